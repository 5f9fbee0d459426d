use ringbuffer::{ConstGenericRingBuffer, RingBuffer};
use thiserror::Error;

use super::SampleTime;

/// Samples older than this relative to the requested time are never returned.
const MAX_SAMPLE_AGE_US: u64 = 100_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[error("sample at {time_us} us is not newer than the last accepted one ({newest_us} us)")]
    OutOfOrder { time_us: u64, newest_us: u64 },

    #[error("buffer has no allocated depth")]
    NotInitialised,
}

/// Fixed capacity, time ordered sample store.
///
/// `CAP` is the compile time storage; the usable depth is chosen at runtime
/// with [`SampleBuffer::allocate`] and never exceeds `CAP`. When the buffer is
/// at depth, pushing evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct SampleBuffer<T, const CAP: usize> {
    buf: ConstGenericRingBuffer<T, CAP>,
    depth: usize,
    last_pushed: Option<T>,
}

impl<T, const CAP: usize> Default for SampleBuffer<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAP: usize> SampleBuffer<T, CAP> {
    pub fn new() -> Self {
        Self {
            buf: ConstGenericRingBuffer::new(),
            depth: 0,
            last_pushed: None,
        }
    }

    /// Sets the usable depth, clearing any stored sample. Returns the depth
    /// actually granted.
    pub fn allocate(&mut self, depth: usize) -> usize {
        self.buf.clear();
        self.last_pushed = None;
        self.depth = depth.clamp(1, CAP);
        self.depth
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.depth > 0 && self.buf.len() >= self.depth
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.last_pushed = None;
    }

    pub fn oldest(&self) -> Option<&T> {
        self.buf.front()
    }

    pub fn newest(&self) -> Option<&T> {
        self.buf.back()
    }

    pub fn newest_mut(&mut self) -> Option<&mut T> {
        self.buf.back_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.buf.iter_mut()
    }
}

impl<T: SampleTime + Clone, const CAP: usize> SampleBuffer<T, CAP> {
    /// Appends a sample, rejecting it if it is not strictly newer than the
    /// newest sample ever accepted since the last allocation.
    pub fn push(&mut self, sample: T) -> Result<(), PushError> {
        if self.depth == 0 {
            return Err(PushError::NotInitialised);
        }

        let time_us = sample.time_us();
        if let Some(newest_us) = self.newest_time_us() {
            if time_us <= newest_us {
                return Err(PushError::OutOfOrder { time_us, newest_us });
            }
        }

        if self.buf.len() >= self.depth {
            let _ = self.buf.dequeue();
        }

        self.last_pushed = Some(sample.clone());
        self.buf.push(sample);

        Ok(())
    }

    /// Newest sample ever accepted, even if already consumed.
    pub fn last_pushed(&self) -> Option<&T> {
        self.last_pushed.as_ref()
    }

    /// Time of the newest sample ever accepted, even if already consumed.
    pub fn newest_time_us(&self) -> Option<u64> {
        self.last_pushed.as_ref().map(|s| s.time_us())
    }

    /// Returns the newest sample taken at or before `time_us`, dropping it
    /// together with every older sample. Samples more than 100 ms older than
    /// `time_us` are discarded and `None` is returned.
    pub fn pop_first_older_than(&mut self, time_us: u64) -> Option<T> {
        let n_older = self
            .buf
            .iter()
            .take_while(|s| s.time_us() <= time_us)
            .count();

        let mut found = None;
        for _ in 0..n_older {
            found = self.buf.dequeue();
        }

        found.filter(|s| time_us - s.time_us() < MAX_SAMPLE_AGE_US)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Sample {
        time_us: u64,
        val: f32,
    }

    impl SampleTime for Sample {
        fn time_us(&self) -> u64 {
            self.time_us
        }
    }

    fn s(time_us: u64) -> Sample {
        Sample {
            time_us,
            val: time_us as f32,
        }
    }

    #[test]
    fn test_push_requires_allocation() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        assert_eq!(buf.push(s(1)), Err(PushError::NotInitialised));
    }

    #[test]
    fn test_depth_is_clamped() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        assert_eq!(buf.allocate(20), 8);
        assert_eq!(buf.allocate(0), 1);
        assert_eq!(buf.allocate(5), 5);
    }

    #[test]
    fn test_evicts_oldest_at_depth() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        buf.allocate(3);

        for t in 1..=5 {
            buf.push(s(t * 1000)).unwrap();
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest(), Some(&s(3000)));
        assert_eq!(buf.newest(), Some(&s(5000)));
    }

    #[test]
    fn test_rejects_stale_sample() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        buf.allocate(4);
        buf.push(s(2000)).unwrap();

        assert_eq!(
            buf.push(s(1000)),
            Err(PushError::OutOfOrder {
                time_us: 1000,
                newest_us: 2000
            })
        );
        assert_eq!(
            buf.push(s(2000)),
            Err(PushError::OutOfOrder {
                time_us: 2000,
                newest_us: 2000
            })
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.newest(), Some(&s(2000)));
    }

    #[test]
    fn test_stale_rejected_after_consumption() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        buf.allocate(4);
        buf.push(s(2000)).unwrap();
        assert_eq!(buf.pop_first_older_than(3000), Some(s(2000)));
        assert!(buf.is_empty());
        assert_eq!(buf.last_pushed(), Some(&s(2000)));

        assert!(buf.push(s(1500)).is_err());
    }

    #[test]
    fn test_pop_first_older_than() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        buf.allocate(8);
        for t in [10_000, 20_000, 30_000, 40_000] {
            buf.push(s(t)).unwrap();
        }

        assert_eq!(buf.pop_first_older_than(5_000), None);
        assert_eq!(buf.len(), 4);

        assert_eq!(buf.pop_first_older_than(25_000), Some(s(20_000)));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest(), Some(&s(30_000)));

        // Nothing new at or before the same horizon
        assert_eq!(buf.pop_first_older_than(25_000), None);

        assert_eq!(buf.pop_first_older_than(40_000), Some(s(40_000)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_discards_too_old() {
        let mut buf = SampleBuffer::<Sample, 8>::new();
        buf.allocate(8);
        buf.push(s(10_000)).unwrap();
        buf.push(s(500_000)).unwrap();

        assert_eq!(buf.pop_first_older_than(300_000), None);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.oldest(), Some(&s(500_000)));
    }
}
