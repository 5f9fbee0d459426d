use crate::Instant;

/// Item travelling through a channel, stamped with the time it was sent.
#[derive(Debug, Clone, Copy)]
pub struct Timestamped<T> {
    pub t: Instant,
    pub v: T,
}

impl<T> Timestamped<T> {
    pub fn new(t: Instant, v: T) -> Self {
        Timestamped { t, v }
    }

    /// Age of the item at `now`, in microseconds.
    pub fn age_us(&self, now: Instant) -> u64 {
        now.as_micros().saturating_sub(self.t.as_micros())
    }
}

pub type Ts<T> = Timestamped<T>;

/// Samples that carry their own measurement time in microseconds.
pub trait SampleTime {
    fn time_us(&self) -> u64;
}

impl<T> SampleTime for Timestamped<T> {
    fn time_us(&self) -> u64 {
        self.t.as_micros()
    }
}
