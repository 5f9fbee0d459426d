//! Sample channels between sensor drivers and the estimator task. Each sensor
//! gets its own single-producer single-consumer queue.

use heapless::spsc::{Consumer, Producer, Queue};
use thiserror::Error;

use crate::{Instant, common::Ts};

pub trait Receiver<T> {
    fn try_recv(&mut self) -> Option<Ts<T>>;

    /// Drains the channel, returning only the newest item.
    fn try_recv_last(&mut self) -> Option<Ts<T>> {
        let mut last = None;
        while let Some(item) = self.try_recv() {
            last = Some(item);
        }
        last
    }

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is full, item dropped")]
    Full,
}

pub trait Sender<T> {
    fn try_send(&mut self, ts: Instant, item: T) -> Result<(), ChannelError>;
}

pub struct SpscReceiver<'a, T, const N: usize> {
    consumer: Consumer<'a, Ts<T>, N>,
}

pub struct SpscSender<'a, T, const N: usize> {
    producer: Producer<'a, Ts<T>, N>,
    num_dropped: usize,
}

/// Splits `queue` into its two ends. The queue holds `N - 1` items.
pub fn spsc_channel<T, const N: usize>(queue: &mut Queue<Ts<T>, N>) -> (SpscSender<'_, T, N>, SpscReceiver<'_, T, N>) {
    let (producer, consumer) = queue.split();
    (
        SpscSender {
            producer,
            num_dropped: 0,
        },
        SpscReceiver { consumer },
    )
}

impl<T, const N: usize> Receiver<T> for SpscReceiver<'_, T, N> {
    fn try_recv(&mut self) -> Option<Ts<T>> {
        self.consumer.dequeue()
    }

    fn len(&self) -> usize {
        self.consumer.len()
    }

    fn capacity(&self) -> usize {
        self.consumer.capacity()
    }
}

impl<T, const N: usize> SpscSender<'_, T, N> {
    /// Items rejected because the receiver fell behind.
    pub fn num_dropped(&self) -> usize {
        self.num_dropped
    }
}

impl<T, const N: usize> Sender<T> for SpscSender<'_, T, N> {
    fn try_send(&mut self, ts: Instant, item: T) -> Result<(), ChannelError> {
        self.producer.enqueue(Ts::new(ts, item)).map_err(|_| {
            self.num_dropped += 1;
            ChannelError::Full
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fifo_and_overflow() {
        let mut queue: Queue<Ts<u32>, 4> = Queue::new();
        let (mut tx, mut rx) = spsc_channel(&mut queue);

        for i in 0..3 {
            tx.try_send(Instant::from_micros(i as u64), i).unwrap();
        }
        assert!(rx.is_full());
        assert_eq!(tx.try_send(Instant::from_micros(3), 3), Err(ChannelError::Full));
        assert_eq!(tx.num_dropped(), 1);

        assert_eq!(rx.try_recv().map(|ts| ts.v), Some(0));
        let last = rx.try_recv_last().unwrap();
        assert_eq!(last.v, 2);
        assert_eq!(last.age_us(Instant::from_micros(10)), 8);
        assert!(rx.is_empty());
        assert!(rx.try_recv().is_none());
    }
}
