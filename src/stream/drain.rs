//! Paced, capped draining of a plot queue

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::queue::QueueReader;

/// Roughly one display refresh.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(16);

/// Most items handed to a consumer per tick.
pub const DEFAULT_MAX_BATCH: usize = 200;

/// Extension trait turning a queue reader into a batch stream
pub trait DrainExt<T> {
    /// Every `period`, yield up to `max_batch` buffered items.
    ///
    /// Ticks with nothing buffered yield nothing. The stream ends once the
    /// writer is gone and the queue is empty.
    fn drain_every(self, period: Duration, max_batch: usize) -> DrainStream<T>;
}

impl<T> DrainExt<T> for QueueReader<T> {
    fn drain_every(self, period: Duration, max_batch: usize) -> DrainStream<T> {
        DrainStream::new(self, period, max_batch)
    }
}

pin_project! {
    /// A stream of batches drained from a [`QueueReader`] on a fixed cadence
    pub struct DrainStream<T> {
        reader: QueueReader<T>,
        interval: Interval,
        max_batch: usize,
    }
}

impl<T> DrainStream<T> {
    pub fn new(reader: QueueReader<T>, period: Duration, max_batch: usize) -> Self {
        let mut interval = interval(period);
        // a late consumer catches up through larger backlogs, not extra ticks
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { reader, interval, max_batch: max_batch.max(1) }
    }

    pub fn reader(&self) -> &QueueReader<T> {
        &self.reader
    }
}

impl<T> Stream for DrainStream<T> {
    type Item = Vec<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        loop {
            ready!(this.interval.poll_tick(cx));

            // checked before draining so a final push is never missed
            let orphaned = this.reader.is_orphaned();
            let batch = this.reader.drain(*this.max_batch);
            if !batch.is_empty() {
                return Poll::Ready(Some(batch));
            }
            if orphaned {
                return Poll::Ready(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ChannelQueue;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn batches_are_capped() {
        let (writer, reader) = ChannelQueue::split(1000);
        for i in 0..450 {
            writer.push(i);
        }

        let mut stream = reader.drain_every(DEFAULT_PERIOD, DEFAULT_MAX_BATCH);
        assert_eq!(stream.next().await.map(|b| b.len()), Some(200));
        assert_eq!(stream.next().await.map(|b| b.len()), Some(200));
        let last = stream.next().await.expect("remaining batch");
        assert_eq!(last, (400..450).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ticks_are_skipped() {
        let (writer, reader) = ChannelQueue::split(10);
        let mut stream = reader.drain_every(Duration::from_millis(10), 5);

        let start = tokio::time::Instant::now();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            writer.push(7u8);
            writer
        });

        assert_eq!(stream.next().await, Some(vec![7]));
        assert!(start.elapsed() >= Duration::from_millis(55));
        drop(producer.await.expect("producer"));
    }

    #[tokio::test(start_paused = true)]
    async fn ends_after_writer_drops_and_queue_empties() {
        let (writer, reader) = ChannelQueue::split(10);
        writer.push(1);
        writer.push(2);
        drop(writer);

        let batches: Vec<Vec<i32>> = reader.drain_every(DEFAULT_PERIOD, 1).collect().await;
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }
}
