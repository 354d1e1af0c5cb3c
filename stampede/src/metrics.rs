use std::sync::Arc;

use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};

use crate::{
    aggregate::{Aggregate, RunAggregate},
    metric::Sample,
};

/// Cloneable handle workers use to report samples.
///
/// Sending never blocks a worker: the channel is unbounded and the aggregator
/// task is the single consumer, so samples land in completion order.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: mpsc::UnboundedSender<Sample>,
}

impl MetricsSink {
    pub fn record(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            tracing::debug!("Aggregator is gone, discarding sample");
        }
    }
}

/// Shared read view of the aggregate the aggregator task keeps up to date.
#[derive(Debug, Clone, Default)]
pub struct LiveMetrics {
    inner: Arc<RwLock<RunAggregate>>,
}

impl LiveMetrics {
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, RunAggregate> {
        self.inner.read().await
    }

    /// Moves the aggregate out, leaving an empty one behind.
    pub async fn take(&self) -> RunAggregate {
        std::mem::take(&mut *self.inner.write().await)
    }
}

/// Spawns the aggregator task and returns the sink feeding it.
///
/// The task ends once every clone of the sink is dropped.
pub fn spawn_aggregator(live: LiveMetrics, batch_size: usize) -> (MetricsSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(aggregator_task(rx, live, batch_size.max(1)));
    (MetricsSink { tx }, handle)
}

/// Drains the channel in batches so the write lock is taken once per burst.
async fn aggregator_task(
    mut rx: mpsc::UnboundedReceiver<Sample>,
    live: LiveMetrics,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        // Receive the first sample or end the loop if every sender is dropped
        match rx.recv().await {
            Some(sample) => batch.push(sample),
            None => break,
        }

        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(sample) => batch.push(sample),
                Err(_) => break,
            }
        }

        live.inner.write().await.aggregate(&batch);
        batch.clear();
    }
    tracing::debug!("Aggregator drained, all senders closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Tags;

    #[tokio::test]
    async fn aggregates_everything_sent_before_close() {
        let live = LiveMetrics::default();
        let (sink, handle) = spawn_aggregator(live.clone(), 4);
        let tags = Tags::new().with("scenario", "s");
        for _ in 0..10 {
            sink.record(Sample::Dropped { tags: tags.clone() });
        }
        drop(sink);
        handle.await.unwrap();

        assert_eq!(live.read().await.dropped_matching(&tags), 10);
        assert_eq!(live.take().await.dropped_matching(&tags), 10);
        assert_eq!(live.read().await.dropped_matching(&tags), 0);
    }
}
