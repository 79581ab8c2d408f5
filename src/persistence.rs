//! Time-series hand-off. The control path never waits on a sink: services
//! snapshot their caches on wall-clock boundaries and `offer` the batch to a
//! bounded queue; a worker task drains it into the configured sink. Sink
//! errors are logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One snapshot of one device, flattened into named points.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub points: Vec<(&'static str, f64)>,
}

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, batch: SampleBatch) -> anyhow::Result<()>;
}

/// Default sink: traces batches at debug level. Stands in for the external
/// time-series writer, which is outside this core.
pub struct LoggingSink;

#[async_trait]
impl TimeSeriesSink for LoggingSink {
    async fn write(&self, batch: SampleBatch) -> anyhow::Result<()> {
        debug!(
            source = %batch.source,
            timestamp = %batch.timestamp,
            points = batch.points.len(),
            "telemetry batch"
        );
        Ok(())
    }
}

/// Cheap clonable handle given to each device service.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<SampleBatch>,
}

impl PersistenceHandle {
    /// Queue a batch without blocking. A full queue drops the batch; the
    /// next boundary tick produces a fresh snapshot anyway.
    pub fn offer(&self, batch: SampleBatch) {
        if let Err(e) = self.tx.try_send(batch) {
            debug!("persistence queue full, dropping batch: {}", e);
        }
    }
}

/// Spawn the drain worker and return the handle services write through.
pub fn spawn_persistence_worker(
    sink: Arc<dyn TimeSeriesSink>,
    queue_depth: usize,
    cancel: CancellationToken,
) -> PersistenceHandle {
    let (tx, mut rx) = mpsc::channel::<SampleBatch>(queue_depth);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    if let Err(e) = sink.write(batch).await {
                        error!(error = %e, "time-series sink write failed");
                    }
                }
            }
        }
        info!("persistence worker shut down");
    });
    PersistenceHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        batches: Mutex<Vec<SampleBatch>>,
    }

    #[async_trait]
    impl TimeSeriesSink for RecordingSink {
        async fn write(&self, batch: SampleBatch) -> anyhow::Result<()> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl TimeSeriesSink for FailingSink {
        async fn write(&self, _batch: SampleBatch) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    fn batch(source: &str) -> SampleBatch {
        SampleBatch {
            source: source.to_string(),
            timestamp: Utc::now(),
            points: vec![("soc_percent", 75.3)],
        }
    }

    #[tokio::test]
    async fn batches_reach_the_sink() {
        let sink = Arc::new(RecordingSink {
            batches: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_persistence_worker(sink.clone(), 16, cancel.clone());

        handle.offer(batch("bms1"));
        handle.offer(batch("pcs1"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = sink.batches.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].source, "bms1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn sink_errors_do_not_stop_the_worker() {
        let cancel = CancellationToken::new();
        let handle = spawn_persistence_worker(Arc::new(FailingSink), 16, cancel.clone());

        handle.offer(batch("bms1"));
        handle.offer(batch("bms1"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still accepting input after failures.
        handle.offer(batch("bms1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // No worker draining: channel of depth 1 fills immediately.
        let (tx, _rx) = mpsc::channel::<SampleBatch>(1);
        let handle = PersistenceHandle { tx };
        handle.offer(batch("bms1"));
        handle.offer(batch("bms1")); // must not block or panic
    }
}
