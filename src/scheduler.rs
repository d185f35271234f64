use crate::ingest::{IngestClient, IngestError};
use crate::reading::{Reading, ReadingAssembler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const STATS_EVERY_BATCHES: u64 = 10;

#[derive(Debug)]
pub struct StreamStats {
    pub rows_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub errors: AtomicU64,
    pub last_offset: AtomicU64,
    started_at: Instant,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            rows_sent: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_offset: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn log_summary(&self, sensors_stale: bool) {
        let rows = self.rows_sent.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            rows as f64 / elapsed
        } else {
            0.0
        };
        tracing::info!(
            rows,
            batches = self.batches_sent.load(Ordering::Relaxed),
            bytes = self.bytes_sent.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            last_offset = self.last_offset.load(Ordering::Relaxed),
            rows_per_sec = format!("{throughput:.2}"),
            sensors_stale,
            "stream statistics"
        );
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic driver: forms batches of rows from the assembler, hands them to
/// the ingest client in strict offset order, and keeps the counters. One
/// scheduler per channel; it is the only caller of `append`.
pub struct BatchScheduler {
    assembler: ReadingAssembler,
    client: IngestClient,
    stats: Arc<StreamStats>,
    batch_size: usize,
    interval: Duration,
    intra_batch_delay: Duration,
    sensors_stale: Box<dyn Fn() -> bool + Send + Sync>,
}

impl BatchScheduler {
    pub fn new(
        assembler: ReadingAssembler,
        client: IngestClient,
        stats: Arc<StreamStats>,
        batch_size: usize,
        interval: Duration,
        intra_batch_delay: Duration,
        sensors_stale: Box<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            assembler,
            client,
            stats,
            batch_size,
            interval,
            intra_batch_delay,
            sensors_stale,
        }
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Runs until cancelled or a fatal error. Cancellation is cooperative:
    /// checked at every sleep and between readings; an in-flight append is
    /// always completed so a batch either commits or was never attempted.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), IngestError> {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let batch_started = Instant::now();
            let batch = self.collect_batch(&cancel).await;

            if !batch.is_empty() {
                match self.client.append(&batch).await {
                    Ok(receipt) => {
                        self.stats
                            .rows_sent
                            .fetch_add(receipt.rows as u64, Ordering::Relaxed);
                        self.stats
                            .bytes_sent
                            .fetch_add(receipt.bytes, Ordering::Relaxed);
                        self.stats
                            .last_offset
                            .store(receipt.offset, Ordering::Relaxed);
                        let batches = self.stats.batches_sent.fetch_add(1, Ordering::Relaxed) + 1;
                        if batches % STATS_EVERY_BATCHES == 0 {
                            self.stats.log_summary((self.sensors_stale)());
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        tracing::error!(error = %err, "fatal ingest failure");
                        return Err(err);
                    }
                    Err(err) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %err, "batch failed; continuing");
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            // Keep the batch cadence steady: the pause shrinks by however
            // long collection and the append took.
            let pause = self.interval.saturating_sub(batch_started.elapsed());
            if wait_or_cancelled(pause, &cancel).await {
                break;
            }
        }
        Ok(())
    }

    async fn collect_batch(&self, cancel: &CancellationToken) -> Vec<Reading> {
        let mut rows = Vec::with_capacity(self.batch_size);
        for index in 0..self.batch_size {
            rows.push(self.assembler.assemble());
            if index + 1 < self.batch_size {
                if wait_or_cancelled(self.intra_batch_delay, cancel).await {
                    break;
                }
            }
        }
        rows
    }

    /// Final statistics and best-effort channel close, in shutdown order.
    pub async fn shutdown(&mut self) {
        self.client.close_channel().await;
        self.stats.log_summary((self.sensors_stale)());
    }
}

async fn wait_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
