//! Async batch writer
//!
//! Decouples the in-memory application path from the high-latency
//! persistence sink. The partition worker submits incremental entities into
//! a bounded FIFO with a blocking put: a full queue stalls the partition
//! until the sink catches up, which is the engine's pressure valve against
//! unbounded memory growth, not an error.
//!
//! A dedicated worker thread drains the FIFO in batches: take one element
//! (1s poll so shutdown is observed), then opportunistically drain up to
//! `batch_size - 1` more without blocking. A failed persist is logged and
//! retried with a fixed 1s backoff indefinitely — at-least-once delivery;
//! the sink must be idempotent per business key. The only exception is a
//! backoff that observes a shutdown request: the worker gives up on that
//! batch (best-effort drain; the WAL remains the authoritative record).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use prometheus::{Histogram, IntGauge};
use tracing::{error, info, warn};

use crate::api::Persister;
use crate::error::{Error, Result};
use crate::types::Entity;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded-FIFO batch writer with a dedicated drain thread.
pub(crate) struct AsyncBatchWriter<E: Entity> {
    tx: Option<Sender<E>>,
    interrupt_tx: Sender<()>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    depth_gauge: IntGauge,
}

impl<E: Entity> AsyncBatchWriter<E> {
    /// Start the writer thread for one partition.
    pub(crate) fn start(
        partition_name: &str,
        queue_size: usize,
        batch_size: usize,
        persister: Arc<dyn Persister<E>>,
        depth_gauge: IntGauge,
        batch_timer: Histogram,
    ) -> Self {
        let (tx, rx) = bounded(queue_size);
        // Zero capacity: the interrupt lands only while the worker is
        // blocked inside a retry backoff
        let (interrupt_tx, interrupt_rx) = bounded(0);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = Arc::clone(&running);
            let depth_gauge = depth_gauge.clone();
            let name = partition_name.to_string();
            std::thread::Builder::new()
                .name(format!("ledger-writer-{}", partition_name))
                .spawn(move || {
                    run_writer(
                        &name,
                        rx,
                        interrupt_rx,
                        running,
                        batch_size,
                        persister,
                        depth_gauge,
                        batch_timer,
                    );
                })
                .expect("spawn writer thread")
        };

        Self {
            tx: Some(tx),
            interrupt_tx,
            running,
            worker: Some(worker),
            depth_gauge,
        }
    }

    /// Blocking put; stalls the caller while the FIFO is full.
    pub(crate) fn submit(&self, entity: E) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Closed("async writer stopped".to_string()))?;
        tx.send(entity)
            .map_err(|_| Error::Closed("async writer stopped".to_string()))?;
        self.depth_gauge.set(tx.len() as i64);
        Ok(())
    }

    /// Stop intake and wait for the drain to finish.
    pub(crate) fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.interrupt_tx.try_send(());
        // Dropping the sender lets the worker observe an empty, closed queue
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("async writer thread panicked");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_writer<E: Entity>(
    partition_name: &str,
    rx: Receiver<E>,
    interrupt_rx: Receiver<()>,
    running: Arc<AtomicBool>,
    batch_size: usize,
    persister: Arc<dyn Persister<E>>,
    depth_gauge: IntGauge,
    batch_timer: Histogram,
) {
    info!(partition = partition_name, "async writer started");
    let mut batch: Vec<E> = Vec::with_capacity(batch_size);

    loop {
        let first = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(entity) => entity,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) && rx.is_empty() {
                    break;
                }
                continue;
            }
            // Sender dropped and queue empty: drain is complete
            Err(RecvTimeoutError::Disconnected) => break,
        };

        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(entity) => batch.push(entity),
                Err(_) => break,
            }
        }
        depth_gauge.set(rx.len() as i64);

        if !persist_with_retry(partition_name, &persister, &batch, &interrupt_rx, &batch_timer) {
            warn!(
                partition = partition_name,
                abandoned = batch.len(),
                remaining = rx.len(),
                "async writer giving up during shutdown, WAL remains authoritative"
            );
            break;
        }
        batch.clear();
    }

    info!(
        partition = partition_name,
        remaining = rx.len(),
        "async writer stopped"
    );
}

/// Retry the same batch until the sink accepts it. Returns false only when
/// a retry backoff observes a shutdown request.
fn persist_with_retry<E: Entity>(
    partition_name: &str,
    persister: &Arc<dyn Persister<E>>,
    batch: &[E],
    interrupt_rx: &Receiver<()>,
    batch_timer: &Histogram,
) -> bool {
    loop {
        let started = Instant::now();
        let result = persister.persist(batch);
        batch_timer.observe(started.elapsed().as_secs_f64());
        match result {
            Ok(()) => return true,
            Err(e) => {
                error!(
                    partition = partition_name,
                    count = batch.len(),
                    error = %e,
                    "batch persist failed, retrying in 1s"
                );
                // The backoff doubles as the shutdown-interrupt window
                match interrupt_rx.recv_timeout(RETRY_BACKOFF) {
                    Ok(()) => return false,
                    Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use parking_lot::Mutex;

    struct CollectingSink {
        batches: Mutex<Vec<Vec<u64>>>,
        fail_first: AtomicBool,
    }

    impl CollectingSink {
        fn new(fail_first: bool) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicBool::new(fail_first),
            }
        }

        fn record(&self, batch: &[u64]) -> Result<()> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(Error::Persist("transient sink failure".to_string()));
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    fn writer_with(
        sink: Arc<CollectingSink>,
        queue_size: usize,
        batch_size: usize,
    ) -> AsyncBatchWriter<u64> {
        let metrics = Metrics::new("writer_test").unwrap();
        let persister: Arc<dyn Persister<u64>> =
            Arc::new(move |batch: &[u64]| -> Result<()> { sink.record(batch) });
        AsyncBatchWriter::start(
            "test-p0",
            queue_size,
            batch_size,
            persister,
            metrics.writer_queue_depth.with_label_values(&["e", "p0"]),
            metrics.persist_batch_seconds.with_label_values(&["e", "p0"]),
        )
    }

    #[test]
    fn test_drains_everything_on_shutdown() {
        let sink = Arc::new(CollectingSink::new(false));
        let mut writer = writer_with(Arc::clone(&sink), 128, 10);
        for i in 0..25u64 {
            writer.submit(i).unwrap();
        }
        writer.shutdown();
        let total: usize = sink.batches.lock().iter().map(|b| b.len()).sum();
        assert_eq!(total, 25);
        let flat: Vec<u64> = sink.batches.lock().iter().flatten().copied().collect();
        assert_eq!(flat, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_respect_batch_size() {
        let sink = Arc::new(CollectingSink::new(false));
        let mut writer = writer_with(Arc::clone(&sink), 128, 4);
        for i in 0..10u64 {
            writer.submit(i).unwrap();
        }
        writer.shutdown();
        for batch in sink.batches.lock().iter() {
            assert!(batch.len() <= 4);
        }
    }

    #[test]
    fn test_retry_after_transient_failure() {
        let sink = Arc::new(CollectingSink::new(true));
        let mut writer = writer_with(Arc::clone(&sink), 16, 16);
        writer.submit(7).unwrap();
        // First attempt fails; the retry fires after the 1s backoff
        std::thread::sleep(Duration::from_millis(1500));
        writer.shutdown();
        let flat: Vec<u64> = sink.batches.lock().iter().flatten().copied().collect();
        assert_eq!(flat, vec![7]);
    }

    #[test]
    fn test_submit_after_shutdown_is_closed() {
        let sink = Arc::new(CollectingSink::new(false));
        let mut writer = writer_with(sink, 16, 16);
        writer.shutdown();
        assert!(matches!(writer.submit(1), Err(Error::Closed(_))));
    }
}
