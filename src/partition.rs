//! Core ledger partition
//!
//! The smallest unit of the engine. Each partition owns an independent
//! worker thread, WAL directory, snapshot file, in-memory state,
//! idempotency filter and async-writer queue. Routing guarantees all
//! commands for one aggregate land on the same partition, so the worker is
//! the sole mutator of its state and needs no locks on the hot path; the
//! state lives behind a `RwLock` only so router-side reads get a
//! point-in-time-consistent view.
//!
//! Lifecycle: `CREATED → RECOVERING → RUNNING → DRAINING → STOPPED`, with
//! `FAILED` on a fatal WAL error or processor panic. Transitions are
//! one-way; submits are accepted only while `RUNNING`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use prometheus::IntGauge;
use tracing::{debug, error, info, warn};

use crate::api::{Persister, Processor};
use crate::codec::CommandCodec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyFilter;
use crate::metrics::Metrics;
use crate::recovery;
use crate::snapshot::{SnapshotContainer, SnapshotStore};
use crate::types::{Command, Completion, Entity, Event, Receipt, State};
use crate::wal::WalStore;
use crate::writer::AsyncBatchWriter;

/// Ring queue capacity between submitters and the worker.
const RING_CAPACITY: usize = 1 << 16;

/// Partition lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartitionStatus {
    /// Constructed, not yet recovering
    Created = 0,
    /// Applying snapshot and replaying the WAL tail
    Recovering = 1,
    /// Accepting and applying commands
    Running = 2,
    /// Shutdown requested; draining the ring queue
    Draining = 3,
    /// Cleanly stopped
    Stopped = 4,
    /// Fatal WAL error or processor panic; rejects all submits
    Failed = 5,
}

impl PartitionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PartitionStatus::Created,
            1 => PartitionStatus::Recovering,
            2 => PartitionStatus::Running,
            3 => PartitionStatus::Draining,
            5 => PartitionStatus::Failed,
            _ => PartitionStatus::Stopped,
        }
    }
}

/// Collaborators shared by every partition of one engine.
pub(crate) struct PartitionContext<S: State, C: Command, E: Entity> {
    pub processor: Arc<dyn Processor<S, C, E>>,
    pub persister: Arc<dyn Persister<E>>,
    pub codec: Arc<CommandCodec<C>>,
    pub filter_prototype: IdempotencyFilter,
    pub metrics: Metrics,
}

/// A single-writer shard: queue, state, WAL, snapshot, filter.
pub(crate) struct Partition<S: State, C: Command, E: Entity> {
    name: String,
    tx: Option<Sender<Event<C>>>,
    worker: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_stop: Option<Sender<()>>,
    status: Arc<AtomicU8>,
    state: Arc<RwLock<S>>,
    ring_gauge: IntGauge,
    _entity: std::marker::PhantomData<fn() -> E>,
}

impl<S: State, C: Command, E: Entity> Partition<S, C, E> {
    /// Recover and start one partition: load snapshot, replay the WAL tail,
    /// start the async writer, then the worker and heartbeat threads.
    pub(crate) fn start(
        index: usize,
        config: &Config,
        ctx: &PartitionContext<S, C, E>,
        initial_state: S,
    ) -> Result<Self> {
        let name = config.partition_name(index);
        let status = Arc::new(AtomicU8::new(PartitionStatus::Recovering as u8));
        info!(partition = %name, "partition starting");

        let data_dir = config.partition_dir(index);
        let wal = WalStore::open(data_dir.join("wal"), &config.wal)?;
        let snapshots = SnapshotStore::open(&data_dir)?;

        let filter_prototype = ctx.filter_prototype.clone();
        let outcome = recovery::recover(
            &name,
            &wal,
            &snapshots,
            &ctx.codec,
            ctx.processor.as_ref(),
            move || initial_state,
            move || filter_prototype,
        )?;

        let labels = [config.engine_name.as_str(), name.as_str()];
        let ring_gauge = ctx.metrics.ring_remaining.with_label_values(&labels);
        let writer = AsyncBatchWriter::start(
            &name,
            config.queue_size,
            config.batch_size,
            Arc::clone(&ctx.persister),
            ctx.metrics.writer_queue_depth.with_label_values(&labels),
            ctx.metrics.persist_batch_seconds.with_label_values(&labels),
        );

        let (tx, rx) = bounded(RING_CAPACITY);
        let state = Arc::new(RwLock::new(outcome.state));

        let worker = {
            let mut loop_state = WorkerLoop {
                name: name.clone(),
                index,
                rx,
                wal,
                snapshots,
                filter: outcome.filter,
                writer,
                processor: Arc::clone(&ctx.processor),
                codec: Arc::clone(&ctx.codec),
                state: Arc::clone(&state),
                status: Arc::clone(&status),
                ring_gauge: ring_gauge.clone(),
                last_wal_index: outcome.last_wal_index,
                last_snapshot_index: outcome.last_wal_index,
                last_snapshot_time: Instant::now(),
                snapshot_interval: config.snapshot_interval,
                enable_time_snapshot: config.enable_time_snapshot,
                snapshot_time_interval: Duration::from_millis(config.snapshot_time_interval_ms),
            };
            std::thread::Builder::new()
                .name(format!("ledger-{}", name))
                .spawn(move || loop_state.run())
                .map_err(|e| Error::Initialization(format!("spawn worker: {}", e)))?
        };

        let (heartbeat_stop, heartbeat_stop_rx) = bounded(1);
        let heartbeat = {
            let tx = tx.clone();
            let name = name.clone();
            let interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));
            std::thread::Builder::new()
                .name(format!("ledger-heartbeat-{}", name))
                .spawn(move || run_heartbeat(&name, tx, heartbeat_stop_rx, interval))
                .map_err(|e| Error::Initialization(format!("spawn heartbeat: {}", e)))?
        };

        status.store(PartitionStatus::Running as u8, Ordering::SeqCst);
        info!(partition = %name, replayed = outcome.replayed, "partition running");

        Ok(Self {
            name,
            tx: Some(tx),
            worker: Some(worker),
            heartbeat: Some(heartbeat),
            heartbeat_stop: Some(heartbeat_stop),
            status,
            state,
            ring_gauge,
            _entity: std::marker::PhantomData,
        })
    }

    /// Publish a command into the ring queue; blocks while the ring is full.
    pub(crate) fn submit(&self, command: C, completion: Option<Completion>) -> Result<()> {
        if self.status() != PartitionStatus::Running {
            return Err(Error::Closed(format!(
                "partition {} is {:?}",
                self.name,
                self.status()
            )));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Closed(format!("partition {} is shut down", self.name)))?;
        tx.send(Event::Command {
            command,
            completion,
        })
        .map_err(|_| Error::Closed(format!("partition {} worker exited", self.name)))?;
        self.ring_gauge.set((RING_CAPACITY - tx.len()) as i64);
        Ok(())
    }

    /// Run `f` against this partition's state under a read lock.
    pub(crate) fn query_with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state.read())
    }

    /// Current lifecycle state.
    pub(crate) fn status(&self) -> PartitionStatus {
        PartitionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Partition display name.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Graceful shutdown with the strict ordering: stop heartbeat, stop
    /// intake and drain the ring, final snapshot, drain the writer, close
    /// the WAL. The last three run on the worker thread as it exits.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        let current = self.status();
        if current != PartitionStatus::Running && current != PartitionStatus::Failed {
            return Ok(());
        }
        info!(partition = %self.name, "partition stopping");
        if current == PartitionStatus::Running {
            self.status
                .store(PartitionStatus::Draining as u8, Ordering::SeqCst);
        }

        // 1. Stop the heartbeat
        if let Some(stop) = self.heartbeat_stop.take() {
            let _ = stop.try_send(());
            drop(stop);
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.join();
        }

        // 2. Stop intake; the worker drains the ring, then snapshots,
        //    drains the writer and closes the WAL before exiting
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(partition = %self.name, "worker thread panicked during shutdown");
                self.status
                    .store(PartitionStatus::Failed as u8, Ordering::SeqCst);
                return Err(Error::Closed(format!(
                    "partition {} worker panicked",
                    self.name
                )));
            }
        }
        info!(partition = %self.name, "partition stopped");
        Ok(())
    }
}

fn run_heartbeat<C>(
    name: &str,
    tx: Sender<Event<C>>,
    stop_rx: Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => match tx.try_send(Event::Heartbeat) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // A full ring means the worker is busy; the time trigger
                    // runs at the next batch boundary anyway
                    debug!(partition = name, "heartbeat dropped, ring full");
                }
                Err(TrySendError::Disconnected(_)) => break,
            },
            // Stop signal or channel closed
            _ => break,
        }
    }
}

/// State owned by the worker thread.
struct WorkerLoop<S: State, C: Command, E: Entity> {
    name: String,
    index: usize,
    rx: Receiver<Event<C>>,
    wal: WalStore,
    snapshots: SnapshotStore,
    filter: IdempotencyFilter,
    writer: AsyncBatchWriter<E>,
    processor: Arc<dyn Processor<S, C, E>>,
    codec: Arc<CommandCodec<C>>,
    state: Arc<RwLock<S>>,
    status: Arc<AtomicU8>,
    ring_gauge: IntGauge,
    last_wal_index: u64,
    last_snapshot_index: u64,
    last_snapshot_time: Instant,
    snapshot_interval: u64,
    enable_time_snapshot: bool,
    snapshot_time_interval: Duration,
}

impl<S: State, C: Command, E: Entity> WorkerLoop<S, C, E> {
    fn run(&mut self) {
        let mut failed = false;

        while let Ok(event) = self.rx.recv() {
            match event {
                Event::Heartbeat => {
                    self.check_and_snapshot();
                    self.ring_gauge
                        .set((RING_CAPACITY - self.rx.len()) as i64);
                }
                Event::Command {
                    command,
                    completion,
                } => {
                    if let Err(fatal) = self.handle_command(command, completion) {
                        error!(partition = %self.name, error = %fatal, "fatal partition error");
                        failed = true;
                        break;
                    }
                    // End-of-batch: the ring is momentarily empty
                    if self.rx.is_empty() {
                        self.check_and_snapshot();
                        self.ring_gauge
                            .set((RING_CAPACITY - self.rx.len()) as i64);
                    }
                }
            }
        }

        if failed {
            self.status
                .store(PartitionStatus::Failed as u8, Ordering::SeqCst);
            self.fail_remaining();
        } else {
            // Clean drain: force the shutdown snapshot
            self.force_snapshot("shutdown");
        }

        // Writer drains its FIFO, then the WAL is flushed and released
        self.writer.shutdown();
        if let Err(e) = self.wal.sync() {
            error!(partition = %self.name, error = %e, "WAL flush on close failed");
        }

        if !failed {
            self.status
                .store(PartitionStatus::Stopped as u8, Ordering::SeqCst);
        }
    }

    /// Returns `Err` only for faults that must kill the partition.
    fn handle_command(&mut self, command: C, completion: Option<Completion>) -> Result<()> {
        // 1. Serialize and append to the WAL before anything else; a
        //    processor-rejected command still occupies a record
        let payload = match self.codec.encode(&command) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(partition = %self.name, tx_id = command.tx_id(), error = %e, "command encode failed");
                complete(completion, Err(e));
                return Ok(());
            }
        };
        let wal_index = match self.wal.append(command.type_key(), &payload) {
            Ok(index) => index,
            Err(e) => {
                // The ledger cannot accept commands without durability
                complete(
                    completion,
                    Err(Error::Wal(format!("append failed: {}", e))),
                );
                return Err(e);
            }
        };
        self.last_wal_index = wal_index;

        // 2. Idempotency check
        let tx_id = command.tx_id().to_string();
        if self.filter.contains(&tx_id) {
            debug!(partition = %self.name, tx_id = %tx_id, "duplicate command rejected");
            complete(completion, Err(Error::Duplicate(tx_id)));
            return Ok(());
        }

        // 3. Apply business logic
        let outcome = {
            let mut state = self.state.write();
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.processor.process(&mut *state, &command)
            }))
        };

        match outcome {
            Ok(Ok(entity)) => {
                // 4. Mark applied, then hand the delta to the async writer
                //    (blocking put: backpressure stalls this worker)
                self.filter.add(&tx_id);
                if let Some(entity) = entity {
                    if let Err(e) = self.writer.submit(entity) {
                        warn!(partition = %self.name, error = %e, "entity dropped, writer stopped");
                    }
                }
                complete(
                    completion,
                    Ok(Receipt {
                        partition: self.index,
                        wal_index,
                    }),
                );
                Ok(())
            }
            Ok(Err(e)) => {
                // Business rejection: no state marked applied, same tx_id
                // may be retried
                debug!(partition = %self.name, tx_id = %tx_id, error = %e, "processor rejected command");
                complete(completion, Err(e));
                Ok(())
            }
            Err(_panic) => {
                complete(
                    completion,
                    Err(Error::Processor("processor panicked".to_string())),
                );
                Err(Error::Processor(format!(
                    "processor panicked on tx {}",
                    tx_id
                )))
            }
        }
    }

    /// Evaluate both snapshot triggers at a batch boundary.
    fn check_and_snapshot(&mut self) {
        let records_since = self.last_wal_index - self.last_snapshot_index;
        if records_since >= self.snapshot_interval && records_since > 0 {
            debug!(partition = %self.name, records_since, "snapshot count trigger");
            self.force_snapshot("count");
            return;
        }
        if self.enable_time_snapshot
            && self.last_snapshot_time.elapsed() >= self.snapshot_time_interval
        {
            debug!(partition = %self.name, "snapshot time trigger");
            self.force_snapshot("time");
        }
    }

    /// Snapshot on the worker thread. The WAL already holds every record,
    /// so a save failure is logged and the partition keeps running; the
    /// next trigger retries.
    fn force_snapshot(&mut self, reason: &str) {
        let result = {
            let state = self.state.read();
            self.snapshots.save(&SnapshotContainer {
                last_wal_index: self.last_wal_index,
                state: &*state,
                filter: self.filter.clone(),
            })
        };
        match result {
            Ok(()) => {
                self.last_snapshot_index = self.last_wal_index;
                self.last_snapshot_time = Instant::now();
                debug!(partition = %self.name, reason, index = self.last_wal_index, "snapshot written");
            }
            Err(e) => {
                error!(partition = %self.name, reason, error = %e, "snapshot save failed");
            }
        }
    }

    /// Complete everything still queued with a closed error after a fatal
    /// fault.
    fn fail_remaining(&mut self) {
        let mut dropped = 0u64;
        while let Ok(event) = self.rx.try_recv() {
            if let Event::Command { completion, .. } = event {
                complete(
                    completion,
                    Err(Error::Closed(format!("partition {} failed", self.name))),
                );
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(partition = %self.name, dropped, "queued commands rejected after failure");
        }
    }
}

fn complete(completion: Option<Completion>, outcome: Result<Receipt>) {
    match completion {
        Some(completion) => completion.complete(outcome),
        None => {
            // Fire-and-forget: surface failures in the log only
            if let Err(e) = outcome {
                if !e.is_command_error() {
                    warn!(error = %e, "fire-and-forget command failed");
                }
            }
        }
    }
}
