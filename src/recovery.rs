//! Partition recovery
//!
//! One-shot replay executed while a partition starts: load the snapshot if
//! one exists, then replay every WAL record past the snapshot point through
//! the business processor. Persistence is skipped during replay (the sink
//! already saw those entities, or the final snapshot covers them) and the
//! idempotency filter rejects duplicates exactly as live traffic would.
//!
//! A snapshot that fails to load is treated as absent (full replay). An
//! unreadable WAL record or an unregistered type key fails the partition
//! start: a partially-replayed partition must not serve traffic.

use std::time::Instant;

use tracing::{debug, info};

use crate::api::Processor;
use crate::codec::CommandCodec;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyFilter;
use crate::snapshot::SnapshotStore;
use crate::types::{Command, Entity, State};
use crate::wal::WalStore;

/// Result of a completed recovery pass.
pub(crate) struct RecoveryOutcome<S> {
    /// Recovered business state
    pub state: S,
    /// Recovered filter state
    pub filter: IdempotencyFilter,
    /// Index of the last WAL record reflected in `state`
    pub last_wal_index: u64,
    /// Number of records replayed past the snapshot point
    pub replayed: u64,
}

/// Recover one partition from its snapshot and WAL tail.
pub(crate) fn recover<S, C, E>(
    partition_name: &str,
    wal: &WalStore,
    snapshots: &SnapshotStore,
    codec: &CommandCodec<C>,
    processor: &dyn Processor<S, C, E>,
    initial_state: impl FnOnce() -> S,
    initial_filter: impl FnOnce() -> IdempotencyFilter,
) -> Result<RecoveryOutcome<S>>
where
    S: State,
    C: Command,
    E: Entity,
{
    let started = Instant::now();

    let (mut state, mut filter, snapshot_index) = match snapshots.load::<S>() {
        Some(container) => {
            info!(
                partition = partition_name,
                snapshot_index = container.last_wal_index,
                filter = container.filter.name(),
                "snapshot loaded"
            );
            (container.state, container.filter, container.last_wal_index)
        }
        None => {
            info!(partition = partition_name, "cold start, replaying WAL from the beginning");
            (initial_state(), initial_filter(), 0)
        }
    };

    let mut cursor = wal.scan_from(snapshot_index);
    let mut last_wal_index = snapshot_index;
    let mut replayed = 0u64;

    loop {
        let record = cursor
            .read()
            .map_err(|e| Error::Recovery(format!("WAL unreadable at replay: {}", e)))?;
        let Some(record) = record else { break };

        let command = codec
            .decode(&record.type_key, &record.payload)
            .map_err(|e| {
                Error::Recovery(format!(
                    "cannot reify WAL record {} (type key '{}'): {}",
                    record.index, record.type_key, e
                ))
            })?;

        replay_command(partition_name, processor, &mut state, &mut filter, &command);
        last_wal_index = record.index;
        replayed += 1;
    }

    // Keep the applied index in step with the log end; new appends must
    // continue past every record already on disk
    if wal.last_index() > last_wal_index {
        last_wal_index = wal.last_index();
    }

    info!(
        partition = partition_name,
        replayed,
        last_wal_index,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recovery complete"
    );

    Ok(RecoveryOutcome {
        state,
        filter,
        last_wal_index,
        replayed,
    })
}

/// Apply one replayed command: same duplicate/processor/filter sequence as
/// live traffic, minus persistence and completion.
fn replay_command<S, C, E>(
    partition_name: &str,
    processor: &dyn Processor<S, C, E>,
    state: &mut S,
    filter: &mut IdempotencyFilter,
    command: &C,
) where
    S: State,
    C: Command,
    E: Entity,
{
    let tx_id = command.tx_id();
    if filter.contains(tx_id) {
        debug!(partition = partition_name, tx_id, "replay skipped duplicate");
        return;
    }
    match processor.process(state, command) {
        Ok(_entity) => {
            filter.add(tx_id);
        }
        Err(e) => {
            // A rejected command replays as rejected; that is consistent
            debug!(partition = partition_name, tx_id, error = %e, "replay re-rejected command");
        }
    }
}
