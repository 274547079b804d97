//! User-supplied collaborator traits
//!
//! The only way to instantiate an engine is to hand these three
//! collaborators to the [`Builder`](crate::engine::Builder): a processor
//! (the business brain), a persister (the system-of-record sink) and a
//! bootstrap (cold-start state plus WAL codec).

use crate::codec::CommandCodec;
use crate::error::Result;
use crate::types::{Command, Entity, State};

/// Business logic processor — the brain of the engine.
///
/// Runs on the partition worker thread with exclusive access to the
/// partition's state. Implementations must be pure with respect to
/// everything except `state`: no I/O, no sleeping, no lock acquisition.
/// Violating this collapses the throughput of the whole partition.
///
/// Returning `Err` rejects the command: no state change is kept visible, the
/// transaction ID is NOT marked applied (the same ID may be retried), and
/// the error surfaces through the command's completion handle. Use
/// [`Error::Processor`](crate::Error::Processor) for business rejections.
pub trait Processor<S: State, C: Command, E: Entity>: Send + Sync + 'static {
    /// Apply `command` to `state`, optionally producing the persistable
    /// delta for the async writer. `Ok(None)` means nothing to persist.
    fn process(&self, state: &mut S, command: &C) -> Result<Option<E>>;
}

impl<S: State, C: Command, E: Entity, F> Processor<S, C, E> for F
where
    F: Fn(&mut S, &C) -> Result<Option<E>> + Send + Sync + 'static,
{
    fn process(&self, state: &mut S, command: &C) -> Result<Option<E>> {
        self(state, command)
    }
}

/// Batch persistence sink for incremental entities.
///
/// Called from the async writer thread, never from the partition worker.
/// A failed batch is retried indefinitely with a fixed backoff, so the sink
/// must be idempotent per business key (at-least-once delivery).
pub trait Persister<E: Entity>: Send + Sync + 'static {
    /// Persist one batch. May perform I/O; may fail to trigger a retry.
    fn persist(&self, batch: &[E]) -> Result<()>;
}

impl<E: Entity, F> Persister<E> for F
where
    F: Fn(&[E]) -> Result<()> + Send + Sync + 'static,
{
    fn persist(&self, batch: &[E]) -> Result<()> {
        self(batch)
    }
}

/// Cold-start and recovery wiring.
///
/// `initial_state` runs only when a partition starts with no snapshot on
/// disk (first boot, or snapshot deleted); typical implementations return an
/// empty state or load a full image from the database. `codec` supplies the
/// type-key deserializer registry used to reify commands read back from the
/// WAL.
pub trait Bootstrap<S: State, C: Command>: Send + Sync + 'static {
    /// State for a partition with no snapshot
    fn initial_state(&self) -> S;

    /// WAL deserializer registry
    fn codec(&self) -> CommandCodec<C>;
}
