//! Core types: command contract, completion handles, partition events

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Contract every business command must satisfy.
///
/// The transaction ID identifies the attempt and drives duplicate rejection;
/// the routing key identifies the aggregate and must be stable for it (use
/// a user or account ID, never the transaction ID). The type key tags WAL
/// records so recovery can pick the right deserializer.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Unique transaction ID, stable across retries
    fn tx_id(&self) -> &str;

    /// Stable aggregate identifier used for partition routing
    fn routing_key(&self) -> &str;

    /// Tag stored with each WAL record for deserializer dispatch
    fn type_key(&self) -> &str;
}

/// Bound alias for partition state.
///
/// State is owned by exactly one partition and serialized whole into
/// snapshots.
pub trait State: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bound alias for incremental entities handed to the async writer.
pub trait Entity: Send + 'static {}

impl<T> Entity for T where T: Send + 'static {}

/// Acknowledgement delivered through a command's completion handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Partition that applied the command
    pub partition: usize,
    /// WAL index assigned to the command's record
    pub wal_index: u64,
}

/// Producer side of the one-shot completion cell.
///
/// Completing twice is a no-op; a dropped consumer is harmless.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: Sender<Result<Receipt>>,
}

impl Completion {
    /// Create a linked completion/handle pair.
    pub(crate) fn pair() -> (Completion, CommandHandle) {
        let (tx, rx) = bounded(1);
        (Completion { tx }, CommandHandle { rx })
    }

    /// Deliver the outcome. Safe to call when the caller abandoned the
    /// handle.
    pub(crate) fn complete(self, outcome: Result<Receipt>) {
        let _ = self.tx.try_send(outcome);
    }
}

/// Caller side of the one-shot completion cell returned by `submit`.
///
/// Dropping the handle abandons the result; the partition still applies the
/// command.
#[derive(Debug)]
pub struct CommandHandle {
    rx: Receiver<Result<Receipt>>,
}

impl CommandHandle {
    /// Block until the partition completes the command.
    pub fn wait(self) -> Result<Receipt> {
        self.rx
            .recv()
            .map_err(|_| Error::Closed("partition dropped the command".to_string()))?
    }

    /// Block up to `timeout` for the outcome. The command keeps running on
    /// timeout; only the caller stops waiting.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Receipt>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking poll for the outcome.
    pub fn try_wait(&self) -> Option<Result<Receipt>> {
        self.rx.try_recv().ok()
    }
}

/// Message consumed by a partition worker.
///
/// Heartbeats are sentinels injected by the partition's timer thread so the
/// time-based snapshot trigger fires under zero business load.
pub(crate) enum Event<C> {
    /// A business command plus its optional completion cell
    Command {
        command: C,
        completion: Option<Completion>,
    },
    /// Timer sentinel; runs the snapshot check only
    Heartbeat,
}
