//! Error types for the ledger engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
///
/// Routing, duplicate and processor failures are delivered through the
/// command's completion handle and never kill a partition. WAL write
/// failures are fatal to the owning partition; persistence failures are
/// absorbed by the async writer's retry loop and never reach submitters.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad configuration or missing required collaborator
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Key routes to a different node than the local one
    #[error("Routing error: {0}")]
    Routing(String),

    /// Transaction ID already applied (or Bloom false positive)
    #[error("Duplicate command: {0}")]
    Duplicate(String),

    /// User processor rejected or failed the command
    #[error("Processor error: {0}")]
    Processor(String),

    /// User persister failed a batch (retried by the async writer)
    #[error("Persist error: {0}")]
    Persist(String),

    /// WAL append or scan failure
    #[error("WAL error: {0}")]
    Wal(String),

    /// Snapshot save/load failure
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Snapshot or WAL unreadable during partition start
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Configuration file or value error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Partition is not accepting commands (draining, stopped or failed)
    #[error("Partition closed: {0}")]
    Closed(String),
}

impl Error {
    /// True for errors that are reported to the submitter without
    /// affecting the partition.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Error::Routing(_) | Error::Duplicate(_) | Error::Processor(_)
        )
    }
}
