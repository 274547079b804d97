//! Embeddable partitioned transactional ledger engine
//!
//! Clients submit business commands (debits, credits, counter updates) and
//! the engine applies them to in-memory state while guaranteeing
//! durability, at-most-once application and crash recovery, with
//! asynchronous batch persistence to an external system of record.
//!
//! # Architecture
//!
//! The engine is a router over N fully independent single-writer
//! partitions. Each partition owns its ring queue, worker thread, WAL
//! directory, snapshot file, state and idempotency filter:
//!
//! ```text
//! submit -> Engine (router) --hash(key)--> Partition (worker thread)
//!             -> WAL append -> idempotency check -> processor -> filter add
//!             -> async writer (bounded FIFO, backpressure) -> persister
//! ```
//!
//! # Invariants
//!
//! - Per-partition ordering: same-key commands apply in submission order
//! - Durability: an acknowledged command survives a crash (WAL)
//! - At-most-once: a transaction ID is applied no more than once
//! - Recovery equivalence: snapshot + WAL-tail replay == full replay
//!
//! # Example
//!
//! ```no_run
//! use ledger_engine::{Builder, CommandCodec, Config, Result};
//! use ledger_engine::support::KeyedLongState;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Credit { tx: String, account: String, amount: i64 }
//!
//! impl ledger_engine::Command for Credit {
//!     fn tx_id(&self) -> &str { &self.tx }
//!     fn routing_key(&self) -> &str { &self.account }
//!     fn type_key(&self) -> &str { "credit" }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut engine = Builder::new(Config::default())
//!         .processor(|state: &mut KeyedLongState, cmd: &Credit| -> Result<Option<i64>> {
//!             state.add(&cmd.account, cmd.amount);
//!             Ok(Some(cmd.amount))
//!         })
//!         .persister(|_batch: &[i64]| -> Result<()> {
//!             // batch-insert into the system of record
//!             Ok(())
//!         })
//!         .bootstrap(KeyedLongState::default, || CommandCodec::bincode("credit"))
//!         .build()?;
//!     engine.start()?;
//!
//!     let receipt = engine
//!         .submit(Credit { tx: "tx-1".into(), account: "u1".into(), amount: 100 })?
//!         .wait()?;
//!     assert_eq!(receipt.wal_index, 1);
//!
//!     let balance = engine.query_with("u1", |s| s.get("u1"))?;
//!     assert_eq!(balance, 100);
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod admin;
pub mod api;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod metrics;
mod partition;
mod recovery;
pub mod routing;
pub mod snapshot;
pub mod support;
pub mod types;
pub mod wal;
mod writer;

// Re-exports
pub use api::{Bootstrap, Persister, Processor};
pub use codec::CommandCodec;
pub use config::{Config, IdempotencyKind, RoutingKind, WalSyncMode};
pub use engine::{Builder, Engine};
pub use error::{Error, Result};
pub use idempotency::{BloomFilter, IdempotencyFilter, LruFilter};
pub use metrics::Metrics;
pub use partition::PartitionStatus;
pub use routing::RoutingStrategy;
pub use snapshot::{SnapshotContainer, SnapshotStore};
pub use types::{Command, CommandHandle, Receipt};
pub use wal::{WalCursor, WalRecord, WalStore};
