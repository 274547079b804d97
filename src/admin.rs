//! Offline operator tools
//!
//! Read-only inspection of a partition's on-disk artifacts: cursor-based
//! WAL paging (forward and backward, with optional filters) and a snapshot
//! dump. Everything here opens its own read-only views and is meant to run
//! against a stopped partition or from a diagnostic process.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CommandCodec;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotStore;
use crate::types::Command;
use crate::wal::WalCursor;

/// Scan direction for WAL pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    /// Ascending indices starting after the cursor
    Forward,
    /// Descending indices starting before the cursor
    Backward,
}

/// Optional record filters; both default to "match everything".
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Keep only records whose command has this routing key
    pub routing_key: Option<String>,
    /// Keep only records whose command has this transaction ID
    pub tx_id: Option<String>,
}

impl RecordFilter {
    fn matches<C: Command>(&self, command: &C) -> bool {
        if let Some(key) = &self.routing_key {
            if command.routing_key() != key {
                return false;
            }
        }
        if let Some(tx) = &self.tx_id {
            if command.tx_id() != tx {
                return false;
            }
        }
        true
    }
}

/// One page of decoded WAL records.
#[derive(Debug)]
pub struct WalPage<C> {
    /// Decoded records with their WAL indices, in scan order
    pub records: Vec<(u64, C)>,
    /// Cursor for the next (older-to-newer) page, if any
    pub next_cursor: Option<u64>,
    /// Cursor for the previous page, if any
    pub prev_cursor: Option<u64>,
    /// More records exist past `next_cursor`
    pub has_more: bool,
    /// Records exist before this page
    pub has_prev: bool,
}

/// Page through a partition's WAL directory.
///
/// `cursor` is the WAL index to continue from: forward pages return records
/// with strictly greater indices, backward pages strictly smaller ones
/// (`None` means "from the start" or "from the end" respectively). Filtered
/// records do not count against `page_size`.
pub fn read_wal_page<C: Command>(
    wal_dir: impl AsRef<Path>,
    codec: &CommandCodec<C>,
    cursor: Option<u64>,
    page_size: usize,
    direction: PageDirection,
    filter: &RecordFilter,
) -> Result<WalPage<C>> {
    if page_size == 0 {
        return Err(Error::Config("page_size must be greater than 0".to_string()));
    }

    match direction {
        PageDirection::Forward => {
            let after = cursor.unwrap_or(0);
            let mut scan = WalCursor::over_dir(&wal_dir, after)?;
            let mut records = Vec::with_capacity(page_size);
            let mut overflow = false;
            while let Some(record) = scan.read()? {
                let command = codec.decode(&record.type_key, &record.payload)?;
                if !filter.matches(&command) {
                    continue;
                }
                if records.len() == page_size {
                    overflow = true;
                    break;
                }
                records.push((record.index, command));
            }
            let first = records.first().map(|(i, _)| *i);
            let last = records.last().map(|(i, _)| *i);
            Ok(WalPage {
                next_cursor: last,
                prev_cursor: first,
                has_more: overflow,
                has_prev: after > 0,
                records,
            })
        }
        PageDirection::Backward => {
            let before = cursor.unwrap_or(u64::MAX);
            // Indices are dense, so a backward page is the tail of a
            // filtered forward scan up to the cursor
            let mut scan = WalCursor::over_dir(&wal_dir, 0)?;
            let mut matched: Vec<(u64, C)> = Vec::new();
            let mut beyond = false;
            while let Some(record) = scan.read()? {
                let command = codec.decode(&record.type_key, &record.payload)?;
                if !filter.matches(&command) {
                    continue;
                }
                if record.index >= before {
                    beyond = true;
                    break;
                }
                matched.push((record.index, command));
            }
            let has_prev = matched.len() > page_size;
            let records: Vec<(u64, C)> = if has_prev {
                matched.split_off(matched.len() - page_size)
            } else {
                std::mem::take(&mut matched)
            };
            let first = records.first().map(|(i, _)| *i);
            let last = records.last().map(|(i, _)| *i);
            Ok(WalPage {
                next_cursor: last,
                prev_cursor: first,
                has_more: beyond,
                has_prev,
                records,
            })
        }
    }
}

/// Dump every WAL record as one JSON line, oldest first.
///
/// Diagnostic only; decoding failures become error objects instead of
/// aborting the dump, so a partially-corrupt log still renders.
pub fn dump_wal<C: Command + Serialize>(
    wal_dir: impl AsRef<Path>,
    codec: &CommandCodec<C>,
) -> Result<Vec<String>> {
    let mut scan = WalCursor::over_dir(&wal_dir, 0)?;
    let mut lines = Vec::new();
    while let Some(record) = scan.read()? {
        let line = match codec.decode(&record.type_key, &record.payload) {
            Ok(command) => serde_json::json!({
                "index": record.index,
                "type_key": record.type_key,
                "command": command,
            }),
            Err(e) => serde_json::json!({
                "index": record.index,
                "type_key": record.type_key,
                "error": e.to_string(),
            }),
        };
        lines.push(line.to_string());
    }
    Ok(lines)
}

/// Human-oriented summary of a partition's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    /// WAL index the snapshot reflects
    pub last_wal_index: u64,
    /// Filter variant stored in the snapshot
    pub filter: String,
    /// Pretty-printed business state
    pub state_json: String,
}

/// Load and render a partition's snapshot for diagnostics.
///
/// Returns `None` when no (valid) snapshot exists.
pub fn dump_snapshot<S: DeserializeOwned + Serialize>(
    partition_dir: impl AsRef<Path>,
) -> Result<Option<SnapshotSummary>> {
    let store = SnapshotStore::open(&partition_dir)?;
    let Some(container) = store.load::<S>() else {
        return Ok(None);
    };
    let state_json = serde_json::to_string_pretty(&container.state)
        .map_err(|e| Error::Snapshot(format!("render state: {}", e)))?;
    Ok(Some(SnapshotSummary {
        last_wal_index: container.last_wal_index,
        filter: container.filter.name().to_string(),
        state_json,
    }))
}
