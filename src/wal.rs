//! Write-ahead log store
//!
//! Durable, append-only, crash-safe sequence of command records with
//! strictly increasing 64-bit indices, backed by memory-mapped fixed-size
//! segment files for sequential-write latencies in the nanosecond range.
//!
//! # Layout
//!
//! Each segment file is named by the index its first record receives
//! (`00000000000000000001.wal`) and starts with an 8-byte header (magic +
//! version). Records are framed as:
//!
//! ```text
//! [index u64][type_key_len u16][payload_len u32][crc32 u32][type_key][payload]
//! ```
//!
//! The CRC covers the type key and payload. A zeroed index terminates a
//! scan (segments are zero-filled at creation), as does a CRC mismatch —
//! a torn tail record from a crash was never acknowledged and is simply
//! overwritten by the next append.
//!
//! # Concurrency
//!
//! One writer per partition; the single-writer loop guarantees exclusive
//! `&mut` access. Cursors open their own read-only mappings and are used
//! before the writer starts (recovery) or offline (admin tools).

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::{debug, info, warn};

use crate::config::{WalConfig, WalSyncMode};
use crate::error::{Error, Result};

const SEGMENT_MAGIC: &[u8; 4] = b"LWAL";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: u64 = 8;
const RECORD_HEADER_LEN: u64 = 18;
const MAX_TYPE_KEY_LEN: usize = 1024;

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Index assigned by the store on append
    pub index: u64,
    /// Deserializer dispatch tag
    pub type_key: String,
    /// Serialized command
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SegmentRef {
    start_index: u64,
    path: PathBuf,
}

/// Append-only segmented WAL store for one partition.
pub struct WalStore {
    dir: PathBuf,
    config: WalConfig,
    segments: Vec<SegmentRef>,
    active: MmapMut,
    write_pos: u64,
    next_index: u64,
}

impl WalStore {
    /// Open or create the store under `dir`.
    ///
    /// Reopening scans the live segment to recover the next index and the
    /// append position past the last intact record.
    pub fn open(dir: impl AsRef<Path>, config: &WalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        if segments.is_empty() {
            let first = create_segment(&dir, 1, config.segment_size)?;
            segments.push(first);
        }

        let last = segments.last().expect("at least one segment").clone();
        let file = OpenOptions::new().read(true).write(true).open(&last.path)?;
        // SAFETY: the store is the only writer for this partition directory
        let active = unsafe { MmapMut::map_mut(&file)? };
        verify_segment_header(&active, &last.path)?;

        let (last_index, write_pos) = scan_live_segment(&active, last.start_index)?;
        let next_index = last_index + 1;

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            next_index,
            "WAL opened"
        );

        Ok(Self {
            dir,
            config: config.clone(),
            segments,
            active,
            write_pos,
            next_index,
        })
    }

    /// Append a record and return its index.
    ///
    /// After return the record survives a process crash, subject to the
    /// configured sync mode; `close` forces a durable boundary.
    pub fn append(&mut self, type_key: &str, payload: &[u8]) -> Result<u64> {
        if type_key.len() > MAX_TYPE_KEY_LEN {
            return Err(Error::Wal(format!(
                "type key too long: {} bytes",
                type_key.len()
            )));
        }
        let need = RECORD_HEADER_LEN + type_key.len() as u64 + payload.len() as u64;
        if need > self.config.segment_size - SEGMENT_HEADER_LEN {
            return Err(Error::Wal(format!(
                "record of {} bytes exceeds segment capacity",
                need
            )));
        }
        if self.write_pos + need > self.config.segment_size {
            self.roll()?;
        }

        let index = self.next_index;
        let mut crc = crc32fast::Hasher::new();
        crc.update(type_key.as_bytes());
        crc.update(payload);
        let checksum = crc.finalize();

        let at = self.write_pos as usize;
        let buf = &mut self.active[at..at + need as usize];
        buf[0..8].copy_from_slice(&index.to_le_bytes());
        buf[8..10].copy_from_slice(&(type_key.len() as u16).to_le_bytes());
        buf[10..14].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[14..18].copy_from_slice(&checksum.to_le_bytes());
        let body = RECORD_HEADER_LEN as usize;
        buf[body..body + type_key.len()].copy_from_slice(type_key.as_bytes());
        buf[body + type_key.len()..].copy_from_slice(payload);

        match self.config.sync_mode {
            WalSyncMode::None => {}
            WalSyncMode::Async => self
                .active
                .flush_async_range(at, need as usize)
                .map_err(|e| Error::Wal(format!("flush_async failed: {}", e)))?,
            WalSyncMode::Sync => self
                .active
                .flush_range(at, need as usize)
                .map_err(|e| Error::Wal(format!("flush failed: {}", e)))?,
        }

        self.write_pos += need;
        self.next_index += 1;
        Ok(index)
    }

    /// Cursor positioned so the next record read has index > `index`.
    /// `scan_from(0)` starts at the beginning of the log.
    pub fn scan_from(&self, index: u64) -> WalCursor {
        WalCursor::new(self.segments.clone(), index)
    }

    /// Index of the last appended record, 0 when the log is empty.
    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }

    /// Force a durable flush of the active segment.
    pub fn sync(&self) -> Result<()> {
        self.active
            .flush()
            .map_err(|e| Error::Wal(format!("flush failed: {}", e)))
    }

    /// Flush and release the store.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        debug!(dir = %self.dir.display(), "WAL closed");
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        self.active
            .flush()
            .map_err(|e| Error::Wal(format!("flush before roll failed: {}", e)))?;
        let seg = create_segment(&self.dir, self.next_index, self.config.segment_size)?;
        let file = OpenOptions::new().read(true).write(true).open(&seg.path)?;
        // SAFETY: fresh segment, exclusively owned by this store
        self.active = unsafe { MmapMut::map_mut(&file)? };
        debug!(start_index = seg.start_index, "WAL segment rolled");
        self.segments.push(seg);
        self.write_pos = SEGMENT_HEADER_LEN;
        Ok(())
    }
}

/// Read cursor over the segment chain.
pub struct WalCursor {
    segments: Vec<SegmentRef>,
    segment_pos: usize,
    mapped: Option<Mmap>,
    offset: u64,
    after_index: u64,
}

impl WalCursor {
    /// Cursor over an existing WAL directory without opening it for
    /// appends. Records with index <= `after_index` are skipped; pass 0 to
    /// read everything. Intended for offline inspection.
    pub fn over_dir(dir: impl AsRef<Path>, after_index: u64) -> Result<Self> {
        let segments = list_segments(dir.as_ref())?;
        Ok(Self::new(segments, after_index))
    }

    fn new(segments: Vec<SegmentRef>, after_index: u64) -> Self {
        // Start at the last segment whose first record could still be
        // beyond `after_index`
        let segment_pos = segments
            .iter()
            .rposition(|s| s.start_index <= after_index)
            .unwrap_or(0);
        Self {
            segments,
            segment_pos,
            mapped: None,
            offset: SEGMENT_HEADER_LEN,
            after_index,
        }
    }

    /// Next record, or `None` at end of log.
    pub fn read(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.segment_pos >= self.segments.len() {
                return Ok(None);
            }
            if self.mapped.is_none() {
                let path = &self.segments[self.segment_pos].path;
                let file = File::open(path)?;
                // SAFETY: read-only mapping of a segment no writer mutates
                // behind the scanned region during recovery/offline use
                let map = unsafe { Mmap::map(&file)? };
                verify_segment_header(&map, path)?;
                self.mapped = Some(map);
                self.offset = SEGMENT_HEADER_LEN;
            }

            let map = self.mapped.as_ref().expect("segment mapped");
            match read_frame(map, self.offset)? {
                Some((record, next_offset)) => {
                    self.offset = next_offset;
                    if record.index <= self.after_index {
                        continue;
                    }
                    return Ok(Some(record));
                }
                None => {
                    self.mapped = None;
                    self.segment_pos += 1;
                }
            }
        }
    }
}

fn segment_path(dir: &Path, start_index: u64) -> PathBuf {
    dir.join(format!("{:020}.wal", start_index))
}

fn list_segments(dir: &Path) -> Result<Vec<SegmentRef>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".wal") else {
            continue;
        };
        match stem.parse::<u64>() {
            Ok(start_index) => segments.push(SegmentRef { start_index, path }),
            Err(_) => warn!(file = name, "ignoring non-segment file in WAL directory"),
        }
    }
    segments.sort_by_key(|s| s.start_index);
    Ok(segments)
}

fn create_segment(dir: &Path, start_index: u64, size: u64) -> Result<SegmentRef> {
    let path = segment_path(dir, start_index);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                Error::Wal(format!("segment already exists: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
    file.set_len(size)?;
    // SAFETY: freshly created file, no other mapping exists
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    map[0..4].copy_from_slice(SEGMENT_MAGIC);
    map[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    map.flush()
        .map_err(|e| Error::Wal(format!("segment header flush failed: {}", e)))?;
    Ok(SegmentRef { start_index, path })
}

fn verify_segment_header(map: &[u8], path: &Path) -> Result<()> {
    if map.len() < SEGMENT_HEADER_LEN as usize {
        return Err(Error::Wal(format!("segment too short: {}", path.display())));
    }
    if &map[0..4] != SEGMENT_MAGIC {
        return Err(Error::Wal(format!("bad segment magic: {}", path.display())));
    }
    let version = u32::from_le_bytes(map[4..8].try_into().expect("4 bytes"));
    if version != SEGMENT_VERSION {
        return Err(Error::Wal(format!(
            "unsupported segment version {} in {}",
            version,
            path.display()
        )));
    }
    Ok(())
}

/// Decode the frame at `offset`; `None` marks end of intact records.
fn read_frame(map: &[u8], offset: u64) -> Result<Option<(WalRecord, u64)>> {
    let at = offset as usize;
    if at + RECORD_HEADER_LEN as usize > map.len() {
        return Ok(None);
    }
    let index = u64::from_le_bytes(map[at..at + 8].try_into().expect("8 bytes"));
    if index == 0 {
        return Ok(None);
    }
    let type_key_len = u16::from_le_bytes(map[at + 8..at + 10].try_into().expect("2 bytes")) as usize;
    let payload_len =
        u32::from_le_bytes(map[at + 10..at + 14].try_into().expect("4 bytes")) as usize;
    let checksum = u32::from_le_bytes(map[at + 14..at + 18].try_into().expect("4 bytes"));

    let body = at + RECORD_HEADER_LEN as usize;
    if type_key_len > MAX_TYPE_KEY_LEN || body + type_key_len + payload_len > map.len() {
        return Ok(None);
    }
    let type_key_bytes = &map[body..body + type_key_len];
    let payload = &map[body + type_key_len..body + type_key_len + payload_len];

    let mut crc = crc32fast::Hasher::new();
    crc.update(type_key_bytes);
    crc.update(payload);
    if crc.finalize() != checksum {
        // Torn tail from a crash; the record was never acknowledged
        return Ok(None);
    }

    let type_key = std::str::from_utf8(type_key_bytes)
        .map_err(|_| Error::Wal("type key is not valid UTF-8".to_string()))?
        .to_string();
    Ok(Some((
        WalRecord {
            index,
            type_key,
            payload: payload.to_vec(),
        },
        offset + RECORD_HEADER_LEN + type_key_len as u64 + payload_len as u64,
    )))
}

/// Find the last intact record and the append position in the live segment.
fn scan_live_segment(map: &[u8], start_index: u64) -> Result<(u64, u64)> {
    let mut last_index = start_index - 1;
    let mut offset = SEGMENT_HEADER_LEN;
    while let Some((record, next_offset)) = read_frame(map, offset)? {
        last_index = record.index;
        offset = next_offset;
    }
    Ok((last_index, offset))
}
