//! The pending-batch journal (§6, §4.7).
//!
//! One journal file per access thread, written before a batch's per-key
//! records are installed and deleted once the batch completes. Its
//! presence on reopen is what drives recovery's roll-forward/rollback
//! decision (§4.9 step 4). Persisted as JSON, matching the style of
//! `task_tracking.rs`'s `ActiveOperationStats` blob rather than a bespoke
//! binary format, since the journal is small, rare on the hot path, and
//! only ever read back once (by recovery).

use std::path::Path;

use pmemkv_types::Result;
use proxmox_sys::fs::{file_read_optional_string, replace_file, CreateOptions};
use serde::{Deserialize, Serialize};

use crate::allocator::{Extent, PmemOffset};

/// One entry of a client-supplied `BatchWrite` (§4.7): a value write, or a
/// tombstone when `value` is `None`.
#[derive(Clone)]
pub struct BatchEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl BatchEntry {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchEntry { key: key.into(), value: Some(value.into()) }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchEntry { key: key.into(), value: None }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct JournalExtent {
    pub offset: u64,
    pub blocks: u32,
}

impl From<Extent> for JournalExtent {
    fn from(e: Extent) -> Self {
        JournalExtent { offset: e.offset.0, blocks: e.blocks }
    }
}

impl JournalExtent {
    pub fn as_extent(&self) -> Extent {
        Extent { offset: PmemOffset(self.offset), blocks: self.blocks }
    }
}

#[derive(Serialize, Deserialize)]
pub struct PendingBatch {
    pub timestamp: u64,
    pub extents: Vec<JournalExtent>,
}

impl PendingBatch {
    pub fn new(timestamp: u64, extents: Vec<Extent>) -> Self {
        PendingBatch { timestamp, extents: extents.into_iter().map(JournalExtent::from).collect() }
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self).map_err(|e| {
            pmemkv_types::EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        replace_file(path, &data, CreateOptions::new(), true).map_err(|e| {
            pmemkv_types::EngineError::Io(std::io::Error::other(e.to_string()))
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = file_read_optional_string(path)
            .map_err(|e| pmemkv_types::EngineError::Io(std::io::Error::other(e.to_string())))?;
        match contents {
            Some(data) => {
                let batch = serde_json::from_str(&data).map_err(|e| {
                    pmemkv_types::EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
