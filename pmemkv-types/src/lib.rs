//! Basic types shared between the engine core and any frontend built on top
//! of it (client facades, collection backends, tooling).

use serde::{Deserialize, Serialize};

/// Status kinds exposed to callers of the engine.
///
/// `Ok` is modeled as `Result::Ok` throughout the crate; this enum only
/// covers the error half of the contract.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("key not found")]
    NotFound,
    #[error("persistent memory region exhausted")]
    PmemOverflow,
    #[error("invalid key or value size")]
    InvalidDataSize,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("too many concurrent access threads")]
    TooManyAccessThreads,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to map persistent region: {0}")]
    MapError(String),
    #[error("aborting: {0}")]
    Abort(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Upper bound on key size, in bytes (`key_size` is a 16-bit field on disk).
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Upper bound on value size, in bytes (`value_size` is a 32-bit field on disk).
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

pub fn check_key_size(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(EngineError::InvalidDataSize);
    }
    Ok(())
}

pub fn check_value_size(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(EngineError::InvalidDataSize);
    }
    Ok(())
}

/// On-medium record type tag (`RecordHeader::record_type`).
///
/// `*DeleteRecord` variants are tombstones: a persisted record that marks a
/// key's prior version as superseded without removing its visibility to
/// readers still holding an older snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u16)]
pub enum RecordType {
    StringRecord = 1,
    StringDeleteRecord = 2,
    SortedHeaderRecord = 3,
    SortedDataRecord = 4,
    SortedDeleteRecord = 5,
    HashHeaderRecord = 6,
    HashElemRecord = 7,
    HashDeleteRecord = 8,
    QueueHeaderRecord = 9,
    QueueElemRecord = 10,
}

impl RecordType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::StringRecord,
            2 => Self::StringDeleteRecord,
            3 => Self::SortedHeaderRecord,
            4 => Self::SortedDataRecord,
            5 => Self::SortedDeleteRecord,
            6 => Self::HashHeaderRecord,
            7 => Self::HashElemRecord,
            8 => Self::HashDeleteRecord,
            9 => Self::QueueHeaderRecord,
            10 => Self::QueueElemRecord,
            _ => return None,
        })
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            Self::StringDeleteRecord | Self::SortedDeleteRecord | Self::HashDeleteRecord
        )
    }

    /// Whether records of this type carry `prev`/`next` persistent links.
    pub fn is_doubly_linked(self) -> bool {
        matches!(
            self,
            Self::SortedHeaderRecord
                | Self::SortedDataRecord
                | Self::SortedDeleteRecord
                | Self::HashHeaderRecord
                | Self::HashElemRecord
                | Self::HashDeleteRecord
                | Self::QueueHeaderRecord
                | Self::QueueElemRecord
        )
    }
}

/// Collection-type tag salted into a collection descriptor's fingerprint
/// (`spec.md` §4.5: "a reserved fingerprint derived from the collection
/// name plus a collection-type tag"), so a sorted collection and a hash
/// collection registered under the same name never collide.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CollectionKind {
    Sorted = 1,
    Hash = 2,
    Queue = 3,
}

/// Coarse category used to pick a type mask for hash index lookups (a Get
/// against the anonymous string space must not match a skip list header
/// registered under the same fingerprint bucket, for example).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TypeMask {
    String,
    Sorted,
    Hash,
    Queue,
    Any,
}

impl TypeMask {
    pub fn matches(self, ty: RecordType) -> bool {
        use RecordType::*;
        match self {
            TypeMask::String => matches!(ty, StringRecord | StringDeleteRecord),
            TypeMask::Sorted => matches!(ty, SortedHeaderRecord | SortedDataRecord | SortedDeleteRecord),
            TypeMask::Hash => matches!(ty, HashHeaderRecord | HashElemRecord | HashDeleteRecord),
            TypeMask::Queue => matches!(ty, QueueHeaderRecord | QueueElemRecord),
            TypeMask::Any => true,
        }
    }
}

/// Whether journal and chunk writes call `fsync`/`fdatasync`.
///
/// Mirrors the tri-level tuning knob backup datastores expose for their
/// chunk store, generalized to the pending-batch journal and the persistent
/// region itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum SyncLevel {
    /// Never call fsync; rely on the page cache (fastest, weakest).
    None,
    /// fsync each record/journal write individually.
    #[default]
    File,
    /// fsync the containing directory too (strongest, slowest).
    Directory,
}

/// Immutable, on-disk engine configuration (the `configs` blob of §6).
///
/// Persisted once at creation time and checked for compatibility on every
/// subsequent `Open`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub layout_version: u32,
    pub block_size: u32,
    pub blocks_per_segment: u32,
    pub max_blocks_per_extent: u32,
    pub max_access_threads: u32,
    pub pmem_file_size: u64,
    pub hash_index_buckets: u64,
    pub sync_level: SyncLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layout_version: 1,
            block_size: 64,
            blocks_per_segment: 1 << 16,
            max_blocks_per_extent: 1024,
            max_access_threads: 64,
            pmem_file_size: 1 << 30,
            hash_index_buckets: 1 << 20,
            sync_level: SyncLevel::File,
        }
    }
}

impl EngineConfig {
    /// Checks a freshly opened instance's on-disk configs against the ones
    /// the caller asked to open with. Only parameters that affect on-medium
    /// layout must match; `max_access_threads` and `sync_level` may differ
    /// between runs.
    pub fn check_compatible(&self, on_disk: &EngineConfig) -> crate::Result<()> {
        if self.layout_version != on_disk.layout_version
            || self.block_size != on_disk.block_size
            || self.blocks_per_segment != on_disk.blocks_per_segment
            || self.pmem_file_size != on_disk.pmem_file_size
        {
            return Err(EngineError::InvalidConfiguration(format!(
                "on-disk layout (version {}, block_size {}, segment {} blocks, {} bytes) \
                 is incompatible with requested configuration",
                on_disk.layout_version,
                on_disk.block_size,
                on_disk.blocks_per_segment,
                on_disk.pmem_file_size
            )));
        }
        Ok(())
    }
}

/// Coarse operation kind, used when a caller wants to record that it is
/// about to perform IO against the engine (mirrors the read/write split
/// backup datastores track for maintenance-mode checks).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Read,
    Write,
}

/// Running tally produced by one old-records cleaner tick (`cleaner tick`
/// in the glossary). Exposed so operators/tests can observe cleaner
/// progress the same way a GC status blob is surfaced today.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanerStatus {
    pub ticks: u64,
    pub oldest_snapshot_ts: u64,
    pub data_records_freed: u64,
    pub delete_records_freed: u64,
    pub bytes_freed: u64,
}
