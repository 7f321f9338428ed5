//! On-disk directory layout for an engine instance.
//!
//! Mirrors `kv_engine.hpp`'s `data_file`/`persisted_pending_block_file`/
//! `backup_mark_file`/`config_file` path helpers.

use std::path::{Path, PathBuf};

/// The memory-mapped persistent region.
pub fn data_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join("data")
}

/// Fixed-size blob of immutable configs.
pub fn config_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join("configs")
}

/// Directory holding one pending-batch journal per access thread id.
pub fn pending_batch_dir(instance_dir: &Path) -> PathBuf {
    instance_dir.join("pending_batch")
}

pub fn pending_batch_file(instance_dir: &Path, tid: usize) -> PathBuf {
    pending_batch_dir(instance_dir).join(tid.to_string())
}

/// Presence marks the instance as a read-only backup.
pub fn backup_mark_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join("backup_mark")
}

/// Inter-process exclusivity lock for the instance directory.
pub fn lock_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join("lock")
}

pub fn ensure_instance_dirs(instance_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(instance_dir)?;
    std::fs::create_dir_all(pending_batch_dir(instance_dir))?;
    Ok(())
}
