//! Atomic file replacement.
//!
//! Index files and metadata records are never written in place: content goes
//! to a sibling temp file first, is synced, and is renamed over the
//! destination. A reader either sees the old content or the new content,
//! never a torn write.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Context, Error, Result};
use crate::util::generate_tmpname;

/// Atomically replace `path` with `data`.
pub fn write_file(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid_input(format!("{path:?} has no parent directory")))?;

    let tmp = dir.join(generate_tmpname(".tmp-"));
    let result = (|| -> Result<()> {
        let mut file =
            File::create(&tmp).with_ctx(|| format!("create temp file {}", tmp.display()))?;
        file.write_all(data)
            .with_ctx(|| format!("write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_ctx(|| format!("sync temp file {}", tmp.display()))?;
        drop(file);
        std::fs::rename(&tmp, path)
            .with_ctx(|| format!("rename temp file into {}", path.display()))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)
        .map_err(|e| Error::invalid_input(format!("serialize JSON: {e}")))?;
    write_file(path, &data)
}

/// Remove `path`, treating a missing file as success.
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_ctx(|| format!("remove {}", path.display())),
    }
}
