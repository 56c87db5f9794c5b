//! The image-id side index.
//!
//! One file per image id (the config digest), named `<algo>-<hex>`, whose
//! ASCII body is the manifest digest. The file's mtime doubles as the
//! image's last-used time; GC reads it to decide what is still wanted.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use tracing::debug;

use vessel::atomic;
use vessel::error::{Context, Error, Result};
use vessel::Digest;

#[derive(Debug, Clone)]
pub struct ImageIdStore {
    root: PathBuf,
}

/// One image-id entry.
#[derive(Debug, Clone)]
pub struct ImageIdEntry {
    pub image_id: Digest,
    pub manifest_digest: Digest,
    pub last_used: SystemTime,
}

impl ImageIdStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_ctx(|| format!("create image-id directory {}", root.display()))?;
        Ok(ImageIdStore { root })
    }

    fn entry_path(&self, image_id: &Digest) -> PathBuf {
        self.root.join(image_id.entry_name())
    }

    /// Record that `image_id` resolves to `manifest_digest`.
    pub fn add(&self, image_id: &Digest, manifest_digest: &Digest) -> Result<()> {
        atomic::write_file(
            self.entry_path(image_id),
            manifest_digest.to_string().as_bytes(),
        )
        .with_ctx(|| format!("record image id {image_id}"))
    }

    /// Resolve an image id to its manifest digest.
    pub fn get(&self, image_id: &Digest) -> Result<Digest> {
        let path = self.entry_path(image_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("image {image_id}")))
            }
            Err(e) => return Err(e).with_ctx(|| format!("read image id {image_id}")),
        };
        Digest::parse(content.trim())
            .with_ctx(|| format!("image id entry {image_id}"))
    }

    /// All valid entries; files that don't parse are skipped.
    pub fn list(&self) -> Result<Vec<ImageIdEntry>> {
        let mut entries = Vec::new();
        let dir = std::fs::read_dir(&self.root)
            .with_ctx(|| format!("read image-id directory {}", self.root.display()))?;
        for entry in dir {
            let entry = entry.ctx("read image-id directory")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!("skipping image-id entry with non-UTF8 name");
                continue;
            };
            let Ok(image_id) = Digest::from_entry_name(name) else {
                debug!("skipping unparseable image-id entry {name}");
                continue;
            };
            let manifest_digest = match self.get(&image_id) {
                Ok(digest) => digest,
                Err(e) => {
                    debug!("skipping unreadable image-id entry {name}: {e}");
                    continue;
                }
            };
            let last_used = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(ImageIdEntry {
                image_id,
                manifest_digest,
                last_used,
            });
        }
        Ok(entries)
    }

    /// Reset the last-used time of an image.
    pub fn mark_used(&self, image_id: &Digest) -> Result<()> {
        let now = FileTime::from_system_time(SystemTime::now());
        filetime::set_file_times(self.entry_path(image_id), now, now)
            .with_ctx(|| format!("touch image id {image_id}"))
    }

    /// Drop an entry; missing entries are fine.
    pub fn remove(&self, image_id: &Digest) -> Result<()> {
        atomic::remove_if_exists(self.entry_path(image_id))
    }

    /// Root directory of the store (for tests and GC accounting).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ImageIdStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageIdStore::open(dir.path().join("image-ids")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_get_roundtrip() {
        let (_dir, store) = store();
        let id = Digest::sha256_of(b"config");
        let manifest = Digest::sha256_of(b"manifest");

        store.add(&id, &manifest).unwrap();
        assert_eq!(store.get(&id).unwrap(), manifest);
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = store();
        let err = store.get(&Digest::sha256_of(b"nope")).unwrap_err();
        assert_eq!(err.kind(), vessel::ErrorKind::NotFound);
    }

    #[test]
    fn test_list_skips_garbage() {
        let (_dir, store) = store();
        let id = Digest::sha256_of(b"config");
        store.add(&id, &Digest::sha256_of(b"manifest")).unwrap();
        std::fs::write(store.root().join("not-an-entry"), b"?").unwrap();
        std::fs::write(
            store.root().join(Digest::sha256_of(b"bad").entry_name()),
            b"not a digest",
        )
        .unwrap();

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image_id, id);
    }

    #[test]
    fn test_mark_used_bumps_mtime() {
        let (_dir, store) = store();
        let id = Digest::sha256_of(b"config");
        store.add(&id, &Digest::sha256_of(b"manifest")).unwrap();

        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(store.root().join(id.entry_name()), old, old).unwrap();
        store.mark_used(&id).unwrap();

        let entry = &store.list().unwrap()[0];
        assert!(entry.last_used > SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_001));
    }

    #[test]
    fn test_remove_idempotent() {
        let (_dir, store) = store();
        let id = Digest::sha256_of(b"config");
        store.add(&id, &Digest::sha256_of(b"manifest")).unwrap();
        store.remove(&id).unwrap();
        store.remove(&id).unwrap();
        assert!(store.get(&id).is_err());
    }
}
