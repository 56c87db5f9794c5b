//! Content-addressable blob storage.
//!
//! Blobs live at `<root>/<algo>/<hex>` and their content always hashes to
//! their own filename. Writes stream through a hasher into a temp file
//! (`<root>/.tmp-*`), are synced, and are renamed into place only if the
//! destination does not already exist — a hash collision with an existing
//! blob is treated as equality and the temp file is discarded. A crashed
//! write can therefore never produce a half-written blob, only a stray temp
//! file that the next [`BlobStore::retain`] sweep removes.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use flate2::read::GzEncoder;
use flate2::Compression;
use log::debug;
use serde::Serialize;

use crate::digest::Digest;
use crate::error::{Context, Error, Result};
use crate::util::{generate_tmpname, DigestReader, DigestWriter};

/// A content-addressable byte store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if necessary) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_ctx(|| format!("create blob directory {}", root.display()))?;
        Ok(BlobStore { root })
    }

    /// The directory blobs are stored under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.blob_path())
    }

    /// Stream `reader` into the store, returning the digest and size.
    pub fn put(&self, reader: &mut impl Read) -> Result<(Digest, u64)> {
        let tmp = self.root.join(generate_tmpname(".tmp-"));
        let result = self.put_tmp(reader, &tmp);
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    fn put_tmp(&self, reader: &mut impl Read, tmp: &Path) -> Result<(Digest, u64)> {
        let file = File::create(tmp).with_ctx(|| format!("create temp blob {}", tmp.display()))?;
        let mut writer = DigestWriter::new(file);
        std::io::copy(reader, &mut writer).ctx("write blob content")?;
        let (file, digest, size) = writer.finalize();
        file.sync_all().ctx("sync blob content")?;
        drop(file);

        let dest = self.blob_path(&digest);
        if dest.exists() {
            // content-equal by definition of the address
            std::fs::remove_file(tmp).with_ctx(|| format!("discard temp blob {}", tmp.display()))?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_ctx(|| format!("create blob directory {}", parent.display()))?;
            }
            std::fs::rename(tmp, &dest)
                .with_ctx(|| format!("rename blob into {}", dest.display()))?;
        }
        Ok((digest, size))
    }

    /// Store a byte slice.
    pub fn put_bytes(&self, data: &[u8]) -> Result<(Digest, u64)> {
        self.put(&mut std::io::Cursor::new(data))
    }

    /// Serialize `value` as canonical JSON and store it.
    pub fn put_json<T: Serialize>(&self, value: &T) -> Result<(Digest, u64)> {
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::invalid_input(format!("serialize JSON blob: {e}")))?;
        self.put_bytes(&data)
    }

    /// Store a plaintext tar stream as a gzipped layer blob.
    ///
    /// The plaintext is teed through a SHA-256 hasher (the layer's diff-id)
    /// while it feeds the gzip compressor whose output is stored. Returns
    /// `(compressed_digest, compressed_size, diff_id)`.
    pub fn put_layer(&self, reader: impl Read) -> Result<(Digest, u64, Digest)> {
        let tee = DigestReader::new(reader);
        let mut gz = GzEncoder::new(tee, Compression::default());
        let (digest, size) = self.put(&mut gz)?;
        let diff_id = gz.into_inner().finalize();
        Ok((digest, size, diff_id))
    }

    /// Open a blob for reading.
    pub fn read(&self, digest: &Digest) -> Result<File> {
        let path = self.blob_path(digest);
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {digest}")))
            }
            Err(e) => Err(e).with_ctx(|| format!("open blob {digest}")),
        }
    }

    /// Read a blob fully into memory.
    pub fn read_to_vec(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read(digest)?
            .read_to_end(&mut data)
            .with_ctx(|| format!("read blob {digest}"))?;
        Ok(data)
    }

    /// True if the blob exists.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Metadata (size, mtime) for a blob.
    pub fn stat(&self, digest: &Digest) -> Result<std::fs::Metadata> {
        let path = self.blob_path(digest);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {digest}")))
            }
            Err(e) => Err(e).with_ctx(|| format!("stat blob {digest}")),
        }
    }

    /// Mark a blob as recently used by resetting its timestamps.
    pub fn touch(&self, digest: &Digest) -> Result<()> {
        let now = FileTime::from_system_time(SystemTime::now());
        filetime::set_file_times(self.blob_path(digest), now, now)
            .with_ctx(|| format!("touch blob {digest}"))
    }

    /// Delete every blob whose digest is not in `keep`.
    ///
    /// Entries whose filename does not parse back to a digest are logged and
    /// preserved; stray temp files from crashed writes are removed.
    pub fn retain(&self, keep: &HashSet<Digest>) -> Result<()> {
        let top = std::fs::read_dir(&self.root)
            .with_ctx(|| format!("read blob directory {}", self.root.display()))?;
        for entry in top {
            let entry = entry.ctx("read blob directory")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!("preserving blob entry with non-UTF8 name {:?}", entry.file_name());
                continue;
            };
            if name.starts_with(".tmp-") {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            if !entry.file_type().ctx("stat blob entry")?.is_dir() {
                debug!("preserving unexpected non-directory blob entry {name}");
                continue;
            }
            self.retain_algo_dir(name, &entry.path(), keep)?;
        }
        Ok(())
    }

    fn retain_algo_dir(&self, algo: &str, dir: &Path, keep: &HashSet<Digest>) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).with_ctx(|| format!("read blob directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.ctx("read blob directory")?;
            let name = entry.file_name();
            let digest = name
                .to_str()
                .and_then(|hex| Digest::parse(&format!("{algo}:{hex}")).ok());
            match digest {
                Some(digest) if keep.contains(&digest) => {}
                Some(digest) => {
                    debug!("removing unreferenced blob {digest}");
                    std::fs::remove_file(entry.path())
                        .with_ctx(|| format!("remove blob {digest}"))?;
                }
                None => {
                    debug!("preserving unparseable blob entry {algo}/{name:?}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::read::GzDecoder;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_and_read() {
        let (_dir, store) = store();
        let (digest, size) = store.put_bytes(b"hello blob").unwrap();
        assert_eq!(size, 10);
        assert_eq!(digest, Digest::sha256_of(b"hello blob"));
        assert_eq!(store.read_to_vec(&digest).unwrap(), b"hello blob");

        // content hashes to its own filename
        let on_disk = std::fs::read(store.root().join(digest.blob_path())).unwrap();
        assert_eq!(Digest::sha256_of(&on_disk), digest);
    }

    #[test]
    fn test_put_deduplicates() {
        let (_dir, store) = store();
        let (a, _) = store.put_bytes(b"same").unwrap();
        let (b, _) = store.put_bytes(b"same").unwrap();
        assert_eq!(a, b);
        // no temp files left behind
        let stray: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn test_read_missing() {
        let (_dir, store) = store();
        let absent = Digest::sha256_of(b"never stored");
        assert_eq!(store.read(&absent).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.stat(&absent).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_put_layer() {
        let (_dir, store) = store();
        let plaintext = b"pretend this is a tar stream".to_vec();
        let (digest, size, diff_id) = store.put_layer(&plaintext[..]).unwrap();

        assert_eq!(diff_id, Digest::sha256_of(&plaintext));
        assert!(size > 0);

        // stored bytes are the gzip framing of the plaintext
        let stored = store.read_to_vec(&digest).unwrap();
        assert_eq!(Digest::sha256_of(&stored), digest);
        let mut unpacked = Vec::new();
        GzDecoder::new(&stored[..]).read_to_end(&mut unpacked).unwrap();
        assert_eq!(unpacked, plaintext);
    }

    #[test]
    fn test_retain() {
        let (_dir, store) = store();
        let (keep_me, _) = store.put_bytes(b"keep").unwrap();
        let (drop_me, _) = store.put_bytes(b"drop").unwrap();
        // an unparseable entry is preserved
        let weird = store.root().join("sha256").join("not-a-digest");
        std::fs::write(&weird, b"?").unwrap();
        // a stray temp file is cleaned up
        let stray = store.root().join(".tmp-stray");
        std::fs::write(&stray, b"?").unwrap();

        let keep: HashSet<Digest> = [keep_me.clone()].into_iter().collect();
        store.retain(&keep).unwrap();

        assert!(store.contains(&keep_me));
        assert!(!store.contains(&drop_me));
        assert!(weird.exists());
        assert!(!stray.exists());
    }

    #[test]
    fn test_touch_updates_mtime() {
        let (_dir, store) = store();
        let (digest, _) = store.put_bytes(b"aging").unwrap();
        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(store.root().join(digest.blob_path()), old, old).unwrap();

        store.touch(&digest).unwrap();
        let mtime = FileTime::from_last_modification_time(&store.stat(&digest).unwrap());
        assert!(mtime > old);
    }
}
