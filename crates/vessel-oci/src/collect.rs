//! Classifying host paths and URLs into tree sources.
//!
//! The collector turns whatever the builder points it at into a
//! [`Source`]: regular files (optionally sniffed as tar/gzip/bzip2 archive
//! overlays), directories, symlinks, fifos and devices. Hardlinked inputs
//! are deduplicated by `(dev, ino, uid, gid)` so repeated encounters share
//! one source and the tree's hardlink machinery engages. URL inputs carry an
//! HTTP revalidation record backed by an on-disk header cache.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use rustix::fs::{major, minor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vessel::atomic;
use vessel::error::{Context, Error, Result};
use vessel::fsspec::{
    Compression, DeviceKind, DeviceNum, FileAttrs, HttpInfo, Source, TarSource,
};
use vessel::Digest;

/// A classified input ready to be added to a tree.
#[derive(Debug)]
pub struct CollectedSource {
    pub source: Rc<Source>,
    pub attrs: FileAttrs,
    pub url: Option<String>,
    pub http: Option<HttpInfo>,
}

/// Classifies host paths and URLs into sources.
pub struct SourceCollector {
    inodes: HashMap<(u64, u64, u32, u32), Rc<Source>>,
    http_cache: Option<HttpHeaderCache>,
    client: Client,
}

impl Default for SourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceCollector {
    pub fn new() -> Self {
        SourceCollector {
            inodes: HashMap::new(),
            http_cache: None,
            client: Client::new(),
        }
    }

    /// Enable the HTTP header cache at `dir`.
    pub fn with_http_cache(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        self.http_cache = Some(HttpHeaderCache::open(dir)?);
        Ok(self)
    }

    /// Classify a host path.
    ///
    /// With `overlay`, a regular file that frames a tar archive (plain,
    /// gzip or bzip2) becomes an archive overlay source instead of a file.
    /// Sockets are rejected.
    pub fn classify(&mut self, path: &Path, overlay: bool) -> Result<CollectedSource> {
        let meta = std::fs::symlink_metadata(path)
            .with_ctx(|| format!("stat source {}", path.display()))?;
        let file_type = meta.file_type();

        let mut attrs = FileAttrs {
            mode: Some(meta.permissions().mode() & 0o7777),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            mtime: Some(meta.mtime()),
            ..FileAttrs::default()
        };

        let source = if file_type.is_file() {
            attrs.size = Some(meta.len());
            let key = (meta.dev(), meta.ino(), meta.uid(), meta.gid());
            if meta.nlink() > 1 {
                if let Some(existing) = self.inodes.get(&key) {
                    debug!("source {} deduplicated by inode", path.display());
                    return Ok(CollectedSource {
                        source: Rc::clone(existing),
                        attrs,
                        url: None,
                        http: None,
                    });
                }
            }
            let source = match overlay.then(|| detect_archive(path)).transpose()?.flatten() {
                Some(compression) => Rc::new(Source::TarOverlay(TarSource {
                    path: path.to_path_buf(),
                    compression,
                })),
                None => Source::file_from_host(path),
            };
            if meta.nlink() > 1 {
                self.inodes.insert(key, Rc::clone(&source));
            }
            source
        } else if file_type.is_dir() {
            Rc::new(Source::Dir)
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(path)
                .with_ctx(|| format!("read symlink {}", path.display()))?;
            attrs.link_target = Some(target.clone());
            Source::symlink(target)
        } else if file_type.is_fifo() {
            Rc::new(Source::Fifo)
        } else if file_type.is_block_device() || file_type.is_char_device() {
            let rdev = meta.rdev();
            let device = DeviceNum {
                kind: if file_type.is_block_device() {
                    DeviceKind::Block
                } else {
                    DeviceKind::Char
                },
                major: major(rdev),
                minor: minor(rdev),
            };
            attrs.device = Some(device);
            Rc::new(Source::Device(device))
        } else {
            return Err(Error::invalid_input(format!(
                "{} is a socket and cannot be stored in an image",
                path.display()
            )));
        };

        Ok(CollectedSource {
            source,
            attrs,
            url: None,
            http: None,
        })
    }

    /// Derive a URL source, revalidating against the header cache.
    ///
    /// A `304 Not Modified` replays the cached headers; a `200` refreshes
    /// the cache. The content itself is fetched later, at write time.
    pub fn url(&mut self, url: &str) -> Result<CollectedSource> {
        let cached = self.http_cache.as_ref().and_then(|c| c.get(url));

        let mut request = self.client.get(url);
        if let Some(info) = &cached {
            if let Some(etag) = &info.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &info.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }
        let response = request
            .send()
            .map_err(|e| Error::corrupt(format!("fetch {url}: {e}")))?;

        let info = if response.status() == StatusCode::NOT_MODIFIED {
            debug!("{url}: not modified, replaying cached headers");
            cached.unwrap_or_default()
        } else if response.status().is_success() {
            let header = |name| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let info = HttpInfo {
                etag: header(ETAG),
                last_modified: header(LAST_MODIFIED),
                content_length: response.content_length(),
            };
            if let Some(cache) = &self.http_cache {
                cache.put(url, &info)?;
            }
            info
        } else {
            return Err(Error::corrupt(format!(
                "fetch {url}: unexpected status {}",
                response.status()
            )));
        };

        let mut attrs = FileAttrs::with_mode(0o644);
        attrs.size = info.content_length;
        Ok(CollectedSource {
            source: Source::url(url, Some(info.clone())),
            attrs,
            url: Some(url.to_string()),
            http: Some(info),
        })
    }
}

/// Sniff a file for tar content, trying gzip and bzip2 framings before
/// plain, reopening the file for each attempt.
fn detect_archive(path: &Path) -> Result<Option<Compression>> {
    for compression in [Compression::Gzip, Compression::Bzip2, Compression::None] {
        let file = std::fs::File::open(path)
            .with_ctx(|| format!("open source {}", path.display()))?;
        let reader: Box<dyn Read> = match compression {
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
            Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
            Compression::None => Box::new(file),
        };
        if looks_like_tar(reader) {
            return Ok(Some(compression));
        }
    }
    Ok(None)
}

/// A tar stream has "ustar" at offset 257 of its first 512-byte block.
fn looks_like_tar(mut reader: impl Read) -> bool {
    let mut block = [0u8; 512];
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    &block[257..262] == b"ustar"
}

/// On-disk cache of HTTP validation headers, keyed by URL digest.
#[derive(Debug)]
struct HttpHeaderCache {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedHeaders {
    url: String,
    #[serde(flatten)]
    info: HttpInfo,
}

impl HttpHeaderCache {
    fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_ctx(|| format!("create HTTP cache directory {}", dir.display()))?;
        Ok(HttpHeaderCache { dir })
    }

    fn entry(&self, url: &str) -> PathBuf {
        self.dir.join(Digest::sha256_of(url.as_bytes()).hex())
    }

    fn get(&self, url: &str) -> Option<HttpInfo> {
        let data = std::fs::read(self.entry(url)).ok()?;
        let cached: CachedHeaders = serde_json::from_slice(&data).ok()?;
        // a digest collision or stale rename must not replay foreign headers
        (cached.url == url).then_some(cached.info)
    }

    fn put(&self, url: &str, info: &HttpInfo) -> Result<()> {
        atomic::write_json(
            self.entry(url),
            &CachedHeaders {
                url: url.to_string(),
                info: info.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn write_tar(path: &Path) {
        let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "file.txt", &b"12345"[..])
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_classify_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"data").unwrap();

        let mut collector = SourceCollector::new();
        let collected = collector.classify(&file, false).unwrap();
        assert!(matches!(&*collected.source, Source::File(..)));
        assert_eq!(collected.attrs.size, Some(4));

        let collected = collector.classify(dir.path(), false).unwrap();
        assert!(matches!(&*collected.source, Source::Dir));
    }

    #[test]
    fn test_classify_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();

        let mut collector = SourceCollector::new();
        let collected = collector.classify(&link, false).unwrap();
        assert!(matches!(&*collected.source, Source::Symlink(..)));
        assert_eq!(collected.attrs.link_target, Some(PathBuf::from("target")));
    }

    #[test]
    fn test_archive_detection() {
        let dir = tempfile::tempdir().unwrap();

        let plain_tar = dir.path().join("a.tar");
        write_tar(&plain_tar);
        assert_eq!(
            detect_archive(&plain_tar).unwrap(),
            Some(Compression::None)
        );

        let gz_tar = dir.path().join("a.tar.gz");
        {
            let mut tar_bytes = Vec::new();
            std::fs::File::open(&plain_tar)
                .unwrap()
                .read_to_end(&mut tar_bytes)
                .unwrap();
            let mut encoder = GzEncoder::new(
                std::fs::File::create(&gz_tar).unwrap(),
                flate2::Compression::default(),
            );
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }
        assert_eq!(detect_archive(&gz_tar).unwrap(), Some(Compression::Gzip));

        let bz_tar = dir.path().join("a.tar.bz2");
        {
            let mut tar_bytes = Vec::new();
            std::fs::File::open(&plain_tar)
                .unwrap()
                .read_to_end(&mut tar_bytes)
                .unwrap();
            let mut encoder = bzip2::write::BzEncoder::new(
                std::fs::File::create(&bz_tar).unwrap(),
                bzip2::Compression::default(),
            );
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }
        assert_eq!(detect_archive(&bz_tar).unwrap(), Some(Compression::Bzip2));

        let not_tar = dir.path().join("note.txt");
        std::fs::write(&not_tar, b"just some text").unwrap();
        assert_eq!(detect_archive(&not_tar).unwrap(), None);
    }

    #[test]
    fn test_overlay_classification() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("content.tar");
        write_tar(&archive);

        let mut collector = SourceCollector::new();
        let collected = collector.classify(&archive, true).unwrap();
        assert!(matches!(&*collected.source, Source::TarOverlay(..)));

        // without overlay the same file is a plain file source
        let collected = collector.classify(&archive, false).unwrap();
        assert!(matches!(&*collected.source, Source::File(..)));
    }

    #[test]
    fn test_hardlink_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"shared").unwrap();
        std::fs::hard_link(&a, &b).unwrap();

        let mut collector = SourceCollector::new();
        let first = collector.classify(&a, false).unwrap();
        let second = collector.classify(&b, false).unwrap();
        assert!(Rc::ptr_eq(&first.source, &second.source));
    }

    #[test]
    fn test_socket_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

        let mut collector = SourceCollector::new();
        assert_eq!(
            collector.classify(&socket, false).unwrap_err().kind(),
            vessel::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_header_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpHeaderCache::open(dir.path().join("http")).unwrap();
        let info = HttpInfo {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            content_length: Some(10),
        };
        assert!(cache.get("https://example.com/f").is_none());
        cache.put("https://example.com/f", &info).unwrap();
        assert_eq!(cache.get("https://example.com/f"), Some(info));
    }
}
