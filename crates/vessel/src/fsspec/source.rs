//! Content sources.
//!
//! Every tree node owns a [`Source`]: the authority on where the node's bytes
//! come from when the tree is written out. Sources are shared via `Rc` —
//! two nodes holding the same underlying source are hardlinks of each other,
//! and writers use the source pointer to emit the second occurrence as a link
//! instead of a second copy.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{Context, Error, Result};
use crate::fsspec::attrs::{DeviceNum, HttpInfo};
use crate::fsspec::node::NodeKind;

/// Where a regular file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileOrigin {
    /// A path on the host filesystem, read at write time.
    Host(PathBuf),
    /// Bytes provided directly by the builder.
    Inline(Vec<u8>),
    /// Content identified only by its digest (e.g. parsed from a snapshot);
    /// such a source cannot be written, only compared.
    Opaque,
}

/// A regular-file source.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub origin: FileOrigin,
}

/// Compression framing of an archive overlay source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

/// A lazily expanded tar archive source.
#[derive(Debug, Clone)]
pub struct TarSource {
    pub path: PathBuf,
    pub compression: Compression,
}

/// A URL-backed file source; content is fetched at write time.
#[derive(Debug)]
pub struct UrlSource {
    pub url: String,
    /// Revalidation record updated by the collector when it re-derives
    /// attributes for this URL.
    pub http: RefCell<Option<HttpInfo>>,
}

/// The closed set of source variants.
#[derive(Debug)]
pub enum Source {
    /// Placeholder created while walking a path; contributes only an
    /// implicit `mkdir -p`.
    ParentDir,
    Dir,
    File(FileSource),
    Symlink(PathBuf),
    Fifo,
    Device(DeviceNum),
    Whiteout,
    TarOverlay(TarSource),
    Url(UrlSource),
    /// A second occurrence of another source: the writer must emit a
    /// hardlink record instead of copying the content again.
    Link(Rc<Source>),
}

impl Source {
    pub fn file_from_host(path: impl Into<PathBuf>) -> Rc<Source> {
        Rc::new(Source::File(FileSource {
            origin: FileOrigin::Host(path.into()),
        }))
    }

    pub fn file_from_bytes(data: impl Into<Vec<u8>>) -> Rc<Source> {
        Rc::new(Source::File(FileSource {
            origin: FileOrigin::Inline(data.into()),
        }))
    }

    pub fn symlink(target: impl Into<PathBuf>) -> Rc<Source> {
        Rc::new(Source::Symlink(target.into()))
    }

    pub fn url(url: impl Into<String>, http: Option<HttpInfo>) -> Rc<Source> {
        Rc::new(Source::Url(UrlSource {
            url: url.into(),
            http: RefCell::new(http),
        }))
    }

    /// The node kind a node with this source has.
    pub fn node_kind(&self) -> NodeKind {
        match self {
            Source::ParentDir | Source::Dir => NodeKind::Dir,
            Source::File(..) | Source::Url(..) => NodeKind::File,
            Source::Symlink(..) => NodeKind::Symlink,
            Source::Fifo => NodeKind::Fifo,
            Source::Device(..) => NodeKind::Device,
            Source::Whiteout => NodeKind::Whiteout,
            Source::TarOverlay(..) => NodeKind::Overlay,
            Source::Link(inner) => inner.node_kind(),
        }
    }

    /// Open a reader over this source's content. Only file-like sources have
    /// content.
    pub fn open_content(&self) -> Result<Box<dyn Read>> {
        match self {
            Source::File(FileSource { origin }) => match origin {
                FileOrigin::Host(path) => {
                    let file = File::open(path)
                        .with_ctx(|| format!("open source file {}", path.display()))?;
                    Ok(Box::new(file))
                }
                FileOrigin::Inline(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
                FileOrigin::Opaque => Err(Error::invalid_input(
                    "source has no readable content, only a digest",
                )),
            },
            Source::Url(UrlSource { url, .. }) => {
                let response = reqwest::blocking::get(url)
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::Corrupt(format!("fetch {url}: {e}")))?;
                Ok(Box::new(response))
            }
            Source::Link(inner) => inner.open_content(),
            other => Err(Error::invalid_input(format!(
                "source {other:?} has no file content"
            ))),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::ParentDir => write!(f, "parent-dir"),
            Source::Dir => write!(f, "dir"),
            Source::File(..) => write!(f, "file"),
            Source::Symlink(target) => write!(f, "symlink -> {}", target.display()),
            Source::Fifo => write!(f, "fifo"),
            Source::Device(dev) => write!(f, "device {}:{}", dev.major, dev.minor),
            Source::Whiteout => write!(f, "whiteout"),
            Source::TarOverlay(tar) => write!(f, "overlay {}", tar.path.display()),
            Source::Url(url) => write!(f, "url {}", url.url),
            Source::Link(inner) => write!(f, "link to {inner}"),
        }
    }
}

/// Strip `Link` wrappers: the source whose content identity matters.
pub fn underlying(source: &Rc<Source>) -> &Rc<Source> {
    match &**source {
        Source::Link(inner) => underlying(inner),
        _ => source,
    }
}

/// True if two sources share their content identity (same underlying
/// allocation).
pub fn same_source(a: &Rc<Source>, b: &Rc<Source>) -> bool {
    Rc::ptr_eq(underlying(a), underlying(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underlying_unwraps_links() {
        let file = Source::file_from_bytes(b"x".to_vec());
        let link = Rc::new(Source::Link(Rc::clone(&file)));
        let link2 = Rc::new(Source::Link(Rc::clone(&link)));

        assert!(Rc::ptr_eq(underlying(&link), &file));
        assert!(Rc::ptr_eq(underlying(&link2), &file));
        assert!(same_source(&link, &file));
        assert!(same_source(&link, &link2));
        assert!(!same_source(&file, &Source::file_from_bytes(b"x".to_vec())));
    }

    #[test]
    fn test_open_content() {
        let inline = Source::file_from_bytes(b"hello".to_vec());
        let mut data = Vec::new();
        inline.open_content().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");

        assert!(Rc::new(Source::Dir).open_content().is_err());
        let opaque = Rc::new(Source::File(FileSource {
            origin: FileOrigin::Opaque,
        }));
        assert!(opaque.open_content().is_err());
    }

    #[test]
    fn test_node_kind() {
        assert_eq!(Source::Dir.node_kind(), NodeKind::Dir);
        assert_eq!(Source::Whiteout.node_kind(), NodeKind::Whiteout);
        let file = Source::file_from_bytes(vec![]);
        let link = Source::Link(Rc::clone(&file));
        assert_eq!(link.node_kind(), NodeKind::File);
    }
}
