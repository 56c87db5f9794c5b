//! Node attributes and their projections.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Block or character device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Char,
}

/// Device node numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNum {
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
}

/// File metadata carried by a tree node.
///
/// All fields are optional: an unset field means "defaulted" when writing and
/// "unknown" when comparing. Xattr keys are raw bytes since the kernel does
/// not require them to be UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// Permission bits (no file type bits; the node kind carries the type).
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Extended attributes, sorted by key for deterministic output.
    pub xattrs: BTreeMap<OsString, Vec<u8>>,
    /// Modification time, seconds since the epoch (tar resolution).
    pub mtime: Option<i64>,
    /// Access time, seconds since the epoch.
    pub atime: Option<i64>,
    pub size: Option<u64>,
    /// Symlink target.
    pub link_target: Option<PathBuf>,
    pub device: Option<DeviceNum>,
}

impl FileAttrs {
    /// Attributes of an implicitly created directory.
    pub fn default_dir() -> Self {
        FileAttrs {
            mode: Some(0o755),
            ..FileAttrs::default()
        }
    }

    pub fn with_mode(mode: u32) -> Self {
        FileAttrs {
            mode: Some(mode),
            ..FileAttrs::default()
        }
    }

    pub fn mode_or(&self, default: u32) -> u32 {
        self.mode.unwrap_or(default)
    }

    pub fn uid_or_root(&self) -> u32 {
        self.uid.unwrap_or(0)
    }

    pub fn gid_or_root(&self) -> u32 {
        self.gid.unwrap_or(0)
    }
}

/// HTTP revalidation record for URL-backed sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpInfo {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

/// Derived attributes: values computed from content rather than declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedAttrs {
    /// Content digest of a regular file.
    pub hash: Option<Digest>,
    /// Origin URL for URL-backed sources.
    pub url: Option<String>,
    /// HTTP revalidation record for URL-backed sources.
    pub http: Option<HttpInfo>,
}

/// Selects which attributes take part in serialization, hashing and
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSet {
    pub usr: bool,
    pub mode: bool,
    pub size: bool,
    pub mtime: bool,
    pub atime: bool,
    pub xattrs: bool,
    pub hash: bool,
    pub url: bool,
    pub http: bool,
}

impl AttrSet {
    /// Everything, including volatile fields.
    pub const ALL: AttrSet = AttrSet {
        usr: true,
        mode: true,
        size: true,
        mtime: true,
        atime: true,
        xattrs: true,
        hash: true,
        url: true,
        http: true,
    };

    /// The projection used for content comparison and tree hashing: atime and
    /// HTTP cache state are excluded since they change without the content
    /// changing.
    pub const COMPARE: AttrSet = AttrSet {
        usr: true,
        mode: true,
        size: true,
        mtime: true,
        atime: false,
        xattrs: true,
        hash: true,
        url: true,
        http: false,
    };
}
