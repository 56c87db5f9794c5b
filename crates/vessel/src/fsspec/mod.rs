//! The virtual filesystem tree ("fsspec") and its writers.
//!
//! An [`FsSpec`] stages filesystem content from heterogeneous sources — host
//! files, archives, URLs, whiteouts — supports overlay semantics and
//! diffing, and can be emitted into a real directory ([`DirWriter`]), a tar
//! stream ([`TarWriter`]) or a textual serialization, and parsed back.

pub mod attrs;
pub mod dirwriter;
pub mod node;
pub mod source;
pub mod tarwriter;
pub mod writer;

mod diff;
mod serialize;

pub use attrs::{AttrSet, DerivedAttrs, DeviceKind, DeviceNum, FileAttrs, HttpInfo};
pub use dirwriter::{secure_join, DirWriter, ROOTLESS_OWNER_XATTR};
pub use node::{FsSpec, NodeId, NodeKind};
pub use source::{
    same_source, underlying, Compression, FileOrigin, FileSource, Source, TarSource, UrlSource,
};
pub use tarwriter::TarWriter;
pub use writer::{write_tar_entries, FsNodeWriter, HashingWriter, Writer};
