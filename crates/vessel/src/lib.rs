//! Core storage engine for rootless OCI containers: content-addressed blob
//! storage, the virtual filesystem tree ("fsspec") with its writers and
//! diffing, filesystem snapshots, id mapping, and the cross-process locking
//! discipline. OCI-specific stores live in the `vessel-oci` crate.

pub mod atomic;
pub mod blobstore;
pub mod digest;
pub mod error;
pub mod fsspec;
pub mod idmap;
pub mod lock;
pub mod snapshot;
pub mod util;

pub use digest::Digest;
pub use error::{Error, ErrorKind, Result};
