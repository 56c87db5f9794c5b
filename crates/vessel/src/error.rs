//! Error types shared across the engine.
//!
//! Every fallible operation returns [`Error`], a closed set of failure kinds
//! plus a contextual message chain. Callers that need to dispatch on the
//! failure class use [`Error::kind`]; the `Display` form renders the
//! `<operation>: <cause>` chain users see on stderr.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The failure classes surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    Conflict,
    Locked,
    Timeout,
    Corrupt,
    Io,
    Trust,
}

/// An engine error: one of the [`ErrorKind`] classes with a message chain.
#[derive(Debug, Error)]
pub enum Error {
    /// The named entity (bundle, image, blob, ref) does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The target already exists and overwriting was not requested.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed digest, name, path or other caller-provided value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The request is valid but cannot be satisfied in the current mode.
    #[error("{0}")]
    Conflict(String),

    /// A cooperative lock is held by another process.
    #[error("{0:?} is locked by another process")]
    Locked(PathBuf),

    /// Lock acquisition exceeded its deadline.
    #[error("timed out waiting for lock {path:?} after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },

    /// On-disk state failed validation (hash mismatch, bad schema version, …).
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// A commit found no difference between the rootfs and its parent.
    ///
    /// Classified as [`ErrorKind::Corrupt`] but kept distinguishable so
    /// callers can special-case the no-op commit.
    #[error("empty diff: rootfs does not differ from parent")]
    EmptyDiff,

    /// An underlying filesystem error, wrapped with the failing operation.
    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: io::Error,
    },

    /// Image signature/policy rejection during import.
    #[error("image rejected by trust policy: {0}")]
    Trust(String),

    /// A nested error annotated with the operation that triggered it.
    #[error("{op}: {source}")]
    Context {
        op: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The failure class of this error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(..) => ErrorKind::NotFound,
            Error::AlreadyExists(..) => ErrorKind::AlreadyExists,
            Error::InvalidInput(..) => ErrorKind::InvalidInput,
            Error::Conflict(..) => ErrorKind::Conflict,
            Error::Locked(..) => ErrorKind::Locked,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Corrupt(..) | Error::EmptyDiff => ErrorKind::Corrupt,
            Error::Io { .. } => ErrorKind::Io,
            Error::Trust(..) => ErrorKind::Trust,
            Error::Context { source, .. } => source.kind(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Error::AlreadyExists(what.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// True if this is a `NotFound`, which cleanup paths routinely ignore.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Attach an operation name to an error, building the message chain.
pub trait Context<T> {
    fn ctx(self, op: impl std::fmt::Display) -> Result<T>;

    fn with_ctx<C: std::fmt::Display>(self, f: impl FnOnce() -> C) -> Result<T>;
}

impl<T> Context<T> for Result<T, Error> {
    fn ctx(self, op: impl std::fmt::Display) -> Result<T> {
        self.map_err(|source| Error::Context {
            op: op.to_string(),
            source: Box::new(source),
        })
    }

    fn with_ctx<C: std::fmt::Display>(self, f: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| Error::Context {
            op: f().to_string(),
            source: Box::new(source),
        })
    }
}

impl<T> Context<T> for io::Result<T> {
    fn ctx(self, op: impl std::fmt::Display) -> Result<T> {
        self.map_err(|source| Error::Io {
            op: op.to_string(),
            source,
        })
    }

    fn with_ctx<C: std::fmt::Display>(self, f: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| Error::Io {
            op: f().to_string(),
            source,
        })
    }
}
