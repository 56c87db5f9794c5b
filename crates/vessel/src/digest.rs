//! Algorithm-prefixed content digests.
//!
//! A [`Digest`] is the immutable identity of a blob: `<algo>:<hex>`, with the
//! hex part lowercase and of the exact length the algorithm dictates. Digest
//! strings cross I/O boundaries (filenames, index entries, manifest fields)
//! and are validated every time they do.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }

    /// Required length of the hex part.
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `<algo>:<hex>` digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algo: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string like `sha256:4e67…`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_input(format!("digest {s:?} has no algorithm prefix")))?;
        let algo = match algo {
            "sha256" => Algorithm::Sha256,
            other => {
                return Err(Error::invalid_input(format!(
                    "unsupported digest algorithm {other:?}"
                )))
            }
        };
        if hex.len() != algo.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_input(format!("malformed digest {s:?}")));
        }
        if hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::invalid_input(format!(
                "digest {s:?} must be lowercase hex"
            )));
        }
        Ok(Digest {
            algo,
            hex: hex.to_string(),
        })
    }

    /// The SHA-256 digest of a byte slice.
    pub fn sha256_of(data: impl AsRef<[u8]>) -> Self {
        Digest {
            algo: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data.as_ref())),
        }
    }

    /// Wrap a finalized SHA-256 state.
    pub fn from_sha256(hasher: Sha256) -> Self {
        Digest {
            algo: Algorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algo
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Relative path of this digest inside a blob directory: `<algo>/<hex>`.
    pub fn blob_path(&self) -> PathBuf {
        PathBuf::from(self.algo.as_str()).join(&self.hex)
    }

    /// Filename form used by per-digest entry files: `<algo>-<hex>`.
    pub fn entry_name(&self) -> String {
        format!("{}-{}", self.algo, self.hex)
    }

    /// Parse the `<algo>-<hex>` filename form back into a digest.
    pub fn from_entry_name(name: &str) -> Result<Self> {
        let (algo, hex) = name
            .split_once('-')
            .ok_or_else(|| Error::invalid_input(format!("entry name {name:?} has no separator")))?;
        Digest::parse(&format!("{algo}:{hex}"))
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}:{})", self.algo, self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_roundtrip() {
        let s = format!("sha256:{HELLO}");
        let digest = Digest::parse(&s).unwrap();
        assert_eq!(digest.to_string(), s);
        assert_eq!(digest.hex(), HELLO);
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
    }

    #[test]
    fn test_sha256_of() {
        assert_eq!(Digest::sha256_of(b"hello").hex(), HELLO);
    }

    #[test]
    fn test_parse_rejects() {
        // no prefix
        assert!(Digest::parse(HELLO).is_err());
        // unknown algorithm
        assert!(Digest::parse(&format!("md5:{HELLO}")).is_err());
        // truncated
        assert!(Digest::parse(&format!("sha256:{}", &HELLO[1..])).is_err());
        // non-hex
        assert!(Digest::parse(&format!("sha256:{}g", &HELLO[1..])).is_err());
        // uppercase
        assert!(Digest::parse(&format!("sha256:{}", HELLO.to_uppercase())).is_err());
        // path traversal smuggled into the hex part
        assert!(Digest::parse("sha256:../../../../../../tmp/evil").is_err());
    }

    #[test]
    fn test_entry_name() {
        let digest = Digest::sha256_of(b"x");
        let name = digest.entry_name();
        assert!(name.starts_with("sha256-"));
        assert_eq!(Digest::from_entry_name(&name).unwrap(), digest);
        assert!(Digest::from_entry_name("garbage").is_err());
    }

    #[test]
    fn test_blob_path() {
        let digest = Digest::sha256_of(b"hello");
        assert_eq!(digest.blob_path(), PathBuf::from(format!("sha256/{HELLO}")));
    }
}
