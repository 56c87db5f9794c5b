use std::io::{Read, Write};

use rand::{distr::Alphanumeric, Rng};
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;

/// Generate a random temporary filename with the given prefix.
pub fn generate_tmpname(prefix: &str) -> String {
    let rand_string: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}{rand_string}")
}

/// A reader that feeds everything it reads through a SHA-256 hasher.
///
/// Used to compute a layer's diff-id while the plaintext streams into the
/// gzip compressor.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finalize(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// A writer that feeds everything written through a SHA-256 hasher.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finalize(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_sha256(self.hasher), self.count)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmpname_unique() {
        let a = generate_tmpname(".tmp-");
        let b = generate_tmpname(".tmp-");
        assert!(a.starts_with(".tmp-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_reader() {
        let mut reader = DigestReader::new(&b"hello"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.count(), 5);
        assert_eq!(reader.finalize(), Digest::sha256_of(b"hello"));
    }

    #[test]
    fn test_digest_writer() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"hello").unwrap();
        let (buf, digest, count) = writer.finalize();
        assert_eq!(buf, b"hello");
        assert_eq!(count, 5);
        assert_eq!(digest, Digest::sha256_of(b"hello"));
    }
}
