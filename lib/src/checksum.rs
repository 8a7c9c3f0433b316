//! SHA-256 object checksums and their 64-character hex text form.

use std::fmt;
use std::io::Write;

use anyhow::{anyhow, Result};
use openssl::hash::{Hasher, MessageDigest};

/// A 32-byte SHA-256 digest naming an object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Parse the canonical textual form: exactly 64 lowercase hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(anyhow!("Invalid checksum string '{s}'"));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(anyhow!("Invalid non-lowercase checksum string '{s}'"));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf).map_err(|_| anyhow!("Invalid checksum string '{s}'"))?;
        Ok(Self(buf))
    }

    /// Construct from raw digest bytes, e.g. the `ay` member of a serialized
    /// commit or dirtree.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        let b: [u8; 32] = b
            .try_into()
            .map_err(|_| anyhow!("Invalid checksum of {} bytes", b.len()))?;
        Ok(Self(b))
    }

    /// Digest a complete buffer.
    pub fn digest(data: &[u8]) -> Result<Self> {
        let digest = openssl::hash::hash(MessageDigest::sha256(), data)?;
        Self::from_bytes(&digest)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hex form, allocated.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A reusable buffer to avoid heap allocating
        let mut hexbuf = [0u8; 64];
        hex::encode_to_slice(self.0, &mut hexbuf).unwrap();
        f.write_str(std::str::from_utf8(&hexbuf).unwrap())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

impl std::str::FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// An [`std::io::Write`] adapter hashing everything written through it.
pub(crate) struct Sha256Writer<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> Sha256Writer<W> {
    pub(crate) fn new(inner: W) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: Hasher::new(MessageDigest::sha256())?,
        })
    }

    /// Finish hashing, returning the digest and the inner writer.
    pub(crate) fn finish(mut self) -> Result<(Checksum, W)> {
        let digest = self.hasher.finish()?;
        Ok((Checksum::from_bytes(&digest)?, self.inner))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher
            .update(&buf[..n])
            .map_err(|e| std::io::Error::other(e))?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
