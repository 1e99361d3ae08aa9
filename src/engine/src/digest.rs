//! Content digests.
//!
//! Every blob, layer and cache key in kiln is addressed by a `sha256:<hex>`
//! digest. [`DigestWriter`] hashes while it writes so large streams never
//! need a second pass.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const ALGORITHM: &str = "sha256";

/// A `sha256:<64 hex>` content digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Digest of everything readable from `reader`, plus the byte count.
    pub fn of_reader(mut reader: impl Read) -> Result<(Self, u64)> {
        let mut writer = DigestWriter::new(io::sink());
        io::copy(&mut reader, &mut writer)?;
        let (_, digest, size) = writer.finish();
        Ok((digest, size))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix("sha256:").ok_or_else(|| {
            BuildError::Serialization(format!("unsupported digest algorithm in '{}'", s))
        })?;
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BuildError::Serialization(format!("malformed digest '{}'", s)));
        }
        Ok(Digest(s.to_ascii_lowercase()))
    }

    pub fn algorithm(&self) -> &str {
        ALGORITHM
    }

    /// The hex-encoded part, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Digest(format!("{}:{}", ALGORITHM, hex::encode(hasher.finalize())))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl FromStr for Digest {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = BuildError;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Writer adapter that hashes and counts every byte passed through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Incremental hash over length-prefixed fields, so that field boundaries
/// are unambiguous (`"ab" + "c"` differs from `"a" + "bc"`).
pub struct FieldHasher {
    hasher: Sha256,
}

impl FieldHasher {
    pub fn new(domain: &str) -> Self {
        let mut hasher = FieldHasher {
            hasher: Sha256::new(),
        };
        hasher.field(domain.as_bytes());
        hasher
    }

    pub fn field(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update((data.len() as u64).to_be_bytes());
        self.hasher.update(data);
        self
    }

    pub fn str_field(&mut self, s: &str) -> &mut Self {
        self.field(s.as_bytes())
    }

    /// Marks an absent optional value; distinct from an empty field.
    pub fn none(&mut self) -> &mut Self {
        self.hasher.update(u64::MAX.to_be_bytes());
        self
    }

    pub fn finish(self) -> Digest {
        Digest::from_hasher(self.hasher)
    }
}
