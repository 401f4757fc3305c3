//! SHA-256 with incremental update, used for the common-view commitment and
//! the blame attestation digest.

use crate::codec::{Codec, Error};
use bytes::{Buf, BufMut};
use sha2::Digest as _;
use std::fmt;

/// Number of bytes in a [Digest].
pub const DIGEST_LENGTH: usize = 32;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// Returns the raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Codec for Digest {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    fn len_encoded(&self) -> usize {
        DIGEST_LENGTH
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self(<[u8; DIGEST_LENGTH]>::read(buf)?))
    }
}

/// Incremental SHA-256 hasher.
#[derive(Clone, Default)]
pub struct Sha256 {
    inner: sha2::Sha256,
}

impl Sha256 {
    /// Creates a new, empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` to the previously recorded data.
    pub fn update(&mut self, message: &[u8]) -> &mut Self {
        self.inner.update(message);
        self
    }

    /// Hashes all recorded data.
    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }

    /// Hashes a single message with a one-time-use hasher.
    pub fn hash(message: &[u8]) -> Digest {
        let mut hasher = Self::new();
        hasher.update(message);
        hasher.finalize()
    }
}
