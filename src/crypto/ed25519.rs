//! Long-term signing identities.
//!
//! Peers are identified by their Ed25519 verification key; every envelope on
//! the wire carries a signature under the sender's key. The implementation
//! uses `ed25519-consensus` for its strict, consensus-safe validation rules:
//! two peers must never disagree on whether a signature verifies, since that
//! judgement decides what enters the evidence transcript.

use crate::codec::{Codec, Error};
use bytes::{Buf, BufMut};
use rand_core::{CryptoRng, RngCore};
use std::fmt;

/// Number of bytes in a serialized [PublicKey].
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Number of bytes in a serialized [Signature].
pub const SIGNATURE_LENGTH: usize = 64;

/// An Ed25519 signing key.
#[derive(Clone)]
pub struct PrivateKey {
    key: ed25519_consensus::SigningKey,
}

impl PrivateKey {
    /// Generates a fresh key from the supplied CSPRNG.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            key: ed25519_consensus::SigningKey::new(rng),
        }
    }

    /// Derives a key from a seed.
    ///
    /// Only suitable for tests: the seed space is trivially enumerable.
    #[cfg(test)]
    pub fn from_seed(seed: u64) -> Self {
        use rand_core::SeedableRng;
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(seed);
        Self::from_rng(&mut rng)
    }

    /// Returns the corresponding verification key.
    pub fn public_key(&self) -> PublicKey {
        let key = self.key.verification_key();
        PublicKey {
            raw: key.to_bytes(),
            key,
        }
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            raw: self.key.sign(message).to_bytes(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        f.write_str("ed25519::PrivateKey(..)")
    }
}

/// An Ed25519 verification key, doubling as a peer identity.
#[derive(Clone)]
pub struct PublicKey {
    raw: [u8; PUBLIC_KEY_LENGTH],
    key: ed25519_consensus::VerificationKey,
}

impl PublicKey {
    /// Verifies a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let signature = ed25519_consensus::Signature::from(signature.raw);
        self.key.verify(&signature, message).is_ok()
    }

    /// Returns the raw key bytes.
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.raw
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.raw {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Codec for PublicKey {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.raw);
    }

    fn len_encoded(&self) -> usize {
        PUBLIC_KEY_LENGTH
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let raw = <[u8; PUBLIC_KEY_LENGTH]>::read(buf)?;
        let key = ed25519_consensus::VerificationKey::try_from(raw)
            .map_err(|_| Error::Invalid("ed25519::PublicKey", "not a valid curve point"))?;
        Ok(Self { raw, key })
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    raw: [u8; SIGNATURE_LENGTH],
}

impl Signature {
    /// Returns the raw signature bytes.
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.raw
    }
}

impl From<[u8; SIGNATURE_LENGTH]> for Signature {
    fn from(raw: [u8; SIGNATURE_LENGTH]) -> Self {
        Self { raw }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.raw {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Codec for Signature {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.raw);
    }

    fn len_encoded(&self) -> usize {
        SIGNATURE_LENGTH
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self {
            raw: <[u8; SIGNATURE_LENGTH]>::read(buf)?,
        })
    }
}
