//! Asymmetric encryption for onion layers.
//!
//! Each layer is an ephemeral-key box: a fresh x25519 key pair is generated
//! per encryption, the Diffie-Hellman shared secret is hashed together with
//! both public keys into a ChaCha20-Poly1305 key, and the ephemeral public
//! key is prepended to the ciphertext. The AEAD nonce is all zeros: the
//! derived key is used exactly once.
//!
//! Round key pairs are static x25519 secrets because the protocol later
//! reveals them (the inner key after a unanimous Go vote, the outer key
//! during blame), so they must serialize and re-derive their public half.

use crate::codec::{Codec, Error};
use crate::crypto::sha256::Sha256;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::Aead as _;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit as _, Nonce};
use rand_core::{CryptoRng, RngCore};
use std::fmt;

/// Number of bytes in a serialized [PublicKey].
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Number of bytes a single encryption layer adds: the ephemeral public key
/// plus the AEAD authentication tag.
pub const LAYER_OVERHEAD: usize = PUBLIC_KEY_LENGTH + 16;

const NONCE: [u8; 12] = [0u8; 12];

fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(shared).update(ephemeral).update(recipient);
    Key::from(*hasher.finalize().as_bytes())
}

/// An encryption key pair held for a single round.
#[derive(Clone)]
pub struct PrivateKey {
    secret: x25519_dalek::StaticSecret,
}

impl PrivateKey {
    /// Generates a fresh key pair from the supplied CSPRNG.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::random_from_rng(rng),
        }
    }

    /// Returns the public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        let key = x25519_dalek::PublicKey::from(&self.secret);
        PublicKey {
            raw: *key.as_bytes(),
            key,
        }
    }

    /// Opens one layer previously produced by [PublicKey::encrypt].
    ///
    /// Returns `None` for anything that is not a well-formed box under this
    /// key: truncated input, a non-contributory ephemeral key, or a failed
    /// authentication tag.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Option<Bytes> {
        if ciphertext.len() < LAYER_OVERHEAD {
            return None;
        }
        let mut ephemeral = [0u8; PUBLIC_KEY_LENGTH];
        ephemeral.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
        let ephemeral_key = x25519_dalek::PublicKey::from(ephemeral);
        let shared = self.secret.diffie_hellman(&ephemeral_key);
        if !shared.was_contributory() {
            return None;
        }
        let recipient = x25519_dalek::PublicKey::from(&self.secret);
        let key = derive_key(shared.as_bytes(), &ephemeral, recipient.as_bytes());
        let cipher = ChaCha20Poly1305::new(&key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&NONCE), &ciphertext[PUBLIC_KEY_LENGTH..])
            .ok()?;
        Some(Bytes::from(plaintext))
    }

    /// Returns whether `public` is the public half of this key pair.
    ///
    /// Used when a peer reveals a round private key: the reveal is only
    /// admissible if it matches the key the peer announced earlier.
    pub fn matches(&self, public: &PublicKey) -> bool {
        *x25519_dalek::PublicKey::from(&self.secret).as_bytes() == public.raw
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        f.write_str("seal::PrivateKey(..)")
    }
}

impl Codec for PrivateKey {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.secret.to_bytes());
    }

    fn len_encoded(&self) -> usize {
        PUBLIC_KEY_LENGTH
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let raw = <[u8; PUBLIC_KEY_LENGTH]>::read(buf)?;
        Ok(Self {
            secret: x25519_dalek::StaticSecret::from(raw),
        })
    }
}

/// The public half of a round encryption key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    raw: [u8; PUBLIC_KEY_LENGTH],
    key: x25519_dalek::PublicKey,
}

impl PublicKey {
    /// Encrypts `message` into a single layer under this key.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, message: &[u8]) -> Bytes {
        let ephemeral_secret = x25519_dalek::EphemeralSecret::random_from_rng(rng);
        let ephemeral = x25519_dalek::PublicKey::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&self.key);
        let key = derive_key(shared.as_bytes(), ephemeral.as_bytes(), &self.raw);
        let cipher = ChaCha20Poly1305::new(&key);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&NONCE), message)
            .expect("block length is far below the AEAD limit");
        let mut out = BytesMut::with_capacity(PUBLIC_KEY_LENGTH + sealed.len());
        out.put_slice(ephemeral.as_bytes());
        out.put_slice(&sealed);
        out.freeze()
    }

    /// Returns the raw key bytes.
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.raw
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
        Ok(Self {
            raw,
            key: x25519_dalek::PublicKey::from(raw),
        })
    }
}
