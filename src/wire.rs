//! Wire messages, signed envelopes, and block framing.
//!
//! Every envelope is the payload followed by a signature over it under the
//! sender's long-term key. A payload begins with the message kind (`u32`) and the
//! round identifier, so a signature can never be replayed into another round
//! or reinterpreted as a different message. The same canonical encoding is
//! reused verbatim inside the evidence transcript and the signed blame
//! attestation.

use crate::codec::{self, Codec};
use crate::crypto::ed25519;
use crate::crypto::seal;
use crate::crypto::Digest;
use crate::RoundId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

/// Default plaintext block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Errors produced when opening a received envelope.
#[derive(Debug, Error)]
pub enum Error {
    /// The envelope is shorter than a signature.
    #[error("envelope shorter than a signature")]
    TooShort,
    /// The signature does not verify under the sender's key.
    #[error("invalid envelope signature")]
    InvalidSignature,
    /// The signed payload does not decode as a message.
    #[error("malformed payload: {0}")]
    Malformed(#[from] codec::Error),
}

/// The nine protocol message payloads.
#[derive(Clone, Debug)]
pub enum Payload {
    /// A peer's round encryption keys, broadcast during key sharing.
    PublicKeys {
        inner: seal::PublicKey,
        outer: seal::PublicKey,
    },
    /// A doubly onion-encrypted submission, sent to the first peer.
    Data { block: Bytes },
    /// The partially peeled pipeline, passed to the next peer in ring order.
    ShuffleData { blocks: Vec<Bytes> },
    /// The fully outer-peeled common view, broadcast by the last peer.
    EncryptedData { blocks: Vec<Bytes> },
    /// A vote that the common view matches the voter's expectation, carrying
    /// the voter's commitment to that view.
    Go { commitment: Digest },
    /// A vote that the common view is missing the voter's submission.
    NoGo,
    /// The voter's inner private key, revealed after a unanimous Go.
    PrivateKey { inner: seal::PrivateKey },
    /// Blame evidence: the sender's outer private key, its serialized
    /// transcript, and its signature over the attestation of both.
    BlameData {
        outer: seal::PrivateKey,
        transcript: Bytes,
        signature: ed25519::Signature,
    },
    /// The sender's collected attestations and signatures, one slot per
    /// peer, cross-checked by every receiver.
    BlameVerification {
        attestations: Vec<Bytes>,
        signatures: Vec<ed25519::Signature>,
    },
}

impl Payload {
    /// Returns the stable numeric kind of this payload.
    pub const fn kind(&self) -> u32 {
        match self {
            Self::PublicKeys { .. } => 0,
            Self::Data { .. } => 1,
            Self::ShuffleData { .. } => 2,
            Self::EncryptedData { .. } => 3,
            Self::Go { .. } => 4,
            Self::NoGo => 5,
            Self::PrivateKey { .. } => 6,
            Self::BlameData { .. } => 7,
            Self::BlameVerification { .. } => 8,
        }
    }

    /// Returns a short name for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PublicKeys { .. } => "public_keys",
            Self::Data { .. } => "data",
            Self::ShuffleData { .. } => "shuffle_data",
            Self::EncryptedData { .. } => "encrypted_data",
            Self::Go { .. } => "go",
            Self::NoGo => "no_go",
            Self::PrivateKey { .. } => "private_key",
            Self::BlameData { .. } => "blame_data",
            Self::BlameVerification { .. } => "blame_verification",
        }
    }
}

/// Numeric kind of [Payload::BlameData], fixed here because the blame
/// attestation embeds it outside a full message.
const BLAME_DATA_KIND: u32 = 7;

/// A round-scoped protocol message.
#[derive(Clone, Debug)]
pub struct Message {
    pub round: RoundId,
    pub payload: Payload,
}

impl Codec for Message {
    fn write(&self, buf: &mut impl BufMut) {
        self.payload.kind().write(buf);
        self.round.write(buf);
        match &self.payload {
            Payload::PublicKeys { inner, outer } => {
                inner.write(buf);
                outer.write(buf);
            }
            Payload::Data { block } => block.write(buf),
            Payload::ShuffleData { blocks } | Payload::EncryptedData { blocks } => {
                blocks.write(buf)
            }
            Payload::Go { commitment } => commitment.write(buf),
            Payload::NoGo => {}
            Payload::PrivateKey { inner } => inner.write(buf),
            Payload::BlameData {
                outer,
                transcript,
                signature,
            } => {
                outer.write(buf);
                transcript.write(buf);
                signature.write(buf);
            }
            Payload::BlameVerification {
                attestations,
                signatures,
            } => {
                attestations.write(buf);
                signatures.write(buf);
            }
        }
    }

    fn len_encoded(&self) -> usize {
        4 + self.round.len()
            + match &self.payload {
                Payload::PublicKeys { inner, outer } => {
                    inner.len_encoded() + outer.len_encoded()
                }
                Payload::Data { block } => block.len_encoded(),
                Payload::ShuffleData { blocks } | Payload::EncryptedData { blocks } => {
                    blocks.len_encoded()
                }
                Payload::Go { commitment } => commitment.len_encoded(),
                Payload::NoGo => 0,
                Payload::PrivateKey { inner } => inner.len_encoded(),
                Payload::BlameData {
                    outer,
                    transcript,
                    signature,
                } => outer.len_encoded() + transcript.len_encoded() + signature.len_encoded(),
                Payload::BlameVerification {
                    attestations,
                    signatures,
                } => attestations.len_encoded() + signatures.len_encoded(),
            }
    }

    fn read(buf: &mut impl Buf) -> Result<Self, codec::Error> {
        let kind = u32::read(buf)?;
        let round = RoundId::read(buf)?;
        let payload = match kind {
            0 => Payload::PublicKeys {
                inner: seal::PublicKey::read(buf)?,
                outer: seal::PublicKey::read(buf)?,
            },
            1 => Payload::Data {
                block: Bytes::read(buf)?,
            },
            2 => Payload::ShuffleData {
                blocks: Vec::read(buf)?,
            },
            3 => Payload::EncryptedData {
                blocks: Vec::read(buf)?,
            },
            4 => Payload::Go {
                commitment: Digest::read(buf)?,
            },
            5 => Payload::NoGo,
            6 => Payload::PrivateKey {
                inner: seal::PrivateKey::read(buf)?,
            },
            7 => Payload::BlameData {
                outer: seal::PrivateKey::read(buf)?,
                transcript: Bytes::read(buf)?,
                signature: ed25519::Signature::read(buf)?,
            },
            8 => Payload::BlameVerification {
                attestations: Vec::read(buf)?,
                signatures: Vec::read(buf)?,
            },
            _ => return Err(codec::Error::Invalid("wire::Message", "unknown message kind")),
        };
        Ok(Self { round, payload })
    }
}

/// Encodes and signs a message into an envelope.
pub fn sign_envelope(signer: &ed25519::PrivateKey, message: &Message) -> Bytes {
    let payload = message.encode();
    let signature = signer.sign(&payload);
    let mut envelope = BytesMut::with_capacity(payload.len() + ed25519::SIGNATURE_LENGTH);
    envelope.put_slice(&payload);
    envelope.put_slice(signature.as_bytes());
    envelope.freeze()
}

/// Verifies and decodes an envelope from `verifier`.
///
/// The caller still has to check the round identifier: an envelope can be
/// perfectly signed and belong to a different round.
pub fn open_envelope(verifier: &ed25519::PublicKey, envelope: &[u8]) -> Result<Message, Error> {
    if envelope.len() < ed25519::SIGNATURE_LENGTH {
        return Err(Error::TooShort);
    }
    let (payload, rest) = envelope.split_at(envelope.len() - ed25519::SIGNATURE_LENGTH);
    let mut raw = [0u8; ed25519::SIGNATURE_LENGTH];
    raw.copy_from_slice(rest);
    if !verifier.verify(payload, &ed25519::Signature::from(raw)) {
        return Err(Error::InvalidSignature);
    }
    Ok(Message::decode(payload)?)
}

/// Builds the blame attestation: the message each peer signs over the digest
/// of its revealed outer key and serialized transcript.
pub fn blame_attestation(round: &RoundId, digest: &Digest) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + round.len() + digest.len_encoded());
    BLAME_DATA_KIND.write(&mut buf);
    round.write(&mut buf);
    digest.write(&mut buf);
    buf.freeze()
}

/// Frames a submission: a little-endian length, the payload, and zero
/// padding up to `block_size + 4` bytes.
///
/// # Panics
///
/// Panics if `data` exceeds `block_size`; the round demotes oversized
/// submissions before framing.
pub fn frame(block_size: usize, data: &[u8]) -> Bytes {
    assert!(data.len() <= block_size, "payload exceeds the block size");
    let mut block = BytesMut::with_capacity(block_size + 4);
    block.put_u32_le(data.len() as u32);
    block.put_slice(data);
    block.resize(block_size + 4, 0);
    block.freeze()
}

/// The all-zero frame meaning "no payload this round".
pub fn default_block(block_size: usize) -> Bytes {
    let mut block = BytesMut::new();
    block.resize(block_size + 4, 0);
    block.freeze()
}

/// Recovers a submission from a decrypted frame.
///
/// Returns `None` both for the explicit empty frame and for any frame whose
/// declared length exceeds `block_size` or the bytes actually present.
pub fn unframe(block_size: usize, block: &[u8]) -> Option<Bytes> {
    if block.len() < 4 {
        warn!(len = block.len(), "cleartext too short to carry a frame");
        return None;
    }
    let len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if len == 0 {
        return None;
    }
    if len > block_size || len > block.len() - 4 {
        warn!(len, block_size, "cleartext declares an impossible length");
        return None;
    }
    Some(Bytes::copy_from_slice(&block[4..4 + len]))
}
