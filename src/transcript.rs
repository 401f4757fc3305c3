//! The append-only evidence transcript.
//!
//! Every raw envelope a round receives is appended before processing and
//! popped again if processing rejects it, so the transcript holds exactly
//! the envelopes the round accepted. Its deterministic serialization is
//! what peers hash, sign, and exchange during blame: two honest peers that
//! accepted the same envelopes produce bit-identical bytes.

use crate::codec::{self, Codec};
use crate::crypto::ed25519::PublicKey;
use bytes::{Buf, BufMut, Bytes};

/// One recorded envelope: who it came from and the raw bytes received.
#[derive(Clone, Debug)]
pub struct Entry {
    pub sender: PublicKey,
    pub envelope: Bytes,
}

impl Codec for Entry {
    fn write(&self, buf: &mut impl BufMut) {
        self.sender.write(buf);
        self.envelope.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.sender.len_encoded() + self.envelope.len_encoded()
    }

    fn read(buf: &mut impl Buf) -> Result<Self, codec::Error> {
        Ok(Self {
            sender: PublicKey::read(buf)?,
            envelope: Bytes::read(buf)?,
        })
    }
}

/// An ordered record of received envelopes.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an envelope at the end of the transcript.
    pub fn append(&mut self, sender: PublicKey, envelope: Bytes) {
        self.entries.push(Entry { sender, envelope });
    }

    /// Removes and returns the most recently appended entry.
    ///
    /// This is the rollback half of the append-verify-dispatch cycle: a
    /// rejected envelope must leave no trace in the evidence.
    pub fn pop(&mut self) -> Option<Entry> {
        self.entries.pop()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the transcript is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Serializes the transcript into its canonical byte form.
    pub fn serialize(&self) -> Bytes {
        self.entries.encode()
    }

    /// Reconstructs a transcript from its canonical byte form.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, codec::Error> {
        Ok(Self {
            entries: Vec::decode(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::PrivateKey;

    fn sender(seed: u64) -> PublicKey {
        PrivateKey::from_seed(seed).public_key()
    }

    #[test]
    fn serialize_round_trip() {
        let mut transcript = Transcript::new();
        transcript.append(sender(0), Bytes::from_static(b"first"));
        transcript.append(sender(1), Bytes::from_static(b"second"));

        let restored = Transcript::deserialize(&transcript.serialize()).unwrap();
        assert_eq!(restored.len(), 2);
        for (a, b) in transcript.iter().zip(restored.iter()) {
            assert_eq!(a.sender, b.sender);
            assert_eq!(a.envelope, b.envelope);
        }
        // Canonical form survives the round trip bit for bit.
        assert_eq!(transcript.serialize(), restored.serialize());
    }

    #[test]
    fn pop_rolls_back_the_last_entry() {
        let mut transcript = Transcript::new();
        transcript.append(sender(0), Bytes::from_static(b"kept"));
        let snapshot = transcript.serialize();

        transcript.append(sender(1), Bytes::from_static(b"rejected"));
        let popped = transcript.pop().unwrap();
        assert_eq!(popped.envelope.as_ref(), b"rejected");
        assert_eq!(transcript.serialize(), snapshot);
    }

    #[test]
    fn order_is_significant() {
        let mut forward = Transcript::new();
        forward.append(sender(0), Bytes::from_static(b"a"));
        forward.append(sender(1), Bytes::from_static(b"b"));

        let mut reversed = Transcript::new();
        reversed.append(sender(1), Bytes::from_static(b"b"));
        reversed.append(sender(0), Bytes::from_static(b"a"));

        assert_ne!(forward.serialize(), reversed.serialize());
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(Transcript::deserialize(&[0xFF, 0xFF]).is_err());
    }
}
