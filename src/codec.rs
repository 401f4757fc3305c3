//! Deterministic binary encoding.
//!
//! Every peer must produce bit-identical bytes for the same value: the same
//! encoding feeds signed envelopes, the evidence transcript, and the blame
//! attestations, so any divergence between two peers' encoders would make
//! honest transcripts disagree and break accountability. All multi-byte
//! integers are big-endian; variable-length byte strings and sequences carry
//! a `u32` length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur when decoding untrusted bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before the value was fully read.
    #[error("end of buffer")]
    EndOfBuffer,
    /// A declared length exceeds the bytes actually present.
    ///
    /// Checked before allocating, so a forged length cannot be used to
    /// reserve unbounded memory.
    #[error("declared length {0} exceeds remaining buffer")]
    InvalidLength(usize),
    /// A structurally valid read produced a semantically invalid value.
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
    /// Bytes remained after decoding a complete value.
    #[error("{0} trailing bytes after decode")]
    ExtraData(usize),
}

/// A value with a canonical binary form.
pub trait Codec: Sized {
    /// Appends the canonical encoding of this value to `buf`.
    fn write(&self, buf: &mut impl BufMut);

    /// Returns the exact number of bytes [Codec::write] will produce.
    fn len_encoded(&self) -> usize;

    /// Reads one value from the front of `buf`.
    fn read(buf: &mut impl Buf) -> Result<Self, Error>;

    /// Encodes this value into a freshly allocated buffer.
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len_encoded());
        self.write(&mut buf);
        debug_assert_eq!(buf.len(), self.len_encoded());
        buf.freeze()
    }

    /// Decodes a value that must consume the entire buffer.
    fn decode(mut buf: impl Buf) -> Result<Self, Error> {
        let value = Self::read(&mut buf)?;
        let remaining = buf.remaining();
        if remaining > 0 {
            return Err(Error::ExtraData(remaining));
        }
        Ok(value)
    }
}

impl Codec for u32 {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(*self);
    }

    fn len_encoded(&self) -> usize {
        4
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 4 {
            return Err(Error::EndOfBuffer);
        }
        Ok(buf.get_u32())
    }
}

impl<const N: usize> Codec for [u8; N] {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }

    fn len_encoded(&self) -> usize {
        N
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < N {
            return Err(Error::EndOfBuffer);
        }
        let mut value = [0u8; N];
        buf.copy_to_slice(&mut value);
        Ok(value)
    }
}

impl Codec for Bytes {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }

    fn len_encoded(&self) -> usize {
        4 + self.len()
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let len = u32::read(buf)? as usize;
        if len > buf.remaining() {
            return Err(Error::InvalidLength(len));
        }
        Ok(buf.copy_to_bytes(len))
    }
}

impl<T: Codec> Codec for Vec<T> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.write(buf);
        }
    }

    fn len_encoded(&self) -> usize {
        4 + self.iter().map(Codec::len_encoded).sum::<usize>()
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let count = u32::read(buf)? as usize;
        // Every item consumes at least one byte, so a count beyond the
        // remaining bytes is unsatisfiable.
        if count > buf.remaining() {
            return Err(Error::InvalidLength(count));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::read(buf)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let value = 0xDEAD_BEEFu32;
        assert_eq!(u32::decode(value.encode()).unwrap(), value);
        assert_eq!(value.encode().as_ref(), [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn u32_truncated() {
        assert!(matches!(
            u32::decode(Bytes::from_static(&[0x01, 0x02])),
            Err(Error::EndOfBuffer)
        ));
    }

    #[test]
    fn bytes_round_trip() {
        let value = Bytes::from_static(b"some payload");
        let encoded = value.encode();
        assert_eq!(encoded.len(), value.len_encoded());
        assert_eq!(Bytes::decode(encoded).unwrap(), value);
    }

    #[test]
    fn bytes_forged_length() {
        // Declares 100 bytes but carries only 2.
        let forged = Bytes::from_static(&[0x00, 0x00, 0x00, 0x64, 0xAA, 0xBB]);
        assert!(matches!(
            Bytes::decode(forged),
            Err(Error::InvalidLength(100))
        ));
    }

    #[test]
    fn vec_round_trip() {
        let value = vec![
            Bytes::from_static(b"a"),
            Bytes::new(),
            Bytes::from_static(b"ccc"),
        ];
        assert_eq!(Vec::<Bytes>::decode(value.encode()).unwrap(), value);
    }

    #[test]
    fn vec_forged_count() {
        let forged = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            Vec::<u32>::decode(forged),
            Err(Error::InvalidLength(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        7u32.write(&mut buf);
        buf.put_u8(0x00);
        assert!(matches!(
            u32::decode(buf.freeze()),
            Err(Error::ExtraData(1))
        ));
    }

    #[test]
    fn array_round_trip() {
        let value = [7u8; 32];
        assert_eq!(<[u8; 32]>::decode(value.encode()).unwrap(), value);
    }
}
