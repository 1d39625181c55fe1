//! # Wire Format
//!
//! Samples travel as little-endian `i16` pairs. With the metadata format each
//! block is preceded by a 16-byte header:
//!
//! ```text
//! offset  size  field
//! ------  ----  -------------------------
//!    0      4   reserved (zero)
//!    4      8   timestamp, u64 LE
//!   12      4   flags, u32 LE
//!   16      …   samples, [I0, Q0, I1, Q1, ...] i16 LE
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, ErrorKind, Result};

/// Size of the metadata header in bytes.
pub const META_HEADER_LEN: usize = 16;

/// Bytes per sample pair (I + Q).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Timestamp and flags carried ahead of a sample block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaHeader {
    pub timestamp: u64,
    pub flags: u32,
}

impl MetaHeader {
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(self.timestamp)?;
        out.write_u32::<LittleEndian>(self.flags)
    }

    pub fn read_from<R: Read>(input: &mut R) -> std::io::Result<Self> {
        let _reserved = input.read_u32::<LittleEndian>()?;
        let timestamp = input.read_u64::<LittleEndian>()?;
        let flags = input.read_u32::<LittleEndian>()?;
        Ok(Self { timestamp, flags })
    }

    pub fn encode(&self) -> [u8; META_HEADER_LEN] {
        let mut buf = [0u8; META_HEADER_LEN];
        LittleEndian::write_u64(&mut buf[4..12], self.timestamp);
        LittleEndian::write_u32(&mut buf[12..16], self.flags);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_HEADER_LEN {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        Ok(Self {
            timestamp: LittleEndian::read_u64(&bytes[4..12]),
            flags: LittleEndian::read_u32(&bytes[12..16]),
        })
    }
}

/// Serialize interleaved samples to little-endian bytes.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Parse little-endian bytes into interleaved samples. The byte count must
/// be a whole number of I/Q pairs.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::native(ErrorKind::Misaligned));
    }
    let mut out = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut out);
    Ok(out)
}

/// Header followed by samples.
pub fn encode_meta_block(header: &MetaHeader, samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(META_HEADER_LEN + samples.len() * 2);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&encode_samples(samples));
    out
}

/// Split a metadata block into its header and samples.
pub fn decode_meta_block(bytes: &[u8]) -> Result<(MetaHeader, Vec<i16>)> {
    let mut cursor = Cursor::new(bytes);
    let header = MetaHeader::read_from(&mut cursor)
        .map_err(|_| Error::native(ErrorKind::InvalidParameter))?;
    let samples = decode_samples(&bytes[META_HEADER_LEN..])?;
    Ok((header, samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = MetaHeader {
            timestamp: 0x0102_0304_0506_0708,
            flags: 0x8000_0001,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[12..16], &[1, 0, 0, 0x80]);

        let mut streamed = Vec::new();
        header.write_to(&mut streamed).unwrap();
        assert_eq!(streamed, bytes.to_vec());
    }

    #[test]
    fn test_sample_byte_order() {
        let bytes = encode_samples(&[1, -1]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xff, 0xff]);
        assert_eq!(decode_samples(&bytes).unwrap(), vec![1, -1]);
    }

    #[test]
    fn test_meta_block() {
        let header = MetaHeader {
            timestamp: 4096,
            flags: 3,
        };
        let block = encode_meta_block(&header, &[10, 20, 30, 40]);
        assert_eq!(block.len(), META_HEADER_LEN + 8);
        let (h, s) = decode_meta_block(&block).unwrap();
        assert_eq!(h, header);
        assert_eq!(s, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_truncated_input() {
        let err = decode_meta_block(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(MetaHeader::decode(&[0u8; 15]).is_err());
        let err = decode_samples(&[0u8; 6]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misaligned);
    }
}
