//! The fixed 32-byte signature header at offset 0 of every 7z archive.
//!
//! ```text
//! 0   6  magic            37 7A BC AF 27 1C
//! 6   1  version major    must be 0
//! 7   1  version minor    informational
//! 8   4  start header CRC CRC32 of bytes 12..32
//! 12  8  next header offset (relative to byte 32)
//! 20  8  next header size
//! 28  4  next header CRC
//! ```
//! All integers little-endian.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};

use crate::header::FormatError;

pub const MAGIC: &[u8; 6] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];
pub const VERSION_MAJOR: u8 = 0;
pub const SIGNATURE_HEADER_SIZE: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub version_major:      u8,
    pub version_minor:      u8,
    pub next_header_offset: u64,
    pub next_header_size:   u64,
    pub next_header_crc:    u32,
}

impl SignatureHeader {
    /// Read and validate the signature header.
    ///
    /// Everything that does not look like a 7z start header, including a
    /// short read, is `FormatError::BadSignature`.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let mut raw = [0u8; SIGNATURE_HEADER_SIZE as usize];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FormatError::BadSignature("file shorter than 32 bytes".into()),
            _ => FormatError::Io(e),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8; SIGNATURE_HEADER_SIZE as usize]) -> Result<Self, FormatError> {
        if &raw[..6] != MAGIC {
            return Err(FormatError::BadSignature("invalid magic".into()));
        }
        let (version_major, version_minor) = (raw[6], raw[7]);
        if version_major != VERSION_MAJOR {
            return Err(FormatError::BadSignature(format!(
                "unsupported version {version_major}.{version_minor}"
            )));
        }

        let mut cur = &raw[8..];
        let start_crc = cur.read_u32::<LittleEndian>()?;
        let actual = crc32fast::hash(&raw[12..]);
        if start_crc != actual {
            return Err(FormatError::BadSignature(format!(
                "start header CRC {start_crc:08x} != {actual:08x}"
            )));
        }

        let next_header_offset = cur.read_u64::<LittleEndian>()?;
        let next_header_size   = cur.read_u64::<LittleEndian>()?;
        let next_header_crc    = cur.read_u32::<LittleEndian>()?;

        Ok(Self {
            version_major,
            version_minor,
            next_header_offset,
            next_header_size,
            next_header_crc,
        })
    }

    /// Absolute position of the next header, checked against the file length.
    pub fn next_header_range(&self, file_len: u64) -> Result<(u64, u64), FormatError> {
        let start = SIGNATURE_HEADER_SIZE
            .checked_add(self.next_header_offset)
            .ok_or_else(|| FormatError::BadSignature("next header offset overflows".into()))?;
        let end = start
            .checked_add(self.next_header_size)
            .ok_or_else(|| FormatError::BadSignature("next header size overflows".into()))?;
        if end > file_len {
            return Err(FormatError::BadSignature(format!(
                "next header {start}..{end} beyond end of file ({file_len} bytes)"
            )));
        }
        Ok((start, self.next_header_size))
    }
}
