//! Container parser: signature header + next header → [`ArchiveIndex`].
//!
//! The next header is either plain metadata (`kHeader`) or a streams info
//! block (`kEncodedHeader`) describing one folder whose decoded output is the
//! real metadata. The encoded form is decoded with the regular
//! [`FolderDecoder`] over a one-folder index and parsed again; this repeats
//! until a plain header is reached.

pub mod files;
pub mod reader;
pub mod streams;

use std::io;

use thiserror::Error;
use tracing::debug;

use crate::folder::{DecodeError, FolderDecoder};
use crate::index::{ArchiveIndex, PackStream};
use crate::signature::{SignatureHeader, SIGNATURE_HEADER_SIZE};
use crate::source::ByteSource;

use self::files::read_files_info;
use self::reader::HeaderReader;
use self::streams::{read_streams_info, StreamsInfo};

/// Property ids of the 7z header grammar.
pub mod property {
    pub const END:                     u8 = 0x00;
    pub const HEADER:                  u8 = 0x01;
    pub const ARCHIVE_PROPERTIES:      u8 = 0x02;
    pub const ADDITIONAL_STREAMS_INFO: u8 = 0x03;
    pub const MAIN_STREAMS_INFO:       u8 = 0x04;
    pub const FILES_INFO:              u8 = 0x05;
    pub const PACK_INFO:               u8 = 0x06;
    pub const UNPACK_INFO:             u8 = 0x07;
    pub const SUBSTREAMS_INFO:         u8 = 0x08;
    pub const SIZE:                    u8 = 0x09;
    pub const CRC:                     u8 = 0x0A;
    pub const FOLDER:                  u8 = 0x0B;
    pub const CODERS_UNPACK_SIZE:      u8 = 0x0C;
    pub const NUM_UNPACK_STREAM:       u8 = 0x0D;
    pub const EMPTY_STREAM:            u8 = 0x0E;
    pub const EMPTY_FILE:              u8 = 0x0F;
    pub const ANTI:                    u8 = 0x10;
    pub const NAME:                    u8 = 0x11;
    pub const CTIME:                   u8 = 0x12;
    pub const ATIME:                   u8 = 0x13;
    pub const MTIME:                   u8 = 0x14;
    pub const WIN_ATTRIBUTES:          u8 = 0x15;
    pub const COMMENT:                 u8 = 0x16;
    pub const ENCODED_HEADER:          u8 = 0x17;
    pub const START_POS:               u8 = 0x18;
    pub const DUMMY:                   u8 = 0x19;
}

/// Nesting limit for encoded headers wrapping encoded headers.
const MAX_HEADER_DEPTH: usize = 4;

// ── Error type ───────────────────────────────────────────────────────────────

/// Archive-level failure. Any of these aborts `open`; no partial index is
/// ever exposed.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Not a 7z archive: {0}")]
    BadSignature(String),
    /// Garbled metadata. `source` is set when the compressed next header
    /// failed to decode (CRC mismatch included).
    #[error("Corrupt archive header: {reason}")]
    CorruptHeader {
        reason: String,
        #[source]
        source: Option<DecodeError>,
    },
    #[error("Archive index mismatch: {0}")]
    IndexMismatch(String),
    #[error("Unsupported archive feature: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FormatError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        FormatError::CorruptHeader { reason: reason.into(), source: None }
    }

    /// True for both plain and encoded header corruption.
    pub fn is_corrupt_header(&self) -> bool {
        matches!(self, FormatError::CorruptHeader { .. })
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Parse the archive behind `source` into an index.
pub fn parse(source: &ByteSource, decoder: &FolderDecoder) -> Result<ArchiveIndex, FormatError> {
    let raw = source.read_at(0, SIGNATURE_HEADER_SIZE as usize).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FormatError::BadSignature("file shorter than 32 bytes".into()),
        _ => FormatError::Io(e),
    })?;
    let sig = SignatureHeader::read(&raw[..])?;
    let (start, size) = sig.next_header_range(source.len())?;

    if size == 0 {
        debug!(archive = %source.name(), "empty archive");
        return Ok(ArchiveIndex::default());
    }
    let size = usize::try_from(size)
        .map_err(|_| FormatError::corrupt(format!("next header size {size} too large")))?;

    let mut buf = source.read_at(start, size)?;
    let actual = crc32fast::hash(&buf);
    if actual != sig.next_header_crc {
        return Err(FormatError::corrupt(format!(
            "next header CRC {actual:08x} != {:08x}", sig.next_header_crc
        )));
    }

    for depth in 0..MAX_HEADER_DEPTH {
        let mut r = HeaderReader::new(&buf);
        match r.read_u8()? {
            property::HEADER => return read_header(&mut r, source),
            property::ENCODED_HEADER => {
                let info = read_streams_info(&mut r)?;
                let packed = into_index(info, source.len())?;
                if packed.folders.len() != 1 {
                    return Err(FormatError::corrupt(format!(
                        "encoded header spans {} folders", packed.folders.len()
                    )));
                }
                debug!(depth, coders = ?packed.folders[0].coder_ids().collect::<Vec<_>>(),
                    "decoding encoded header");
                buf = decoder.decode(&packed, 0, source).map_err(|e| FormatError::CorruptHeader {
                    reason: format!("encoded header failed to decode: {e}"),
                    source: Some(e),
                })?;
            }
            other => {
                return Err(FormatError::corrupt(format!(
                    "unexpected property 0x{other:02x} at start of next header"
                )));
            }
        }
    }
    Err(FormatError::corrupt("encoded headers nested too deeply"))
}

fn read_header(r: &mut HeaderReader<'_>, source: &ByteSource) -> Result<ArchiveIndex, FormatError> {
    let mut id = r.read_u8()?;

    if id == property::ARCHIVE_PROPERTIES {
        loop {
            if r.read_u8()? == property::END {
                break;
            }
            r.skip_data()?;
        }
        id = r.read_u8()?;
    }

    if id == property::ADDITIONAL_STREAMS_INFO {
        // Only used by archives with external references, which are rejected below.
        read_streams_info(r)?;
        id = r.read_u8()?;
    }

    let mut info = StreamsInfo::default();
    if id == property::MAIN_STREAMS_INFO {
        info = read_streams_info(r)?;
        id = r.read_u8()?;
    }
    let mut index = into_index(info, source.len())?;

    if id == property::FILES_INFO {
        index.files = read_files_info(r, &index.folders)?;
        id = r.read_u8()?;
    } else if index.folders.iter().any(|f| !f.substreams.is_empty()) {
        return Err(FormatError::IndexMismatch("streams present but no files table".into()));
    }

    if id != property::END {
        return Err(FormatError::corrupt(format!(
            "unexpected property 0x{id:02x} in header"
        )));
    }

    debug!(
        archive = %source.name(),
        folders = index.folders.len(),
        files = index.files.len(),
        "archive index built"
    );
    Ok(index)
}

/// Resolve pack positions to absolute file ranges and assemble the index.
fn into_index(info: StreamsInfo, file_len: u64) -> Result<ArchiveIndex, FormatError> {
    let mut offset = SIGNATURE_HEADER_SIZE
        .checked_add(info.pack_pos)
        .ok_or_else(|| FormatError::corrupt("pack position overflows"))?;

    let mut pack_streams = Vec::with_capacity(info.pack_sizes.len());
    for (i, &size) in info.pack_sizes.iter().enumerate() {
        let end = offset.checked_add(size)
            .filter(|&end| end <= file_len)
            .ok_or_else(|| FormatError::corrupt(format!(
                "pack stream {i} ({size} bytes at {offset}) lies beyond end of file"
            )))?;
        pack_streams.push(PackStream {
            offset,
            size,
            crc: info.pack_crcs.get(i).copied().flatten(),
        });
        offset = end;
    }

    let needed: usize = info.folders.iter().map(|f| f.packed_streams.len()).sum();
    if needed > pack_streams.len() {
        return Err(FormatError::corrupt(format!(
            "folders need {needed} pack streams, header declares {}", pack_streams.len()
        )));
    }

    Ok(ArchiveIndex { pack_streams, folders: info.folders, files: Vec::new() })
}
