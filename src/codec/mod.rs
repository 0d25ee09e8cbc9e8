//! Codec registry: 7z method ids mapped to decode functions.
//!
//! # Identity rules
//! Every coder in a folder is identified by its 7z method id, stored on disk
//! as 1..=15 big-endian bytes and held in memory as a [`CoderId`] (`u64`).
//! The id is the only thing the folder decoder dispatches on; property bytes
//! are handed to the codec untouched.
//!
//! # Contract
//! A codec receives every input stream bound to the coder (in the coder's
//! declared input order), the declared size of its single output stream and
//! the raw property bytes, and returns exactly that many output bytes.
//! A registry lookup miss is [`CodecError::UnavailableCoder`]; callers MUST
//! NOT fall back to another codec.

pub mod bcj2;
pub mod filters;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use self::bcj2::Bcj2Codec;
use self::filters::{BranchCodec, BranchKind, DeltaCodec};

// ── Method ids ───────────────────────────────────────────────────────────────

/// Numeric 7z method id of one coder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CoderId(pub u64);

impl CoderId {
    pub const COPY:    CoderId = CoderId(0x00);
    pub const DELTA:   CoderId = CoderId(0x03);
    pub const X86:     CoderId = CoderId(0x0303_0103);
    pub const PPC:     CoderId = CoderId(0x0303_0205);
    pub const IA64:    CoderId = CoderId(0x0303_0401);
    pub const ARM:     CoderId = CoderId(0x0303_0501);
    pub const ARMT:    CoderId = CoderId(0x0303_0701);
    pub const SPARC:   CoderId = CoderId(0x0303_0805);
    pub const BCJ2:    CoderId = CoderId(0x0303_011B);
    pub const LZMA:    CoderId = CoderId(0x03_0101);
    pub const LZMA2:   CoderId = CoderId(0x21);
    pub const PPMD:    CoderId = CoderId(0x03_0401);
    pub const DEFLATE: CoderId = CoderId(0x04_0108);
    pub const BZIP2:   CoderId = CoderId(0x04_0202);
    pub const ZSTD:    CoderId = CoderId(0x04F7_1101);
    pub const BROTLI:  CoderId = CoderId(0x04F7_1102);
    pub const LZ4:     CoderId = CoderId(0x04F7_1104);
    pub const AES:     CoderId = CoderId(0x06F1_0701);

    // Short aliases newer 7-Zip versions write for the branch filters.
    pub const X86_ALIAS:   CoderId = CoderId(0x04);
    pub const PPC_ALIAS:   CoderId = CoderId(0x05);
    pub const IA64_ALIAS:  CoderId = CoderId(0x06);
    pub const ARM_ALIAS:   CoderId = CoderId(0x07);
    pub const ARMT_ALIAS:  CoderId = CoderId(0x08);
    pub const SPARC_ALIAS: CoderId = CoderId(0x09);

    /// Stand-in for ids longer than eight bytes. Never registered, so a
    /// folder using one fails with [`CodecError::UnavailableCoder`].
    pub const OVERLONG: CoderId = CoderId(u64::MAX);

    /// Assemble an id from its on-disk big-endian bytes.
    pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > 8 {
            return None;
        }
        Some(CoderId(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)))
    }

    /// Human-readable name, for diagnostics only.
    pub fn name(self) -> &'static str {
        match self {
            CoderId::COPY                        => "Copy",
            CoderId::DELTA                       => "Delta",
            CoderId::X86 | CoderId::X86_ALIAS     => "BCJ",
            CoderId::PPC | CoderId::PPC_ALIAS     => "PPC",
            CoderId::IA64 | CoderId::IA64_ALIAS   => "IA64",
            CoderId::ARM | CoderId::ARM_ALIAS     => "ARM",
            CoderId::ARMT | CoderId::ARMT_ALIAS   => "ARMT",
            CoderId::SPARC | CoderId::SPARC_ALIAS => "SPARC",
            CoderId::BCJ2                        => "BCJ2",
            CoderId::LZMA                        => "LZMA",
            CoderId::LZMA2                       => "LZMA2",
            CoderId::PPMD                        => "PPMd",
            CoderId::DEFLATE                     => "Deflate",
            CoderId::BZIP2                       => "BZip2",
            CoderId::ZSTD                        => "ZSTD",
            CoderId::BROTLI                      => "Brotli",
            CoderId::LZ4                         => "LZ4",
            CoderId::AES                         => "7zAES",
            CoderId::OVERLONG                    => "over-long id",
            _                                    => "unknown",
        }
    }
}

impl fmt::Display for CoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({})", self.0, self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Invalid coder properties: {0}")]
    InvalidProperties(String),
    #[error("Coder expects {expected} input stream(s), got {got}")]
    InputCount { expected: usize, got: usize },
    /// Emitted when a coder id has no registered codec.
    /// Decoding MUST NOT continue for the folder that needs it.
    #[error("Coder not available: {id}")]
    UnavailableCoder { id: CoderId },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decode `inputs` into exactly `unpack_size` bytes.
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, properties: &[u8])
        -> Result<Vec<u8>, CodecError>;
}

/// The single input of a one-in/one-out coder.
pub(crate) fn single_input<'a>(inputs: &[&'a [u8]]) -> Result<&'a [u8], CodecError> {
    match inputs {
        [only] => Ok(*only),
        _      => Err(CodecError::InputCount { expected: 1, got: inputs.len() }),
    }
}

/// Starting buffer size: the declared size, unless the input is too small to
/// plausibly expand that far.
fn initial_capacity(unpack_size: usize, input_len: usize) -> usize {
    unpack_size.min(input_len.saturating_mul(4))
}

/// Drain `reader` up to the declared size.
fn read_bounded(reader: impl Read, unpack_size: usize, input_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(initial_capacity(unpack_size, input_len));
    reader.take(unpack_size as u64)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    finish(out, unpack_size)
}

/// Write sink that refuses to grow past the declared size.
struct BoundedOutput {
    buf:   Vec<u8>,
    limit: usize,
}

impl BoundedOutput {
    fn new(limit: usize, input_len: usize) -> Self {
        Self { buf: Vec::with_capacity(initial_capacity(limit, input_len)), limit }
    }
}

impl Write for BoundedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.limit - self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("output exceeds declared size {}", self.limit),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cut `out` to the declared size; a short buffer is a data error.
fn finish(mut out: Vec<u8>, unpack_size: usize) -> Result<Vec<u8>, CodecError> {
    if out.len() < unpack_size {
        return Err(CodecError::Decompression(format!(
            "stream ended after {} of {unpack_size} bytes", out.len()
        )));
    }
    out.truncate(unpack_size);
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct CopyCodec;
impl Codec for CopyCodec {
    fn name(&self) -> &'static str { "Copy" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        finish(data.to_vec(), unpack_size)
    }
}

/// Raw LZMA as stored by 7z: 5 property bytes (lc/lp/pb, dictionary size),
/// no header in the stream itself.
pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn name(&self) -> &'static str { "LZMA" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, props: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        if props.len() != 5 {
            return Err(CodecError::InvalidProperties(format!(
                "LZMA expects 5 property bytes, got {}", props.len()
            )));
        }
        // lzma-rs reads the classic .lzma header; rebuild it around the
        // raw stream with the size the folder declares.
        let mut header = [0u8; 13];
        header[..5].copy_from_slice(props);
        header[5..].copy_from_slice(&(unpack_size as u64).to_le_bytes());

        let mut input = BufReader::new(Cursor::new(header).chain(data));
        let mut out = BoundedOutput::new(unpack_size, data.len());
        lzma_rs::lzma_decompress(&mut input, &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        finish(out.buf, unpack_size)
    }
}

/// LZMA2 chunk stream; the single property byte encodes the dictionary size.
pub struct Lzma2Codec;
impl Codec for Lzma2Codec {
    fn name(&self) -> &'static str { "LZMA2" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, props: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        match props {
            [dict] if *dict <= 40 => {}
            _ => return Err(CodecError::InvalidProperties(format!(
                "LZMA2 expects one dictionary byte <= 40, got {props:02x?}"
            ))),
        }
        let mut out = BoundedOutput::new(unpack_size, data.len());
        lzma_rs::lzma2_decompress(&mut Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        finish(out.buf, unpack_size)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn name(&self) -> &'static str { "ZSTD" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        read_bounded(decoder, unpack_size, data.len())
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn name(&self) -> &'static str { "Brotli" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        read_bounded(brotli::Decompressor::new(data, 4096), unpack_size, data.len())
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn name(&self) -> &'static str { "LZ4" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        read_bounded(lz4_flex::frame::FrameDecoder::new(data), unpack_size, data.len())
    }
}

const PPMD_ORDERS: std::ops::RangeInclusive<u32> = 2..=64;
/// Model memory accepted from coder properties; 7-Zip itself writes at most
/// a few hundred MiB.
const PPMD_MEMORY: std::ops::RangeInclusive<u32> = (1 << 11)..=(1 << 30);

/// PPMd variant H as used by 7z: 5 property bytes, model order then the
/// little-endian model memory size.
pub struct PpmdCodec;
impl Codec for PpmdCodec {
    fn name(&self) -> &'static str { "PPMd" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, props: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        let (order, memory) = match props {
            [order, m0, m1, m2, m3] => (*order as u32, u32::from_le_bytes([*m0, *m1, *m2, *m3])),
            _ => return Err(CodecError::InvalidProperties(format!(
                "PPMd expects 5 property bytes, got {}", props.len()
            ))),
        };
        if !PPMD_ORDERS.contains(&order) || !PPMD_MEMORY.contains(&memory) {
            return Err(CodecError::InvalidProperties(format!(
                "PPMd order {order} / memory {memory} out of range"
            )));
        }
        let decoder = ppmd_rust::Ppmd7Decoder::new(data, order, memory)
            .map_err(|e| CodecError::Decompression(format!("PPMd: {e:?}")))?;
        read_bounded(decoder, unpack_size, data.len())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Coder id → codec table consulted by the folder decoder.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<CoderId, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with nothing in it.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    /// Every codec this build can decode.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(CoderId::COPY,  Arc::new(CopyCodec));
        r.register(CoderId::LZMA,  Arc::new(LzmaCodec));
        r.register(CoderId::LZMA2, Arc::new(Lzma2Codec));
        r.register(CoderId::ZSTD,  Arc::new(ZstdCodec));
        r.register(CoderId::BROTLI, Arc::new(BrotliCodec));
        r.register(CoderId::LZ4,   Arc::new(Lz4Codec));
        r.register(CoderId::PPMD,  Arc::new(PpmdCodec));
        r.register(CoderId::DELTA, Arc::new(DeltaCodec));
        r.register(CoderId::BCJ2,  Arc::new(Bcj2Codec));

        let branches = [
            (CoderId::X86,   CoderId::X86_ALIAS,   BranchKind::X86),
            (CoderId::PPC,   CoderId::PPC_ALIAS,   BranchKind::Ppc),
            (CoderId::IA64,  CoderId::IA64_ALIAS,  BranchKind::Ia64),
            (CoderId::ARM,   CoderId::ARM_ALIAS,   BranchKind::Arm),
            (CoderId::ARMT,  CoderId::ARMT_ALIAS,  BranchKind::ArmThumb),
            (CoderId::SPARC, CoderId::SPARC_ALIAS, BranchKind::Sparc),
        ];
        for (id, alias, kind) in branches {
            let codec: Arc<dyn Codec> = Arc::new(BranchCodec::new(kind));
            r.register(id, Arc::clone(&codec));
            r.register(alias, codec);
        }
        r
    }

    /// Add or replace the codec for `id`, returning the previous one.
    pub fn register(&mut self, id: CoderId, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        self.codecs.insert(id, codec)
    }

    pub fn get(&self, id: CoderId) -> Option<&Arc<dyn Codec>> {
        if id == CoderId::OVERLONG {
            return None;
        }
        self.codecs.get(&id)
    }

    pub fn supports(&self, id: CoderId) -> bool {
        self.get(id).is_some()
    }

    /// Dispatch one coder invocation.
    ///
    /// Returns `Err(CodecError::UnavailableCoder)` if `id` is not registered.
    pub fn decode(
        &self,
        id:          CoderId,
        inputs:      &[&[u8]],
        unpack_size: usize,
        properties:  &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let codec = self.get(id).ok_or(CodecError::UnavailableCoder { id })?;
        codec.decode(inputs, unpack_size, properties)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&CoderId> = self.codecs.keys().collect();
        ids.sort();
        f.debug_struct("CodecRegistry").field("coders", &ids).finish()
    }
}
