//! Fixture writer: assembles real 7z byte streams for the integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use import7z::archive::Archive;
use import7z::codec::{Codec, CodecError, CodecRegistry, CoderId};
use tempfile::NamedTempFile;

/// Registered by [`counting_registry`]; stores data uncompressed.
pub const CUSTOM_CODER: CoderId = CoderId(0x7F_0001);
/// Never registered anywhere.
pub const UNKNOWN_CODER: CoderId = CoderId(0x7F_FFFF);

const MAGIC: [u8; 6] = [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Copy,
    Lzma,
    Lzma2,
    /// Data stored verbatim under an arbitrary coder id.
    Custom(CoderId),
    /// Data stored verbatim under raw on-disk id bytes (up to 15).
    RawId(&'static [u8]),
    /// Copy folder that claims this many unpacked bytes.
    DeclaredSize(u64),
    /// Three copy coders, two of them feeding each other.
    Cyclic,
}

struct FolderFixture {
    method: Method,
    files:  Vec<(String, Vec<u8>)>,
}

struct CoderRec {
    /// On-disk big-endian id bytes.
    id:     Vec<u8>,
    num_in: u64,
    props:  Vec<u8>,
}

struct FolderRec {
    coders:       Vec<CoderRec>,
    bind_pairs:   Vec<(u64, u64)>,
    unpack_sizes: Vec<u64>,
    crc:          Option<u32>,
}

pub struct Built {
    pub bytes:       Vec<u8>,
    /// Absolute byte range of each folder's pack stream.
    pub pack_ranges: Vec<Range<usize>>,
    /// Pack stream holding the encoded header, if any.
    pub header_pack: Option<Range<usize>>,
}

impl Built {
    pub fn archive(&self) -> Archive {
        self.archive_with(CodecRegistry::builtin())
    }

    pub fn archive_with(&self, registry: CodecRegistry) -> Archive {
        Archive::from_reader_with(Cursor::new(self.bytes.clone()), "test.7z", registry).unwrap()
    }

    pub fn open(&self) -> Result<Archive, import7z::FormatError> {
        Archive::from_reader(Cursor::new(self.bytes.clone()), "test.7z")
    }

    pub fn write_temp(&self) -> NamedTempFile {
        use std::io::Write;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&self.bytes).unwrap();
        f.flush().unwrap();
        f
    }

    /// Flip one byte in the middle of folder `folder`'s packed data.
    pub fn corrupt_folder(mut self, folder: usize) -> Self {
        let r = self.pack_ranges[folder].clone();
        self.bytes[(r.start + r.end) / 2] ^= 0x55;
        self
    }
}

pub struct ArchiveBuilder {
    folders:        Vec<FolderFixture>,
    dirs:           Vec<String>,
    empty_files:    Vec<String>,
    phantoms:       Vec<String>,
    folder_crcs:    bool,
    encoded_header: Option<Method>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self {
            folders:        Vec::new(),
            dirs:           Vec::new(),
            empty_files:    Vec::new(),
            phantoms:       Vec::new(),
            folder_crcs:    true,
            encoded_header: None,
        }
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A solid folder holding text files.
    pub fn folder(self, method: Method, files: &[(&str, &str)]) -> Self {
        let files = files.iter()
            .map(|(n, d)| (n.to_string(), d.as_bytes().to_vec()))
            .collect();
        self.folder_bytes(method, files)
    }

    pub fn folder_bytes(mut self, method: Method, files: Vec<(String, Vec<u8>)>) -> Self {
        self.folders.push(FolderFixture { method, files });
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.dirs.push(name.into());
        self
    }

    pub fn empty_file(mut self, name: &str) -> Self {
        self.empty_files.push(name.into());
        self
    }

    /// A file entry that claims a stream no folder provides.
    pub fn phantom_file(mut self, name: &str) -> Self {
        self.phantoms.push(name.into());
        self
    }

    /// Rely on substream CRCs only.
    pub fn without_folder_crcs(mut self) -> Self {
        self.folder_crcs = false;
        self
    }

    pub fn encoded_header(mut self, method: Method) -> Self {
        self.encoded_header = Some(method);
        self
    }

    pub fn build(&self) -> Built {
        let mut packs: Vec<u8> = Vec::new();
        let mut pack_ranges = Vec::new();
        let mut pack_sizes = Vec::new();
        let mut records = Vec::new();
        let mut substreams = Vec::new();

        for fixture in &self.folders {
            let plain: Vec<u8> = fixture.files.iter().flat_map(|(_, d)| d.iter().copied()).collect();
            let (packed, rec) = pack_folder(fixture.method, &plain, self.folder_crcs);
            let start = 32 + packs.len();
            pack_ranges.push(start..start + packed.len());
            pack_sizes.push(packed.len() as u64);
            packs.extend_from_slice(&packed);
            records.push(rec);
            substreams.push(fixture.files.iter()
                .map(|(_, d)| (d.len() as u64, crc32fast::hash(d)))
                .collect::<Vec<_>>());
        }

        let mut header = vec![0x01];
        if !records.is_empty() {
            header.push(0x04);
            write_streams_info(&mut header, 0, &pack_sizes, &records, Some(substreams.as_slice()));
        }
        self.write_files_info(&mut header);
        header.push(0x00);

        let mut header_pack = None;
        let next_header = match self.encoded_header {
            None => header,
            Some(method) => {
                let (packed, rec) = pack_folder(method, &header, true);
                let pos = packs.len() as u64;
                let start = 32 + packs.len();
                header_pack = Some(start..start + packed.len());
                packs.extend_from_slice(&packed);

                let mut encoded = vec![0x17];
                write_streams_info(&mut encoded, pos, &[packed.len() as u64], &[rec], None);
                encoded
            }
        };

        let mut bytes = signature(packs.len() as u64, &next_header);
        bytes.extend_from_slice(&packs);
        bytes.extend_from_slice(&next_header);
        Built { bytes, pack_ranges, header_pack }
    }

    fn write_files_info(&self, out: &mut Vec<u8>) {
        // (name, has_stream, is_dir)
        let mut entries: Vec<(&str, bool, bool)> = Vec::new();
        entries.extend(self.dirs.iter().map(|d| (d.as_str(), false, true)));
        for fixture in &self.folders {
            entries.extend(fixture.files.iter().map(|(n, _)| (n.as_str(), true, false)));
        }
        entries.extend(self.empty_files.iter().map(|f| (f.as_str(), false, false)));
        entries.extend(self.phantoms.iter().map(|f| (f.as_str(), true, false)));
        if entries.is_empty() {
            return;
        }

        out.push(0x05);
        write_number(out, entries.len() as u64);

        let empty: Vec<bool> = entries.iter().map(|e| !e.1).collect();
        if empty.contains(&true) {
            write_property(out, 0x0E, &bit_vector(&empty));
            let empty_file: Vec<bool> = entries.iter().filter(|e| !e.1).map(|e| !e.2).collect();
            if empty_file.contains(&true) {
                write_property(out, 0x0F, &bit_vector(&empty_file));
            }
        }

        let mut names = vec![0u8];
        for (name, _, _) in &entries {
            names.extend(name.encode_utf16().chain([0]).flat_map(u16::to_le_bytes));
        }
        write_property(out, 0x11, &names);

        let mut attrs = vec![1u8, 0u8];
        for (_, _, is_dir) in &entries {
            let a: u32 = if *is_dir { 0x10 } else { 0x20 };
            attrs.extend_from_slice(&a.to_le_bytes());
        }
        write_property(out, 0x15, &attrs);

        out.push(0x00);
    }
}

fn pack_folder(method: Method, plain: &[u8], with_crc: bool) -> (Vec<u8>, FolderRec) {
    let size = plain.len() as u64;
    let crc = with_crc.then(|| crc32fast::hash(plain));
    let single = |id: Vec<u8>, props: Vec<u8>| FolderRec {
        coders: vec![CoderRec { id, num_in: 1, props }],
        bind_pairs: vec![],
        unpack_sizes: vec![size],
        crc,
    };
    match method {
        Method::Copy => (plain.to_vec(), single(id_bytes(CoderId::COPY), vec![])),
        Method::Custom(id) => (plain.to_vec(), single(id_bytes(id), vec![])),
        Method::RawId(id) => (plain.to_vec(), single(id.to_vec(), vec![])),
        Method::DeclaredSize(declared) => {
            let mut rec = single(id_bytes(CoderId::COPY), vec![]);
            rec.unpack_sizes = vec![declared];
            (plain.to_vec(), rec)
        }
        Method::Lzma2 => {
            let mut out = Vec::new();
            lzma_rs::lzma2_compress(&mut Cursor::new(plain), &mut out).unwrap();
            (out, single(id_bytes(CoderId::LZMA2), vec![0x10]))
        }
        Method::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut Cursor::new(plain), &mut out).unwrap();
            // Strip the 13-byte .lzma header; 7z keeps only the 5 property bytes.
            let props = out[..5].to_vec();
            (out[13..].to_vec(), single(id_bytes(CoderId::LZMA), props))
        }
        Method::Cyclic => (plain.to_vec(), FolderRec {
            coders: (0..3).map(|_| CoderRec { id: id_bytes(CoderId::COPY), num_in: 1, props: vec![] }).collect(),
            bind_pairs: vec![(0, 1), (1, 0)],
            unpack_sizes: vec![size; 3],
            crc,
        }),
    }
}

/// Shortest big-endian encoding of `id`; copy is the single byte 0x00.
fn id_bytes(id: CoderId) -> Vec<u8> {
    let be = id.0.to_be_bytes();
    let skip = be.iter().take_while(|&&b| b == 0).count().min(7);
    be[skip..].to_vec()
}

pub fn signature(next_offset: u64, next_header: &[u8]) -> Vec<u8> {
    let mut tail = Vec::with_capacity(20);
    tail.extend_from_slice(&next_offset.to_le_bytes());
    tail.extend_from_slice(&(next_header.len() as u64).to_le_bytes());
    tail.extend_from_slice(&crc32fast::hash(next_header).to_le_bytes());

    let mut out = MAGIC.to_vec();
    out.extend_from_slice(&[0, 4]);
    out.extend_from_slice(&crc32fast::hash(&tail).to_le_bytes());
    out.extend_from_slice(&tail);
    out
}

fn write_streams_info(
    out: &mut Vec<u8>,
    pack_pos: u64,
    pack_sizes: &[u64],
    folders: &[FolderRec],
    substreams: Option<&[Vec<(u64, u32)>]>,
) {
    out.push(0x06);
    write_number(out, pack_pos);
    write_number(out, pack_sizes.len() as u64);
    out.push(0x09);
    for &s in pack_sizes {
        write_number(out, s);
    }
    out.push(0x00);

    out.push(0x07);
    out.push(0x0B);
    write_number(out, folders.len() as u64);
    out.push(0x00);
    for f in folders {
        write_folder(out, f);
    }
    out.push(0x0C);
    for f in folders {
        for &s in &f.unpack_sizes {
            write_number(out, s);
        }
    }
    if folders.iter().any(|f| f.crc.is_some()) {
        out.push(0x0A);
        write_digests(out, &folders.iter().map(|f| f.crc).collect::<Vec<_>>());
    }
    out.push(0x00);

    if let Some(subs) = substreams {
        out.push(0x08);
        out.push(0x0D);
        for s in subs {
            write_number(out, s.len() as u64);
        }
        out.push(0x09);
        for s in subs {
            for &(size, _) in s.iter().take(s.len().saturating_sub(1)) {
                write_number(out, size);
            }
        }
        let unknown: Vec<Option<u32>> = folders.iter().zip(subs)
            .filter(|(f, s)| !(s.len() == 1 && f.crc.is_some()))
            .flat_map(|(_, s)| s.iter().map(|&(_, crc)| Some(crc)))
            .collect();
        if !unknown.is_empty() {
            out.push(0x0A);
            write_digests(out, &unknown);
        }
        out.push(0x00);
    }

    out.push(0x00);
}

fn write_folder(out: &mut Vec<u8>, f: &FolderRec) {
    write_number(out, f.coders.len() as u64);
    for c in &f.coders {
        let id = &c.id;
        let complex = c.num_in != 1;
        let mut flags = id.len() as u8;
        if complex {
            flags |= 0x10;
        }
        if !c.props.is_empty() {
            flags |= 0x20;
        }
        out.push(flags);
        out.extend_from_slice(id);
        if complex {
            write_number(out, c.num_in);
            write_number(out, 1);
        }
        if !c.props.is_empty() {
            write_number(out, c.props.len() as u64);
            out.extend_from_slice(&c.props);
        }
    }
    for &(in_index, out_index) in &f.bind_pairs {
        write_number(out, in_index);
        write_number(out, out_index);
    }
}

fn write_digests(out: &mut Vec<u8>, crcs: &[Option<u32>]) {
    let defined: Vec<bool> = crcs.iter().map(Option::is_some).collect();
    if defined.iter().all(|&d| d) {
        out.push(1);
    } else {
        out.push(0);
        out.extend(bit_vector(&defined));
    }
    for crc in crcs.iter().flatten() {
        out.extend_from_slice(&crc.to_le_bytes());
    }
}

fn write_property(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    write_number(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn bit_vector(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, &b)| b) {
        out[i / 8] |= 0x80 >> (i % 8);
    }
    out
}

pub fn write_number(out: &mut Vec<u8>, v: u64) {
    for extra in 0..8usize {
        let limit_bits = 7 - extra as u32 + 8 * extra as u32;
        if v < (1u64 << limit_bits) {
            let lead = !(0xFFu8 >> extra);
            out.push(lead | (v >> (8 * extra)) as u8);
            out.extend_from_slice(&v.to_le_bytes()[..extra]);
            return;
        }
    }
    out.push(0xFF);
    out.extend_from_slice(&v.to_le_bytes());
}

// ── Test codecs ──────────────────────────────────────────────────────────────

/// Copy codec that counts invocations and optionally dawdles.
pub struct CountingCopy {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl Codec for CountingCopy {
    fn name(&self) -> &'static str { "CountingCopy" }

    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let [data] = inputs else {
            return Err(CodecError::InputCount { expected: 1, got: inputs.len() });
        };
        Ok(data[..unpack_size.min(data.len())].to_vec())
    }
}

/// Builtin registry plus [`CUSTOM_CODER`] as a [`CountingCopy`].
pub fn counting_registry(delay: Duration) -> (CodecRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = CodecRegistry::builtin();
    registry.register(CUSTOM_CODER, Arc::new(CountingCopy { calls: Arc::clone(&calls), delay }));
    (registry, calls)
}
