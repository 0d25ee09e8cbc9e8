//! Folder decoder: runs a folder's coder graph over its pack streams.
//!
//! A folder is a small DAG. Coders are nodes; every coder input is fed
//! either by a pack stream or, through a bind pair, by another coder's
//! output. Exactly one output is left unbound and becomes the folder's
//! decoded bytes. [`DecodePlan`] validates the wiring and orders the coders
//! topologically; [`FolderDecoder`] executes that order.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::codec::{CodecError, CodecRegistry, CoderId};
use crate::index::{ArchiveIndex, EntryLocation, FolderDescriptor};
use crate::source::ByteSource;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Folder {folder}: invalid coder graph: {reason}")]
    InvalidGraph { folder: usize, reason: String },
    #[error("Folder {folder}: unsupported coder {id:#x} ({name})")]
    UnsupportedCoder { folder: usize, id: u64, name: &'static str },
    #[error("Folder {folder}: coder {id} failed: {source}")]
    Codec {
        folder: usize,
        id:     CoderId,
        #[source]
        source: CodecError,
    },
    #[error("Folder {folder}: coder {id} produced {actual} bytes, expected {expected}")]
    SizeMismatch { folder: usize, id: CoderId, expected: u64, actual: u64 },
    #[error("Folder {folder}: pack stream {stream} CRC mismatch (expected {expected:08x}, got {actual:08x})")]
    PackCrcMismatch { folder: usize, stream: usize, expected: u32, actual: u32 },
    #[error("Folder {folder}: CRC mismatch (expected {expected:08x}, got {actual:08x})")]
    CrcMismatch { folder: usize, expected: u32, actual: u32 },
    #[error("Folder {folder} substream {substream}: CRC mismatch (expected {expected:08x}, got {actual:08x})")]
    SubstreamCrcMismatch { folder: usize, substream: usize, expected: u32, actual: u32 },
    #[error("Folder {folder}: substream at {offset}+{size} exceeds decoded size {len}")]
    SubstreamRange { folder: usize, offset: u64, size: u64, len: usize },
    #[error("Folder {folder}: reading pack data failed: {source}")]
    Io {
        folder: usize,
        #[source]
        source: io::Error,
    },
    #[error("No folder {0} in archive")]
    NoSuchFolder(usize),
}

impl DecodeError {
    pub fn folder(&self) -> usize {
        match *self {
            DecodeError::InvalidGraph { folder, .. }
            | DecodeError::UnsupportedCoder { folder, .. }
            | DecodeError::Codec { folder, .. }
            | DecodeError::SizeMismatch { folder, .. }
            | DecodeError::PackCrcMismatch { folder, .. }
            | DecodeError::CrcMismatch { folder, .. }
            | DecodeError::SubstreamCrcMismatch { folder, .. }
            | DecodeError::SubstreamRange { folder, .. }
            | DecodeError::Io { folder, .. } => folder,
            DecodeError::NoSuchFolder(folder) => folder,
        }
    }

    /// True for failures caused by the stored bytes rather than the
    /// decoder's capabilities.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DecodeError::Codec { .. }
                | DecodeError::SizeMismatch { .. }
                | DecodeError::PackCrcMismatch { .. }
                | DecodeError::CrcMismatch { .. }
                | DecodeError::SubstreamCrcMismatch { .. }
                | DecodeError::SubstreamRange { .. }
        )
    }
}

// ── Plan ─────────────────────────────────────────────────────────────────────

/// Where one coder input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The n-th pack stream of the folder.
    Pack(usize),
    /// The single output of another coder.
    Coder(usize),
}

/// A validated, topologically ordered coder graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodePlan {
    order:      Vec<usize>,
    inputs:     Vec<Vec<InputSource>>,
    main_coder: usize,
}

impl DecodePlan {
    pub fn build(folder: &FolderDescriptor) -> Result<Self, String> {
        let coders = &folder.coders;
        if coders.is_empty() {
            return Err("folder has no coders".into());
        }
        if let Some((c, coder)) = coders.iter().enumerate().find(|(_, c)| c.num_out_streams != 1) {
            return Err(format!(
                "coder {c} ({}) has {} output streams; only single-output coders are supported",
                coder.id, coder.num_out_streams
            ));
        }

        let num_in = folder.num_in_streams_total();
        // One output per coder: output stream `o` belongs to coder `o`.
        let num_out = coders.len();

        if folder.bind_pairs.len() + 1 != num_out {
            return Err(format!(
                "{} bind pairs for {num_out} output streams", folder.bind_pairs.len()
            ));
        }
        if folder.unpack_sizes.len() != num_out {
            return Err(format!(
                "{} unpack sizes for {num_out} output streams", folder.unpack_sizes.len()
            ));
        }

        // Feed table: which source drives each folder input stream.
        let mut feeds: Vec<Option<InputSource>> = vec![None; num_in];
        let mut out_bound = vec![false; num_out];

        for bp in &folder.bind_pairs {
            if bp.in_index >= num_in || bp.out_index >= num_out {
                return Err(format!(
                    "bind pair {} <- {} out of range ({num_in} inputs, {num_out} outputs)",
                    bp.in_index, bp.out_index
                ));
            }
            if feeds[bp.in_index].is_some() {
                return Err(format!("input stream {} bound twice", bp.in_index));
            }
            if out_bound[bp.out_index] {
                return Err(format!("output stream {} bound twice", bp.out_index));
            }
            feeds[bp.in_index] = Some(InputSource::Coder(bp.out_index));
            out_bound[bp.out_index] = true;
        }

        for (k, &stream) in folder.packed_streams.iter().enumerate() {
            match feeds.get(stream) {
                None => return Err(format!("packed stream index {stream} out of range")),
                Some(Some(_)) => return Err(format!("input stream {stream} is both packed and bound")),
                Some(None) => feeds[stream] = Some(InputSource::Pack(k)),
            }
        }

        let mut unbound = (0..num_out).filter(|&o| !out_bound[o]);
        let main_coder = match (unbound.next(), unbound.next()) {
            (Some(o), None) => o,
            _ => return Err("folder must have exactly one unbound output".into()),
        };

        let mut inputs = Vec::with_capacity(coders.len());
        let mut indegree = vec![0usize; coders.len()];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); coders.len()];
        for c in 0..coders.len() {
            let start = folder.coder_in_start(c);
            let mut coder_inputs = Vec::with_capacity(coders[c].num_in_streams);
            for stream in start..start + coders[c].num_in_streams {
                let src = feeds[stream]
                    .ok_or_else(|| format!("input stream {stream} of coder {c} is not fed"))?;
                if let InputSource::Coder(producer) = src {
                    indegree[c] += 1;
                    consumers[producer].push(c);
                }
                coder_inputs.push(src);
            }
            inputs.push(coder_inputs);
        }

        // Kahn's algorithm; lowest index first keeps the order deterministic.
        let mut ready: VecDeque<usize> = (0..coders.len()).filter(|&c| indegree[c] == 0).collect();
        let mut order = Vec::with_capacity(coders.len());
        while let Some(c) = ready.pop_front() {
            order.push(c);
            for &next in &consumers[c] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != coders.len() {
            return Err("coder graph contains a cycle".into());
        }

        Ok(Self { order, inputs, main_coder })
    }

    /// Coder execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn inputs(&self, coder: usize) -> &[InputSource] {
        &self.inputs[coder]
    }

    /// The coder whose output is the folder output.
    pub fn main_coder(&self) -> usize {
        self.main_coder
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FolderDecoder {
    registry: CodecRegistry,
}

impl FolderDecoder {
    pub fn new(registry: CodecRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Validate `folder`'s graph without touching the archive.
    pub fn plan(&self, index: &ArchiveIndex, folder: usize) -> Result<DecodePlan, DecodeError> {
        let desc = index.folders.get(folder).ok_or(DecodeError::NoSuchFolder(folder))?;
        let plan = DecodePlan::build(desc)
            .map_err(|reason| DecodeError::InvalidGraph { folder, reason })?;
        let available = index.folder_pack_streams(folder).len();
        if available != desc.packed_streams.len() {
            return Err(DecodeError::InvalidGraph {
                folder,
                reason: format!(
                    "needs {} pack streams, archive has {available}", desc.packed_streams.len()
                ),
            });
        }
        Ok(plan)
    }

    /// Decode folder `folder` of `index` to its full unpacked bytes and
    /// verify the folder CRC.
    pub fn decode(
        &self,
        index:  &ArchiveIndex,
        folder: usize,
        source: &ByteSource,
    ) -> Result<Vec<u8>, DecodeError> {
        let plan = self.plan(index, folder)?;
        let desc = &index.folders[folder];

        if let Some(coder) = desc.coders.iter().find(|c| !self.registry.supports(c.id)) {
            return Err(DecodeError::UnsupportedCoder {
                folder,
                id: coder.id.0,
                name: coder.id.name(),
            });
        }

        debug!(
            folder,
            coders = ?desc.coder_ids().map(|id| id.name()).collect::<Vec<_>>(),
            unpack_size = desc.unpack_size(),
            "decoding folder"
        );

        let mut packed = Vec::with_capacity(desc.packed_streams.len());
        for (k, ps) in index.folder_pack_streams(folder).iter().enumerate() {
            let len = usize::try_from(ps.size).map_err(|_| DecodeError::InvalidGraph {
                folder,
                reason: format!("pack stream of {} bytes", ps.size),
            })?;
            let data = source.read_at(ps.offset, len)
                .map_err(|source| DecodeError::Io { folder, source })?;
            if let Some(expected) = ps.crc {
                let actual = crc32fast::hash(&data);
                if actual != expected {
                    return Err(DecodeError::PackCrcMismatch { folder, stream: k, expected, actual });
                }
            }
            packed.push(data);
        }

        let mut outputs: Vec<Option<Vec<u8>>> = vec![None; desc.coders.len()];
        for &c in plan.order() {
            let coder = &desc.coders[c];
            let expected = desc.unpack_sizes[c];
            let size = usize::try_from(expected).map_err(|_| DecodeError::InvalidGraph {
                folder,
                reason: format!("coder {c} declares {expected} output bytes"),
            })?;

            // Each coder output feeds exactly one input, so it can be moved out.
            let owned: Vec<Option<Vec<u8>>> = plan.inputs(c).iter()
                .map(|src| match *src {
                    InputSource::Coder(p) => outputs[p].take(),
                    InputSource::Pack(_) => None,
                })
                .collect();
            let inputs = plan.inputs(c).iter().zip(&owned)
                .map(|(src, own)| match (*src, own) {
                    (InputSource::Pack(k), _) => Ok(packed[k].as_slice()),
                    (InputSource::Coder(_), Some(buf)) => Ok(buf.as_slice()),
                    (InputSource::Coder(p), None) => Err(DecodeError::InvalidGraph {
                        folder,
                        reason: format!("coder {c} scheduled before its producer {p}"),
                    }),
                })
                .collect::<Result<Vec<&[u8]>, _>>()?;

            let out = self.registry
                .decode(coder.id, &inputs, size, &coder.properties)
                .map_err(|source| match source {
                    CodecError::UnavailableCoder { id } => DecodeError::UnsupportedCoder {
                        folder,
                        id: id.0,
                        name: id.name(),
                    },
                    source => DecodeError::Codec { folder, id: coder.id, source },
                })?;
            if out.len() as u64 != expected {
                return Err(DecodeError::SizeMismatch {
                    folder,
                    id: coder.id,
                    expected,
                    actual: out.len() as u64,
                });
            }
            trace!(folder, coder = %coder.id, size, "coder finished");
            outputs[c] = Some(out);
        }

        let out = outputs[plan.main_coder()].take().ok_or_else(|| DecodeError::InvalidGraph {
            folder,
            reason: "main coder produced nothing".into(),
        })?;

        if let Some(expected) = desc.crc {
            let actual = crc32fast::hash(&out);
            if actual != expected {
                return Err(DecodeError::CrcMismatch { folder, expected, actual });
            }
        }
        debug!(folder, size = out.len(), "folder decoded");
        Ok(out)
    }
}

/// Cut one entry out of a decoded folder and verify its CRC.
pub fn slice_substream(data: &Bytes, loc: &EntryLocation) -> Result<Bytes, DecodeError> {
    let range = usize::try_from(loc.offset).ok()
        .and_then(|start| Some(start..start.checked_add(usize::try_from(loc.size).ok()?)?))
        .filter(|r| r.end <= data.len())
        .ok_or(DecodeError::SubstreamRange {
            folder: loc.folder,
            offset: loc.offset,
            size:   loc.size,
            len:    data.len(),
        })?;
    let slice = data.slice(range);
    if let Some(expected) = loc.crc {
        let actual = crc32fast::hash(&slice);
        if actual != expected {
            return Err(DecodeError::SubstreamCrcMismatch {
                folder: loc.folder,
                substream: loc.substream,
                expected,
                actual,
            });
        }
    }
    Ok(slice)
}
