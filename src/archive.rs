//! High-level [`Archive`] handle: parsed index, byte source and decode cache.
//!
//! ```no_run
//! use import7z::archive::Archive;
//!
//! let ar = Archive::open("lib.7z")?;
//! for f in ar.list() {
//!     println!("{} ({} bytes)", f.name, f.size);
//! }
//! let data = ar.read_file("pkg/__init__.py")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheStats, DecodeCache};
use crate::codec::CodecRegistry;
use crate::folder::{slice_substream, DecodeError, FolderDecoder};
use crate::header::{self, FormatError};
use crate::index::{ArchiveIndex, EntryLocation, FileEntry, FolderDescriptor};
use crate::resolver::EntryResolver;
use crate::source::ByteSource;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("No such entry: {0}")]
    NotFound(String),
    #[error("Archive {0} is closed")]
    Closed(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ReadError {
    /// True when the archive bytes themselves are damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ReadError::Decode(e) if e.is_corruption())
    }
}

// ── FileInfo ──────────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Archive::list`].
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub index:      usize,
    pub name:       String,
    pub size:       u64,
    pub is_dir:     bool,
    pub folder:     Option<usize>,
    pub crc:        Option<u32>,
    pub mtime:      Option<DateTime<Utc>>,
    pub attributes: Option<u32>,
    /// Coder chain of the backing folder, e.g. `BCJ:LZMA`.
    pub method:     Option<String>,
}

impl FileInfo {
    fn new(index: usize, entry: &FileEntry, archive: &ArchiveIndex) -> Self {
        FileInfo {
            index,
            name:       entry.path.clone(),
            size:       entry.size(),
            is_dir:     entry.is_dir,
            folder:     entry.folder(),
            crc:        entry.crc(),
            mtime:      entry.mtime,
            attributes: entry.attributes,
            method:     entry.folder().and_then(|f| archive.folders.get(f)).map(method_name),
        }
    }
}

fn method_name(folder: &FolderDescriptor) -> String {
    folder.coder_ids().map(|id| id.name()).collect::<Vec<_>>().join(":")
}

// ── Archive summary ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CoderInfo {
    pub id:         String,
    pub name:       &'static str,
    pub properties: String,
    pub supported:  bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderInfo {
    pub index:       usize,
    pub method:      String,
    pub coders:      Vec<CoderInfo>,
    pub pack_size:   u64,
    pub unpack_size: u64,
    pub substreams:  usize,
    pub crc:         Option<u32>,
    /// Why the coder graph cannot be decoded, if it cannot.
    pub graph_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub path:        PathBuf,
    pub file_size:   u64,
    pub entries:     usize,
    pub pack_size:   u64,
    pub unpack_size: u64,
    pub folders:     Vec<FolderInfo>,
    pub cache:       CacheStats,
}

/// Outcome of decoding one folder in [`Archive::verify`].
#[derive(Debug)]
pub struct FolderCheck {
    pub folder: usize,
    /// Decoded size on success.
    pub result: Result<u64, ReadError>,
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path:         PathBuf,
    /// `None` once closed; the file handle goes with it.
    source:       RwLock<Option<ByteSource>>,
    file_size:    u64,
    index:        Arc<ArchiveIndex>,
    resolver:     EntryResolver,
    decoder:      FolderDecoder,
    cache:        DecodeCache,
    /// Per folder: the coder-graph defect found at open, if any.
    graph_errors: Vec<Option<String>>,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        Self::open_with(path, CodecRegistry::builtin())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, registry: CodecRegistry) -> Result<Self, FormatError> {
        let path = path.as_ref().to_owned();
        let source = ByteSource::open(&path)?;
        Self::build(path, source, registry)
    }

    /// Open an archive held by any seekable reader; `name` stands in for the
    /// archive path in origins and search roots.
    pub fn from_reader<R>(reader: R, name: impl Into<PathBuf>) -> Result<Self, FormatError>
    where
        R: Read + Seek + Send + 'static,
    {
        Self::from_reader_with(reader, name, CodecRegistry::builtin())
    }

    pub fn from_reader_with<R>(
        reader:   R,
        name:     impl Into<PathBuf>,
        registry: CodecRegistry,
    ) -> Result<Self, FormatError>
    where
        R: Read + Seek + Send + 'static,
    {
        let path = name.into();
        let source = ByteSource::new(reader, path.display().to_string())?;
        Self::build(path, source, registry)
    }

    fn build(path: PathBuf, source: ByteSource, registry: CodecRegistry) -> Result<Self, FormatError> {
        let decoder = FolderDecoder::new(registry);
        let index = header::parse(&source, &decoder)?;

        let graph_errors: Vec<Option<String>> = (0..index.folders.len())
            .map(|f| match decoder.plan(&index, f) {
                Ok(_) => None,
                Err(DecodeError::InvalidGraph { reason, .. }) => Some(reason),
                Err(other) => Some(other.to_string()),
            })
            .collect();
        for (folder, reason) in graph_errors.iter().enumerate() {
            if let Some(reason) = reason {
                warn!(archive = %path.display(), folder, %reason, "folder cannot be decoded");
            }
        }

        let resolver = EntryResolver::new(&index);
        debug!(
            archive = %path.display(),
            entries = index.files.len(),
            folders = index.folders.len(),
            "opened archive"
        );
        Ok(Self {
            path,
            file_size: source.len(),
            source: RwLock::new(Some(source)),
            index: Arc::new(index),
            resolver,
            decoder,
            cache: DecodeCache::new(),
            graph_errors,
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Drop cached folders, release the byte source and refuse further
    /// reads. Idempotent.
    pub fn close(&self) {
        if !self.cache.is_closed() {
            debug!(archive = %self.path.display(), "closing archive");
        }
        self.cache.close();
        // Waits for in-flight decodes holding the source.
        drop(self.source.write().take());
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }

    pub fn index(&self) -> &Arc<ArchiveIndex> { &self.index }

    pub fn resolver(&self) -> &EntryResolver { &self.resolver }

    pub fn registry(&self) -> &CodecRegistry { self.decoder.registry() }

    pub fn cache_stats(&self) -> CacheStats { self.cache.stats() }

    pub fn list(&self) -> Vec<FileInfo> {
        self.index.files.iter().enumerate()
            .map(|(i, f)| FileInfo::new(i, f, &self.index))
            .collect()
    }

    pub fn stat(&self, name: &str) -> Option<FileInfo> {
        let idx = self.resolver.entry(name)?;
        Some(FileInfo::new(idx, &self.index.files[idx], &self.index))
    }

    pub fn info(&self) -> ArchiveInfo {
        let registry = self.decoder.registry();
        let folders = self.index.folders.iter().enumerate()
            .map(|(i, f)| FolderInfo {
                index:       i,
                method:      method_name(f),
                coders:      f.coders.iter().map(|c| CoderInfo {
                    id:         format!("{:x}", c.id.0),
                    name:       c.id.name(),
                    properties: hex::encode(&c.properties),
                    supported:  registry.supports(c.id),
                }).collect(),
                pack_size:   self.index.folder_pack_streams(i).iter().map(|p| p.size).sum(),
                unpack_size: f.unpack_size(),
                substreams:  f.substreams.len(),
                crc:         f.crc,
                graph_error: self.graph_errors[i].clone(),
            })
            .collect();
        ArchiveInfo {
            path:        self.path.clone(),
            file_size:   self.file_size,
            entries:     self.index.files.len(),
            pack_size:   self.index.total_pack_size(),
            unpack_size: self.index.total_unpack_size(),
            folders,
            cache:       self.cache.stats(),
        }
    }

    /// `Err(InvalidGraph)` if `folder`'s coder graph was rejected at open.
    pub fn check_folder(&self, folder: usize) -> Result<(), DecodeError> {
        match self.graph_errors.get(folder) {
            None => Err(DecodeError::NoSuchFolder(folder)),
            Some(None) => Ok(()),
            Some(Some(reason)) => Err(DecodeError::InvalidGraph { folder, reason: reason.clone() }),
        }
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    /// Decoded bytes of a whole folder, through the cache.
    pub fn folder_data(&self, folder: usize) -> Result<Bytes, ReadError> {
        self.check_folder(folder)?;
        self.cache
            .get_or_decode(folder, || {
                let source = self.source.read();
                let source = source.as_ref().ok_or(CacheError::Closed)?;
                Ok(self.decoder.decode(&self.index, folder, source)?)
            })
            .map_err(|e| match e {
                CacheError::Closed => self.closed_error(),
                CacheError::Decode(e) => ReadError::Decode(e),
            })
    }

    fn closed_error(&self) -> ReadError {
        ReadError::Closed(self.path.display().to_string())
    }

    /// Contents of entry `idx`; empty for entries without a stream.
    pub fn read_entry(&self, idx: usize) -> Result<Bytes, ReadError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let entry = self.index.files.get(idx)
            .ok_or_else(|| ReadError::NotFound(format!("entry #{idx}")))?;
        let Some(loc) = entry.location else {
            return Ok(Bytes::new());
        };
        let data = self.folder_data(loc.folder)?;
        Ok(slice_substream(&data, &loc)?)
    }

    pub fn read_file(&self, name: &str) -> Result<Bytes, ReadError> {
        let idx = self.resolver.entry(name)
            .ok_or_else(|| ReadError::NotFound(name.to_owned()))?;
        self.read_entry(idx)
    }

    /// Decode every folder and check every substream CRC, bypassing the cache.
    pub fn verify(&self) -> Vec<FolderCheck> {
        let locations = self.index.locations_by_folder();

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            locations.par_iter().enumerate().map(|(f, locs)| self.verify_folder(f, locs)).collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            locations.iter().enumerate().map(|(f, locs)| self.verify_folder(f, locs)).collect()
        }
    }

    fn verify_folder(&self, folder: usize, locations: &[EntryLocation]) -> FolderCheck {
        let result = self.check_folder(folder)
            .map_err(ReadError::from)
            .and_then(|()| {
                let source = self.source.read();
                let source = source.as_ref().ok_or_else(|| self.closed_error())?;
                Ok(self.decoder.decode(&self.index, folder, source)?)
            })
            .and_then(|out| {
                let data = Bytes::from(out);
                for loc in locations {
                    slice_substream(&data, loc)?;
                }
                Ok(data.len() as u64)
            });
        FolderCheck { folder, result }
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("entries", &self.index.files.len())
            .field("folders", &self.index.folders.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
