//! Finder/loader over one archive and a directory prefix inside it.
//!
//! An [`Importer`] answers the host's two questions for a qualified module
//! name: "is it here?" ([`Importer::find`]) and "give me its code"
//! ([`Importer::load`]). Only the last dotted segment of the name is looked
//! up; the host walks packages by asking the importer of each package's
//! search root, which [`Importer::for_package`] or a
//! [`PathHook`](crate::hook::PathHook) hands out.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::archive::{Archive, ReadError};
use crate::folder::DecodeError;
use crate::resolver::{normalize_path, Candidate};

pub use crate::resolver::CodeKind;

/// Bytes before the marshalled code object in a compiled module.
pub const BYTECODE_HEADER_SIZE: usize = 16;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Expected leading bytes of compiled modules. Entries that do not start
    /// with them are skipped in favour of the next search suffix.
    pub bytecode_magic:   Option<[u8; 4]>,
    /// Consider `.pyc` entries at all.
    pub allow_bytecode:   bool,
    /// Convert `\r\n` and `\r` to `\n` and end source with a newline.
    pub normalize_source: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            bytecode_magic:   None,
            allow_bytecode:   true,
            normalize_source: true,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("can't find module {name:?}")]
    NotFound { name: String },
    #[error("can't load {name:?} from {path}: {source}")]
    Unreadable {
        name:   String,
        path:   String,
        #[source]
        source: DecodeError,
    },
    #[error("{name:?}: archive index is inconsistent: {reason}")]
    Inconsistent { name: String, reason: String },
    #[error("bad bytecode for {name:?} in {path}: {reason}")]
    BadBytecode { name: String, path: String, reason: String },
    #[error("source of {name:?} in {path} is not valid UTF-8")]
    Encoding { name: String, path: String },
    #[error("archive {archive} is closed")]
    Closed { archive: String },
}

// ── Lookup results ────────────────────────────────────────────────────────────

/// A resolved module: which entry to load and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadUnit {
    pub fullname:    String,
    pub entry:       usize,
    /// Entry path inside the archive.
    pub path:        String,
    pub is_package:  bool,
    pub kind:        CodeKind,
    /// `<archive>/<path>`.
    pub origin:      String,
    /// `<archive>/<prefix><name>` for packages.
    pub search_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(LoadUnit),
    /// A directory without `__init__`: a namespace package portion.
    Namespace(String),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub fullname:    String,
    pub kind:        CodeKind,
    /// Source text (normalised if configured) or the whole compiled file.
    pub code:        Bytes,
    pub is_package:  bool,
    pub origin:      String,
    /// Package search path; empty for plain modules.
    pub search_path: Vec<String>,
}

impl LoadedModule {
    pub fn source(&self) -> Option<&str> {
        match self.kind {
            CodeKind::Source => std::str::from_utf8(&self.code).ok(),
            CodeKind::Bytecode => None,
        }
    }

    /// The marshalled code object after the compiled-file header.
    pub fn bytecode_body(&self) -> Option<&[u8]> {
        match self.kind {
            CodeKind::Bytecode => self.code.get(BYTECODE_HEADER_SIZE..),
            CodeKind::Source => None,
        }
    }
}

// ── Importer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Importer {
    archive: Arc<Archive>,
    /// Empty or ending in `/`.
    prefix:  String,
    options: ImportOptions,
}

impl Importer {
    pub fn new(archive: Arc<Archive>, prefix: &str, options: ImportOptions) -> Self {
        let prefix = match normalize_path(prefix) {
            p if p.is_empty() => p,
            p => p + "/",
        };
        Self { archive, prefix, options }
    }

    pub fn archive(&self) -> &Arc<Archive> { &self.archive }

    pub fn prefix(&self) -> &str { &self.prefix }

    pub fn options(&self) -> &ImportOptions { &self.options }

    /// The importer for a package's search root.
    pub fn for_package(&self, unit: &LoadUnit) -> Option<Importer> {
        unit.is_package.then(|| Importer {
            archive: Arc::clone(&self.archive),
            prefix:  format!("{}/", self.base(&unit.fullname)),
            options: self.options.clone(),
        })
    }

    pub fn find(&self, fullname: &str) -> Result<Option<LoadUnit>, LoadError> {
        self.ensure_open()?;
        let base = self.base(fullname);
        let resolver = self.archive.resolver();
        let Some(found) = resolver.candidates(&base, self.options.allow_bytecode).into_iter().next() else {
            trace!(name = fullname, %base, "not in archive");
            return Ok(None);
        };
        trace!(name = fullname, path = %found.path, "# trying");

        // A folder whose coder graph was rejected can never be loaded.
        if let Some(folder) = self.archive.index().files[found.entry].folder() {
            self.archive.check_folder(folder).map_err(|source| LoadError::Unreadable {
                name: fullname.to_owned(),
                path: found.path.clone(),
                source,
            })?;
        }
        Ok(Some(self.unit(fullname, &base, found)))
    }

    pub fn find_loader(&self, fullname: &str) -> Result<Lookup, LoadError> {
        if let Some(unit) = self.find(fullname)? {
            return Ok(Lookup::Found(unit));
        }
        let base = self.base(fullname);
        if !base.is_empty() && self.archive.resolver().is_dir(&base) {
            return Ok(Lookup::Namespace(self.join(&base)));
        }
        Ok(Lookup::NotFound)
    }

    pub fn load(&self, unit: &LoadUnit) -> Result<LoadedModule, LoadError> {
        self.ensure_open()?;
        let name = &unit.fullname;
        let base = self.base(name);
        let candidates = self.archive.resolver().candidates(&base, self.options.allow_bytecode);
        let start = candidates.iter().position(|c| c.entry == unit.entry).ok_or_else(|| {
            LoadError::Inconsistent {
                name:   name.clone(),
                reason: format!("{} is not reachable from {:?}", unit.path, self.prefix),
            }
        })?;

        let mut rejected = None;
        for c in &candidates[start..] {
            let data = self.read(name, c)?;
            match c.suffix.kind {
                CodeKind::Bytecode => match self.check_bytecode(&data) {
                    Ok(()) => return Ok(self.loaded(name, &base, c, data)),
                    Err(reason) => {
                        warn!(name = %name, path = %c.path, %reason, "skipping compiled module");
                        rejected = Some((c.path.clone(), reason));
                    }
                },
                CodeKind::Source => {
                    let code = if self.options.normalize_source {
                        Bytes::from(normalize_line_endings(&data))
                    } else {
                        data
                    };
                    return Ok(self.loaded(name, &base, c, code));
                }
            }
        }

        let (path, reason) = rejected.unwrap_or_else(|| (unit.path.clone(), "no loadable entry".into()));
        Err(LoadError::BadBytecode { name: name.clone(), path, reason })
    }

    /// `find` then `load`; absence is an error.
    pub fn load_module(&self, fullname: &str) -> Result<LoadedModule, LoadError> {
        let unit = self.find(fullname)?
            .ok_or_else(|| LoadError::NotFound { name: fullname.to_owned() })?;
        self.load(&unit)
    }

    pub fn is_package(&self, fullname: &str) -> Result<bool, LoadError> {
        Ok(self.require(fullname)?.is_package)
    }

    /// The module's source text, or `None` when only bytecode is stored.
    pub fn get_source(&self, fullname: &str) -> Result<Option<String>, LoadError> {
        let unit = self.require(fullname)?;
        let base = self.base(fullname);
        let path = if unit.is_package {
            format!("{base}/__init__.py")
        } else {
            format!("{base}.py")
        };
        let Some(entry) = self.archive.resolver().entry(&path) else {
            return Ok(None);
        };
        let data = self.archive.read_entry(entry)
            .map_err(|e| self.map_read_error(fullname, &path, e))?;
        String::from_utf8(data.to_vec())
            .map(Some)
            .map_err(|_| LoadError::Encoding { name: fullname.to_owned(), path })
    }

    /// Raw bytes of any stored file, by archive-relative path or by a path
    /// starting with the archive path.
    pub fn get_data(&self, path: &str) -> Result<Bytes, LoadError> {
        self.ensure_open()?;
        let archive = self.archive.path().display().to_string();
        let rel = path.strip_prefix(archive.as_str())
            .and_then(|rest| rest.strip_prefix(['/', '\\']))
            .unwrap_or(path);
        let entry = self.archive.resolver().entry(rel)
            .ok_or_else(|| LoadError::NotFound { name: path.to_owned() })?;
        self.archive.read_entry(entry).map_err(|e| self.map_read_error(path, rel, e))
    }

    pub fn get_filename(&self, fullname: &str) -> Result<String, LoadError> {
        Ok(self.require(fullname)?.origin)
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn require(&self, fullname: &str) -> Result<LoadUnit, LoadError> {
        self.find(fullname)?.ok_or_else(|| LoadError::NotFound { name: fullname.to_owned() })
    }

    fn ensure_open(&self) -> Result<(), LoadError> {
        if self.archive.is_closed() {
            return Err(LoadError::Closed { archive: self.archive.path().display().to_string() });
        }
        Ok(())
    }

    /// Archive-relative path of `fullname` without suffix.
    fn base(&self, fullname: &str) -> String {
        let subname = fullname.rsplit('.').next().unwrap_or(fullname);
        format!("{}{subname}", self.prefix)
    }

    fn join(&self, rel: &str) -> String {
        self.archive.path().join(rel).display().to_string()
    }

    fn unit(&self, fullname: &str, base: &str, c: Candidate) -> LoadUnit {
        LoadUnit {
            fullname:    fullname.to_owned(),
            entry:       c.entry,
            origin:      self.join(&c.path),
            path:        c.path,
            is_package:  c.suffix.is_package,
            kind:        c.suffix.kind,
            search_root: c.suffix.is_package.then(|| self.join(base)),
        }
    }

    fn read(&self, name: &str, c: &Candidate) -> Result<Bytes, LoadError> {
        self.archive.read_entry(c.entry).map_err(|e| self.map_read_error(name, &c.path, e))
    }

    fn map_read_error(&self, name: &str, path: &str, err: ReadError) -> LoadError {
        match err {
            ReadError::NotFound(what) => LoadError::Inconsistent {
                name:   name.to_owned(),
                reason: format!("{what} vanished from the index"),
            },
            ReadError::Closed(archive) => LoadError::Closed { archive },
            ReadError::Decode(source) => LoadError::Unreadable {
                name: name.to_owned(),
                path: path.to_owned(),
                source,
            },
        }
    }

    fn check_bytecode(&self, data: &[u8]) -> Result<(), String> {
        let Some(magic) = self.options.bytecode_magic else {
            return Ok(());
        };
        if data.len() < BYTECODE_HEADER_SIZE {
            return Err(format!("{} bytes is shorter than the header", data.len()));
        }
        if data[..4] != magic {
            return Err(format!("magic {:02x?} != {magic:02x?}", &data[..4]));
        }
        Ok(())
    }

    fn loaded(&self, name: &str, base: &str, c: &Candidate, code: Bytes) -> LoadedModule {
        let origin = self.join(&c.path);
        debug!("import {name} # loaded from 7z {origin}");
        LoadedModule {
            fullname:    name.to_owned(),
            kind:        c.suffix.kind,
            code,
            is_package:  c.suffix.is_package,
            origin,
            search_path: if c.suffix.is_package { vec![self.join(base)] } else { Vec::new() },
        }
    }
}

/// `\r\n` and lone `\r` become `\n`; the result always ends in `\n`.
pub fn normalize_line_endings(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + 1);
    let mut bytes = src.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\r' {
            bytes.next_if_eq(&b'\n');
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    if out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
    out
}
