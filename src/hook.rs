//! Path hook: turns search-path entries such as `lib.7z/pkg/sub` into
//! importers, sharing one open [`Archive`] per archive file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::archive::Archive;
use crate::codec::CodecRegistry;
use crate::header::FormatError;
use crate::importer::{ImportOptions, Importer};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("archive path is empty")]
    Empty,
    #[error("not a 7z file: {0}")]
    NotAnArchive(PathBuf),
    #[error("can't open archive {path}: {source}")]
    Format {
        path:   PathBuf,
        #[source]
        source: FormatError,
    },
}

pub struct PathHook {
    registry: CodecRegistry,
    options:  ImportOptions,
    archives: Mutex<HashMap<PathBuf, Arc<Archive>>>,
}

impl Default for PathHook {
    fn default() -> Self {
        Self::new(CodecRegistry::builtin(), ImportOptions::default())
    }
}

impl PathHook {
    pub fn new(registry: CodecRegistry, options: ImportOptions) -> Self {
        Self { registry, options, archives: Mutex::new(HashMap::new()) }
    }

    /// Importer for `path_entry`: the longest leading part that is a regular
    /// file is the archive, the rest is the prefix inside it.
    pub fn importer_for<P: AsRef<Path>>(&self, path_entry: P) -> Result<Importer, HookError> {
        let path = path_entry.as_ref();
        if path.as_os_str().is_empty() {
            return Err(HookError::Empty);
        }

        let mut archive_path = path;
        loop {
            match fs::metadata(archive_path) {
                Ok(meta) if meta.is_file() => break,
                Ok(_) => return Err(HookError::NotAnArchive(path.to_owned())),
                Err(_) => {
                    archive_path = archive_path.parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .ok_or_else(|| HookError::NotAnArchive(path.to_owned()))?;
                }
            }
        }

        let prefix = path.strip_prefix(archive_path)
            .map(|rest| rest.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"))
            .unwrap_or_default();

        let archive = self.archive(archive_path)?;
        debug!(archive = %archive_path.display(), %prefix, "importer for path entry");
        Ok(Importer::new(archive, &prefix, self.options.clone()))
    }

    /// The shared handle for `path`, opening it on first use.
    fn archive(&self, path: &Path) -> Result<Arc<Archive>, HookError> {
        let mut archives = self.archives.lock();
        if let Some(ar) = archives.get(path).filter(|ar| !ar.is_closed()) {
            return Ok(Arc::clone(ar));
        }
        let ar = Archive::open_with(path, self.registry.clone())
            .map_err(|source| HookError::Format { path: path.to_owned(), source })?;
        let ar = Arc::new(ar);
        archives.insert(path.to_owned(), Arc::clone(&ar));
        Ok(ar)
    }

    /// Close and forget the handle for `path`. Returns whether one was open.
    pub fn close<P: AsRef<Path>>(&self, path: P) -> bool {
        match self.archives.lock().remove(path.as_ref()) {
            Some(ar) => {
                ar.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for (_, ar) in self.archives.lock().drain() {
            ar.close();
        }
    }

    pub fn open_archives(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.archives.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}
