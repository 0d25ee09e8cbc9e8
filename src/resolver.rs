//! Entry resolver: archive paths → entry indices, plus the module search order.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::index::ArchiveIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Source,
    Bytecode,
}

/// One step of the search order: `<name><suffix>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSuffix {
    pub suffix:     &'static str,
    pub is_package: bool,
    pub kind:       CodeKind,
}

/// Packages before modules, bytecode before source.
pub const SEARCH_ORDER: [SearchSuffix; 4] = [
    SearchSuffix { suffix: "/__init__.pyc", is_package: true,  kind: CodeKind::Bytecode },
    SearchSuffix { suffix: "/__init__.py",  is_package: true,  kind: CodeKind::Source },
    SearchSuffix { suffix: ".pyc",          is_package: false, kind: CodeKind::Bytecode },
    SearchSuffix { suffix: ".py",           is_package: false, kind: CodeKind::Source },
];

/// An entry matched by one search suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub entry:  usize,
    pub path:   String,
    pub suffix: SearchSuffix,
}

/// `/`-separated relative path without empty, `.` or trailing segments.
pub fn normalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Default)]
pub struct EntryResolver {
    files: HashMap<String, usize>,
    dirs:  HashSet<String>,
}

impl EntryResolver {
    pub fn new(index: &ArchiveIndex) -> Self {
        let mut resolver = Self::default();
        for (i, entry) in index.files.iter().enumerate() {
            if entry.is_anti {
                continue;
            }
            let path = normalize_path(&entry.path);
            if path.is_empty() {
                continue;
            }
            let mut parent = path.as_str();
            while let Some((dir, _)) = parent.rsplit_once('/') {
                resolver.dirs.insert(dir.to_owned());
                parent = dir;
            }
            if entry.is_dir {
                resolver.dirs.insert(path);
            } else {
                // Later entries with the same name shadow earlier ones.
                resolver.files.insert(path, i);
            }
        }
        resolver
    }

    /// Entry index of the regular file at `path`.
    pub fn entry(&self, path: &str) -> Option<usize> {
        self.files.get(&normalize_path(path)).copied()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize_path(path);
        path.is_empty() || self.dirs.contains(&path)
    }

    /// Every entry matching `base` under the search order, in that order.
    pub fn candidates(&self, base: &str, allow_bytecode: bool) -> Vec<Candidate> {
        SEARCH_ORDER.iter()
            .filter(|s| allow_bytecode || s.kind == CodeKind::Source)
            .filter_map(|&suffix| {
                let path = format!("{base}{}", suffix.suffix);
                self.files.get(&path).map(|&entry| Candidate { entry, path, suffix })
            })
            .collect()
    }
}
