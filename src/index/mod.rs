//! In-memory archive index: pack streams, folders (coder graphs) and files.
//!
//! Built once by the header parser and never mutated afterwards. Files refer
//! to folders by index; nothing here owns decoded data.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::CoderId;

/// Windows attribute bit marking a directory.
pub const ATTR_DIRECTORY: u32 = 0x10;
/// Set when the high 16 attribute bits carry a unix mode.
pub const ATTR_UNIX_EXTENSION: u32 = 0x8000;

/// One packed stream: an absolute byte range of the archive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackStream {
    pub offset: u64,
    pub size:   u64,
    pub crc:    Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoderNode {
    pub id:              CoderId,
    pub num_in_streams:  usize,
    pub num_out_streams: usize,
    pub properties:      Vec<u8>,
}

/// Binds folder output stream `out_index` to folder input stream `in_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindPair {
    pub in_index:  usize,
    pub out_index: usize,
}

/// One file's share of a solid folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubStream {
    pub size: u64,
    pub crc:  Option<u32>,
}

/// A unit of solid compression.
///
/// Stream indices are folder-global: coder `c`'s inputs are numbered from
/// the sum of `num_in_streams` of coders `0..c`, and likewise for outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderDescriptor {
    pub coders:            Vec<CoderNode>,
    pub bind_pairs:        Vec<BindPair>,
    /// Folder input streams fed by pack streams, in pack-stream order.
    pub packed_streams:    Vec<usize>,
    /// Index of this folder's first pack stream in [`ArchiveIndex::pack_streams`].
    pub first_pack_stream: usize,
    /// One size per coder output stream.
    pub unpack_sizes:      Vec<u64>,
    pub crc:               Option<u32>,
    pub substreams:        Vec<SubStream>,
}

impl FolderDescriptor {
    pub fn num_in_streams_total(&self) -> usize {
        self.coders.iter().map(|c| c.num_in_streams).sum()
    }

    pub fn num_out_streams_total(&self) -> usize {
        self.coders.iter().map(|c| c.num_out_streams).sum()
    }

    /// First folder input stream index belonging to coder `coder`.
    pub fn coder_in_start(&self, coder: usize) -> usize {
        self.coders[..coder].iter().map(|c| c.num_in_streams).sum()
    }

    pub fn bind_pair_for_in(&self, in_index: usize) -> Option<&BindPair> {
        self.bind_pairs.iter().find(|bp| bp.in_index == in_index)
    }

    pub fn bind_pair_for_out(&self, out_index: usize) -> Option<&BindPair> {
        self.bind_pairs.iter().find(|bp| bp.out_index == out_index)
    }

    /// The single output stream no bind pair consumes.
    pub fn main_output(&self) -> Option<usize> {
        (0..self.num_out_streams_total()).find(|&o| self.bind_pair_for_out(o).is_none())
    }

    /// Size of the folder's final decoded output.
    pub fn unpack_size(&self) -> u64 {
        self.main_output()
            .and_then(|o| self.unpack_sizes.get(o).copied())
            .unwrap_or(0)
    }

    pub fn coder_ids(&self) -> impl Iterator<Item = CoderId> + '_ {
        self.coders.iter().map(|c| c.id)
    }
}

/// Where a file's bytes live inside a decoded folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryLocation {
    pub folder:    usize,
    pub substream: usize,
    pub offset:    u64,
    pub size:      u64,
    pub crc:       Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Stored name with `/` separators.
    pub path:       String,
    pub has_stream: bool,
    pub is_dir:     bool,
    /// Zero-length regular file (no stream, not a directory).
    pub is_empty_file: bool,
    pub is_anti:    bool,
    pub attributes: Option<u32>,
    pub mtime:      Option<DateTime<Utc>>,
    pub location:   Option<EntryLocation>,
}

impl FileEntry {
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    pub fn size(&self) -> u64 {
        self.location.map_or(0, |l| l.size)
    }

    pub fn crc(&self) -> Option<u32> {
        self.location.and_then(|l| l.crc)
    }

    pub fn folder(&self) -> Option<usize> {
        self.location.map(|l| l.folder)
    }
}

/// Convert a Windows FILETIME (100 ns ticks since 1601) to UTC.
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    const EPOCH_DELTA_SECS: i64 = 11_644_473_600;
    let secs = (ticks / 10_000_000) as i64 - EPOCH_DELTA_SECS;
    let nanos = (ticks % 10_000_000) as u32 * 100;
    DateTime::from_timestamp(secs, nanos)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveIndex {
    pub pack_streams: Vec<PackStream>,
    pub folders:      Vec<FolderDescriptor>,
    pub files:        Vec<FileEntry>,
}

impl ArchiveIndex {
    /// The pack streams feeding `folder`, in folder pack order.
    pub fn folder_pack_streams(&self, folder: usize) -> &[PackStream] {
        let f = &self.folders[folder];
        let start = f.first_pack_stream.min(self.pack_streams.len());
        let end = (start + f.packed_streams.len()).min(self.pack_streams.len());
        &self.pack_streams[start..end]
    }

    /// Substream locations of every file, grouped by folder in one pass.
    pub fn locations_by_folder(&self) -> Vec<Vec<EntryLocation>> {
        let mut out = vec![Vec::new(); self.folders.len()];
        for loc in self.files.iter().filter_map(|f| f.location) {
            if let Some(group) = out.get_mut(loc.folder) {
                group.push(loc);
            }
        }
        out
    }

    pub fn total_unpack_size(&self) -> u64 {
        self.folders.iter().map(FolderDescriptor::unpack_size).sum()
    }

    pub fn total_pack_size(&self) -> u64 {
        self.pack_streams.iter().map(|p| p.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bcj2_folder() -> FolderDescriptor {
        // BCJ2 (4 in / 1 out) fed by LZMA for main, call and jump.
        let coder = |id, ins| CoderNode { id, num_in_streams: ins, num_out_streams: 1, properties: vec![] };
        FolderDescriptor {
            coders: vec![
                coder(CoderId::BCJ2, 4),
                coder(CoderId::LZMA, 1),
                coder(CoderId::LZMA, 1),
                coder(CoderId::LZMA, 1),
            ],
            bind_pairs: vec![
                BindPair { in_index: 0, out_index: 1 },
                BindPair { in_index: 1, out_index: 2 },
                BindPair { in_index: 2, out_index: 3 },
            ],
            packed_streams: vec![4, 5, 6, 3],
            unpack_sizes: vec![100, 90, 8, 4],
            ..Default::default()
        }
    }

    #[test]
    fn stream_numbering() {
        let f = bcj2_folder();
        assert_eq!(f.num_in_streams_total(), 7);
        assert_eq!(f.num_out_streams_total(), 4);
        assert_eq!(f.coder_in_start(1), 4);
        assert_eq!(f.main_output(), Some(0));
        assert_eq!(f.unpack_size(), 100);
    }

    #[test]
    fn locations_grouped_by_folder() {
        let file = |path: &str, location: Option<EntryLocation>| FileEntry {
            path:          path.into(),
            has_stream:    location.is_some(),
            is_dir:        false,
            is_empty_file: location.is_none(),
            is_anti:       false,
            attributes:    None,
            mtime:         None,
            location,
        };
        let at = |folder, substream| Some(EntryLocation { folder, substream, offset: 0, size: 1, crc: None });
        let index = ArchiveIndex {
            folders: vec![FolderDescriptor::default(), FolderDescriptor::default()],
            files: vec![file("a", at(1, 0)), file("b", None), file("c", at(0, 0)), file("d", at(1, 1))],
            ..Default::default()
        };
        let groups = index.locations_by_folder();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[1].iter().map(|l| l.substream).collect::<Vec<_>>(), [0, 1]);
    }

    #[test]
    fn filetime_epoch() {
        let t = filetime_to_utc(116_444_736_000_000_000).unwrap();
        assert_eq!(t.timestamp(), 0);
    }

    #[test]
    fn entry_segments_and_size() {
        let entry = FileEntry {
            path:          "pkg/sub/mod.py".into(),
            has_stream:    true,
            is_dir:        false,
            is_empty_file: false,
            is_anti:       false,
            attributes:    None,
            mtime:         None,
            location:      Some(EntryLocation { folder: 2, substream: 0, offset: 0, size: 9, crc: None }),
        };
        assert_eq!(entry.segments().collect::<Vec<_>>(), ["pkg", "sub", "mod.py"]);
        assert_eq!(entry.size(), 9);
        assert_eq!(entry.folder(), Some(2));
        assert_eq!(entry.crc(), None);
    }
}
