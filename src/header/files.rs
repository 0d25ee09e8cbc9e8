//! `FilesInfo`: names, empty-stream flags, attributes and times, plus the
//! assignment of every stream-bearing file to its folder substream.

use tracing::trace;

use crate::index::{
    filetime_to_utc, EntryLocation, FileEntry, FolderDescriptor, ATTR_DIRECTORY,
};
use crate::resolver::normalize_path;

use super::property;
use super::reader::HeaderReader;
use super::FormatError;

pub fn read_files_info(
    r: &mut HeaderReader<'_>,
    folders: &[FolderDescriptor],
) -> Result<Vec<FileEntry>, FormatError> {
    // Files past the substream count are empty and need one bit each.
    let substreams: usize = folders.iter().map(|f| f.substreams.len()).sum();
    let limit = r.remaining().saturating_mul(8).saturating_add(substreams);
    let num_files = r.read_count_at_most("file", limit)?;

    let mut empty_stream = vec![false; num_files];
    let mut empty_file: Vec<bool> = Vec::new();
    let mut anti: Vec<bool> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut mtimes: Vec<Option<u64>> = vec![None; num_files];
    let mut attributes: Vec<Option<u32>> = vec![None; num_files];

    loop {
        let prop = r.read_u8()?;
        if prop == property::END {
            break;
        }
        let size = r.read_size_in_header("file property")?;
        let mut sub = r.sub_reader(size)?;
        let num_empty = empty_stream.iter().filter(|&&e| e).count();

        match prop {
            property::EMPTY_STREAM => empty_stream = sub.read_bits(num_files)?,
            property::EMPTY_FILE => empty_file = sub.read_bits(num_empty)?,
            property::ANTI => anti = sub.read_bits(num_empty)?,
            property::NAME => {
                if sub.read_u8()? != 0 {
                    return Err(FormatError::Unsupported("external file names".into()));
                }
                names = read_names(&mut sub, num_files)?;
            }
            property::MTIME => {
                mtimes = read_external_vector(&mut sub, num_files, |r| r.read_u64())?;
            }
            property::WIN_ATTRIBUTES => {
                attributes = read_external_vector(&mut sub, num_files, |r| r.read_u32())?;
            }
            // CTime, ATime, StartPos, Comment, Dummy and anything newer carry
            // nothing the loader uses.
            other => trace!(property = other, size, "skipping file property"),
        }
    }

    if names.is_empty() && num_files > 0 {
        names = vec![String::new(); num_files];
    }

    let mut locations = substream_locations(folders);
    let with_stream = empty_stream.iter().filter(|&&e| !e).count();
    if with_stream != locations.len() {
        return Err(FormatError::IndexMismatch(format!(
            "{with_stream} files carry data but folders hold {} substreams", locations.len()
        )));
    }

    let mut files = Vec::with_capacity(num_files);
    let mut empty_idx = 0usize;
    for (i, name) in names.into_iter().enumerate() {
        let has_stream = !empty_stream[i];
        let attrs = attributes[i];
        let (location, is_empty_file, is_anti) = if has_stream {
            (locations.next(), false, false)
        } else {
            let flags = (
                empty_file.get(empty_idx).copied().unwrap_or(false),
                anti.get(empty_idx).copied().unwrap_or(false),
            );
            empty_idx += 1;
            (None, flags.0, flags.1)
        };
        let is_dir = attrs.is_some_and(|a| a & ATTR_DIRECTORY != 0)
            || (!has_stream && !is_empty_file);

        files.push(FileEntry {
            path: normalize_path(&name),
            has_stream,
            is_dir,
            is_empty_file,
            is_anti,
            attributes: attrs,
            mtime: mtimes[i].and_then(filetime_to_utc),
            location,
        });
    }
    Ok(files)
}

/// Null-terminated UTF-16LE names, one per file.
fn read_names(r: &mut HeaderReader<'_>, num_files: usize) -> Result<Vec<String>, FormatError> {
    let mut names = Vec::with_capacity(num_files);
    for _ in 0..num_files {
        let mut units = Vec::new();
        loop {
            let lo = r.read_u8()?;
            let hi = r.read_u8()?;
            let unit = u16::from_le_bytes([lo, hi]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        let name = String::from_utf16(&units)
            .map_err(|_| FormatError::corrupt("file name is not valid UTF-16"))?;
        names.push(name);
    }
    if r.remaining() != 0 {
        return Err(FormatError::corrupt(format!(
            "{} bytes left after {num_files} file names", r.remaining()
        )));
    }
    Ok(names)
}

/// Defined-vector + external byte + one value per defined file.
fn read_external_vector<T>(
    r: &mut HeaderReader<'_>,
    n: usize,
    mut read: impl FnMut(&mut HeaderReader<'_>) -> Result<T, FormatError>,
) -> Result<Vec<Option<T>>, FormatError> {
    let defined = r.read_defined(n)?;
    if r.read_u8()? != 0 {
        return Err(FormatError::Unsupported("external file property data".into()));
    }
    defined.into_iter()
        .map(|d| if d { read(r).map(Some) } else { Ok(None) })
        .collect()
}

/// Substream positions in file order: folder by folder, offset by offset.
fn substream_locations(folders: &[FolderDescriptor]) -> std::vec::IntoIter<EntryLocation> {
    let mut out = Vec::new();
    for (folder, f) in folders.iter().enumerate() {
        let mut offset = 0u64;
        for (substream, s) in f.substreams.iter().enumerate() {
            out.push(EntryLocation { folder, substream, offset, size: s.size, crc: s.crc });
            offset += s.size;
        }
    }
    out.into_iter()
}
