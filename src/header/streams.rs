//! `StreamsInfo`: pack info, folder (coder graph) info and substream info.

use tracing::trace;

use crate::codec::CoderId;
use crate::index::{BindPair, CoderNode, FolderDescriptor, SubStream};

use super::property;
use super::reader::HeaderReader;
use super::FormatError;

/// Coders and streams per folder beyond which a folder is rejected.
const MAX_CODERS: usize = 64;
const MAX_CODER_STREAMS: usize = 64;

/// Largest unpacked size accepted for any coder output stream. Decoded
/// folders are held in memory whole.
pub const MAX_UNPACK_SIZE: u64 = 1 << 32;

#[derive(Debug, Default)]
pub struct StreamsInfo {
    /// Offset of the first pack stream, relative to the end of the signature header.
    pub pack_pos:   u64,
    pub pack_sizes: Vec<u64>,
    pub pack_crcs:  Vec<Option<u32>>,
    /// Folders with `first_pack_stream` and `substreams` filled in.
    pub folders:    Vec<FolderDescriptor>,
}

pub fn read_streams_info(r: &mut HeaderReader<'_>) -> Result<StreamsInfo, FormatError> {
    let mut info = StreamsInfo::default();
    let mut id = r.read_u8()?;

    if id == property::PACK_INFO {
        read_pack_info(r, &mut info)?;
        id = r.read_u8()?;
    }

    if id == property::UNPACK_INFO {
        info.folders = read_unpack_info(r)?;
        id = r.read_u8()?;
    }

    let mut next_pack = 0usize;
    for folder in &mut info.folders {
        folder.first_pack_stream = next_pack;
        next_pack += folder.packed_streams.len();
    }

    if id == property::SUBSTREAMS_INFO {
        read_substreams_info(r, &mut info.folders)?;
        id = r.read_u8()?;
    } else {
        for folder in &mut info.folders {
            folder.substreams = vec![SubStream { size: folder.unpack_size(), crc: folder.crc }];
        }
    }

    if id != property::END {
        return Err(FormatError::corrupt(format!(
            "unexpected property 0x{id:02x} in streams info"
        )));
    }
    Ok(info)
}

fn read_pack_info(r: &mut HeaderReader<'_>, info: &mut StreamsInfo) -> Result<(), FormatError> {
    info.pack_pos = r.read_number()?;
    let n = r.read_count_at_most("pack stream", r.remaining())?;
    info.pack_crcs = vec![None; n];

    let mut id = r.read_u8()?;
    if id == property::SIZE {
        info.pack_sizes = (0..n).map(|_| r.read_number()).collect::<Result<_, _>>()?;
        id = r.read_u8()?;
    } else {
        return Err(FormatError::corrupt("pack info without sizes"));
    }

    while id != property::END {
        if id == property::CRC {
            info.pack_crcs = r.read_digests(n)?;
        } else {
            r.skip_data()?;
        }
        id = r.read_u8()?;
    }
    Ok(())
}

fn read_unpack_info(r: &mut HeaderReader<'_>) -> Result<Vec<FolderDescriptor>, FormatError> {
    r.expect(property::FOLDER, "folder list")?;
    let n = r.read_count_at_most("folder", r.remaining())?;
    if r.read_u8()? != 0 {
        return Err(FormatError::Unsupported("external folder definitions".into()));
    }

    let mut folders = (0..n).map(|_| read_folder(r)).collect::<Result<Vec<_>, _>>()?;

    r.expect(property::CODERS_UNPACK_SIZE, "coder unpack sizes")?;
    for folder in &mut folders {
        folder.unpack_sizes = (0..folder.num_out_streams_total())
            .map(|_| read_unpack_size(r))
            .collect::<Result<_, _>>()?;
    }

    loop {
        match r.read_u8()? {
            property::END => break,
            property::CRC => {
                let crcs = r.read_digests(n)?;
                for (folder, crc) in folders.iter_mut().zip(crcs) {
                    folder.crc = crc;
                }
            }
            _ => r.skip_data()?,
        }
    }
    Ok(folders)
}

fn read_unpack_size(r: &mut HeaderReader<'_>) -> Result<u64, FormatError> {
    let size = r.read_number()?;
    if size > MAX_UNPACK_SIZE {
        return Err(FormatError::corrupt(format!(
            "coder unpack size {size} exceeds limit {MAX_UNPACK_SIZE}"
        )));
    }
    Ok(size)
}

fn read_folder(r: &mut HeaderReader<'_>) -> Result<FolderDescriptor, FormatError> {
    let num_coders = r.read_count("coder")?;
    if num_coders == 0 || num_coders > MAX_CODERS {
        return Err(FormatError::corrupt(format!("folder with {num_coders} coders")));
    }

    let mut folder = FolderDescriptor::default();
    for _ in 0..num_coders {
        let flags = r.read_u8()?;
        if flags & 0xC0 != 0 {
            return Err(FormatError::Unsupported(format!(
                "coder flags 0x{flags:02x} (alternative methods)"
            )));
        }
        let id_size = (flags & 0x0F) as usize;
        let id_bytes = r.read_bytes(id_size)?;
        // Ids longer than eight bytes name no coder this crate can know.
        let id = CoderId::from_be_bytes(id_bytes).unwrap_or(CoderId::OVERLONG);

        let (num_in_streams, num_out_streams) = if flags & 0x10 != 0 {
            (r.read_count("coder input")?, r.read_count("coder output")?)
        } else {
            (1, 1)
        };
        if num_in_streams > MAX_CODER_STREAMS || num_out_streams > MAX_CODER_STREAMS {
            return Err(FormatError::corrupt(format!(
                "coder {id} declares {num_in_streams} inputs / {num_out_streams} outputs"
            )));
        }

        let properties = if flags & 0x20 != 0 {
            let size = r.read_size_in_header("coder properties")?;
            r.read_bytes(size)?.to_vec()
        } else {
            Vec::new()
        };

        trace!(coder = %id, num_in_streams, num_out_streams, props = properties.len(), "coder");
        folder.coders.push(CoderNode { id, num_in_streams, num_out_streams, properties });
    }

    let num_out = folder.num_out_streams_total();
    let num_in = folder.num_in_streams_total();
    if num_out == 0 {
        return Err(FormatError::corrupt("folder has no output streams"));
    }
    let num_bind_pairs = num_out - 1;
    if num_bind_pairs > num_in {
        return Err(FormatError::corrupt(format!(
            "folder binds {num_bind_pairs} streams but has only {num_in} inputs"
        )));
    }

    for _ in 0..num_bind_pairs {
        let in_index = r.read_count("bind pair input")?;
        let out_index = r.read_count("bind pair output")?;
        folder.bind_pairs.push(BindPair { in_index, out_index });
    }

    let num_packed = num_in - num_bind_pairs;
    if num_packed == 1 {
        let unbound = (0..num_in)
            .find(|&i| folder.bind_pair_for_in(i).is_none())
            .ok_or_else(|| FormatError::corrupt("folder has no unbound input"))?;
        folder.packed_streams.push(unbound);
    } else {
        for _ in 0..num_packed {
            folder.packed_streams.push(r.read_count("packed stream index")?);
        }
    }
    Ok(folder)
}

fn read_substreams_info(
    r: &mut HeaderReader<'_>,
    folders: &mut [FolderDescriptor],
) -> Result<(), FormatError> {
    let mut counts = vec![1usize; folders.len()];
    let mut id = r.read_u8()?;

    if id == property::NUM_UNPACK_STREAM {
        for count in &mut counts {
            *count = r.read_count("substream")?;
        }
        id = r.read_u8()?;
    }

    let has_sizes = id == property::SIZE;
    for (folder, &count) in folders.iter_mut().zip(&counts) {
        if count == 0 {
            folder.substreams.clear();
            continue;
        }
        let total = folder.unpack_size();
        let mut sizes = Vec::new();
        if has_sizes {
            let mut sum = 0u64;
            for _ in 1..count {
                let size = r.read_number()?;
                sum = sum.checked_add(size).filter(|&s| s <= total).ok_or_else(|| {
                    FormatError::IndexMismatch(format!(
                        "substream sizes exceed folder unpack size {total}"
                    ))
                })?;
                sizes.push(size);
            }
            sizes.push(total - sum);
        } else if count == 1 {
            sizes.push(total);
        } else {
            return Err(FormatError::corrupt(format!(
                "{count} substreams without sizes"
            )));
        }
        folder.substreams = sizes.into_iter().map(|size| SubStream { size, crc: None }).collect();
    }
    if has_sizes {
        id = r.read_u8()?;
    }

    // Streams whose CRC the folder digest already covers are not listed again.
    let known = |f: &FolderDescriptor| f.substreams.len() == 1 && f.crc.is_some();
    let unknown: usize = folders.iter()
        .filter(|f| !known(f))
        .map(|f| f.substreams.len())
        .sum();

    let mut digests: Option<Vec<Option<u32>>> = None;
    while id != property::END {
        if id == property::CRC {
            digests = Some(r.read_digests(unknown)?);
        } else {
            r.skip_data()?;
        }
        id = r.read_u8()?;
    }

    let mut listed = digests.unwrap_or_default().into_iter();
    for folder in folders.iter_mut() {
        if known(folder) {
            folder.substreams[0].crc = folder.crc;
            continue;
        }
        for sub in &mut folder.substreams {
            sub.crc = listed.next().flatten();
        }
    }
    Ok(())
}
