//! Single-input byte filters: delta and the branch-call converters.
//!
//! Filters never change the stream length. Decoding runs in place on a copy
//! of the input, starting from instruction pointer 0 unless the coder
//! properties carry a 4-byte little-endian start offset.

use byteorder::{ByteOrder, LittleEndian};

use super::{single_input, Codec, CodecError};

// ── Delta ────────────────────────────────────────────────────────────────────

/// Undo delta encoding with byte distance `dist` (1..=256).
pub fn delta_decode(buf: &mut [u8], dist: usize) {
    for i in dist..buf.len() {
        buf[i] = buf[i].wrapping_add(buf[i - dist]);
    }
}

pub struct DeltaCodec;
impl Codec for DeltaCodec {
    fn name(&self) -> &'static str { "Delta" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, props: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        let dist = match props {
            [d] => *d as usize + 1,
            _   => return Err(CodecError::InvalidProperties(
                format!("Delta expects one property byte, got {}", props.len())
            )),
        };
        let mut out = sized_copy(data, unpack_size)?;
        delta_decode(&mut out, dist);
        Ok(out)
    }
}

// ── Branch converters ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    X86,
    Ppc,
    Ia64,
    Arm,
    ArmThumb,
    Sparc,
}

pub struct BranchCodec {
    kind: BranchKind,
}

impl BranchCodec {
    pub fn new(kind: BranchKind) -> Self {
        Self { kind }
    }
}

impl Codec for BranchCodec {
    fn name(&self) -> &'static str {
        match self.kind {
            BranchKind::X86      => "BCJ",
            BranchKind::Ppc      => "PPC",
            BranchKind::Ia64     => "IA64",
            BranchKind::Arm      => "ARM",
            BranchKind::ArmThumb => "ARMT",
            BranchKind::Sparc    => "SPARC",
        }
    }

    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, props: &[u8]) -> Result<Vec<u8>, CodecError> {
        let data = single_input(inputs)?;
        let ip = match props.len() {
            0 => 0,
            4 => LittleEndian::read_u32(props),
            n => return Err(CodecError::InvalidProperties(
                format!("{} expects 0 or 4 property bytes, got {n}", self.name())
            )),
        };
        let mut out = sized_copy(data, unpack_size)?;
        match self.kind {
            BranchKind::X86      => { x86_decode(&mut out, ip); }
            BranchKind::Ppc      => ppc_decode(&mut out, ip),
            BranchKind::Ia64     => ia64_decode(&mut out, ip),
            BranchKind::Arm      => arm_decode(&mut out, ip),
            BranchKind::ArmThumb => armt_decode(&mut out, ip),
            BranchKind::Sparc    => sparc_decode(&mut out, ip),
        }
        Ok(out)
    }
}

fn sized_copy(data: &[u8], unpack_size: usize) -> Result<Vec<u8>, CodecError> {
    if data.len() < unpack_size {
        return Err(CodecError::Decompression(format!(
            "filter input holds {} of {unpack_size} bytes", data.len()
        )));
    }
    Ok(data[..unpack_size].to_vec())
}

#[inline]
fn test_ms_byte(b: u8) -> bool {
    b == 0x00 || b == 0xFF
}

/// x86 BCJ: convert absolute CALL/JMP (E8/E9) targets back to relative.
/// Returns the number of bytes fully processed.
pub fn x86_decode(data: &mut [u8], ip: u32) -> usize {
    if data.len() < 5 {
        return 0;
    }
    let limit = data.len() - 4;
    let ip = ip.wrapping_add(5);
    let mut mask: u32 = 0;
    let mut pos = 0usize;

    loop {
        let mut p = pos;
        while p < limit && data[p] & 0xFE != 0xE8 {
            p += 1;
        }
        let d = p - pos;
        pos = p;
        if p >= limit {
            return pos;
        }
        if d > 2 {
            mask = 0;
        } else {
            mask >>= d as u32;
            if mask != 0
                && (mask > 4 || mask == 3 || test_ms_byte(data[p + (mask as usize >> 1) + 1]))
            {
                mask = (mask >> 1) | 4;
                pos += 1;
                continue;
            }
        }

        if test_ms_byte(data[p + 4]) {
            let mut v = LittleEndian::read_u32(&data[p + 1..p + 5]);
            let cur = ip.wrapping_add(pos as u32);
            pos += 5;
            v = v.wrapping_sub(cur);
            if mask != 0 {
                let sh = (mask & 6) << 2;
                if test_ms_byte((v >> sh) as u8) {
                    v ^= (0x100u32 << sh).wrapping_sub(1);
                    v = v.wrapping_sub(cur);
                }
                mask = 0;
            }
            data[p + 1] = v as u8;
            data[p + 2] = (v >> 8) as u8;
            data[p + 3] = (v >> 16) as u8;
            data[p + 4] = 0u8.wrapping_sub(((v >> 24) & 1) as u8);
        } else {
            mask = (mask >> 1) | 4;
            pos += 1;
        }
    }
}

/// ARM (little-endian) BL instructions.
pub fn arm_decode(data: &mut [u8], ip: u32) {
    let ip = ip.wrapping_add(8);
    let end = data.len() & !3;
    let mut i = 0;
    while i < end {
        if data[i + 3] == 0xEB {
            let src = (data[i + 2] as u32) << 16 | (data[i + 1] as u32) << 8 | data[i] as u32;
            let dest = (src << 2).wrapping_sub(ip.wrapping_add(i as u32)) >> 2;
            data[i + 2] = (dest >> 16) as u8;
            data[i + 1] = (dest >> 8) as u8;
            data[i] = dest as u8;
        }
        i += 4;
    }
}

/// ARM Thumb BL instruction pairs.
pub fn armt_decode(data: &mut [u8], ip: u32) {
    let len = data.len() & !1;
    if len < 4 {
        return;
    }
    let last = len - 4;
    let ip = ip.wrapping_add(4);
    let mut i = 0;
    while i <= last {
        if data[i + 1] & 0xF8 == 0xF0 && data[i + 3] & 0xF8 == 0xF8 {
            let src = ((data[i + 1] as u32 & 7) << 19)
                | (data[i] as u32) << 11
                | ((data[i + 3] as u32 & 7) << 8)
                | data[i + 2] as u32;
            let dest = (src << 1).wrapping_sub(ip.wrapping_add(i as u32)) >> 1;
            data[i + 1] = 0xF0 | ((dest >> 19) & 7) as u8;
            data[i] = (dest >> 11) as u8;
            data[i + 3] = 0xF8 | ((dest >> 8) & 7) as u8;
            data[i + 2] = dest as u8;
            i += 2;
        }
        i += 2;
    }
}

/// PowerPC (big-endian) `bl` instructions.
pub fn ppc_decode(data: &mut [u8], ip: u32) {
    let end = data.len() & !3;
    let mut i = 0;
    while i < end {
        if data[i] >> 2 == 0x12 && data[i + 3] & 3 == 1 {
            let src = ((data[i] as u32 & 3) << 24)
                | (data[i + 1] as u32) << 16
                | (data[i + 2] as u32) << 8
                | (data[i + 3] as u32 & !3);
            let dest = src.wrapping_sub(ip.wrapping_add(i as u32));
            data[i] = 0x48 | ((dest >> 24) & 3) as u8;
            data[i + 1] = (dest >> 16) as u8;
            data[i + 2] = (dest >> 8) as u8;
            data[i + 3] &= 3;
            data[i + 3] |= dest as u8;
        }
        i += 4;
    }
}

/// Bundle templates → bit mask of the slots holding branch instructions.
const IA64_BRANCH_SLOTS: [u8; 32] = [
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    4, 4, 6, 6, 0, 0, 7, 7,
    4, 4, 0, 0, 4, 4, 0, 0,
];

/// Itanium `br.call` targets in 16-byte instruction bundles.
pub fn ia64_decode(data: &mut [u8], ip: u32) {
    ia64_convert(data, ip, false);
}

fn ia64_convert(data: &mut [u8], ip: u32, encoding: bool) {
    let mut i = 0;
    while i + 16 <= data.len() {
        let mask = IA64_BRANCH_SLOTS[(data[i] & 0x1F) as usize];
        for slot in 0..3 {
            if (mask >> slot) & 1 == 0 {
                continue;
            }
            let bit_pos = 5 + 41 * slot;
            let byte_pos = i + bit_pos / 8;
            let bit_res = bit_pos % 8;

            let mut instruction = 0u64;
            for j in 0..6 {
                instruction |= (data[byte_pos + j] as u64) << (8 * j);
            }
            let mut norm = instruction >> bit_res;
            if (norm >> 37) & 0xF != 0x5 || (norm >> 9) & 0x7 != 0 {
                continue;
            }

            let mut src = ((norm >> 13) & 0xF_FFFF) as u32;
            src |= (((norm >> 36) & 1) as u32) << 20;
            src <<= 4;
            let base = ip.wrapping_add(i as u32);
            let dest = (if encoding { base.wrapping_add(src) } else { src.wrapping_sub(base) }) >> 4;

            norm &= !(0x8F_FFFFu64 << 13);
            norm |= ((dest & 0xF_FFFF) as u64) << 13;
            norm |= ((dest & 0x10_0000) as u64) << (36 - 20);

            instruction &= (1u64 << bit_res) - 1;
            instruction |= norm << bit_res;
            for j in 0..6 {
                data[byte_pos + j] = (instruction >> (8 * j)) as u8;
            }
        }
        i += 16;
    }
}

/// SPARC `call` instructions.
pub fn sparc_decode(data: &mut [u8], ip: u32) {
    let end = data.len() & !3;
    let mut i = 0;
    while i < end {
        if (data[i] == 0x40 && data[i + 1] & 0xC0 == 0x00)
            || (data[i] == 0x7F && data[i + 1] & 0xC0 == 0xC0)
        {
            let src = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) << 2;
            let mut dest = src.wrapping_sub(ip.wrapping_add(i as u32)) >> 2;
            dest = ((0u32.wrapping_sub((dest >> 22) & 1) << 22) & 0x3FFF_FFFF)
                | (dest & 0x3F_FFFF)
                | 0x4000_0000;
            data[i..i + 4].copy_from_slice(&dest.to_be_bytes());
        }
        i += 4;
    }
}
