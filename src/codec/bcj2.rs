//! BCJ2: the four-input x86 branch converter.
//!
//! Input order is fixed by the coder declaration: main stream, CALL
//! targets, JUMP targets, range-coded selector bits. Branch targets are
//! stored as absolute big-endian addresses.

use super::{Codec, CodecError};

const NUM_BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u32 = 1 << NUM_BIT_MODEL_TOTAL_BITS;
const NUM_MOVE_BITS: u32 = 5;
const TOP_VALUE: u32 = 1 << 24;

struct RangeDecoder<'a> {
    buf:   &'a [u8],
    pos:   usize,
    range: u32,
    code:  u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < 5 {
            return Err(CodecError::Decompression("BCJ2 range stream shorter than 5 bytes".into()));
        }
        let code = buf[..5].iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        Ok(Self { buf, pos: 5, range: 0xFFFF_FFFF, code })
    }

    fn normalize(&mut self) -> Result<(), CodecError> {
        if self.range < TOP_VALUE {
            let b = *self.buf.get(self.pos)
                .ok_or_else(|| CodecError::Decompression("BCJ2 range stream truncated".into()))?;
            self.pos += 1;
            self.range <<= 8;
            self.code = (self.code << 8) | b as u32;
        }
        Ok(())
    }

    fn decode_bit(&mut self, prob: &mut u16) -> Result<bool, CodecError> {
        let p = *prob as u32;
        let bound = (self.range >> NUM_BIT_MODEL_TOTAL_BITS) * p;
        let bit = if self.code < bound {
            self.range = bound;
            *prob = (p + ((BIT_MODEL_TOTAL - p) >> NUM_MOVE_BITS)) as u16;
            false
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob = (p - (p >> NUM_MOVE_BITS)) as u16;
            true
        };
        self.normalize()?;
        Ok(bit)
    }
}

#[inline]
fn is_jcc(b0: u8, b1: u8) -> bool {
    b0 == 0x0F && b1 & 0xF0 == 0x80
}

#[inline]
fn is_j(b0: u8, b1: u8) -> bool {
    b1 & 0xFE == 0xE8 || is_jcc(b0, b1)
}

fn take_u32_be(stream: &[u8], pos: &mut usize, what: &str) -> Result<u32, CodecError> {
    let bytes = stream.get(*pos..*pos + 4)
        .ok_or_else(|| CodecError::Decompression(format!("BCJ2 {what} stream exhausted")))?;
    *pos += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reassemble the x86 stream from the four BCJ2 inputs.
pub fn bcj2_decode(
    main:   &[u8],
    call:   &[u8],
    jump:   &[u8],
    rc:     &[u8],
    out_size: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut probs = [(BIT_MODEL_TOTAL >> 1) as u16; 258];
    let mut rd = RangeDecoder::new(rc)?;
    let produced = main.len().saturating_add(call.len()).saturating_add(jump.len());
    let mut out = Vec::with_capacity(out_size.min(produced));
    let (mut in_pos, mut call_pos, mut jump_pos) = (0usize, 0usize, 0usize);
    let mut prev: u8 = 0;

    while out.len() < out_size {
        // Copy plain bytes up to and including the next branch opcode.
        let mut opcode = None;
        while in_pos < main.len() && out.len() < out_size {
            let b = main[in_pos];
            in_pos += 1;
            out.push(b);
            if is_j(prev, b) {
                opcode = Some(b);
                break;
            }
            prev = b;
        }
        let b = match opcode {
            Some(b) if out.len() < out_size => b,
            _ => break,
        };

        let prob = match b {
            0xE8 => &mut probs[prev as usize],
            0xE9 => &mut probs[256],
            _    => &mut probs[257],
        };
        if !rd.decode_bit(prob)? {
            prev = b;
            continue;
        }

        let src = if b == 0xE8 {
            take_u32_be(call, &mut call_pos, "call")?
        } else {
            take_u32_be(jump, &mut jump_pos, "jump")?
        };
        let dest = src.wrapping_sub(out.len() as u32 + 4);
        for byte in dest.to_le_bytes() {
            if out.len() == out_size {
                break;
            }
            out.push(byte);
        }
        prev = (dest >> 24) as u8;
    }

    if out.len() != out_size {
        return Err(CodecError::Decompression(format!(
            "BCJ2 produced {} of {out_size} bytes", out.len()
        )));
    }
    Ok(out)
}

pub struct Bcj2Codec;
impl Codec for Bcj2Codec {
    fn name(&self) -> &'static str { "BCJ2" }
    fn decode(&self, inputs: &[&[u8]], unpack_size: usize, _: &[u8]) -> Result<Vec<u8>, CodecError> {
        match inputs {
            [main, call, jump, rc] => bcj2_decode(main, call, jump, rc, unpack_size),
            _ => Err(CodecError::InputCount { expected: 4, got: inputs.len() }),
        }
    }
}
