//! Cursor over raw header bytes with the 7z primitive encodings.

use byteorder::{ByteOrder, LittleEndian};

use super::FormatError;

/// Upper bound for any element count read from a header.
const MAX_COUNT: u64 = 1 << 28;

pub struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        let b = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let out = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, FormatError> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    /// 7z `NUMBER`: the leading one bits of the first byte give the count of
    /// extra little-endian bytes; the remaining low bits are the high part.
    pub fn read_number(&mut self) -> Result<u64, FormatError> {
        let first = self.read_u8()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = (first & mask.wrapping_sub(1)) as u64;
                value |= high << (8 * i);
                return Ok(value);
            }
            value |= (self.read_u8()? as u64) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    /// A `NUMBER` used as an element count or index.
    pub fn read_count(&mut self, what: &str) -> Result<usize, FormatError> {
        let n = self.read_number()?;
        if n > MAX_COUNT {
            return Err(FormatError::corrupt(format!("{what} count {n} is implausible")));
        }
        Ok(n as usize)
    }

    /// A count whose elements each occupy header bytes, so it can never
    /// exceed `limit` in a well-formed header.
    pub fn read_count_at_most(&mut self, what: &str, limit: usize) -> Result<usize, FormatError> {
        let n = self.read_count(what)?;
        if n > limit {
            return Err(FormatError::corrupt(format!(
                "{what} count {n} exceeds what the header can describe ({limit})"
            )));
        }
        Ok(n)
    }

    /// A `NUMBER` used as a byte size that must fit in the remaining header.
    pub fn read_size_in_header(&mut self, what: &str) -> Result<usize, FormatError> {
        let n = self.read_number()?;
        if n > self.remaining() as u64 {
            return Err(FormatError::corrupt(format!(
                "{what} size {n} exceeds remaining header ({} bytes)", self.remaining()
            )));
        }
        Ok(n as usize)
    }

    /// `n` bits, most significant bit of each byte first.
    pub fn read_bits(&mut self, n: usize) -> Result<Vec<bool>, FormatError> {
        let bytes = self.read_bytes(n.div_ceil(8))?;
        Ok((0..n).map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0).collect())
    }

    /// An "all defined" byte followed, when zero, by a bit vector.
    pub fn read_defined(&mut self, n: usize) -> Result<Vec<bool>, FormatError> {
        match self.read_u8()? {
            0 => self.read_bits(n),
            _ => Ok(vec![true; n]),
        }
    }

    /// CRC digests for `n` streams, absent where undefined.
    pub fn read_digests(&mut self, n: usize) -> Result<Vec<Option<u32>>, FormatError> {
        let defined = self.read_defined(n)?;
        defined.into_iter()
            .map(|d| if d { self.read_u32().map(Some) } else { Ok(None) })
            .collect()
    }

    /// Consume one property id and require it to be `id`.
    pub fn expect(&mut self, id: u8, what: &str) -> Result<(), FormatError> {
        let got = self.read_u8()?;
        if got != id {
            return Err(FormatError::corrupt(format!(
                "expected {what} (0x{id:02x}), found 0x{got:02x}"
            )));
        }
        Ok(())
    }

    /// Skip a size-prefixed property body.
    pub fn skip_data(&mut self) -> Result<(), FormatError> {
        let size = self.read_size_in_header("property")?;
        self.read_bytes(size)?;
        Ok(())
    }

    /// A sub-reader over the next `size` bytes.
    pub fn sub_reader(&mut self, size: usize) -> Result<HeaderReader<'a>, FormatError> {
        Ok(HeaderReader::new(self.read_bytes(size)?))
    }
}

fn truncated() -> FormatError {
    FormatError::corrupt("header truncated")
}
