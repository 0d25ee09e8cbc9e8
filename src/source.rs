//! Positioned reads over the archive file.
//!
//! One underlying reader is shared by every decode; seeks and reads are
//! serialised with a mutex so a `&ByteSource` can be used from any thread.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use parking_lot::Mutex;

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub struct ByteSource {
    inner: Mutex<Box<dyn ReadSeek>>,
    len:   u64,
    name:  String,
}

impl ByteSource {
    pub fn new<R: Read + Seek + Send + 'static>(mut reader: R, name: impl Into<String>) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self { inner: Mutex::new(Box::new(reader)), len, name: name.into() })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::new(BufReader::new(file), path.display().to_string())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read exactly `len` bytes at absolute `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!(
                "range {offset}+{len} exceeds {} ({} bytes)", self.name, self.len
            )));
        }
        let mut buf = vec![0u8; len];
        let mut inner = self.inner.lock();
        inner.seek(SeekFrom::Start(offset))?;
        inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource").field("name", &self.name).field("len", &self.len).finish()
    }
}
