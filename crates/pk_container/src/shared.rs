//! A seekable byte source shared between several independent readers.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

/// Anything we can mount: a file, a cursor, a buffered reader.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

type BoxedSource = Box<dyn ReadSeek>;

/// A cloneable handle to one underlying reader.
///
/// Every clone sees the same reader. Reads go through [`RangeReader`]s which keep their own
/// position, so two streams over the same source can be consumed in any interleaving.
/// Closing through any clone releases the reader for all of them.
#[derive(Clone)]
pub struct SharedSource {
    inner: Arc<Mutex<Option<BoxedSource>>>,
}

impl SharedSource {
    pub fn new<R: ReadSeek + 'static>(source: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(source)))),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Release the underlying reader. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    /// Total length of the underlying reader.
    pub fn len(&self) -> io::Result<u64> {
        self.with(|source| source.seek(SeekFrom::End(0)))
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read into `buf` starting at the absolute `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.with(|source| {
            source.seek(SeekFrom::Start(offset))?;
            source.read(buf)
        })
    }

    /// A reader over `len` bytes starting at `offset`.
    pub fn range(&self, offset: u64, len: u64) -> RangeReader {
        RangeReader {
            source: self.clone(),
            start: offset,
            len,
            pos: 0,
        }
    }

    /// A reader over the whole source.
    pub fn full_range(&self) -> io::Result<RangeReader> {
        Ok(self.range(0, self.len()?))
    }

    fn with<T>(&self, f: impl FnOnce(&mut BoxedSource) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(source) => f(source),
            None => Err(closed_error()),
        }
    }
}

impl std::fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSource")
            .field("open", &self.is_open())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "source has been closed")
}

/// A window of a [`SharedSource`] with its own read position.
#[derive(Debug, Clone)]
pub struct RangeReader {
    source: SharedSource,
    start: u64,
    len: u64,
    pos: u64,
}

impl RangeReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute offset of the first byte of the window.
    pub fn start(&self) -> u64 {
        self.start
    }
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(remaining) as usize;
        let read = self.source.read_at(self.start + self.pos, &mut buf[..want])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for RangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };

        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
