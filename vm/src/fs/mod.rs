//! The file capability the paging core reads program data through.
//!
//! The real filesystem lives elsewhere in the kernel; paging only needs a
//! seekable byte source, shared between every page lazily backed by the
//! same file.

use crate::sync::Mutex;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;

/// A readable, seekable file.
pub trait VmFile: Send {
    /// Sets the position the next [`read`](Self::read) starts at.
    fn seek(&mut self, pos: u32);

    /// Reads into `buf` from the current position, advancing it. Returns the
    /// number of bytes read, which is less than `buf.len()` only at end of
    /// file.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// A shared handle to an open file.
///
/// Every page backed by the same file holds a clone of one handle, so seeks
/// and reads from concurrent loads are serialized.
#[derive(Clone)]
pub struct FileRef(Arc<Mutex<Box<dyn VmFile>>>);

impl FileRef {
    pub fn new(file: impl VmFile + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(file))))
    }

    pub fn seek(&self, pos: u32) {
        self.0.lock().seek(pos);
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.0.lock().read(buf)
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileRef").finish_non_exhaustive()
    }
}

/// An in-memory file over a byte buffer.
pub struct ByteFile {
    data: Vec<u8>,
    pos: usize,
}

impl ByteFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl VmFile for ByteFile {
    fn seek(&mut self, pos: u32) {
        self.pos = pos as usize;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let available = self.data.len().saturating_sub(self.pos);
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        count
    }
}
