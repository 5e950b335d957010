//! Byte-range access to the device holding the volume.
//!
//! Nothing here locks: a handle shared between several streams must be
//! serialized by the caller. The usual pattern is one handle per stream.

use std::io::{self, Read, Seek, SeekFrom};

use log::debug;

/// A random-access, read-only device.
pub trait DiskReader {
    /// Total readable bytes.
    fn size(&self) -> u64;

    /// `true` when `length` bytes starting at `offset` lie on the device.
    fn can_read_bytes(&self, offset: u64, length: usize) -> bool {
        offset
            .checked_add(length as u64)
            .is_some_and(|end| end <= self.size())
    }

    /// Fill `buf` from `offset`. Returns fewer bytes than `buf.len()` only at
    /// the end of the device.
    fn read_bytes(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl<D: DiskReader + ?Sized> DiskReader for &mut D {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_bytes(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_bytes(buf, offset)
    }
}

/// [`DiskReader`] over anything seekable: an image file, a `Cursor`, an
/// evidence container slice.
#[derive(Debug)]
pub struct SeekDisk<T> {
    inner: T,
    size: u64,
}

impl<T: Read + Seek> SeekDisk<T> {
    pub fn new(mut inner: T) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        debug!("Opened disk of {} bytes", size);
        Ok(Self { inner, size })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: Read + Seek> DiskReader for SeekDisk<T> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_bytes(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// How a stream holds its disk: owned handles are dropped with the stream,
/// borrowed ones are left open for their other users.
#[derive(Debug)]
pub enum DiskHandle<'a, D> {
    Owned(D),
    Borrowed(&'a mut D),
}

impl<D> DiskHandle<'_, D> {
    pub fn is_owned(&self) -> bool {
        matches!(self, DiskHandle::Owned(_))
    }

    pub fn get_mut(&mut self) -> &mut D {
        match self {
            DiskHandle::Owned(disk) => disk,
            DiskHandle::Borrowed(disk) => disk,
        }
    }

    pub fn get_ref(&self) -> &D {
        match self {
            DiskHandle::Owned(disk) => disk,
            DiskHandle::Borrowed(disk) => disk,
        }
    }
}
