//! Random-access byte sources backing an archive.

use std::io::{self, Read, Seek, SeekFrom};

/// Positioned reads over archive bytes.
pub trait ArchiveSource: Send {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read at `ofs`, returning the number of bytes read (short at end of data).
    fn read_at(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read as much of `buf` as available at `ofs`.
    fn read_full_at(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read_at(ofs + total as u64, &mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

/// Adapter for any seekable reader (host files, in-memory cursors).
pub struct SeekSource<R> {
    inner: R,
    size: u64,
    pos: u64,
}

impl<R: Read + Seek> SeekSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, size, pos: size })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> ArchiveSource for SeekSource<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<usize> {
        if ofs >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - ofs) as usize);
        if ofs != self.pos {
            self.inner.seek(SeekFrom::Start(ofs))?;
            self.pos = ofs;
        }
        let read = self.inner.read(&mut buf[..n])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl ArchiveSource for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<usize> {
        if ofs >= self.len() as u64 {
            return Ok(0);
        }
        let src = &self[ofs as usize..];
        let n = buf.len().min(src.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

impl<S: ArchiveSource + ?Sized> ArchiveSource for Box<S> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(ofs, buf)
    }
}

pub(crate) fn le16(b: &[u8], ofs: usize) -> u16 {
    u16::from_le_bytes([b[ofs], b[ofs + 1]])
}

pub(crate) fn le32(b: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

pub(crate) fn le64(b: &[u8], ofs: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[ofs..ofs + 8]);
    u64::from_le_bytes(v)
}
