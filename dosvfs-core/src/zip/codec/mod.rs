//! Decompression backends for ZIP members.
//!
//! Every backend answers positioned reads against the uncompressed stream:
//! - Stored: passthrough into the archive
//! - Shrink / Implode: decoded into memory on first open
//! - Deflate: small members decoded into memory, larger ones streamed with seek cursors

mod deflate;
mod implode;
mod inflate;
mod shrink;

use std::path::PathBuf;

use tracing::debug;

use super::source::ArchiveSource;
use crate::error::{DosError, DriveResult};

pub use deflate::{cursor_block_for, DeflateUnpacker, SEEK_CACHE_MIN_CURSORS};
pub use implode::explode;
pub use shrink::unshrink;

pub(crate) use inflate::Huffman;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_SHRUNK: u16 = 1;
pub const METHOD_IMPLODED: u16 = 6;
pub const METHOD_DEFLATED: u16 = 8;

/// Returns true for the compression methods this crate can decode.
pub fn method_supported(method: u16) -> bool {
    matches!(method, METHOD_STORED | METHOD_SHRUNK | METHOD_IMPLODED | METHOD_DEFLATED)
}

/// Where a member's data lives and how it is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberData {
    /// Offset of the first data byte (past the local header).
    pub data_ofs: u64,
    pub comp_size: u32,
    pub uncomp_size: u32,
    pub bit_flags: u16,
    pub method: u16,
}

/// Positioned reads against the uncompressed stream of one member.
pub trait Unpacker: Send {
    /// Read up to `buf.len()` bytes at uncompressed offset `ofs`.
    fn read(&mut self, src: &mut dyn ArchiveSource, member: &MemberData, ofs: u32, buf: &mut [u8]) -> DriveResult<usize>;
}

/// Passthrough for uncompressed members.
pub struct StoredUnpacker;

impl Unpacker for StoredUnpacker {
    fn read(&mut self, src: &mut dyn ArchiveSource, member: &MemberData, ofs: u32, buf: &mut [u8]) -> DriveResult<usize> {
        let n = buf.len().min(member.uncomp_size.saturating_sub(ofs) as usize);
        src.read_full_at(member.data_ofs + ofs as u64, &mut buf[..n])
            .map_err(|_| DosError::DataInvalid)
    }
}

/// Member fully decoded into memory.
pub struct MemoryUnpacker {
    data: Vec<u8>,
}

impl MemoryUnpacker {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Unpacker for MemoryUnpacker {
    fn read(&mut self, _src: &mut dyn ArchiveSource, _member: &MemberData, ofs: u32, buf: &mut [u8]) -> DriveResult<usize> {
        let ofs = (ofs as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - ofs);
        buf[..n].copy_from_slice(&self.data[ofs..ofs + n]);
        Ok(n)
    }
}

/// LSB-first bit reader over an in-memory buffer. Reads past the end yield zero bits.
pub(crate) struct LsbReader<'a> {
    data: &'a [u8],
    pos: usize,
    buf: u32,
    cnt: u32,
}

impl<'a> LsbReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, buf: 0, cnt: 0 }
    }

    /// Input bits not consumed yet.
    pub(crate) fn remaining_bits(&self) -> usize {
        self.data.len().saturating_sub(self.pos) * 8 + self.cnt as usize
    }

    /// Next whole byte; only meaningful while no bits are buffered.
    pub(crate) fn byte(&mut self) -> u8 {
        let b = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    pub(crate) fn bits(&mut self, n: u32) -> u32 {
        while self.cnt < n {
            self.buf |= (self.byte() as u32) << self.cnt;
            self.cnt += 8;
        }
        let v = self.buf & ((1u32 << n) - 1);
        self.buf >>= n;
        self.cnt -= n;
        v
    }
}

/// Read the raw compressed bytes of a member.
pub fn read_compressed(src: &mut dyn ArchiveSource, member: &MemberData) -> DriveResult<Vec<u8>> {
    let mut comp = vec![0u8; member.comp_size as usize];
    let n = src
        .read_full_at(member.data_ofs, &mut comp)
        .map_err(|_| DosError::DataInvalid)?;
    if n != comp.len() {
        return Err(DosError::DataInvalid);
    }
    Ok(comp)
}

/// Inflate a whole raw DEFLATE member into memory.
pub fn inflate_to_vec(comp: &[u8], uncomp_size: u32) -> DriveResult<Vec<u8>> {
    let mut data = miniz_oxide::inflate::decompress_to_vec_with_limit(comp, uncomp_size as usize)
        .map_err(|e| {
            debug!(status = ?e.status, "inflate failed");
            DosError::DataInvalid
        })?;
    if data.len() < uncomp_size as usize {
        return Err(DosError::DataInvalid);
    }
    data.truncate(uncomp_size as usize);
    Ok(data)
}

/// Create the backend for a member on its first open.
///
/// `seek_cache` is the host path of the member's cursor cache, if caching is enabled.
pub fn open_unpacker(
    src: &mut dyn ArchiveSource,
    member: &MemberData,
    seek_cache: Option<PathBuf>,
) -> DriveResult<Box<dyn Unpacker>> {
    match member.method {
        METHOD_STORED => Ok(Box::new(StoredUnpacker)),
        METHOD_SHRUNK => {
            let comp = read_compressed(src, member)?;
            Ok(Box::new(MemoryUnpacker::new(unshrink(&comp, member.uncomp_size as usize)?)))
        }
        METHOD_IMPLODED => {
            let comp = read_compressed(src, member)?;
            let data = explode(&comp, member.uncomp_size as usize, member.bit_flags)?;
            Ok(Box::new(MemoryUnpacker::new(data)))
        }
        METHOD_DEFLATED if member.uncomp_size <= cursor_block_for(member.uncomp_size) => {
            let comp = read_compressed(src, member)?;
            Ok(Box::new(MemoryUnpacker::new(inflate_to_vec(&comp, member.uncomp_size)?)))
        }
        METHOD_DEFLATED => Ok(Box::new(DeflateUnpacker::new(member, seek_cache))),
        _ => Err(DosError::DataInvalid),
    }
}
