//! Seekable DEFLATE backend for large members.
//!
//! Decoding state is snapshotted at block boundaries into per-region cursors so
//! random reads only need to decode from the closest cursor. For very large
//! members every 20th cursor is persisted to a host-side `.SKC` file:
//!
//! ```text
//! u16 0x5344 | u16 cursor size | u16 comp size (high) | u16 comp size (low)
//! repeated: u16 index | u16 compressed length (0 = raw) | cursor bytes
//! ```

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::inflate::{Feed, Inflater, Progress, SeekCursor, WINDOW_SIZE};
use super::{MemberData, Unpacker};
use crate::error::DriveResult;
use crate::zip::source::{le16, ArchiveSource};

/// Members need more cursor regions than this before a seek cache is used.
pub const SEEK_CACHE_MIN_CURSORS: usize = 50;
const SEEK_CACHE_STEP: usize = 20;
const SEEK_CACHE_MAGIC: u16 = 0x5344;
const SEEK_CACHE_HEADER: usize = 8;

/// Size of the uncompressed region covered by one cursor slot.
pub fn cursor_block_for(uncomp_size: u32) -> u32 {
    const MB: u32 = 1024 * 1024;
    match uncomp_size {
        s if s > 50 * MB => MB,
        s if s > 30 * MB => 768 * 1024,
        s if s > 12 * MB => 384 * 1024,
        _ => 256 * 1024,
    }
}

struct SeekCache {
    path: PathBuf,
    cache_count: usize,
}

pub struct DeflateUnpacker {
    inflater: Inflater,
    cursor_block: u32,
    cursors: Vec<Option<SeekCursor>>,
    cache: Option<SeekCache>,
}

impl DeflateUnpacker {
    /// `cache_path` is only used for members with many cursor regions.
    pub fn new(member: &MemberData, cache_path: Option<PathBuf>) -> Self {
        Self::with_cursor_block(member, cursor_block_for(member.uncomp_size), cache_path)
    }

    pub(crate) fn with_cursor_block(member: &MemberData, cursor_block: u32, cache_path: Option<PathBuf>) -> Self {
        let count = (member.uncomp_size as usize).div_ceil(cursor_block as usize);
        let mut unpacker = Self {
            inflater: Inflater::new(),
            cursor_block,
            cursors: vec![None; count],
            cache: None,
        };
        if let Some(path) = cache_path.filter(|_| count > SEEK_CACHE_MIN_CURSORS) {
            unpacker.cache = Some(SeekCache { path, cache_count: 0 });
            unpacker.load_cache(member);
        }
        unpacker
    }

    fn load_cache(&mut self, member: &MemberData) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let Ok(data) = fs::read(&cache.path) else {
            return;
        };
        match parse_cache(&data, member.comp_size, self.cursor_block, self.cursors.len()) {
            Some(entries) => {
                cache.cache_count = entries.len();
                for (idx, cursor) in entries {
                    self.cursors[idx] = Some(cursor);
                }
                debug!(path = %cache.path.display(), cursors = cache.cache_count, "loaded seek cache");
            }
            None => {
                warn!(path = %cache.path.display(), "discarding invalid seek cache");
                if let Err(e) = fs::remove_file(&cache.path) {
                    warn!(error = %e, "failed to remove seek cache");
                }
                cache.cache_count = 0;
            }
        }
    }

    /// Persist every 20th cursor to the seek cache file.
    pub(crate) fn write_cache(&mut self, member: &MemberData) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let size = SeekCursor::SERIALIZED_SIZE;
        let mut out = Vec::new();
        out.extend_from_slice(&SEEK_CACHE_MAGIC.to_le_bytes());
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.extend_from_slice(&((member.comp_size >> 16) as u16).to_le_bytes());
        out.extend_from_slice(&(member.comp_size as u16).to_le_bytes());

        let mut written = 0;
        for idx in (0..self.cursors.len()).step_by(SEEK_CACHE_STEP) {
            let Some(cursor) = &self.cursors[idx] else {
                continue;
            };
            let raw = cursor.to_bytes();
            let packed = miniz_oxide::deflate::compress_to_vec(&raw, 6);
            out.extend_from_slice(&(idx as u16).to_le_bytes());
            if packed.len() < size - 10 {
                out.extend_from_slice(&(packed.len() as u16).to_le_bytes());
                out.extend_from_slice(&packed);
            } else {
                out.extend_from_slice(&0u16.to_le_bytes());
                out.extend_from_slice(&raw);
            }
            written += 1;
        }

        if let Some(dir) = cache.path.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "cannot create seek cache directory");
                return;
            }
        }
        match fs::write(&cache.path, &out) {
            Ok(()) => {
                debug!(path = %cache.path.display(), cursors = written, "wrote seek cache");
                cache.cache_count = written;
            }
            Err(e) => warn!(path = %cache.path.display(), error = %e, "failed to write seek cache"),
        }
    }

    fn maybe_write_cache(&mut self, member: &MemberData, idx: usize) {
        let Some(cache) = &self.cache else {
            return;
        };
        if idx <= SEEK_CACHE_MIN_CURSORS || idx % SEEK_CACHE_STEP != 0 {
            return;
        }
        let count = self.cursors.len();
        let got = self.cursors.iter().step_by(SEEK_CACHE_STEP).filter(|c| c.is_some()).count();
        let known = cache.cache_count;
        if got > count / (SEEK_CACHE_STEP * 2)
            && got > known
            && (got >= known + 5 || got == count.div_ceil(SEEK_CACHE_STEP))
            && count <= 0xFFFF
        {
            self.write_cache(member);
        }
    }

    /// Keep cursors toward the middle of their region to serve seeks both ways.
    fn store_cursor(&mut self, member: &MemberData) {
        let out = self.inflater.out_pos();
        let block = self.cursor_block as u64;
        let idx = (out / block) as usize;
        if out == 0 || idx >= self.cursors.len() {
            return;
        }
        let replace = match &self.cursors[idx] {
            None => true,
            Some(c) => out > c.out_pos + 120 * 1024 && out < idx as u64 * block + block / 2 + 70 * 1024,
        };
        if replace {
            self.cursors[idx] = Some(self.inflater.snapshot());
            self.maybe_write_cache(member, idx);
        }
    }

    /// Position the decoder so that `want_from` is reachable by decoding forward.
    fn seek(&mut self, want_from: u64) {
        let out_pos = self.inflater.out_pos();
        let have_from = out_pos.saturating_sub(WINDOW_SIZE as u64);
        if (have_from..=out_pos).contains(&want_from) || self.cursors.is_empty() {
            return;
        }
        let first = ((want_from / self.cursor_block as u64) as usize).min(self.cursors.len() - 1);
        for idx in (0..=first).rev() {
            let Some(cursor) = &self.cursors[idx] else {
                continue;
            };
            if cursor.out_pos > want_from {
                continue;
            }
            // Decoding on from the current position is closer
            if want_from > out_pos && cursor.out_pos <= out_pos {
                break;
            }
            self.inflater.restore(cursor);
            break;
        }
        if want_from < self.inflater.out_pos().saturating_sub(WINDOW_SIZE as u64) {
            self.inflater.reset();
        }
    }
}

fn parse_cache(data: &[u8], comp_size: u32, cursor_block: u32, count: usize) -> Option<Vec<(usize, SeekCursor)>> {
    let size = SeekCursor::SERIALIZED_SIZE;
    if data.len() < SEEK_CACHE_HEADER
        || le16(data, 0) != SEEK_CACHE_MAGIC
        || le16(data, 2) != size as u16
        || le16(data, 4) != (comp_size >> 16) as u16
        || le16(data, 6) != comp_size as u16
    {
        return None;
    }

    let mut entries = Vec::new();
    let mut pos = SEEK_CACHE_HEADER;
    while pos + 4 <= data.len() {
        let idx = le16(data, pos) as usize;
        let packed_len = le16(data, pos + 2) as usize;
        if idx >= count || packed_len >= size {
            break;
        }
        pos += 4;
        let cursor = if packed_len > 0 {
            let packed = data.get(pos..pos + packed_len)?;
            pos += packed_len;
            let raw = miniz_oxide::inflate::decompress_to_vec_with_limit(packed, size).ok()?;
            SeekCursor::from_bytes(&raw)?
        } else {
            let raw = data.get(pos..pos + size)?;
            pos += size;
            SeekCursor::from_bytes(raw)?
        };
        if cursor.out_pos == 0 || cursor.out_pos / cursor_block as u64 != idx as u64 || cursor.comp_pos > comp_size as u64 {
            return None;
        }
        entries.push((idx, cursor));
    }
    Some(entries)
}

impl Unpacker for DeflateUnpacker {
    fn read(&mut self, src: &mut dyn ArchiveSource, member: &MemberData, ofs: u32, buf: &mut [u8]) -> DriveResult<usize> {
        let want_from = ofs as u64;
        let want_to = (want_from + buf.len() as u64).min(member.uncomp_size as u64);
        if want_from >= want_to {
            return Ok(0);
        }
        let buf = &mut buf[..(want_to - want_from) as usize];

        self.seek(want_from);
        let out_pos = self.inflater.out_pos();
        if out_pos > want_from {
            let to = out_pos.min(want_to);
            self.inflater.copy_window(want_from, to, &mut buf[..(to - want_from) as usize]);
        }

        let mut feed = Feed {
            src,
            data_ofs: member.data_ofs,
            comp_size: member.comp_size as u64,
        };
        while self.inflater.out_pos() < want_to {
            match self.inflater.run(&mut feed, want_to, want_from, buf) {
                Ok(Progress::Boundary) => self.store_cursor(member),
                Ok(Progress::Stopped) => {}
                Ok(Progress::Done) => break,
                Err(e) => {
                    debug!(ofs = want_from, out_pos = self.inflater.out_pos(), "corrupt deflate stream");
                    self.inflater.reset();
                    return Err(e);
                }
            }
        }
        Ok(self.inflater.out_pos().min(want_to).saturating_sub(want_from) as usize)
    }
}
