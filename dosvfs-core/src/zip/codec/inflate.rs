//! Raw DEFLATE decoder that can pause at block boundaries and resume from a
//! saved cursor (input position, bit buffer and the 32 KiB history window).

use std::mem;

use crate::error::{DosError, DriveResult};
use crate::zip::source::ArchiveSource;

pub(crate) const WINDOW_SIZE: usize = 0x8000;
const WINDOW_MASK: u64 = WINDOW_SIZE as u64 - 1;
const READ_BLOCK: usize = 16 * 1024;

const MAX_BITS: usize = 16;

static LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131, 163, 195, 227, 258,
];
static LENGTH_EXTRA: [u8; 29] = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0];
static DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537, 2049, 3073, 4097, 6145,
    8193, 12289, 16385, 24577,
];
static DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13,
];
static CODE_LENGTH_ORDER: [usize; 19] = [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

/// Canonical Huffman decoding table (codes up to 16 bits).
#[derive(Debug, Clone)]
pub(crate) struct Huffman {
    counts: [u16; MAX_BITS + 1],
    symbols: Vec<u16>,
}

impl Huffman {
    /// Build from per-symbol code lengths. Over-subscribed codes are rejected, and
    /// so are incomplete ones unless they hold at most one single-bit code.
    pub(crate) fn new(lengths: &[u8]) -> DriveResult<Self> {
        let (table, left) = Self::build(lengths)?;
        let longest = (1..=MAX_BITS).rev().find(|&len| table.counts[len] != 0).unwrap_or(0);
        if left > 0 && longest > 1 {
            return Err(DosError::DataInvalid);
        }
        Ok(table)
    }

    /// Build accepting incomplete codes, as the fixed distance table needs.
    pub(crate) fn new_incomplete(lengths: &[u8]) -> DriveResult<Self> {
        Self::build(lengths).map(|(table, _)| table)
    }

    /// Table and the number of unused codes at the longest length.
    fn build(lengths: &[u8]) -> DriveResult<(Self, i32)> {
        let mut counts = [0u16; MAX_BITS + 1];
        for &len in lengths {
            if len as usize > MAX_BITS {
                return Err(DosError::DataInvalid);
            }
            counts[len as usize] += 1;
        }
        let mut left: i32 = 1;
        for &count in &counts[1..] {
            left = (left << 1) - count as i32;
            if left < 0 {
                return Err(DosError::DataInvalid);
            }
        }

        let mut offsets = [0u16; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + counts[len];
        }
        let mut symbols = vec![0u16; offsets[MAX_BITS + 1] as usize];
        for (sym, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbols[offsets[len as usize] as usize] = sym as u16;
                offsets[len as usize] += 1;
            }
        }
        Ok((Self { counts, symbols }, left))
    }

    /// Decode one symbol, pulling code bits (most significant first) from `next_bit`.
    pub(crate) fn decode(&self, mut next_bit: impl FnMut() -> DriveResult<u32>) -> DriveResult<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for &count in &self.counts[1..] {
            code |= next_bit()? as i32;
            let count = count as i32;
            if code - count < first {
                return Ok(self.symbols[(index + (code - first)) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }
        Err(DosError::DataInvalid)
    }
}

fn fixed_tables() -> DriveResult<(Huffman, Huffman)> {
    let mut lengths = [0u8; 288];
    lengths[..144].fill(8);
    lengths[144..256].fill(9);
    lengths[256..280].fill(7);
    lengths[280..].fill(8);
    Ok((Huffman::new(&lengths)?, Huffman::new_incomplete(&[5u8; 30])?))
}

/// Location of a member's compressed bytes.
pub(crate) struct Feed<'a> {
    pub src: &'a mut dyn ArchiveSource,
    pub data_ofs: u64,
    pub comp_size: u64,
}

/// Decoder state at a block boundary, enough to resume from there.
#[derive(Clone)]
pub(crate) struct SeekCursor {
    pub comp_pos: u64,
    pub out_pos: u64,
    pub bit_buf: u32,
    pub bit_cnt: u32,
    pub window: Box<[u8]>,
}

impl SeekCursor {
    pub const SERIALIZED_SIZE: usize = 24 + WINDOW_SIZE;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SERIALIZED_SIZE);
        out.extend_from_slice(&self.comp_pos.to_le_bytes());
        out.extend_from_slice(&self.out_pos.to_le_bytes());
        out.extend_from_slice(&self.bit_buf.to_le_bytes());
        out.extend_from_slice(&self.bit_cnt.to_le_bytes());
        out.extend_from_slice(&self.window);
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != Self::SERIALIZED_SIZE {
            return None;
        }
        let u64_at = |o: usize| u64::from_le_bytes(b[o..o + 8].try_into().unwrap_or_default());
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap_or_default());
        let bit_cnt = u32_at(20);
        if bit_cnt > 32 {
            return None;
        }
        Some(Self {
            comp_pos: u64_at(0),
            out_pos: u64_at(8),
            bit_buf: u32_at(16),
            bit_cnt,
            window: b[24..].into(),
        })
    }
}

enum Block {
    Header,
    Stored { remaining: u32 },
    Codes { lit: Huffman, dist: Huffman, copy_len: u32, copy_dist: u32 },
    Done,
}

/// Why [`Inflater::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// A non-final block just ended; the state can be saved as a cursor.
    Boundary,
    /// The requested stop position was reached.
    Stopped,
    /// End of stream.
    Done,
}

pub(crate) struct Inflater {
    comp_pos: u64,
    bit_buf: u32,
    bit_cnt: u32,
    read_buf: Vec<u8>,
    read_start: u64,
    window: Box<[u8]>,
    out_pos: u64,
    block: Block,
    last_block: bool,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            comp_pos: 0,
            bit_buf: 0,
            bit_cnt: 0,
            read_buf: Vec::new(),
            read_start: 0,
            window: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            out_pos: 0,
            block: Block::Header,
            last_block: false,
        }
    }

    /// Restart decoding from the beginning of the stream.
    pub fn reset(&mut self) {
        self.comp_pos = 0;
        self.bit_buf = 0;
        self.bit_cnt = 0;
        self.out_pos = 0;
        self.block = Block::Header;
        self.last_block = false;
    }

    /// Uncompressed bytes produced so far.
    pub fn out_pos(&self) -> u64 {
        self.out_pos
    }

    pub fn snapshot(&self) -> SeekCursor {
        SeekCursor {
            comp_pos: self.comp_pos,
            out_pos: self.out_pos,
            bit_buf: self.bit_buf,
            bit_cnt: self.bit_cnt,
            window: self.window.clone(),
        }
    }

    pub fn restore(&mut self, c: &SeekCursor) {
        self.comp_pos = c.comp_pos;
        self.out_pos = c.out_pos;
        self.bit_buf = c.bit_buf;
        self.bit_cnt = c.bit_cnt;
        self.window.copy_from_slice(&c.window);
        self.block = Block::Header;
        self.last_block = false;
    }

    /// Copy already produced bytes `[from, to)` out of the history window.
    pub fn copy_window(&self, from: u64, to: u64, out: &mut [u8]) {
        for (i, pos) in (from..to).enumerate() {
            out[i] = self.window[(pos & WINDOW_MASK) as usize];
        }
    }

    /// Decode until `stop_at`, a block boundary or the end of the stream.
    /// Bytes at positions `out_from..out_from + out.len()` land in `out`.
    pub fn run(&mut self, feed: &mut Feed, stop_at: u64, out_from: u64, out: &mut [u8]) -> DriveResult<Progress> {
        let mut block = mem::replace(&mut self.block, Block::Done);
        let res = self.run_block(&mut block, feed, stop_at, out_from, out);
        if res.is_ok() {
            self.block = block;
        }
        res
    }

    fn run_block(
        &mut self,
        block: &mut Block,
        feed: &mut Feed,
        stop_at: u64,
        out_from: u64,
        out: &mut [u8],
    ) -> DriveResult<Progress> {
        loop {
            match block {
                Block::Header => {
                    if self.out_pos >= stop_at {
                        return Ok(Progress::Stopped);
                    }
                    *block = self.read_header(feed)?;
                }
                Block::Stored { remaining } => {
                    if *remaining == 0 {
                        return Ok(self.end_block(block));
                    }
                    if self.out_pos >= stop_at {
                        return Ok(Progress::Stopped);
                    }
                    let b = self.bits(feed, 8)? as u8;
                    self.emit(b, out_from, out);
                    *remaining -= 1;
                }
                Block::Codes { lit, dist, copy_len, copy_dist } => {
                    if self.out_pos >= stop_at {
                        return Ok(Progress::Stopped);
                    }
                    if *copy_len > 0 {
                        let b = self.window[((self.out_pos - *copy_dist as u64) & WINDOW_MASK) as usize];
                        self.emit(b, out_from, out);
                        *copy_len -= 1;
                        continue;
                    }
                    let sym = lit.decode(|| self.bits(feed, 1))?;
                    if sym < 256 {
                        self.emit(sym as u8, out_from, out);
                        continue;
                    }
                    if sym == 256 {
                        return Ok(self.end_block(block));
                    }
                    let idx = (sym - 257) as usize;
                    if idx >= LENGTH_BASE.len() {
                        return Err(DosError::DataInvalid);
                    }
                    let len = LENGTH_BASE[idx] as u32 + self.bits(feed, LENGTH_EXTRA[idx] as u32)?;
                    let dsym = dist.decode(|| self.bits(feed, 1))? as usize;
                    if dsym >= DIST_BASE.len() {
                        return Err(DosError::DataInvalid);
                    }
                    let d = DIST_BASE[dsym] as u32 + self.bits(feed, DIST_EXTRA[dsym] as u32)?;
                    if d as u64 > self.out_pos {
                        return Err(DosError::DataInvalid);
                    }
                    *copy_len = len;
                    *copy_dist = d;
                }
                Block::Done => return Ok(Progress::Done),
            }
        }
    }

    fn end_block(&mut self, block: &mut Block) -> Progress {
        if self.last_block {
            *block = Block::Done;
            Progress::Done
        } else {
            *block = Block::Header;
            Progress::Boundary
        }
    }

    fn read_header(&mut self, feed: &mut Feed) -> DriveResult<Block> {
        let hdr = self.bits(feed, 3)?;
        self.last_block = hdr & 1 != 0;
        match hdr >> 1 {
            0 => {
                self.bit_buf = 0;
                self.bit_cnt = 0;
                let len = self.bits(feed, 16)?;
                let nlen = self.bits(feed, 16)?;
                if len != !nlen & 0xffff {
                    return Err(DosError::DataInvalid);
                }
                Ok(Block::Stored { remaining: len })
            }
            1 => {
                let (lit, dist) = fixed_tables()?;
                Ok(Block::Codes { lit, dist, copy_len: 0, copy_dist: 0 })
            }
            2 => self.read_dynamic(feed),
            _ => Err(DosError::DataInvalid),
        }
    }

    fn read_dynamic(&mut self, feed: &mut Feed) -> DriveResult<Block> {
        let nlen = self.bits(feed, 5)? as usize + 257;
        let ndist = self.bits(feed, 5)? as usize + 1;
        let ncode = self.bits(feed, 4)? as usize + 4;
        if nlen > 286 || ndist > 30 {
            return Err(DosError::DataInvalid);
        }

        let mut code_lengths = [0u8; 19];
        for &slot in &CODE_LENGTH_ORDER[..ncode] {
            code_lengths[slot] = self.bits(feed, 3)? as u8;
        }
        let lencode = Huffman::new(&code_lengths)?;

        let mut lengths = vec![0u8; nlen + ndist];
        let mut i = 0;
        while i < lengths.len() {
            let sym = lencode.decode(|| self.bits(feed, 1))?;
            if sym < 16 {
                lengths[i] = sym as u8;
                i += 1;
                continue;
            }
            let (value, repeat) = match sym {
                16 => {
                    if i == 0 {
                        return Err(DosError::DataInvalid);
                    }
                    (lengths[i - 1], 3 + self.bits(feed, 2)? as usize)
                }
                17 => (0, 3 + self.bits(feed, 3)? as usize),
                _ => (0, 11 + self.bits(feed, 7)? as usize),
            };
            if i + repeat > lengths.len() {
                return Err(DosError::DataInvalid);
            }
            lengths[i..i + repeat].fill(value);
            i += repeat;
        }
        if lengths[256] == 0 {
            return Err(DosError::DataInvalid);
        }

        Ok(Block::Codes {
            lit: Huffman::new(&lengths[..nlen])?,
            dist: Huffman::new(&lengths[nlen..])?,
            copy_len: 0,
            copy_dist: 0,
        })
    }

    fn emit(&mut self, b: u8, out_from: u64, out: &mut [u8]) {
        self.window[(self.out_pos & WINDOW_MASK) as usize] = b;
        if self.out_pos >= out_from {
            if let Some(slot) = out.get_mut((self.out_pos - out_from) as usize) {
                *slot = b;
            }
        }
        self.out_pos += 1;
    }

    fn next_byte(&mut self, feed: &mut Feed) -> DriveResult<u8> {
        if self.comp_pos >= feed.comp_size {
            return Err(DosError::DataInvalid);
        }
        if self.comp_pos < self.read_start || self.comp_pos - self.read_start >= self.read_buf.len() as u64 {
            let n = (feed.comp_size - self.comp_pos).min(READ_BLOCK as u64) as usize;
            self.read_buf.resize(n, 0);
            let got = feed
                .src
                .read_full_at(feed.data_ofs + self.comp_pos, &mut self.read_buf)
                .map_err(|_| DosError::DataInvalid)?;
            if got != n {
                return Err(DosError::DataInvalid);
            }
            self.read_start = self.comp_pos;
        }
        let b = self.read_buf[(self.comp_pos - self.read_start) as usize];
        self.comp_pos += 1;
        Ok(b)
    }

    fn bits(&mut self, feed: &mut Feed, n: u32) -> DriveResult<u32> {
        while self.bit_cnt < n {
            let b = self.next_byte(feed)?;
            self.bit_buf |= (b as u32) << self.bit_cnt;
            self.bit_cnt += 8;
        }
        let v = self.bit_buf & ((1u32 << n) - 1);
        self.bit_buf >>= n;
        self.bit_cnt -= n;
        Ok(v)
    }
}
