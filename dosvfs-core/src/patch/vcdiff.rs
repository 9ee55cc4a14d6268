//! VCDIFF (RFC 3284) decoding, as produced by xdelta.
//!
//! Only the default instruction code table is supported; secondary
//! compressors and application-defined code tables are rejected.

use super::{PatchReader, PatchResult};
use crate::error::PatchError;

const MAGIC: [u8; 4] = [0xD6, 0xC3, 0xC4, 0x00];

// Header indicator
const HDR_DECOMPRESS: u8 = 1;
const HDR_CODETABLE: u8 = 2;
const HDR_APPHEADER: u8 = 4;

// Window indicator
const WIN_SOURCE: u8 = 1;
const WIN_TARGET: u8 = 2;
const WIN_ADLER32: u8 = 4;

const NEAR_SIZE: usize = 4;
const SAME_SIZE: usize = 3;
const MODE_SELF: u8 = 0;
const MODE_HERE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Op {
    #[default]
    Noop,
    Add,
    Run,
    Copy,
}

#[derive(Debug, Clone, Copy, Default)]
struct Instruction {
    op: Op,
    size: u8,
    mode: u8,
}

impl Instruction {
    const fn new(op: Op, size: u8, mode: u8) -> Self {
        Self { op, size, mode }
    }
}

/// The default code table of RFC 3284 section 5.6.
fn default_code_table() -> Box<[[Instruction; 2]; 256]> {
    let mut t = Box::new([[Instruction::default(); 2]; 256]);
    t[0][0] = Instruction::new(Op::Run, 0, 0);
    let mut idx = 1;
    for size in 0..18u8 {
        t[idx][0] = Instruction::new(Op::Add, size, 0);
        idx += 1;
    }
    for mode in 0..9u8 {
        t[idx][0] = Instruction::new(Op::Copy, 0, mode);
        idx += 1;
        for size in 4..19u8 {
            t[idx][0] = Instruction::new(Op::Copy, size, mode);
            idx += 1;
        }
    }
    for mode in 0..6u8 {
        for add in 1..5u8 {
            for copy in 4..7u8 {
                t[idx] = [Instruction::new(Op::Add, add, 0), Instruction::new(Op::Copy, copy, mode)];
                idx += 1;
            }
        }
    }
    for mode in 6..9u8 {
        for add in 1..5u8 {
            t[idx] = [Instruction::new(Op::Add, add, 0), Instruction::new(Op::Copy, 4, mode)];
            idx += 1;
        }
    }
    for mode in 0..9u8 {
        t[idx] = [Instruction::new(Op::Copy, 4, mode), Instruction::new(Op::Add, 1, 0)];
        idx += 1;
    }
    t
}

/// Near and same address caches, reset per window.
struct AddressCache {
    near: [u64; NEAR_SIZE],
    same: Vec<u64>,
    next_slot: usize,
}

impl AddressCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_SIZE],
            same: vec![0; SAME_SIZE * 256],
            next_slot: 0,
        }
    }

    fn reset(&mut self) {
        self.near = [0; NEAR_SIZE];
        self.same.fill(0);
        self.next_slot = 0;
    }

    fn decode(&mut self, here: u64, mode: u8, addrs: &mut PatchReader) -> PatchResult<u64> {
        let addr = match mode {
            MODE_SELF => addrs.varint()?,
            MODE_HERE => here.checked_sub(addrs.varint()?).ok_or(PatchError::OutOfRange(here))?,
            m if (m as usize) < NEAR_SIZE + 2 => {
                let near = self.near[m as usize - 2];
                near.checked_add(addrs.varint()?).ok_or(PatchError::OutOfRange(near))?
            }
            m => {
                let slot = (m as usize - 2 - NEAR_SIZE) * 256 + addrs.u8()? as usize;
                *self.same.get(slot).ok_or(PatchError::Unsupported("address mode"))?
            }
        };
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % NEAR_SIZE;
        self.same[(addr % (SAME_SIZE as u64 * 256)) as usize] = addr;
        Ok(addr)
    }
}

/// Source segment of a window: where COPY addresses below `len` read from.
struct Segment {
    from_target: bool,
    len: u64,
    pos: u64,
}

pub fn apply_vcdiff(source: &[u8], patch: &[u8]) -> PatchResult<Vec<u8>> {
    if patch.get(..4) != Some(&MAGIC[..]) {
        return Err(PatchError::UnknownFormat);
    }
    let mut r = PatchReader::at(patch, 4);
    let indicator = r.u8()?;
    if indicator & HDR_DECOMPRESS != 0 {
        return Err(PatchError::Unsupported("secondary compression"));
    }
    if indicator & HDR_CODETABLE != 0 && r.varint()? != 0 {
        return Err(PatchError::Unsupported("application-defined code table"));
    }
    if indicator & HDR_APPHEADER != 0 {
        let len = r.varint()?;
        r.skip(len as usize)?;
    }

    let table = default_code_table();
    let mut cache = AddressCache::new();
    let mut out: Vec<u8> = Vec::with_capacity(source.len());
    while r.remaining() > 0 {
        let win_indicator = r.u8()?;
        let segment = if win_indicator & (WIN_SOURCE | WIN_TARGET) != 0 {
            let len = r.varint()?;
            let pos = r.varint()?;
            Some(Segment {
                from_target: win_indicator & WIN_SOURCE == 0,
                len,
                pos,
            })
        } else {
            None
        };
        let _delta_len = r.varint()?;
        let target_len = r.varint()?;
        // Output offsets are 32-bit
        if (out.len() as u64)
            .checked_add(target_len)
            .map_or(true, |end| end > u32::MAX as u64)
        {
            return Err(PatchError::OutOfRange(target_len));
        }
        if r.u8()? != 0 {
            return Err(PatchError::Unsupported("compressed window sections"));
        }
        let data_len = r.varint()? as usize;
        let inst_len = r.varint()? as usize;
        let addr_len = r.varint()? as usize;
        if win_indicator & WIN_ADLER32 != 0 {
            r.skip(4)?;
        }
        let mut data = PatchReader::new(r.bytes(data_len)?);
        let mut insts = PatchReader::new(r.bytes(inst_len)?);
        let mut addrs = PatchReader::new(r.bytes(addr_len)?);

        cache.reset();
        let win_start = out.len();
        let src_len = segment.as_ref().map_or(0, |s| s.len);
        while insts.remaining() > 0 {
            let pair = table[insts.u8()? as usize];
            for inst in pair {
                if inst.op == Op::Noop {
                    continue;
                }
                let size = match inst.size {
                    0 => insts.varint()?,
                    s => s as u64,
                };
                let written = (out.len() - win_start) as u64;
                if written.checked_add(size).map_or(true, |end| end > target_len) {
                    return Err(PatchError::TargetSizeMismatch {
                        expected: target_len,
                        actual: written.saturating_add(size),
                    });
                }
                let size = size as usize;
                match inst.op {
                    Op::Add => out.extend_from_slice(data.bytes(size)?),
                    Op::Run => {
                        let b = data.u8()?;
                        out.resize(out.len() + size, b);
                    }
                    _ => {
                        let here = written.checked_add(src_len).ok_or(PatchError::OutOfRange(src_len))?;
                        let addr = cache.decode(here, inst.mode, &mut addrs)?;
                        match &segment {
                            Some(seg) if addr < seg.len => {
                                let from = seg.pos.checked_add(addr).ok_or(PatchError::OutOfRange(addr))?;
                                // Source segments never overlap the bytes being produced
                                let src = if seg.from_target { &out[..win_start] } else { source };
                                if from.checked_add(size as u64).map_or(true, |end| end > src.len() as u64) {
                                    return Err(PatchError::OutOfRange(from));
                                }
                                let chunk = src[from as usize..from as usize + size].to_vec();
                                out.extend_from_slice(&chunk);
                            }
                            _ => {
                                let from = (win_start as u64)
                                    .checked_add(addr - src_len)
                                    .ok_or(PatchError::OutOfRange(addr))?;
                                if from >= out.len() as u64 {
                                    return Err(PatchError::OutOfRange(from));
                                }
                                for k in 0..size {
                                    out.push(out[from as usize + k]);
                                }
                            }
                        }
                    }
                }
            }
        }
        let written = (out.len() - win_start) as u64;
        if written != target_len {
            return Err(PatchError::TargetSizeMismatch {
                expected: target_len,
                actual: written,
            });
        }
    }
    Ok(out)
}
