//! BPS patches.
//!
//! Layout: `"BPS1"`, varint source size, varint target size, varint metadata
//! size and metadata, the action stream, then CRC32s of source, target and
//! patch. All three checksums are verified.

use super::{PatchReader, PatchResult};
use crate::error::PatchError;

const HEADER: &[u8] = b"BPS1";
const FOOTER_SIZE: usize = 12;

const SOURCE_READ: u64 = 0;
const TARGET_READ: u64 = 1;
const SOURCE_COPY: u64 = 2;

/// BPS integer: little-endian base-128 with the continuation bias folded in.
fn read_number(r: &mut PatchReader) -> PatchResult<u64> {
    let mut v: u64 = 0;
    let mut shift: u64 = 1;
    loop {
        let b = r.u8()?;
        v = v
            .checked_add((b & 0x7f) as u64 * shift)
            .ok_or(PatchError::Unsupported("number overflow"))?;
        if b & 0x80 != 0 {
            return Ok(v);
        }
        shift = shift.checked_shl(7).ok_or(PatchError::Unsupported("number overflow"))?;
        v = v.checked_add(shift).ok_or(PatchError::Unsupported("number overflow"))?;
    }
}

/// Apply a signed relative offset (lowest bit is the sign).
fn relative(base: u64, data: u64) -> PatchResult<u64> {
    let delta = data >> 1;
    if data & 1 != 0 {
        base.checked_sub(delta).ok_or(PatchError::OutOfRange(delta))
    } else {
        base.checked_add(delta).ok_or(PatchError::OutOfRange(delta))
    }
}

pub fn apply_bps(source: &[u8], patch: &[u8]) -> PatchResult<Vec<u8>> {
    if !patch.starts_with(HEADER) || patch.len() < HEADER.len() + FOOTER_SIZE {
        return Err(PatchError::UnknownFormat);
    }
    let actions_end = patch.len() - FOOTER_SIZE;
    let footer = &patch[actions_end..];
    let stored = |i: usize| u32::from_le_bytes([footer[i], footer[i + 1], footer[i + 2], footer[i + 3]]);
    verify_crc(stored(8), crc32fast::hash(&patch[..patch.len() - 4]))?;
    let mut r = PatchReader::at(&patch[..actions_end], HEADER.len());
    let source_size = read_number(&mut r)?;
    if source_size != source.len() as u64 {
        return Err(PatchError::SourceSizeMismatch {
            expected: source_size,
            actual: source.len() as u64,
        });
    }
    verify_crc(stored(0), crc32fast::hash(source))?;
    let target_size = read_number(&mut r)?;
    let meta_size = read_number(&mut r)?;
    r.skip(meta_size as usize)?;
    if target_size > u32::MAX as u64 {
        return Err(PatchError::Unsupported("target larger than 4 GiB"));
    }

    let mut out: Vec<u8> = Vec::with_capacity(target_size as usize);
    let mut source_rel: u64 = 0;
    let mut target_rel: u64 = 0;
    while r.remaining() > 0 {
        let data = read_number(&mut r)?;
        let len = (data >> 2) + 1;
        let at = out.len() as u64;
        if at + len > target_size {
            return Err(PatchError::OutOfRange(at + len));
        }
        let len = len as usize;
        match data & 3 {
            SOURCE_READ => {
                let src = source
                    .get(at as usize..at as usize + len)
                    .ok_or(PatchError::OutOfRange(at))?;
                out.extend_from_slice(src);
            }
            TARGET_READ => out.extend_from_slice(r.bytes(len)?),
            SOURCE_COPY => {
                source_rel = relative(source_rel, read_number(&mut r)?)?;
                let src = source
                    .get(source_rel as usize..source_rel as usize + len)
                    .ok_or(PatchError::OutOfRange(source_rel))?;
                out.extend_from_slice(src);
                source_rel += len as u64;
            }
            _ => {
                target_rel = relative(target_rel, read_number(&mut r)?)?;
                if target_rel >= at {
                    return Err(PatchError::OutOfRange(target_rel));
                }
                // Byte by byte: the copy may overlap what it produces
                for _ in 0..len {
                    out.push(out[target_rel as usize]);
                    target_rel += 1;
                }
            }
        }
    }
    if out.len() as u64 != target_size {
        return Err(PatchError::TargetSizeMismatch {
            expected: target_size,
            actual: out.len() as u64,
        });
    }

    verify_crc(stored(4), crc32fast::hash(&out))?;
    Ok(out)
}

fn verify_crc(expected: u32, actual: u32) -> PatchResult<()> {
    if expected != actual {
        return Err(PatchError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let x = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(0x80 | x);
                return;
            }
            out.push(x);
            v -= 1;
        }
    }

    fn signed(delta: i64, out: &mut Vec<u8>) {
        number(((delta.unsigned_abs()) << 1) | (delta < 0) as u64, out);
    }

    enum Op<'a> {
        SourceRead(usize),
        TargetRead(&'a [u8]),
        SourceCopy(usize, i64),
        TargetCopy(usize, i64),
    }

    fn build(source: &[u8], target: &[u8], ops: &[Op]) -> Vec<u8> {
        let mut p = b"BPS1".to_vec();
        number(source.len() as u64, &mut p);
        number(target.len() as u64, &mut p);
        number(3, &mut p);
        p.extend(b"m=1");
        for op in ops {
            match op {
                Op::SourceRead(n) => number((*n as u64 - 1) << 2, &mut p),
                Op::TargetRead(d) => {
                    number(((d.len() as u64 - 1) << 2) | 1, &mut p);
                    p.extend(*d);
                }
                Op::SourceCopy(n, rel) => {
                    number(((*n as u64 - 1) << 2) | 2, &mut p);
                    signed(*rel, &mut p);
                }
                Op::TargetCopy(n, rel) => {
                    number(((*n as u64 - 1) << 2) | 3, &mut p);
                    signed(*rel, &mut p);
                }
            }
        }
        p.extend(crc32fast::hash(source).to_le_bytes());
        p.extend(crc32fast::hash(target).to_le_bytes());
        let patch_crc = crc32fast::hash(&p);
        p.extend(patch_crc.to_le_bytes());
        p
    }

    #[test]
    fn test_number_encoding() {
        for v in [0u64, 1, 127, 128, 16511, 16512, 1 << 40] {
            let mut buf = Vec::new();
            number(v, &mut buf);
            assert_eq!(read_number(&mut PatchReader::new(&buf)).unwrap(), v);
        }
    }

    #[test]
    fn test_bps_all_actions() {
        let source = b"0123456789abcdef";
        let target = b"0123XYZcdef89ZZZZZZ";
        let ops = [
            Op::SourceRead(4),
            Op::TargetRead(b"XYZ"),
            Op::SourceCopy(4, 12),
            Op::SourceCopy(2, -8),
            Op::TargetRead(b"Z"),
            // Overlapping copy repeats the byte just written
            Op::TargetCopy(5, 13),
        ];
        let patch = build(source, target, &ops);
        assert_eq!(apply_bps(source, &patch).unwrap(), target);
        // Applying twice from the same source gives the same bytes
        assert_eq!(apply_bps(source, &patch).unwrap(), target);
    }

    #[test]
    fn test_bps_empty_target() {
        let patch = build(b"abc", b"", &[]);
        assert_eq!(apply_bps(b"abc", &patch).unwrap(), b"");
    }

    #[test]
    fn test_bps_source_size_must_match() {
        let patch = build(b"abc", b"abc", &[Op::SourceRead(3)]);
        assert_eq!(
            apply_bps(b"abcd", &patch),
            Err(PatchError::SourceSizeMismatch { expected: 3, actual: 4 })
        );
    }

    #[test]
    fn test_bps_out_of_range_copy() {
        let patch = build(b"abc", b"abcd", &[Op::SourceCopy(4, 0)]);
        assert_eq!(apply_bps(b"abc", &patch), Err(PatchError::OutOfRange(0)));
        let patch = build(b"abc", b"aa", &[Op::TargetCopy(2, 0)]);
        assert_eq!(apply_bps(b"abc", &patch), Err(PatchError::OutOfRange(0)));
    }

    /// Flip a footer byte and re-seal the patch checksum.
    fn corrupt_footer(patch: &mut Vec<u8>, at: usize) {
        let n = patch.len();
        patch[n - at] ^= 0xff;
        let crc = crc32fast::hash(&patch[..n - 4]);
        patch[n - 4..].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_bps_checksum_verified() {
        let good = build(b"abc", b"abd", &[Op::SourceRead(2), Op::TargetRead(b"d")]);

        let mut patch = good.clone();
        corrupt_footer(&mut patch, 8);
        assert_eq!(
            apply_bps(b"abc", &patch),
            Err(PatchError::ChecksumMismatch {
                expected: crc32fast::hash(b"abd") ^ 0xff,
                actual: crc32fast::hash(b"abd"),
            })
        );

        let mut patch = good.clone();
        corrupt_footer(&mut patch, 12);
        assert!(matches!(apply_bps(b"abc", &patch), Err(PatchError::ChecksumMismatch { .. })));

        let mut patch = good.clone();
        let n = patch.len();
        patch[n - 1] ^= 0xff;
        assert!(matches!(apply_bps(b"abc", &patch), Err(PatchError::ChecksumMismatch { .. })));

        // Same size, different source bytes
        assert!(matches!(apply_bps(b"abx", &good), Err(PatchError::ChecksumMismatch { .. })));
        assert_eq!(apply_bps(b"abc", &good).unwrap(), b"abd");
    }

    #[test]
    fn test_bps_truncated_target() {
        let patch = build(b"abc", b"abcabc", &[Op::SourceRead(3)]);
        assert_eq!(
            apply_bps(b"abc", &patch),
            Err(PatchError::TargetSizeMismatch { expected: 6, actual: 3 })
        );
    }
}
