//! XOR patches.
//!
//! Layout: `"XOR"`, the NUL-terminated DOS path of the source file (empty means
//! the file being patched), varint source offset, varint target size, then the
//! payload. Each payload byte is XORed with the source starting at the offset,
//! wrapping to the start of the source when it is shorter than the target.

use super::{PatchReader, PatchResult};
use crate::error::PatchError;

const MAGIC: &[u8] = b"XOR";
const CHUNK: usize = 1024;

/// Parsed header of an XOR patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorHeader {
    /// Source path embedded in the patch, if any.
    pub source_path: Option<String>,
    pub base: u64,
    pub target_size: u64,
    payload_ofs: usize,
}

impl XorHeader {
    pub fn parse(patch: &[u8]) -> PatchResult<Self> {
        if !patch.starts_with(MAGIC) {
            return Err(PatchError::UnknownFormat);
        }
        let rest = &patch[MAGIC.len()..];
        let nul = rest.iter().position(|&c| c == 0).ok_or(PatchError::Truncated)?;
        let source_path = match &rest[..nul] {
            [] => None,
            path => Some(String::from_utf8_lossy(path).into_owned()),
        };
        let mut r = PatchReader::at(patch, MAGIC.len() + nul + 1);
        let base = r.varint()?;
        let target_size = r.varint()?;
        Ok(Self {
            source_path,
            base,
            target_size,
            payload_ofs: r.pos(),
        })
    }
}

pub fn apply_xor(source: &[u8], patch: &[u8]) -> PatchResult<Vec<u8>> {
    let header = XorHeader::parse(patch)?;
    let payload = &patch[header.payload_ofs..];
    if (payload.len() as u64) < header.target_size {
        return Err(PatchError::Truncated);
    }
    let mut out = payload[..header.target_size as usize].to_vec();
    if source.is_empty() {
        return Ok(out);
    }
    if header.base >= source.len() as u64 {
        return Err(PatchError::OutOfRange(header.base));
    }

    let mut src_pos = header.base as usize;
    let mut i = 0;
    while i < out.len() {
        let n = (out.len() - i).min(CHUNK).min(source.len() - src_pos);
        for (o, s) in out[i..i + n].iter_mut().zip(&source[src_pos..src_pos + n]) {
            *o ^= s;
        }
        i += n;
        src_pos += n;
        if src_pos == source.len() {
            src_pos = 0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(v: u64, out: &mut Vec<u8>) {
        let mut groups = vec![(v & 0x7f) as u8];
        let mut v = v >> 7;
        while v > 0 {
            groups.push(0x80 | (v & 0x7f) as u8);
            v >>= 7;
        }
        out.extend(groups.iter().rev());
    }

    fn make(path: &str, base: u64, source: &[u8], target: &[u8]) -> Vec<u8> {
        let mut p = b"XOR".to_vec();
        p.extend(path.as_bytes());
        p.push(0);
        varint(base, &mut p);
        varint(target.len() as u64, &mut p);
        for (i, &t) in target.iter().enumerate() {
            let s = if source.is_empty() { 0 } else { source[(base as usize + i) % source.len()] };
            p.push(t ^ s);
        }
        p
    }

    #[test]
    fn test_xor_header() {
        let p = make("DATA\\BASE.DAT", 300, b"x", b"abc");
        let h = XorHeader::parse(&p).unwrap();
        assert_eq!(h.source_path.as_deref(), Some("DATA\\BASE.DAT"));
        assert_eq!(h.base, 300);
        assert_eq!(h.target_size, 3);
        assert_eq!(XorHeader::parse(&make("", 0, b"", b"")).unwrap().source_path, None);
    }

    #[test]
    fn test_xor_wraps_short_source() {
        let source = b"0123456789";
        let target: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
        let p = make("", 7, source, &target);
        assert_eq!(apply_xor(source, &p).unwrap(), target);
    }

    #[test]
    fn test_xor_large_source_window() {
        let source: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 256) as u8).collect();
        let target = b"new file contents".repeat(100);
        let p = make("OLD.BIN", 1500, &source, &target);
        assert_eq!(apply_xor(&source, &p).unwrap(), target);
    }

    #[test]
    fn test_xor_errors() {
        let p = make("", 10, b"abc", b"xyz");
        assert_eq!(apply_xor(b"abc", &p), Err(PatchError::OutOfRange(10)));
        let p = make("", 0, b"abc", b"xyz");
        assert_eq!(apply_xor(b"abc", &p[..p.len() - 1]), Err(PatchError::Truncated));
        assert_eq!(apply_xor(b"abc", b"XORno-nul"), Err(PatchError::Truncated));
    }
}
