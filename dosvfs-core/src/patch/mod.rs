//! Binary patches and the layered patch drive.
//!
//! The appliers are pure functions from (source bytes, patch bytes) to target bytes:
//! - `xor`: XOR of a source window with the patch payload
//! - `ips`: offset/length records with run-length fills
//! - `bps`: source/target read and copy opcodes with relative addressing
//! - `vcdiff`: RFC 3284 windows with the default instruction code table

mod bps;
mod ips;
mod patch_drive;
mod vcdiff;
mod xor;

use crate::error::PatchError;

pub use bps::apply_bps;
pub use ips::apply_ips;
pub use patch_drive::{PatchDrive, PatchLayer};
pub use vcdiff::apply_vcdiff;
pub use xor::{apply_xor, XorHeader};

/// Result type of the patch appliers.
pub type PatchResult<T> = Result<T, PatchError>;

/// Patch file formats, told apart by their first three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    Xor,
    Ips,
    Bps,
    Vcdiff,
}

impl PatchFormat {
    /// Identify a patch by its magic.
    pub fn sniff(patch: &[u8]) -> PatchResult<Self> {
        match patch.get(..3) {
            Some(b"XOR") => Ok(PatchFormat::Xor),
            Some(b"PAT") => Ok(PatchFormat::Ips),
            Some(b"BPS") => Ok(PatchFormat::Bps),
            Some([0xD6, 0xC3, 0xC4]) => Ok(PatchFormat::Vcdiff),
            _ => Err(PatchError::UnknownFormat),
        }
    }

    /// Returns true if a file name carries one of the reserved patch extensions.
    pub fn is_patch_name(name: &str) -> bool {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        ["IPS", "BPS", "XOR", "VCD", "XDE"]
            .iter()
            .any(|e| ext.eq_ignore_ascii_case(e))
    }
}

/// Apply any supported patch to `source`.
///
/// XOR patches name their source in the header; callers resolve that path
/// themselves (see [`XorHeader::parse`]) and pass the bytes found there.
pub fn apply_patch(source: &[u8], patch: &[u8]) -> PatchResult<Vec<u8>> {
    match PatchFormat::sniff(patch)? {
        PatchFormat::Xor => apply_xor(source, patch),
        PatchFormat::Ips => apply_ips(source, patch),
        PatchFormat::Bps => apply_bps(source, patch),
        PatchFormat::Vcdiff => apply_vcdiff(source, patch),
    }
}

/// Cursor over a patch stream. Running off the end is `Truncated`.
pub(crate) struct PatchReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PatchReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn skip(&mut self, n: usize) -> PatchResult<()> {
        self.bytes(n).map(|_| ())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> PatchResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(PatchError::Truncated)?;
        let out = self.data.get(self.pos..end).ok_or(PatchError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> PatchResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Big-endian unsigned integer of `n` bytes.
    pub(crate) fn be(&mut self, n: usize) -> PatchResult<u32> {
        Ok(self.bytes(n)?.iter().fold(0, |v, &b| (v << 8) | b as u32))
    }

    /// Big-endian base-128 integer, high bit set on every byte but the last.
    pub(crate) fn varint(&mut self) -> PatchResult<u64> {
        let mut v: u64 = 0;
        loop {
            let b = self.u8()?;
            if v >> 57 != 0 {
                return Err(PatchError::Unsupported("varint overflow"));
            }
            v = (v << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(v);
            }
        }
    }
}
