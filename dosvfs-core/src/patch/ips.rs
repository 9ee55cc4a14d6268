//! IPS patches.

use super::{PatchReader, PatchResult};
use crate::error::PatchError;

const HEADER: &[u8] = b"PATCH";
/// Record offset that terminates the record list.
const EOF_MARKER: u32 = 0x45_4f_46;

/// Apply an IPS patch. Records past the end of `source` grow the target.
pub fn apply_ips(source: &[u8], patch: &[u8]) -> PatchResult<Vec<u8>> {
    if !patch.starts_with(HEADER) {
        return Err(PatchError::UnknownFormat);
    }
    let mut r = PatchReader::at(patch, HEADER.len());
    let mut out = source.to_vec();
    // A missing end marker is tolerated
    while r.remaining() >= 3 {
        let ofs = r.be(3)? as usize;
        if ofs as u32 == EOF_MARKER {
            if r.remaining() >= 3 {
                out.truncate(r.be(3)? as usize);
            }
            break;
        }
        let len = r.be(2)? as usize;
        if len == 0 {
            let run = r.be(2)? as usize;
            let fill = r.u8()?;
            if out.len() < ofs + run {
                out.resize(ofs + run, 0);
            }
            out[ofs..ofs + run].fill(fill);
        } else {
            let data = r.bytes(len)?;
            if out.len() < ofs + len {
                out.resize(ofs + len, 0);
            }
            out[ofs..ofs + len].copy_from_slice(data);
        }
    }
    Ok(out)
}
