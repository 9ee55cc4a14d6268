//! ZIP archives as read-only drives.
//!
//! - `source`: random-access byte sources (host files, memory)
//! - `codec`: decoders for stored, shrunk, imploded and deflated members
//! - `zip_drive`: the drive built from the central directory

pub mod codec;
mod source;
mod zip_drive;

pub use codec::{MemberData, Unpacker};
pub use source::{ArchiveSource, SeekSource};
pub use zip_drive::ZipDrive;
