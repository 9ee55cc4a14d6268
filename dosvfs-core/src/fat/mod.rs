//! Block-device view of a drive for guests that read raw FAT sectors.
//!
//! - `layout`: FAT12/16/32 structures synthesized from a drive tree
//! - `diff`: sector stores capturing writes (differencing or discarding)
//! - `device`: the sector read/write surface tying both together

mod device;
mod diff;
mod layout;

pub use device::FatBlockDevice;
pub use diff::{DifferencingDisk, DiscardDisk, Sector, SectorStore, DIFF_MAGIC};
pub use layout::{
    lfn_checksum, short_name_from_long, size_tier, FatLayout, Regions, BYTES_PER_SECTOR, HEAD_COUNT, SECTORS_PER_TRACK,
    SECT_BOOT,
};
