//! DOS virtual drive layer
//!
//! This crate provides the file system backends a DOS emulator mounts as drives:
//! - `fs`: the `Drive` contract, in-memory and mirrored drives, path helpers
//! - `zip`: read-only drives backed by ZIP archives, with their decompressors
//! - `patch`: XOR/IPS/BPS/VCDIFF appliers and a layered, patched drive
//! - `union`: a writable overlay whose changes persist in a ZIP save
//! - `fat`: a sector-level FAT12/16/32 disk synthesized from any drive
//!
//! # Architecture
//!
//! Drives stack: a `ZipDrive` holds the game, a `PatchDrive` applies patches
//! and variants on top, a `UnionDrive` records changes, and a `FatBlockDevice`
//! presents the result to guests that want raw disk sectors. `MountConfig`
//! builds such a stack from a JSON description.

pub mod config;
pub mod error;
pub mod fat;
pub mod fs;
mod mount;
pub mod patch;
pub mod union;
pub mod zip;

pub use config::{FatConfig, LayerConfig, MountConfig, UnionConfig, ZipConfig};
pub use error::{CoreError, CoreResult, DosError, DriveResult, PatchError};
pub use fat::{DifferencingDisk, DiscardDisk, FatBlockDevice, SectorStore};
pub use fs::{canonical_path, make_8dot3, Drive, MemoryDrive, MirrorDrive};
pub use patch::{apply_patch, PatchDrive, PatchLayer};
pub use union::UnionDrive;
pub use zip::ZipDrive;
