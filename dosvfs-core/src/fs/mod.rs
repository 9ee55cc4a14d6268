//! Virtual drive abstractions.
//!
//! This module provides the drive contract and the plain drives built on it:
//! - `Drive`: the filesystem interface every drive implements
//! - `MemoryDrive`: RAM-backed drive with a full directory tree
//! - `MirrorDrive`: exposes a subdirectory of another drive under a mount point
//! - `HashDirectory`: the name table used for directory contents
//! - `DriveSession`: open-file and search id tables

pub mod drive;
pub mod hash_dir;
mod memory_drive;
mod mirror_drive;
pub mod path;
mod session;
mod walk;

pub use drive::*;
pub use hash_dir::HashDirectory;
pub use memory_drive::MemoryDrive;
pub use mirror_drive::MirrorDrive;
pub use path::{canonical_path, join_path, make_8dot3, split_parent};
pub use session::DriveSession;
pub use walk::{collect_tree, walk_drive, WalkEntry};
