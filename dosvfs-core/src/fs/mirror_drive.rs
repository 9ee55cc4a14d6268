//! Path-rewriting drive that exposes another drive under a different root.
//!
//! - `mount_point` is stripped from incoming paths (the underlying drive appears inside it)
//! - `sub_dir` is prepended (a subdirectory of the underlying drive becomes the root)
//! - Bookkeeping files always resolve at the real root of the underlying drive

use super::drive::*;
use super::path::{canonical_path, is_inside, join_path};
use crate::error::{DosError, DriveResult};

/// Names that bypass path rewriting.
pub const MIRROR_BYPASS_NAMES: [&str; 2] = ["AUTOBOOT.DBP", "DOS.YML"];

/// Search id of the synthesized mount point listing.
const SEARCH_MOUNT_POINT: u16 = 0xEEEE;
/// Search id after the synthesized entry was reported.
const SEARCH_MOUNT_DONE: u16 = 0xEEEF;

const MOUNT_POINT_DATE: u16 = 8600;
const MOUNT_POINT_TIME: u16 = 48128;

/// Drive that rewrites every path and delegates to `under`.
pub struct MirrorDrive<D: Drive> {
    under: D,
    mount_point: String,
    sub_dir: String,
    pending_child: Option<String>,
}

impl<D: Drive> MirrorDrive<D> {
    /// `mount_point` and `sub_dir` are DOS paths; either may be empty.
    pub fn new(under: D, mount_point: &str, sub_dir: &str) -> Self {
        Self {
            under,
            mount_point: canonical_path(mount_point).trim_end_matches('\\').to_string(),
            sub_dir: canonical_path(sub_dir).trim_end_matches('\\').to_string(),
            pending_child: None,
        }
    }

    pub fn under(&self) -> &D {
        &self.under
    }

    pub fn under_mut(&mut self) -> &mut D {
        &mut self.under
    }

    pub fn into_inner(self) -> D {
        self.under
    }

    /// Rewrite a logical path into a path of the underlying drive.
    fn fix_path(&self, path: &str, is_dir: bool, can_be_root: bool) -> DriveResult<String> {
        let path = canonical_path(path);
        if MIRROR_BYPASS_NAMES.contains(&path.as_str()) {
            return Ok(path);
        }
        let rest = if self.mount_point.is_empty() {
            path.as_str()
        } else if path == self.mount_point && can_be_root {
            ""
        } else if is_inside(&path, &self.mount_point) {
            &path[self.mount_point.len() + 1..]
        } else if is_dir {
            return Err(DosError::PathNotFound);
        } else {
            return Err(DosError::FileNotFound);
        };
        if self.sub_dir.is_empty() {
            return Ok(rest.to_string());
        }
        if (!can_be_root && rest.is_empty()) || self.sub_dir.len() + 1 + rest.len() >= DOS_PATHLENGTH {
            return Err(DosError::AccessDenied);
        }
        if rest.is_empty() {
            Ok(self.sub_dir.clone())
        } else {
            Ok(join_path(&self.sub_dir, rest))
        }
    }

    /// Next mount point component when `dir` is a strict ancestor of the mount point.
    fn mount_child(&self, dir: &str) -> Option<String> {
        if self.mount_point.is_empty() || !is_inside(&self.mount_point, dir) {
            return None;
        }
        let start = if dir.is_empty() { 0 } else { dir.len() + 1 };
        let rest = &self.mount_point[start..];
        Some(rest.split('\\').next().unwrap_or(rest).to_string())
    }
}

impl<D: Drive> Drive for MirrorDrive<D> {
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle> {
        check_access_code(flags)?;
        let path = self.fix_path(path, false, false)?;
        self.under.file_open(&path, flags)
    }

    fn file_create(&mut self, path: &str, attr: u16) -> DriveResult<FileHandle> {
        if attr & ATTR_DIRECTORY != 0 || canonical_path(path).is_empty() {
            return Err(DosError::AccessDenied);
        }
        let path = self.fix_path(path, false, false)?;
        self.under.file_create(&path, attr)
    }

    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
        self.under.file_read(handle, buf)
    }

    fn file_write(&mut self, handle: FileHandle, data: &[u8]) -> DriveResult<usize> {
        self.under.file_write(handle, data)
    }

    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32> {
        self.under.file_seek(handle, offset, mode)
    }

    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat> {
        self.under.file_info(handle)
    }

    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.under.file_add_ref(handle)
    }

    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.under.file_close(handle)
    }

    fn file_unlink(&mut self, path: &str) -> DriveResult<()> {
        let path = self.fix_path(path, false, false)?;
        self.under.file_unlink(&path)
    }

    fn make_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = self.fix_path(path, true, false)?;
        self.under.make_dir(&path)
    }

    fn remove_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = self.fix_path(path, true, false)?;
        self.under.remove_dir(&path)
    }

    fn test_dir(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        if self.mount_child(&path).is_some() {
            return true;
        }
        match self.fix_path(&path, true, true) {
            Ok(p) => self.under.test_dir(&p),
            Err(_) => false,
        }
    }

    fn find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()> {
        let dir = canonical_path(dir);
        if let Some(child) = self.mount_child(&dir) {
            self.pending_child = Some(child);
            dta.dir_id = SEARCH_MOUNT_POINT;
            if find_drive_volume(self.under.label(), &dir, dta) {
                return Ok(());
            }
            return self.find_next(dta);
        }
        let path = self.fix_path(&dir, true, true)?;
        self.under.find_first(&path, dta)
    }

    fn find_next(&mut self, dta: &mut Dta) -> DriveResult<()> {
        match dta.dir_id {
            SEARCH_MOUNT_POINT => {
                let child = self.pending_child.take().ok_or(DosError::NoMoreFiles)?;
                dta.dir_id = SEARCH_MOUNT_DONE;
                if dta.skips(&child, ATTR_DIRECTORY) || dta.search_attr as u16 & ATTR_DIRECTORY == 0 {
                    return Err(DosError::NoMoreFiles);
                }
                dta.set_result(&child, 0, MOUNT_POINT_DATE, MOUNT_POINT_TIME, ATTR_DIRECTORY);
                Ok(())
            }
            SEARCH_MOUNT_DONE => Err(DosError::NoMoreFiles),
            _ => self.under.find_next(dta),
        }
    }

    fn get_file_attr(&mut self, path: &str) -> DriveResult<u16> {
        let path = self.fix_path(path, false, false)?;
        self.under.get_file_attr(&path)
    }

    fn file_stat(&mut self, path: &str) -> DriveResult<FileStat> {
        let path = self.fix_path(path, false, false)?;
        self.under.file_stat(&path)
    }

    fn file_exists(&mut self, path: &str) -> bool {
        match self.fix_path(path, false, false) {
            Ok(p) => self.under.file_exists(&p),
            Err(_) => false,
        }
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> DriveResult<()> {
        let old_path = self.fix_path(old_path, false, false)?;
        let new_path = self.fix_path(new_path, false, false)?;
        self.under.rename(&old_path, &new_path)
    }

    fn allocation_info(&mut self) -> AllocationInfo {
        self.under.allocation_info()
    }

    fn get_long_file_name(&mut self, path: &str) -> Option<String> {
        let path = self.fix_path(path, false, false).ok()?;
        self.under.get_long_file_name(&path)
    }

    fn media_byte(&self) -> u8 {
        self.under.media_byte()
    }

    fn label(&self) -> &str {
        self.under.label()
    }

    fn unmount(&mut self) -> DriveResult<()> {
        self.under.unmount()
    }
}
