//! Copy-on-write union of a read-only drive and a writable drive.
//!
//! Lookups go through the modification log first, then the writable `over`
//! drive, then the `under` drive. Changes only ever touch `over` and the log:
//! - Files of `under` opened for writing are copied into `over` on the first write
//! - Deleting an entry of `under` leaves a `Delete` record
//! - Renaming an entry of `under` leaves a redirect record
//!
//! With a save path configured, every change arms the save timer; the host pumps
//! it with [`UnionDrive::poll_save`].

use std::time::Instant;

use tracing::{debug, info, warn};

use super::modlog::{EntryKind, ModLog, Modification};
use super::save::{load_save, write_save, SaveStats};
use super::timer::SaveTimer;
use crate::config::UnionConfig;
use crate::error::{CoreResult, DosError, DriveResult};
use crate::fs::drive::*;
use crate::fs::path::{canonical_path, is_inside, join_path, split_parent, wild_file_cmp};
use crate::fs::{DriveSession, MemoryDrive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Under,
    Over,
}

struct UnionHandle {
    path: String,
    side: Side,
    /// `None` once a failed copy-up dropped the file.
    inner: Option<FileHandle>,
    flags: u32,
    copy_on_write: bool,
    dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Under,
    Over,
    Redirects,
}

#[derive(Clone)]
struct UnionSearch {
    dir: String,
    dots: u8,
    phase: Phase,
    /// Search running on `under` or `over`.
    inner: Option<Dta>,
    /// Log slots visited, counted from the end.
    mod_index: usize,
}

/// Create every missing parent directory of `path`.
fn create_parent_dirs(drive: &mut dyn Drive, path: &str) {
    for (i, _) in path.match_indices('\\') {
        let dir = &path[..i];
        if !drive.test_dir(dir) {
            let _ = drive.make_dir(dir);
        }
    }
}

fn copy_handle(src: &mut dyn Drive, from: FileHandle, dst: &mut dyn Drive, to: FileHandle) -> DriveResult<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = src.file_read(from, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        write_all(dst, to, &buf[..n])?;
    }
}

/// Writable union drive over a read-only drive.
pub struct UnionDrive {
    under: Box<dyn Drive>,
    over: Box<dyn Drive>,
    mods: ModLog,
    session: DriveSession<UnionHandle, UnionSearch>,
    writable: bool,
    config: UnionConfig,
    timer: SaveTimer,
    save_size: u64,
    dirty: bool,
    /// Set after a failed save until the next one succeeds.
    save_failing: bool,
}

impl UnionDrive {
    /// Union with a fresh in-memory overlay and no persistence.
    pub fn new(under: impl Drive + 'static) -> Self {
        Self::with_over(under, MemoryDrive::new())
    }

    /// Union over an explicit writable drive. The union is read-only when
    /// `over` reports no free space.
    pub fn with_over(under: impl Drive + 'static, over: impl Drive + 'static) -> Self {
        Self::build(Box::new(under), Box::new(over), UnionConfig::default(), ModLog::new(), 0)
    }

    /// Union whose changes persist in `config.save_path`, restoring an existing save.
    pub fn with_save(under: impl Drive + 'static, config: UnionConfig) -> CoreResult<Self> {
        let (over, mods, size) = match &config.save_path {
            Some(path) => {
                let loaded = load_save(path, config.strict)?;
                info!(
                    path = %path.display(),
                    bytes = loaded.size,
                    modifications = loaded.mods.len(),
                    "loaded union save"
                );
                (loaded.drive, loaded.mods, loaded.size)
            }
            None => (MemoryDrive::new(), ModLog::new(), 0),
        };
        Ok(Self::build(Box::new(under), Box::new(over), config, mods, size))
    }

    fn build(under: Box<dyn Drive>, mut over: Box<dyn Drive>, config: UnionConfig, mods: ModLog, save_size: u64) -> Self {
        let writable = over.allocation_info().free_clusters > 0;
        Self {
            under,
            over,
            mods,
            session: DriveSession::new(),
            writable,
            config,
            timer: SaveTimer::new(),
            save_size,
            dirty: false,
            save_failing: false,
        }
    }

    pub fn modifications(&self) -> &ModLog {
        &self.mods
    }

    /// The writable drive holding all changed files.
    pub fn over_mut(&mut self) -> &mut dyn Drive {
        &mut *self.over
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// True while changes are waiting to be saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Deadline of the pending save, if any.
    pub fn save_due(&self) -> Option<Instant> {
        self.timer.due()
    }

    /// Run the scheduled save once its deadline has passed. Returns true if a
    /// save was written; a failed save is retried later.
    pub fn poll_save(&mut self, now: Instant) -> bool {
        self.timer.fire_if_due(now) && self.save_now().is_ok_and(|s| s.is_some())
    }

    /// Save immediately. Returns `None` without a save path.
    pub fn save_now(&mut self) -> CoreResult<Option<SaveStats>> {
        let Some(path) = self.config.save_path.clone() else {
            return Ok(None);
        };
        self.timer.cancel();
        match write_save(&path, &mut *self.over, &self.mods) {
            Ok(stats) => {
                self.save_size = stats.content_size;
                self.dirty = false;
                self.save_failing = false;
                info!(
                    path = %path.display(),
                    members = stats.members,
                    written = stats.bytes_written,
                    unchanged = stats.bytes_unchanged,
                    "saved filesystem changes"
                );
                Ok(Some(stats))
            }
            Err(e) => {
                if self.save_failing {
                    debug!(path = %path.display(), error = %e, "save retry failed");
                } else {
                    warn!(path = %path.display(), error = %e, "saving filesystem changes failed, will retry");
                }
                self.save_failing = true;
                self.timer.schedule(Instant::now(), self.config.retry_delay());
                Err(e)
            }
        }
    }

    fn schedule_save(&mut self) {
        if self.config.save_path.is_none() {
            return;
        }
        let delay = self.config.save_delay(self.save_size);
        self.timer.schedule(Instant::now(), delay);
        if !self.dirty {
            debug!(delay_ms = delay.as_millis() as u64, "save scheduled");
        }
        self.dirty = true;
    }

    fn side(&mut self, side: Side) -> &mut dyn Drive {
        match side {
            Side::Under => &mut *self.under,
            Side::Over => &mut *self.over,
        }
    }

    /// Path of `path` on the under drive, following renamed parent directories.
    /// `None` if a parent directory was deleted.
    fn under_path(&self, path: &str) -> Option<String> {
        let mut end = path.len();
        while let Some(i) = path[..end].rfind('\\') {
            end = i;
            match self.mods.get(&path[..end]) {
                Some(Modification::Delete) => return None,
                Some(Modification::Redirect {
                    kind: EntryKind::Dir,
                    source,
                }) => return Some(format!("{}{}", source, &path[end..])),
                _ => {}
            }
        }
        Some(path.to_string())
    }

    /// Directory of `under` whose entries show up in `dir`.
    fn under_dir(&self, dir: &str) -> Option<String> {
        match self.mods.get(dir) {
            Some(m) => m.redirect_source(EntryKind::Dir).map(str::to_string),
            None => self.under_path(dir),
        }
    }

    fn in_under(&mut self, path: &str) -> bool {
        match self.under_path(path) {
            Some(p) => self.under.file_exists(&p) || self.under.test_dir(&p),
            None => false,
        }
    }

    fn union_test(&mut self, path: &str, kind: EntryKind) -> bool {
        if path.is_empty() {
            return kind == EntryKind::Dir;
        }
        if let Some(m) = self.mods.get(path) {
            return m.redirect_kind() == Some(kind);
        }
        let under = self.under_path(path);
        match kind {
            EntryKind::File => {
                self.over.file_exists(path) || under.is_some_and(|p| self.under.file_exists(&p))
            }
            EntryKind::Dir => self.over.test_dir(path) || under.is_some_and(|p| self.under.test_dir(&p)),
        }
    }

    /// Returns (is file, exists in under) for an existing unmodified path.
    fn exists_in_over_or_under(&mut self, path: &str) -> Option<(bool, bool)> {
        let under = self.under_path(path);
        let file_in_under = under.as_ref().is_some_and(|p| self.under.file_exists(p));
        let dir_in_under = under.as_ref().is_some_and(|p| self.under.test_dir(p));
        let is_file = file_in_under || self.over.file_exists(path);
        let exists = is_file || dir_in_under || self.over.test_dir(path);
        exists.then_some((is_file, file_in_under || dir_in_under))
    }

    fn prepare_create(&mut self, path: &str, can_overwrite: bool) -> DriveResult<()> {
        if !self.writable || path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        match self.mods.get(path).map(Modification::is_delete) {
            None if can_overwrite || !self.in_under(path) => Ok(()),
            None => Err(DosError::FileAlreadyExists),
            Some(false) if !can_overwrite => Err(DosError::FileAlreadyExists),
            Some(_) => {
                self.mods.remove(path);
                Ok(())
            }
        }
    }

    /// Close every handle on `path` or below it.
    fn force_close(&mut self, path: &str) {
        let closed = self.session.force_close(|h| h.path == path || is_inside(&h.path, path));
        if !closed.is_empty() {
            debug!(path, count = closed.len(), "force closed handles");
        }
        for h in closed {
            if let Some(inner) = h.inner {
                let _ = self.side(h.side).file_close(inner);
            }
        }
    }

    fn remove_over(&mut self, path: &str, kind: EntryKind) -> DriveResult<()> {
        match kind {
            EntryKind::File => self.over.file_unlink(path),
            EntryKind::Dir => self.over.remove_dir(path),
        }
    }

    fn move_over(&mut self, old: &str, new: &str) {
        if self.over.file_exists(old) || self.over.test_dir(old) {
            create_parent_dirs(&mut *self.over, new);
            if let Err(e) = self.over.rename(old, new) {
                warn!(old, new, error = %e, "failed to move overlay entry");
            }
        }
    }

    fn union_unlink(&mut self, path: &str, kind: EntryKind) -> DriveResult<()> {
        if !self.writable || path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        match self.mods.get(path).map(Modification::redirect_kind) {
            Some(found) if found != Some(kind) => return Err(DosError::FileNotFound),
            Some(_) => {
                self.force_close(path);
                let _ = self.remove_over(path, kind);
                if self.in_under(path) {
                    self.mods.put(path, Modification::Delete);
                } else {
                    self.mods.remove(path);
                }
                self.schedule_save();
                return Ok(());
            }
            None => {}
        }

        let in_over = match kind {
            EntryKind::File => self.over.file_exists(path),
            EntryKind::Dir => self.over.test_dir(path),
        };
        let under = self.under_path(path);
        let in_under = under.is_some_and(|p| match kind {
            EntryKind::File => self.under.file_exists(&p),
            EntryKind::Dir => self.under.test_dir(&p),
        });
        if !in_over && !in_under {
            return Err(DosError::FileNotFound);
        }
        self.force_close(path);
        if in_over {
            self.remove_over(path, kind)?;
        }
        if in_under || self.in_under(path) {
            self.mods.put(path, Modification::Delete);
        }
        self.schedule_save();
        Ok(())
    }

    /// Copy an under file into `over` for a copy-on-write handle. Returns false
    /// when the write is a no-op truncation at the end of the file.
    fn copy_up(&mut self, handle: FileHandle, truncating: bool) -> DriveResult<bool> {
        let (path, inner) = {
            let h = self.session.handle(handle)?;
            (h.path.clone(), h.inner.ok_or(DosError::InvalidHandle)?)
        };
        let pos = self.under.file_seek(inner, 0, SeekMode::Cur)?;
        if truncating && self.under.file_seek(inner, 0, SeekMode::End)? == pos {
            return Ok(false);
        }
        self.under.file_seek(inner, 0, SeekMode::Set)?;

        let copy = match self.over.file_create(&path, ATTR_ARCHIVE) {
            Ok(h) => h,
            Err(_) => {
                create_parent_dirs(&mut *self.over, &path);
                self.over.file_create(&path, ATTR_ARCHIVE).map_err(|_| DosError::AccessDenied)?
            }
        };
        let copied = copy_handle(&mut *self.under, inner, &mut *self.over, copy);
        let _ = self.under.file_close(inner);
        if let Err(e) = copied {
            warn!(path = %path, error = %e, "copy on write failed");
            let _ = self.over.file_close(copy);
            let _ = self.over.file_unlink(&path);
            self.session.handle_mut(handle)?.inner = None;
            return Err(DosError::AccessDenied);
        }
        self.over.file_seek(copy, pos as i64, SeekMode::Set)?;
        // The copy now shadows whatever the path was redirected to
        self.mods.remove(&path);

        let h = self.session.handle_mut(handle)?;
        h.side = Side::Over;
        h.inner = Some(copy);
        h.copy_on_write = false;
        debug!(path = %path, "copied file to overlay on first write");
        Ok(true)
    }

    fn next_from_side(&mut self, side: Side, s: &mut UnionSearch, dta: &Dta) -> Option<FoundEntry> {
        loop {
            let res = match s.inner.as_mut() {
                Some(inner) => self.side(side).find_next(inner),
                None => {
                    let dir = match side {
                        Side::Under => self.under_dir(&s.dir)?,
                        Side::Over => s.dir.clone(),
                    };
                    let mut inner = Dta::new(dta.search_attr, &dta.pattern);
                    let res = self.side(side).find_first(&dir, &mut inner);
                    s.inner = Some(inner);
                    res
                }
            };
            res.ok()?;
            let found = s.inner.as_ref()?.result.clone();
            if found.attr as u16 & ATTR_VOLUME != 0 || found.is_dot() {
                continue;
            }
            if side == Side::Under {
                let path = join_path(&s.dir, &found.name);
                if self.mods.get(&path).is_some() || self.over.file_exists(&path) || self.over.test_dir(&path) {
                    continue;
                }
            }
            return Some(found);
        }
    }

    fn next_redirect(&mut self, s: &mut UnionSearch, dta: &Dta) -> Option<FoundEntry> {
        // Reverse slot order keeps deleting matches during a search stable
        while s.mod_index < self.mods.capacity() {
            let slot = self.mods.capacity() - 1 - s.mod_index;
            s.mod_index += 1;
            let Some((target, Modification::Redirect { source, .. })) = self.mods.get_at_index(slot) else {
                continue;
            };
            let (parent, name) = split_parent(target);
            if parent != s.dir || !wild_file_cmp(name, &dta.pattern) {
                continue;
            }
            let (path, name, source) = (target.to_string(), name.to_string(), source.clone());
            if self.over.file_exists(&path) || self.over.test_dir(&path) {
                continue;
            }
            let Ok(stat) = self.under.file_stat(&source) else {
                continue;
            };
            if attr_hidden_from(dta.search_attr, stat.attr) {
                continue;
            }
            return Some(FoundEntry {
                name,
                size: stat.size,
                date: stat.date,
                time: stat.time,
                attr: stat.attr as u8,
            });
        }
        None
    }
}

impl Drive for UnionDrive {
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle> {
        check_access_code(flags)?;
        let path = canonical_path(path);
        if path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        let source = match self.mods.get(&path) {
            Some(m) => Some(m.redirect_source(EntryKind::File).ok_or(DosError::FileNotFound)?.to_string()),
            None => None,
        };

        if open_is_writing(flags) {
            if !self.writable {
                return Err(DosError::AccessDenied);
            }
            if let Ok(inner) = self.over.file_open(&path, flags) {
                return Ok(self.session.open(UnionHandle {
                    path,
                    side: Side::Over,
                    inner: Some(inner),
                    flags,
                    copy_on_write: false,
                    dirty: false,
                }));
            }
            if self.over.test_dir(&path) {
                return Err(DosError::FileNotFound);
            }
            let under_path = source.clone().or_else(|| self.under_path(&path)).ok_or(DosError::FileNotFound)?;
            let inner = match self.under.file_open(&under_path, OPEN_READ) {
                Ok(h) => h,
                Err(_) => {
                    if source.is_some() {
                        // Redirect source vanished
                        self.mods.remove(&path);
                    }
                    return Err(DosError::FileNotFound);
                }
            };
            return Ok(self.session.open(UnionHandle {
                path,
                side: Side::Under,
                inner: Some(inner),
                flags,
                copy_on_write: true,
                dirty: false,
            }));
        }

        let (side, inner) = match source {
            Some(source) => (Side::Under, self.under.file_open(&source, flags)?),
            None => match self.over.file_open(&path, flags) {
                Ok(h) => (Side::Over, h),
                Err(_) => {
                    let under_path = self.under_path(&path).ok_or(DosError::FileNotFound)?;
                    (Side::Under, self.under.file_open(&under_path, flags)?)
                }
            },
        };
        Ok(self.session.open(UnionHandle {
            path,
            side,
            inner: Some(inner),
            flags,
            copy_on_write: false,
            dirty: false,
        }))
    }

    fn file_create(&mut self, path: &str, attr: u16) -> DriveResult<FileHandle> {
        let path = canonical_path(path);
        if attr & ATTR_DIRECTORY != 0 || path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        let (parent, _) = split_parent(&path);
        if !self.union_test(parent, EntryKind::Dir) {
            return Err(DosError::PathNotFound);
        }
        self.prepare_create(&path, true)?;
        self.force_close(&path);
        let inner = match self.over.file_create(&path, attr) {
            Ok(h) => h,
            Err(_) => {
                create_parent_dirs(&mut *self.over, &path);
                self.over.file_create(&path, attr).map_err(|_| DosError::AccessDenied)?
            }
        };
        self.schedule_save();
        Ok(self.session.open(UnionHandle {
            path,
            side: Side::Over,
            inner: Some(inner),
            flags: OPEN_READWRITE,
            copy_on_write: false,
            dirty: false,
        }))
    }

    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
        let h = self.session.handle(handle)?;
        if !open_is_reading(h.flags) {
            return Err(DosError::AccessDenied);
        }
        let (side, inner) = (h.side, h.inner.ok_or(DosError::InvalidHandle)?);
        self.side(side).file_read(inner, buf)
    }

    fn file_write(&mut self, handle: FileHandle, data: &[u8]) -> DriveResult<usize> {
        let h = self.session.handle(handle)?;
        if !open_is_writing(h.flags) {
            return Err(DosError::AccessDenied);
        }
        if h.copy_on_write && !self.copy_up(handle, data.is_empty())? {
            return Ok(0);
        }
        let h = self.session.handle_mut(handle)?;
        h.dirty = true;
        let (side, inner) = (h.side, h.inner.ok_or(DosError::InvalidHandle)?);
        self.side(side).file_write(inner, data)
    }

    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32> {
        let h = self.session.handle(handle)?;
        let (side, inner) = (h.side, h.inner.ok_or(DosError::InvalidHandle)?);
        self.side(side).file_seek(inner, offset, mode)
    }

    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat> {
        let h = self.session.handle(handle)?;
        let (side, inner) = (h.side, h.inner.ok_or(DosError::InvalidHandle)?);
        self.side(side).file_info(inner)
    }

    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.add_ref(handle)
    }

    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()> {
        let h = self.session.handle_mut(handle)?;
        if std::mem::take(&mut h.dirty) {
            self.schedule_save();
        }
        if let Some(h) = self.session.release(handle)? {
            if let Some(inner) = h.inner {
                self.side(h.side).file_close(inner)?;
            }
        }
        Ok(())
    }

    fn file_unlink(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        self.union_unlink(&path, EntryKind::File)
    }

    fn make_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        let (parent, _) = split_parent(&path);
        if !path.is_empty() && !self.union_test(parent, EntryKind::Dir) {
            return Err(DosError::PathNotFound);
        }
        self.prepare_create(&path, false)?;
        create_parent_dirs(&mut *self.over, &path);
        self.over.make_dir(&path)?;
        self.schedule_save();
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        if path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        if !self.union_test(&path, EntryKind::Dir) {
            return Err(DosError::PathNotFound);
        }
        if !list_dir(self, &path, SEARCH_ALL_FILES)?.is_empty() {
            return Err(DosError::AccessDenied);
        }
        self.union_unlink(&path, EntryKind::Dir)
    }

    fn test_dir(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        self.union_test(&path, EntryKind::Dir)
    }

    fn find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()> {
        let dir = canonical_path(dir);
        if !self.union_test(&dir, EntryKind::Dir) {
            return Err(DosError::PathNotFound);
        }
        let label = self.under.label().to_string();
        dta.dir_id = self.session.start_search(UnionSearch {
            dir: dir.clone(),
            dots: 0,
            phase: Phase::Under,
            inner: None,
            mod_index: 0,
        });
        if find_drive_volume(&label, &dir, dta) {
            return Ok(());
        }
        self.find_next(dta)
    }

    fn find_next(&mut self, dta: &mut Dta) -> DriveResult<()> {
        let id = dta.dir_id;
        let mut s = self.session.search_mut(id)?.clone();

        let mut found = None;
        while s.dots < 2 && found.is_none() {
            let dotted = if s.dots == 0 { "." } else { ".." };
            s.dots += 1;
            if s.dir.is_empty() {
                continue;
            }
            // Both dot entries report the searched directory itself
            let Ok(stat) = self.file_stat(&s.dir) else {
                continue;
            };
            if !dta.skips(dotted, stat.attr) {
                found = Some(FoundEntry {
                    name: dotted.to_string(),
                    size: 0,
                    date: stat.date,
                    time: stat.time,
                    attr: stat.attr as u8,
                });
            }
        }
        while found.is_none() {
            found = match s.phase {
                Phase::Under => self.next_from_side(Side::Under, &mut s, dta),
                Phase::Over => self.next_from_side(Side::Over, &mut s, dta),
                Phase::Redirects => match self.next_redirect(&mut s, dta) {
                    Some(entry) => Some(entry),
                    None => return self.session.end_search(id),
                },
            };
            if found.is_none() {
                s.inner = None;
                s.phase = match s.phase {
                    Phase::Under => Phase::Over,
                    _ => Phase::Redirects,
                };
            }
        }
        *self.session.search_mut(id)? = s;
        if let Some(entry) = found {
            dta.result = entry;
        }
        Ok(())
    }

    fn get_file_attr(&mut self, path: &str) -> DriveResult<u16> {
        self.file_stat(path).map(|s| s.attr)
    }

    fn file_stat(&mut self, path: &str) -> DriveResult<FileStat> {
        let path = canonical_path(path);
        if path.is_empty() {
            // Root timestamps come from the base drive
            return self.under.file_stat("");
        }
        match self.mods.get(&path) {
            Some(Modification::Delete) => Err(DosError::FileNotFound),
            Some(Modification::Redirect { source, .. }) => {
                let source = source.clone();
                self.under.file_stat(&source)
            }
            None => match self.over.file_stat(&path) {
                Ok(stat) => Ok(stat),
                Err(_) => {
                    let under = self.under_path(&path).ok_or(DosError::FileNotFound)?;
                    self.under.file_stat(&under)
                }
            },
        }
    }

    fn file_exists(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        self.union_test(&path, EntryKind::File)
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> DriveResult<()> {
        let old = canonical_path(old_path);
        let new = canonical_path(new_path);
        if !self.writable || old.is_empty() || new.is_empty() {
            return Err(DosError::AccessDenied);
        }
        if old == new {
            return Ok(());
        }
        let old_m = self.mods.get(&old).cloned();
        let new_is_deleted = match self.mods.get(&new) {
            Some(Modification::Delete) => true,
            Some(_) => return Err(DosError::FileAlreadyExists),
            None => false,
        };
        let (is_file, in_under) = match &old_m {
            Some(Modification::Delete) => return Err(DosError::FileNotFound),
            Some(Modification::Redirect { kind, .. }) => (*kind == EntryKind::File, false),
            None => self.exists_in_over_or_under(&old).ok_or(DosError::FileNotFound)?,
        };
        if !new_is_deleted && self.exists_in_over_or_under(&new).is_some() {
            return Err(DosError::FileAlreadyExists);
        }
        let (old_parent, _) = split_parent(&old);
        let (new_parent, _) = split_parent(&new);
        if !self.union_test(new_parent, EntryKind::Dir) {
            return Err(DosError::PathNotFound);
        }
        if !is_file && old_parent != new_parent {
            // Directories only rename in place
            return Err(DosError::AccessDenied);
        }

        self.force_close(&old);
        self.schedule_save();
        if new_is_deleted {
            self.mods.remove(&new);
        }
        if let Some(Modification::Redirect { kind, source }) = old_m {
            self.mods.remove(&old);
            self.move_over(&old, &new);
            if self.under_path(&new).as_deref() != Some(source.as_str()) {
                self.mods.put(&new, Modification::redirect(kind, source));
            }
            return Ok(());
        }

        let kind = if is_file { EntryKind::File } else { EntryKind::Dir };
        let in_over = if is_file { self.over.file_exists(&old) } else { self.over.test_dir(&old) };
        let source = self.under_path(&old);
        if in_over {
            create_parent_dirs(&mut *self.over, &new);
            self.over.rename(&old, &new)?;
        }
        if in_under {
            self.mods.put(&old, Modification::Delete);
            // A directory's under entries follow it even when over moved too
            if let Some(source) = source.filter(|_| !in_over || !is_file) {
                self.mods.put(&new, Modification::redirect(kind, source));
            }
        }
        Ok(())
    }

    fn allocation_info(&mut self) -> AllocationInfo {
        let u = self.under.allocation_info();
        let o = self.over.allocation_info();
        let bytes = |i: &AllocationInfo, clusters: u16| clusters as u64 * i.sectors_per_cluster as u64 * i.bytes_per_sector as u64;
        let bytes_per_sector = u.bytes_per_sector.max(o.bytes_per_sector);
        let sectors_per_cluster = u.sectors_per_cluster.max(o.sectors_per_cluster);
        let cluster = (bytes_per_sector as u64 * sectors_per_cluster as u64).max(1);
        let total = bytes(&u, u.total_clusters).max(bytes(&o, o.total_clusters)) / cluster;
        let free = bytes(&o, o.free_clusters) / cluster;
        AllocationInfo {
            bytes_per_sector,
            sectors_per_cluster,
            total_clusters: total.min(u16::MAX as u64) as u16,
            free_clusters: free.min(u16::MAX as u64) as u16,
        }
    }

    fn get_long_file_name(&mut self, path: &str) -> Option<String> {
        let path = canonical_path(path);
        match self.mods.get(&path) {
            Some(Modification::Delete) => None,
            Some(Modification::Redirect { source, .. }) => {
                let source = source.clone();
                self.under.get_long_file_name(&source)
            }
            None => match self.over.get_long_file_name(&path) {
                Some(long) => Some(long),
                None => {
                    let under = self.under_path(&path)?;
                    self.under.get_long_file_name(&under)
                }
            },
        }
    }

    fn media_byte(&self) -> u8 {
        self.over.media_byte()
    }

    fn label(&self) -> &str {
        self.under.label()
    }

    fn unmount(&mut self) -> DriveResult<()> {
        for h in self.session.close_all() {
            if let Some(inner) = h.inner {
                let _ = self.side(h.side).file_close(inner);
            }
        }
        if self.dirty {
            self.save_now().map_err(|_| DosError::AccessDenied)?;
        }
        self.under.unmount()?;
        self.over.unmount()
    }
}

impl Drop for UnionDrive {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.save_now();
        }
    }
}
