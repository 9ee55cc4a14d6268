//! Per-drive tables of open files and running directory searches.
//!
//! Ids are recycled through a free list so they stay small, like DOS expects.

use crate::error::{DosError, DriveResult};

use super::drive::FileHandle;

/// Slot table with id reuse.
#[derive(Debug)]
struct IdTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<u16>,
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> IdTable<T> {
    fn insert(&mut self, val: T) -> u16 {
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(val);
                id
            }
            None => {
                self.slots.push(Some(val));
                (self.slots.len() - 1) as u16
            }
        }
    }

    fn remove(&mut self, id: u16) -> Option<T> {
        let val = self.slots.get_mut(id as usize)?.take()?;
        self.free.push(id);
        Some(val)
    }
}

struct OpenFile<H> {
    refs: u32,
    state: H,
}

/// Open-file and search tables owned by one drive instance.
pub struct DriveSession<H, S> {
    files: IdTable<OpenFile<H>>,
    searches: IdTable<S>,
}

impl<H, S> Default for DriveSession<H, S> {
    fn default() -> Self {
        Self {
            files: IdTable::default(),
            searches: IdTable::default(),
        }
    }
}

impl<H, S> DriveSession<H, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened file with one reference.
    pub fn open(&mut self, state: H) -> FileHandle {
        FileHandle(self.files.insert(OpenFile { refs: 1, state }))
    }

    pub fn handle(&self, handle: FileHandle) -> DriveResult<&H> {
        match self.files.slots.get(handle.0 as usize) {
            Some(Some(f)) => Ok(&f.state),
            _ => Err(DosError::InvalidHandle),
        }
    }

    pub fn handle_mut(&mut self, handle: FileHandle) -> DriveResult<&mut H> {
        match self.files.slots.get_mut(handle.0 as usize) {
            Some(Some(f)) => Ok(&mut f.state),
            _ => Err(DosError::InvalidHandle),
        }
    }

    pub fn add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        match self.files.slots.get_mut(handle.0 as usize) {
            Some(Some(f)) => {
                f.refs += 1;
                Ok(())
            }
            _ => Err(DosError::InvalidHandle),
        }
    }

    /// Drop one reference. Returns the file state once the last reference is gone.
    pub fn release(&mut self, handle: FileHandle) -> DriveResult<Option<H>> {
        let f = match self.files.slots.get_mut(handle.0 as usize) {
            Some(Some(f)) => f,
            _ => return Err(DosError::InvalidHandle),
        };
        f.refs -= 1;
        if f.refs > 0 {
            return Ok(None);
        }
        Ok(self.files.remove(handle.0).map(|f| f.state))
    }

    /// Close every open file matching `pred` regardless of its reference count.
    pub fn force_close(&mut self, pred: impl Fn(&H) -> bool) -> Vec<H> {
        let ids: Vec<u16> = self
            .files
            .slots
            .iter()
            .enumerate()
            .filter(|(_, f)| f.as_ref().is_some_and(|f| pred(&f.state)))
            .map(|(i, _)| i as u16)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.files.remove(id).map(|f| f.state))
            .collect()
    }

    /// Close all open files.
    pub fn close_all(&mut self) -> Vec<H> {
        self.force_close(|_| true)
    }

    pub fn open_files(&self) -> impl Iterator<Item = &H> {
        self.files.slots.iter().flatten().map(|f| &f.state)
    }

    pub fn open_count(&self) -> usize {
        self.open_files().count()
    }

    /// Register a search, returning its DTA directory id.
    pub fn start_search(&mut self, state: S) -> u16 {
        self.searches.insert(state)
    }

    /// State of a running search. Ids that were never issued are `AccessDenied`,
    /// finished searches are `NoMoreFiles`.
    pub fn search_mut(&mut self, id: u16) -> DriveResult<&mut S> {
        match self.searches.slots.get_mut(id as usize) {
            None => Err(DosError::AccessDenied),
            Some(None) => Err(DosError::NoMoreFiles),
            Some(Some(s)) => Ok(s),
        }
    }

    /// Finish a search and recycle its id.
    pub fn end_search(&mut self, id: u16) -> DriveResult<()> {
        self.searches.remove(id);
        Err(DosError::NoMoreFiles)
    }
}
