//! In-memory drive implementation.
//!
//! Directories and files live in two arenas; directory tables map names to arena
//! ids and a drive-wide table maps full directory paths to directory ids.

use tracing::debug;

use super::drive::*;
use super::hash_dir::HashDirectory;
use super::path::{canonical_path, dos_now, is_inside, join_path, split_parent};
use super::session::DriveSession;
use crate::error::{DosError, DriveResult};

const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct EntryMeta {
    name: String,
    date: u16,
    time: u16,
    attr: u16,
}

impl EntryMeta {
    fn new(name: &str, attr: u16, date: u16, time: u16) -> Self {
        let (date, time) = if date == 0 && time == 0 { dos_now() } else { (date, time) };
        Self {
            name: name.to_string(),
            date,
            time,
            attr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    File(usize),
    Dir(usize),
}

struct MemFile {
    meta: EntryMeta,
    data: Vec<u8>,
}

struct MemDir {
    meta: EntryMeta,
    path: String,
    entries: HashDirectory<Node>,
}

struct MemHandle {
    file: usize,
    pos: u32,
    flags: u32,
}

struct MemSearch {
    dir: usize,
    index: usize,
}

fn alloc<T>(arena: &mut Vec<Option<T>>, val: T) -> usize {
    match arena.iter().position(|s| s.is_none()) {
        Some(i) => {
            arena[i] = Some(val);
            i
        }
        None => {
            arena.push(Some(val));
            arena.len() - 1
        }
    }
}

/// RAM-backed drive with a full directory tree.
pub struct MemoryDrive {
    files: Vec<Option<MemFile>>,
    dirs: Vec<Option<MemDir>>,
    directories: HashDirectory<usize>,
    session: DriveSession<MemHandle, MemSearch>,
    label: String,
}

impl Default for MemoryDrive {
    fn default() -> Self {
        let root = MemDir {
            meta: EntryMeta::new("", ATTR_VOLUME | ATTR_DIRECTORY, 0, 0),
            path: String::new(),
            entries: HashDirectory::new(),
        };
        Self {
            files: Vec::new(),
            dirs: vec![Some(root)],
            directories: HashDirectory::new(),
            session: DriveSession::new(),
            label: String::new(),
        }
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial files; parent directories are created as needed.
    pub fn with_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: AsRef<str>,
    {
        let mut drive = Self::new();
        for (path, data) in files {
            drive.add_file(path.as_ref(), data);
        }
        drive
    }

    /// Add a file (convenience method), creating missing parent directories.
    pub fn add_file(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        let path = canonical_path(path);
        let (parent, _) = split_parent(&path);
        self.make_dirs(parent);
        if let Ok(h) = self.file_create(&path, ATTR_ARCHIVE) {
            if let Ok(f) = self.session.handle(h).map(|h| h.file) {
                if let Some(file) = self.files[f].as_mut() {
                    file.data = data.into();
                }
            }
            let _ = self.file_close(h);
        }
    }

    /// Create a directory and all missing parents.
    pub fn make_dirs(&mut self, path: &str) {
        let mut prefix = String::new();
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            prefix = join_path(&prefix, part);
            if !self.test_dir(&prefix) {
                let _ = self.make_dir(&prefix);
            }
        }
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_ascii_uppercase();
    }

    fn dir(&self, id: usize) -> Option<&MemDir> {
        self.dirs.get(id).and_then(|d| d.as_ref())
    }

    fn dir_mut(&mut self, id: usize) -> Option<&mut MemDir> {
        self.dirs.get_mut(id).and_then(|d| d.as_mut())
    }

    fn file(&self, id: usize) -> Option<&MemFile> {
        self.files.get(id).and_then(|f| f.as_ref())
    }

    fn dir_id(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            Some(ROOT)
        } else {
            self.directories.get(path).copied()
        }
    }

    /// Resolve a path to (parent directory, node).
    fn lookup(&self, path: &str) -> (Option<usize>, Option<Node>) {
        if path.is_empty() {
            return (None, Some(Node::Dir(ROOT)));
        }
        let (parent, name) = split_parent(path);
        let parent_id = self.dir_id(parent);
        let node = parent_id
            .and_then(|p| self.dir(p))
            .and_then(|d| d.entries.get(name))
            .copied();
        (parent_id, node)
    }

    fn meta(&self, node: Node) -> Option<&EntryMeta> {
        match node {
            Node::File(f) => self.file(f).map(|f| &f.meta),
            Node::Dir(d) => self.dir(d).map(|d| &d.meta),
        }
    }

    fn stat_node(&self, node: Node) -> Option<FileStat> {
        let meta = self.meta(node)?;
        let size = match node {
            Node::File(f) => self.file(f).map_or(0, |f| f.data.len() as u32),
            Node::Dir(_) => 0,
        };
        Some(FileStat {
            attr: meta.attr,
            size,
            date: meta.date,
            time: meta.time,
        })
    }

    fn handle_file(&mut self, handle: FileHandle) -> DriveResult<(&mut MemHandle, &mut MemFile)> {
        let h = self.session.handle_mut(handle)?;
        let file = self
            .files
            .get_mut(h.file)
            .and_then(|f| f.as_mut())
            .ok_or(DosError::InvalidHandle)?;
        Ok((h, file))
    }

    /// Copy an entry (file with content, or empty directory) from another drive.
    pub fn clone_entry_from(&mut self, src: &mut dyn Drive, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        let stat = src.file_stat(&path)?;
        let (parent, name) = split_parent(&path);
        let parent_id = self.dir_id(parent).ok_or(DosError::PathNotFound)?;
        let meta = EntryMeta::new(name, stat.attr, stat.date, stat.time);
        let node = if stat.is_dir() {
            if let Some(id) = self.directories.get(&path).copied() {
                if let Some(d) = self.dir_mut(id) {
                    d.meta = meta;
                }
                return Ok(());
            }
            let id = alloc(
                &mut self.dirs,
                MemDir {
                    meta,
                    path: path.clone(),
                    entries: HashDirectory::new(),
                },
            );
            self.directories.put(&path, id);
            Node::Dir(id)
        } else {
            let data = if stat.size > 0 { read_file(src, &path)? } else { Vec::new() };
            Node::File(alloc(&mut self.files, MemFile { meta, data }))
        };
        if let Some(Node::File(old)) = self.dir(parent_id).and_then(|d| d.entries.get(name)).copied() {
            self.session.force_close(|h| h.file == old);
            self.files[old] = None;
        }
        if let Some(d) = self.dir_mut(parent_id) {
            d.entries.put(name, node);
        }
        Ok(())
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.session.open_count()
    }
}

impl Drive for MemoryDrive {
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle> {
        check_access_code(flags)?;
        let path = canonical_path(path);
        match self.lookup(&path).1 {
            Some(Node::File(file)) => Ok(self.session.open(MemHandle { file, pos: 0, flags })),
            _ => Err(DosError::FileNotFound),
        }
    }

    fn file_create(&mut self, path: &str, attr: u16) -> DriveResult<FileHandle> {
        let path = canonical_path(path);
        if attr & ATTR_DIRECTORY != 0 || path.is_empty() {
            return Err(DosError::AccessDenied);
        }
        let (parent, node) = self.lookup(&path);
        let parent = parent.ok_or(DosError::PathNotFound)?;
        let file = match node {
            Some(Node::Dir(_)) => return Err(DosError::AccessDenied),
            Some(Node::File(f)) => {
                if let Some(file) = self.files[f].as_mut() {
                    file.data.clear();
                }
                f
            }
            None => {
                let (_, name) = split_parent(&path);
                let f = alloc(
                    &mut self.files,
                    MemFile {
                        meta: EntryMeta::new(name, attr, 0, 0),
                        data: Vec::new(),
                    },
                );
                if let Some(d) = self.dir_mut(parent) {
                    d.entries.put(name, Node::File(f));
                }
                f
            }
        };
        Ok(self.session.open(MemHandle {
            file,
            pos: 0,
            flags: OPEN_READWRITE,
        }))
    }

    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
        let (h, file) = self.handle_file(handle)?;
        if !open_is_reading(h.flags) {
            return Err(DosError::AccessDenied);
        }
        let pos = h.pos as usize;
        if buf.is_empty() || pos >= file.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.data.len() - pos);
        buf[..n].copy_from_slice(&file.data[pos..pos + n]);
        h.pos += n as u32;
        Ok(n)
    }

    fn file_write(&mut self, handle: FileHandle, data: &[u8]) -> DriveResult<usize> {
        let (h, file) = self.handle_file(handle)?;
        if !open_is_writing(h.flags) {
            return Err(DosError::AccessDenied);
        }
        let pos = h.pos as usize;
        if data.is_empty() {
            file.data.resize(pos, 0);
            return Ok(0);
        }
        let end = pos + data.len();
        if end > file.data.len() {
            file.data.resize(end, 0);
        }
        file.data[pos..end].copy_from_slice(data);
        h.pos = end as u32;
        Ok(data.len())
    }

    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32> {
        let (h, file) = self.handle_file(handle)?;
        h.pos = mode.resolve(offset, h.pos, file.data.len() as u32);
        Ok(h.pos)
    }

    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat> {
        let file = self.session.handle(handle)?.file;
        self.stat_node(Node::File(file)).ok_or(DosError::InvalidHandle)
    }

    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.add_ref(handle)
    }

    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.release(handle).map(|_| ())
    }

    fn file_unlink(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        let (parent, node) = self.lookup(&path);
        let file = match (parent, node) {
            (Some(_), Some(Node::File(f))) => f,
            _ => return Err(DosError::FileNotFound),
        };
        if self.file(file).map_or(true, |f| f.meta.attr & ATTR_READ_ONLY != 0) {
            return Err(DosError::FileNotFound);
        }
        let closed = self.session.force_close(|h| h.file == file);
        if !closed.is_empty() {
            debug!(path = %path, count = closed.len(), "force closed handles on unlink");
        }
        let (_, name) = split_parent(&path);
        if let Some(d) = parent.and_then(|p| self.dir_mut(p)) {
            d.entries.remove(name);
        }
        self.files[file] = None;
        Ok(())
    }

    fn make_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        let (parent, node) = self.lookup(&path);
        if node.is_some() {
            return Err(DosError::FileAlreadyExists);
        }
        let parent = parent.ok_or(DosError::AccessDenied)?;
        let (_, name) = split_parent(&path);
        let id = alloc(
            &mut self.dirs,
            MemDir {
                meta: EntryMeta::new(name, ATTR_DIRECTORY, 0, 0),
                path: path.clone(),
                entries: HashDirectory::new(),
            },
        );
        if let Some(d) = self.dir_mut(parent) {
            d.entries.put(name, Node::Dir(id));
        }
        self.directories.put(&path, id);
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> DriveResult<()> {
        let path = canonical_path(path);
        let id = match self.directories.get(&path) {
            Some(&id) => id,
            None => return Err(DosError::PathNotFound),
        };
        if self.dir(id).map_or(false, |d| !d.entries.is_empty()) {
            return Err(DosError::AccessDenied);
        }
        let (parent, name) = split_parent(&path);
        if let Some(p) = self.dir_id(parent) {
            if let Some(d) = self.dir_mut(p) {
                d.entries.remove(name);
            }
        }
        self.directories.remove(&path);
        self.dirs[id] = None;
        Ok(())
    }

    fn test_dir(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        path.is_empty() || self.directories.contains(&path)
    }

    fn find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()> {
        let dir = canonical_path(dir);
        let id = self.dir_id(&dir).ok_or(DosError::PathNotFound)?;
        dta.dir_id = self.session.start_search(MemSearch { dir: id, index: 0 });
        if find_drive_volume(&self.label, &dir, dta) {
            return Ok(());
        }
        self.find_next(dta)
    }

    fn find_next(&mut self, dta: &mut Dta) -> DriveResult<()> {
        let id = dta.dir_id;
        let (dir_id, mut index) = {
            let s = self.session.search_mut(id)?;
            (s.dir, s.index)
        };
        let dir = match self.dirs.get(dir_id).and_then(|d| d.as_ref()) {
            Some(d) => d,
            None => return self.session.end_search(id),
        };
        let mut found: Option<FoundEntry> = None;
        while index < 2 && found.is_none() {
            let dotted = if index == 0 { "." } else { ".." };
            index += 1;
            if dir.meta.attr & ATTR_VOLUME != 0 || dta.skips(dotted, dir.meta.attr) {
                continue;
            }
            found = Some(FoundEntry {
                name: dotted.to_string(),
                size: 0,
                date: dir.meta.date,
                time: dir.meta.time,
                attr: dir.meta.attr as u8,
            });
        }
        // Walk slots in reverse so deleting matches while iterating stays stable
        while found.is_none() && index - 2 < dir.entries.capacity() {
            let slot = dir.entries.capacity() - 1 - (index - 2);
            index += 1;
            let node = match dir.entries.get_at_index(slot) {
                Some(&n) => n,
                None => continue,
            };
            let (meta, size) = match node {
                Node::File(f) => match self.file(f) {
                    Some(f) => (&f.meta, f.data.len() as u32),
                    None => continue,
                },
                Node::Dir(d) => match self.dir(d) {
                    Some(d) => (&d.meta, 0),
                    None => continue,
                },
            };
            if dta.skips(&meta.name, meta.attr) {
                continue;
            }
            found = Some(FoundEntry {
                name: meta.name.clone(),
                size,
                date: meta.date,
                time: meta.time,
                attr: meta.attr as u8,
            });
        }
        match found {
            Some(entry) => {
                self.session.search_mut(id)?.index = index;
                dta.result = entry;
                Ok(())
            }
            None => self.session.end_search(id),
        }
    }

    fn get_file_attr(&mut self, path: &str) -> DriveResult<u16> {
        self.file_stat(path).map(|s| s.attr)
    }

    fn file_stat(&mut self, path: &str) -> DriveResult<FileStat> {
        let path = canonical_path(path);
        self.lookup(&path)
            .1
            .and_then(|n| self.stat_node(n))
            .ok_or(DosError::FileNotFound)
    }

    fn file_exists(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        matches!(self.lookup(&path).1, Some(Node::File(_)))
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> DriveResult<()> {
        let old_path = canonical_path(old_path);
        let new_path = canonical_path(new_path);
        let (old_parent, node) = self.lookup(&old_path);
        let (old_parent, node) = match (old_parent, node) {
            (Some(p), Some(n)) => (p, n),
            _ => return Err(DosError::FileNotFound),
        };
        let (new_parent, existing) = self.lookup(&new_path);
        if let Some(existing) = existing {
            return if existing == node { Ok(()) } else { Err(DosError::FileAlreadyExists) };
        }
        let new_parent = new_parent.ok_or(DosError::PathNotFound)?;
        if matches!(node, Node::Dir(_)) && old_parent != new_parent {
            return Err(DosError::AccessDenied);
        }

        let (_, old_name) = split_parent(&old_path);
        let (_, new_name) = split_parent(&new_path);
        match node {
            Node::File(f) => {
                self.session.force_close(|h| h.file == f);
                if let Some(file) = self.files[f].as_mut() {
                    file.meta.name = new_name.to_string();
                }
            }
            Node::Dir(d) => {
                if let Some(dir) = self.dir_mut(d) {
                    dir.meta.name = new_name.to_string();
                }
                // Re-key this directory and everything below it
                let moved: Vec<usize> = self
                    .dirs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, dir)| dir.as_ref().map(|dir| (i, dir)))
                    .filter(|(_, dir)| dir.path == old_path || is_inside(&dir.path, &old_path))
                    .map(|(i, _)| i)
                    .collect();
                for i in moved {
                    if let Some(dir) = self.dirs[i].as_mut() {
                        let renamed = format!("{}{}", new_path, &dir.path[old_path.len()..]);
                        self.directories.remove(&dir.path);
                        self.directories.put(&renamed, i);
                        dir.path = renamed;
                    }
                }
            }
        }
        if let Some(d) = self.dir_mut(old_parent) {
            d.entries.remove(old_name);
        }
        if let Some(d) = self.dir_mut(new_parent) {
            d.entries.put(new_name, node);
        }
        Ok(())
    }

    fn allocation_info(&mut self) -> AllocationInfo {
        AllocationInfo {
            bytes_per_sector: 512,
            sectors_per_cluster: 32,
            total_clusters: 32765,
            free_clusters: 16000,
        }
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn unmount(&mut self) -> DriveResult<()> {
        self.session.close_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walk::collect_tree;

    #[test]
    fn test_write_read_file() {
        let mut fs = MemoryDrive::new();
        write_file(&mut fs, "TEST.COM", &[0xC9]).unwrap();

        assert!(fs.file_exists("TEST.COM"));
        assert!(fs.file_exists("test.com")); // Case insensitive
        assert_eq!(read_file(&mut fs, "TEST.COM").unwrap(), vec![0xC9]);
    }

    #[test]
    fn test_zero_length_write_truncates() {
        let mut fs = MemoryDrive::with_files([("DATA.BIN", b"0123456789".to_vec())]);
        let h = fs.file_open("DATA.BIN", OPEN_READWRITE).unwrap();
        fs.file_seek(h, 4, SeekMode::Set).unwrap();
        assert_eq!(fs.file_write(h, &[]).unwrap(), 0);
        fs.file_close(h).unwrap();
        assert_eq!(read_file(&mut fs, "DATA.BIN").unwrap(), b"0123");
    }

    #[test]
    fn test_shared_content_and_refcount() {
        let mut fs = MemoryDrive::with_files([("A.TXT", b"abc".to_vec())]);
        let w = fs.file_open("A.TXT", OPEN_READWRITE).unwrap();
        let r = fs.file_open("A.TXT", OPEN_READ).unwrap();
        fs.file_seek(w, 0, SeekMode::End).unwrap();
        fs.file_write(w, b"def").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.file_read(r, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(fs.file_write(r, b"x"), Err(DosError::AccessDenied));

        fs.file_add_ref(r).unwrap();
        fs.file_close(r).unwrap();
        assert!(fs.file_seek(r, 0, SeekMode::Set).is_ok()); // Still referenced
        fs.file_close(r).unwrap();
        assert_eq!(fs.file_seek(r, 0, SeekMode::Set), Err(DosError::InvalidHandle));
        fs.file_close(w).unwrap();
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_create_errors() {
        let mut fs = MemoryDrive::new();
        fs.make_dir("DIR").unwrap();
        assert_eq!(fs.file_create("", 0).err(), Some(DosError::AccessDenied));
        assert_eq!(fs.file_create("X", ATTR_DIRECTORY).err(), Some(DosError::AccessDenied));
        assert_eq!(fs.file_create("NOPE\\X", 0).err(), Some(DosError::PathNotFound));
        assert_eq!(fs.file_create("DIR", 0).err(), Some(DosError::AccessDenied));
    }

    #[test]
    fn test_create_existing_truncates() {
        let mut fs = MemoryDrive::with_files([("A.TXT", b"old".to_vec())]);
        let h = fs.file_create("A.TXT", ATTR_ARCHIVE).unwrap();
        fs.file_close(h).unwrap();
        assert_eq!(fs.file_stat("A.TXT").unwrap().size, 0);
    }

    #[test]
    fn test_delete_file() {
        let mut fs = MemoryDrive::with_files([("TEST.COM", vec![0xC9])]);
        let h = fs.file_open("TEST.COM", OPEN_READ).unwrap();
        fs.file_unlink("TEST.COM").unwrap();
        assert!(!fs.file_exists("TEST.COM"));
        assert_eq!(fs.file_close(h), Err(DosError::InvalidHandle)); // Force closed
        assert_eq!(fs.file_unlink("NOTEXIST.COM"), Err(DosError::FileNotFound));
    }

    #[test]
    fn test_unlink_read_only_or_dir_fails() {
        let mut fs = MemoryDrive::new();
        let h = fs.file_create("RO.TXT", ATTR_READ_ONLY).unwrap();
        fs.file_close(h).unwrap();
        fs.make_dir("SUB").unwrap();
        assert_eq!(fs.file_unlink("RO.TXT"), Err(DosError::FileNotFound));
        assert_eq!(fs.file_unlink("SUB"), Err(DosError::FileNotFound));
    }

    #[test]
    fn test_directories() {
        let mut fs = MemoryDrive::new();
        assert!(fs.test_dir(""));
        fs.make_dir("GAMES").unwrap();
        assert_eq!(fs.make_dir("GAMES"), Err(DosError::FileAlreadyExists));
        assert_eq!(fs.make_dir("NO\\SUB"), Err(DosError::AccessDenied));
        fs.make_dir("GAMES\\DOOM").unwrap();
        assert!(fs.test_dir("games\\doom"));
        assert_eq!(fs.remove_dir("GAMES"), Err(DosError::AccessDenied));
        fs.remove_dir("GAMES\\DOOM").unwrap();
        fs.remove_dir("GAMES").unwrap();
        assert_eq!(fs.remove_dir("GAMES"), Err(DosError::PathNotFound));
        assert!(!fs.test_dir("GAMES"));
    }

    #[test]
    fn test_rename() {
        let mut fs = MemoryDrive::with_files([("A.TXT", b"a".to_vec()), ("B.TXT", b"b".to_vec())]);
        fs.make_dir("SUB").unwrap();
        assert_eq!(fs.rename("A.TXT", "B.TXT"), Err(DosError::FileAlreadyExists));
        assert_eq!(fs.rename("A.TXT", "A.TXT"), Ok(()));
        assert_eq!(fs.rename("X.TXT", "Y.TXT"), Err(DosError::FileNotFound));
        assert_eq!(fs.rename("A.TXT", "NO\\A.TXT"), Err(DosError::PathNotFound));
        fs.rename("A.TXT", "SUB\\C.TXT").unwrap();
        assert!(!fs.file_exists("A.TXT"));
        assert_eq!(read_file(&mut fs, "SUB\\C.TXT").unwrap(), b"a");
        fs.make_dir("OTHER").unwrap();
        assert_eq!(fs.rename("SUB", "OTHER\\SUB"), Err(DosError::AccessDenied));
    }

    #[test]
    fn test_rename_directory_rekeys_subtree() {
        let mut fs = MemoryDrive::with_files([("OLD\\INNER\\F.TXT", b"f".to_vec())]);
        fs.rename("OLD", "NEW").unwrap();
        assert!(fs.test_dir("NEW\\INNER"));
        assert!(!fs.test_dir("OLD\\INNER"));
        assert_eq!(read_file(&mut fs, "NEW\\INNER\\F.TXT").unwrap(), b"f");
    }

    #[test]
    fn test_find_lists_dots_and_entries() {
        let mut fs = MemoryDrive::with_files([("SUB\\A.TXT", vec![1]), ("SUB\\B.DAT", vec![2, 3])]);
        let names: Vec<String> = {
            let mut dta = Dta::new(0xff, "*.*");
            let mut out = Vec::new();
            let mut res = fs.find_first("SUB", &mut dta);
            while res.is_ok() {
                out.push(dta.result.name.clone());
                res = fs.find_next(&mut dta);
            }
            assert_eq!(res, Err(DosError::NoMoreFiles));
            out
        };
        assert_eq!(&names[..2], &[".", ".."]);
        assert_eq!(names.len(), 4);

        let root = list_dir(&mut fs, "", 0xff).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "SUB");

        let txt = list_dir(&mut fs, "SUB", 0).unwrap();
        assert_eq!(txt.len(), 2);
        let mut dta = Dta::new(0, "*.TXT");
        fs.find_first("SUB", &mut dta).unwrap();
        assert_eq!(dta.result.name, "A.TXT");
        assert_eq!(fs.find_first("MISSING", &mut dta), Err(DosError::PathNotFound));
    }

    #[test]
    fn test_delete_all_while_searching() {
        let files: Vec<(String, Vec<u8>)> = (0..40).map(|i| (format!("F{}.TMP", i), vec![i as u8])).collect();
        let mut fs = MemoryDrive::with_files(files);
        let mut dta = Dta::new(0, "*.TMP");
        let mut deleted = 0;
        while fs.find_first("", &mut dta).is_ok() {
            let mut res = Ok(());
            while res.is_ok() {
                fs.file_unlink(&dta.result.name).unwrap();
                deleted += 1;
                res = fs.find_next(&mut dta);
            }
        }
        assert_eq!(deleted, 40);
        assert!(list_dir(&mut fs, "", 0xff).unwrap().is_empty());
    }

    #[test]
    fn test_search_ids_recycled() {
        let mut fs = MemoryDrive::new();
        let mut dta = Dta::new(0xff, "*.*");
        assert_eq!(fs.find_first("", &mut dta), Err(DosError::NoMoreFiles));
        let first = dta.dir_id;
        assert_eq!(fs.find_first("", &mut dta), Err(DosError::NoMoreFiles));
        assert_eq!(dta.dir_id, first);
        dta.dir_id = 500;
        assert_eq!(fs.find_next(&mut dta), Err(DosError::AccessDenied));
    }

    #[test]
    fn test_clone_entry_from() {
        let mut src = MemoryDrive::with_files([("DIR\\FILE.BIN", b"payload".to_vec())]);
        let mut dst = MemoryDrive::new();
        dst.clone_entry_from(&mut src, "DIR").unwrap();
        dst.clone_entry_from(&mut src, "DIR\\FILE.BIN").unwrap();
        assert_eq!(read_file(&mut dst, "DIR\\FILE.BIN").unwrap(), b"payload");
        assert_eq!(
            dst.file_stat("DIR\\FILE.BIN").unwrap().date,
            src.file_stat("DIR\\FILE.BIN").unwrap().date
        );
        assert_eq!(dst.clone_entry_from(&mut src, "NONE"), Err(DosError::FileNotFound));
    }

    #[test]
    fn test_walk_tree() {
        let mut fs = MemoryDrive::with_files([("A\\B\\C.TXT", vec![1]), ("D.TXT", vec![])]);
        let tree = collect_tree(&mut fs).unwrap();
        let mut paths: Vec<&str> = tree.iter().map(|e| e.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["A", "A\\B", "A\\B\\C.TXT", "D.TXT"]);
    }
}
