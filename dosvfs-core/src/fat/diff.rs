//! Sector overlays that capture writes to a read-only block device.
//!
//! `DifferencingDisk` only keeps sectors that differ from the base content and
//! can persist them in a host file:
//! `"FFDD\x01"` followed by records of `(sector: u32 LE, 512 payload bytes)`.
//! A record whose sector number is `0xFFFFFFFF` is free and gets reused.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::layout::BYTES_PER_SECTOR;

pub const DIFF_MAGIC: &[u8; 5] = b"FFDD\x01";

const NULL_CURSOR: u32 = u32::MAX;
const FREE_RECORD: u32 = u32::MAX;
const RECORD_SIZE: u32 = 4 + BYTES_PER_SECTOR as u32;

pub type Sector = [u8; BYTES_PER_SECTOR];

/// Storage for sectors written over a base device.
pub trait SectorStore: Send {
    /// Copy a stored sector into `buf`. Returns false if none is stored.
    fn read(&mut self, sector: u32, buf: &mut Sector) -> bool;

    /// Record a write given the base content of the sector. Returns true if
    /// the stored state changed.
    fn write(&mut self, sector: u32, data: &Sector, unmodified: &Sector) -> bool;

    /// Number of sectors currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Volatile overlay keeping every written sector in memory.
#[derive(Default)]
pub struct DiscardDisk {
    sectors: Vec<Option<Box<Sector>>>,
    count: usize,
}

impl DiscardDisk {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SectorStore for DiscardDisk {
    fn read(&mut self, sector: u32, buf: &mut Sector) -> bool {
        match self.sectors.get(sector as usize) {
            Some(Some(data)) => {
                buf.copy_from_slice(&data[..]);
                true
            }
            _ => false,
        }
    }

    fn write(&mut self, sector: u32, data: &Sector, _unmodified: &Sector) -> bool {
        let idx = sector as usize;
        if idx >= self.sectors.len() {
            self.sectors.resize(idx + 1, None);
        }
        match &mut self.sectors[idx] {
            Some(stored) => **stored = *data,
            slot => {
                *slot = Some(Box::new(*data));
                self.count += 1;
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.count
    }
}

/// Overlay storing only sectors that differ from the base device.
pub struct DifferencingDisk {
    /// Cursor per sector: index into `bufs`, or record offset in `file`.
    cursors: Vec<u32>,
    bufs: Vec<Sector>,
    free: Vec<u32>,
    file: Option<File>,
    /// Created on the first differing write.
    pending_path: Option<PathBuf>,
    end_cursor: u32,
    count: usize,
}

impl Default for DifferencingDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl DifferencingDisk {
    /// Differences kept in memory only.
    pub fn new() -> Self {
        Self {
            cursors: Vec::new(),
            bufs: Vec::new(),
            free: Vec::new(),
            file: None,
            pending_path: None,
            end_cursor: 0,
            count: 0,
        }
    }

    /// Differences persisted in `path` for a device of `sector_count` sectors.
    /// An existing file is loaded; an invalid one is left untouched and changes
    /// stay in memory.
    pub fn with_file(path: &Path, sector_count: u32) -> Self {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(_) => {
                return Self {
                    pending_path: Some(path.to_path_buf()),
                    ..Self::new()
                }
            }
        };
        match Self::load(file, sector_count) {
            Ok(disk) => {
                debug!(path = %path.display(), sectors = disk.count, "loaded differencing file");
                disk
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid differencing file, changes stay in memory");
                Self::new()
            }
        }
    }

    fn load(mut file: File, sector_count: u32) -> io::Result<Self> {
        let mut magic = [0u8; 5];
        file.read_exact(&mut magic)?;
        if &magic != DIFF_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let mut disk = Self::new();
        let mut cursor = DIFF_MAGIC.len() as u32;
        loop {
            let mut num = [0u8; 4];
            match file.read_exact(&mut num) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            file.seek(SeekFrom::Current(BYTES_PER_SECTOR as i64))?;
            let sector = u32::from_le_bytes(num);
            if sector == FREE_RECORD {
                disk.free.push(cursor);
            } else {
                if sector >= sector_count {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "sector out of range"));
                }
                let idx = sector as usize;
                if idx >= disk.cursors.len() {
                    disk.cursors.resize(idx + 1, NULL_CURSOR);
                }
                if disk.cursors[idx] == NULL_CURSOR {
                    disk.count += 1;
                }
                disk.cursors[idx] = cursor;
            }
            cursor += RECORD_SIZE;
        }
        disk.end_cursor = cursor;
        disk.file = Some(file);
        Ok(disk)
    }

    /// True when differences go to a host file.
    pub fn is_persistent(&self) -> bool {
        self.file.is_some() || self.pending_path.is_some()
    }

    fn create_pending_file(&mut self) {
        let Some(path) = self.pending_path.take() else {
            return;
        };
        let created = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|mut f| f.write_all(DIFF_MAGIC).map(|_| f));
        match created {
            Ok(f) => {
                self.file = Some(f);
                self.end_cursor = DIFF_MAGIC.len() as u32;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot create differencing file, changes stay in memory"),
        }
    }

    fn write_record(file: &mut File, cursor: u32, sector: Option<u32>, data: &Sector) -> io::Result<()> {
        match sector {
            Some(n) => {
                file.seek(SeekFrom::Start(cursor as u64))?;
                file.write_all(&n.to_le_bytes())?;
            }
            None => {
                file.seek(SeekFrom::Start(cursor as u64 + 4))?;
            }
        }
        file.write_all(data)
    }
}

impl SectorStore for DifferencingDisk {
    fn read(&mut self, sector: u32, buf: &mut Sector) -> bool {
        let cursor = self.cursors.get(sector as usize).copied().unwrap_or(NULL_CURSOR);
        if cursor == NULL_CURSOR {
            return false;
        }
        match &mut self.file {
            Some(file) => {
                let res = file
                    .seek(SeekFrom::Start(cursor as u64 + 4))
                    .and_then(|_| file.read_exact(buf));
                if let Err(e) = &res {
                    warn!(sector, error = %e, "reading differencing file failed");
                }
                res.is_ok()
            }
            None => {
                buf.copy_from_slice(&self.bufs[cursor as usize]);
                true
            }
        }
    }

    fn write(&mut self, sector: u32, data: &Sector, unmodified: &Sector) -> bool {
        let idx = sector as usize;
        if idx >= self.cursors.len() {
            self.cursors.resize(idx + 128, NULL_CURSOR);
        }
        let old = self.cursors[idx];

        if data != unmodified {
            if self.file.is_none() {
                self.create_pending_file();
            }
            let mut cursor = old;
            let mut new_record = false;
            if cursor == NULL_CURSOR {
                if let Some(free) = self.free.pop() {
                    cursor = free;
                    new_record = true;
                }
            }
            match &mut self.file {
                Some(file) => {
                    if cursor == NULL_CURSOR {
                        cursor = self.end_cursor;
                        self.end_cursor += RECORD_SIZE;
                        new_record = true;
                    }
                    if let Err(e) = Self::write_record(file, cursor, new_record.then_some(sector), data) {
                        warn!(sector, error = %e, "writing differencing file failed");
                    }
                }
                None => {
                    if cursor == NULL_CURSOR {
                        cursor = self.bufs.len() as u32;
                        self.bufs.push(*data);
                    } else {
                        self.bufs[cursor as usize] = *data;
                    }
                }
            }
            if old == NULL_CURSOR {
                self.count += 1;
            }
            self.cursors[idx] = cursor;
            return true;
        }

        if old == NULL_CURSOR {
            return false;
        }
        // Back to the base content: release the record
        if let Some(file) = &mut self.file {
            let res = file
                .seek(SeekFrom::Start(old as u64))
                .and_then(|_| file.write_all(&FREE_RECORD.to_le_bytes()));
            if let Err(e) = res {
                warn!(sector, error = %e, "freeing differencing record failed");
            }
        }
        self.free.push(old);
        self.cursors[idx] = NULL_CURSOR;
        self.count -= 1;
        true
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector(fill: u8) -> Sector {
        [fill; BYTES_PER_SECTOR]
    }

    #[test]
    fn test_identical_writes_are_not_stored() {
        let mut disk = DifferencingDisk::new();
        assert!(!disk.write(5, &sector(0), &sector(0)));
        assert!(disk.is_empty());
        let mut buf = sector(9);
        assert!(!disk.read(5, &mut buf));
        assert_eq!(buf, sector(9));
    }

    #[test]
    fn test_revert_frees_and_reuses_slot() {
        let mut disk = DifferencingDisk::new();
        assert!(disk.write(3, &sector(1), &sector(0)));
        assert!(disk.write(3, &sector(2), &sector(0)));
        assert_eq!(disk.len(), 1);
        let mut buf = sector(0);
        assert!(disk.read(3, &mut buf));
        assert_eq!(buf, sector(2));

        assert!(disk.write(3, &sector(0), &sector(0)));
        assert!(disk.is_empty());
        assert!(!disk.read(3, &mut buf));

        assert!(disk.write(700, &sector(7), &sector(0)));
        assert_eq!(disk.bufs.len(), 1);
        assert!(disk.read(700, &mut buf));
        assert_eq!(buf, sector(7));
    }

    #[test]
    fn test_file_persists_differences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.ffd");
        {
            let mut disk = DifferencingDisk::with_file(&path, 1000);
            assert!(disk.is_persistent());
            assert!(!disk.write(1, &sector(0), &sector(0)));
            assert!(!path.exists());
            disk.write(10, &sector(0xAA), &sector(0));
            disk.write(20, &sector(0xBB), &sector(0));
            disk.write(10, &sector(0), &sector(0));
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..5], DIFF_MAGIC);
        assert_eq!(bytes.len(), 5 + 2 * RECORD_SIZE as usize);
        assert_eq!(&bytes[5..9], &FREE_RECORD.to_le_bytes());

        let mut disk = DifferencingDisk::with_file(&path, 1000);
        assert_eq!(disk.len(), 1);
        let mut buf = sector(0);
        assert!(!disk.read(10, &mut buf));
        assert!(disk.read(20, &mut buf));
        assert_eq!(buf, sector(0xBB));

        // Freed record gets reused
        disk.write(30, &sector(0xCC), &sector(0));
        drop(disk);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 5 + 2 * RECORD_SIZE as usize);
        assert_eq!(&bytes[5..9], &30u32.to_le_bytes());
    }

    #[test]
    fn test_invalid_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ffd");
        std::fs::write(&path, b"NOPE!!").unwrap();
        let mut disk = DifferencingDisk::with_file(&path, 100);
        assert!(!disk.is_persistent());
        disk.write(1, &sector(1), &sector(0));
        assert_eq!(std::fs::read(&path).unwrap(), b"NOPE!!");
        let mut buf = sector(0);
        assert!(disk.read(1, &mut buf));
    }

    #[test]
    fn test_out_of_range_record_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range.ffd");
        let mut bytes = DIFF_MAGIC.to_vec();
        bytes.extend(500u32.to_le_bytes());
        bytes.extend([0u8; BYTES_PER_SECTOR]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(!DifferencingDisk::with_file(&path, 100).is_persistent());
        assert_eq!(DifferencingDisk::with_file(&path, 1000).len(), 1);
    }

    #[test]
    fn test_discard_disk_keeps_everything() {
        let mut disk = DiscardDisk::new();
        assert!(disk.write(2, &sector(0), &sector(0)));
        assert!(disk.write(2, &sector(4), &sector(0)));
        assert_eq!(disk.len(), 1);
        let mut buf = sector(9);
        assert!(disk.read(2, &mut buf));
        assert_eq!(buf, sector(4));
        assert!(!disk.read(3, &mut buf));
    }
}
