//! A drive presented as a partitioned FAT hard disk.

use std::io::{self, Write};

use tracing::{info, warn};

use super::diff::{DifferencingDisk, Sector, SectorStore};
use super::layout::{FatLayout, SectorSource, BYTES_PER_SECTOR, HEAD_COUNT, SECTORS_PER_TRACK, SECT_MBR};
use crate::config::FatConfig;
use crate::error::{DosError, DriveResult};
use crate::fs::{read_exact_or_eof, Drive, FileHandle, SeekMode, OPEN_READ};

const CACHE_COUNT: usize = 256;
const KEEP_OPEN_COUNT: usize = 4;
/// Bytes of the MBR before the partition table.
const MBR_BOOTER_SIZE: usize = 446;

/// Sector-level view of a drive, laid out as FAT12/16/32.
///
/// File contents are read from the drive on demand; writes are captured by a
/// [`SectorStore`] and never reach the drive.
pub struct FatBlockDevice {
    drive: Box<dyn Drive>,
    layout: FatLayout,
    store: Box<dyn SectorStore>,
    cache: Vec<Sector>,
    cache_tags: Vec<Option<u32>>,
    kept_open: [Option<(usize, FileHandle)>; KEEP_OPEN_COUNT],
    open_cursor: usize,
}

impl FatBlockDevice {
    /// Lay out `drive` and capture writes in a differencing disk, persisted
    /// when `config.diff_path` is set.
    pub fn new(drive: impl Drive + 'static, config: &FatConfig) -> DriveResult<Self> {
        let mut drive: Box<dyn Drive> = Box::new(drive);
        let layout = FatLayout::build(&mut *drive, config.free_space_mb, config.serial, config.read_only)?;
        let store: Box<dyn SectorStore> = match &config.diff_path {
            Some(path) if !layout.is_read_only() => Box::new(DifferencingDisk::with_file(path, layout.sector_count())),
            _ => Box::new(DifferencingDisk::new()),
        };
        Ok(Self::assemble(drive, layout, store))
    }

    /// Lay out `drive` with an explicit write store such as a `DiscardDisk`.
    pub fn with_store(drive: impl Drive + 'static, config: &FatConfig, store: Box<dyn SectorStore>) -> DriveResult<Self> {
        let mut drive: Box<dyn Drive> = Box::new(drive);
        let layout = FatLayout::build(&mut *drive, config.free_space_mb, config.serial, config.read_only)?;
        Ok(Self::assemble(drive, layout, store))
    }

    fn assemble(drive: Box<dyn Drive>, layout: FatLayout, store: Box<dyn SectorStore>) -> Self {
        info!(
            fat = layout.fat_bits(),
            sectors = layout.sector_count(),
            cluster_kb = layout.sectors_per_cluster() / 2,
            serial = format_args!("{:08X}", layout.serial()),
            read_only = layout.is_read_only(),
            "synthesized FAT disk"
        );
        Self {
            drive,
            layout,
            store,
            cache: vec![[0; BYTES_PER_SECTOR]; CACHE_COUNT],
            cache_tags: vec![None; CACHE_COUNT],
            kept_open: [None; KEEP_OPEN_COUNT],
            open_cursor: 0,
        }
    }

    pub fn layout(&self) -> &FatLayout {
        &self.layout
    }

    pub fn sector_count(&self) -> u32 {
        self.layout.sector_count()
    }

    /// Cylinders, heads and sectors per track.
    pub fn geometry(&self) -> (u32, u32, u32) {
        let per_cylinder = HEAD_COUNT * SECTORS_PER_TRACK;
        (self.sector_count().div_ceil(per_cylinder), HEAD_COUNT, SECTORS_PER_TRACK)
    }

    pub fn is_read_only(&self) -> bool {
        self.layout.is_read_only()
    }

    /// Number of sectors held by the write store.
    pub fn changed_sectors(&self) -> usize {
        self.store.len()
    }

    pub fn read_sector(&mut self, n: u32, buf: &mut Sector) {
        let slot = n as usize % CACHE_COUNT;
        if self.cache_tags[slot] == Some(n) {
            buf.copy_from_slice(&self.cache[slot]);
            return;
        }
        if !self.store.read(n, buf) {
            self.unmodified_sector(n, buf);
        }
        self.cache[slot] = *buf;
        self.cache_tags[slot] = Some(n);
    }

    /// Write one sector. Read-only devices accept and drop writes.
    pub fn write_sector(&mut self, n: u32, data: &Sector) -> DriveResult<()> {
        if n >= self.sector_count() {
            return Err(DosError::AccessDenied);
        }
        let slot = n as usize % CACHE_COUNT;
        if n == SECT_MBR {
            // Disk timestamps written into the boot code are not differences
            self.layout.mbr[..MBR_BOOTER_SIZE].copy_from_slice(&data[..MBR_BOOTER_SIZE]);
            self.cache_tags[slot] = None;
        }
        if self.layout.is_read_only() {
            return Ok(());
        }
        let mut unmodified = [0u8; BYTES_PER_SECTOR];
        self.unmodified_sector(n, &mut unmodified);
        if self.store.write(n, data, &unmodified) {
            self.cache_tags[slot] = None;
        }
        Ok(())
    }

    /// Stream the whole disk image.
    pub fn write_image(&mut self, out: &mut impl Write) -> io::Result<()> {
        let mut buf = [0u8; BYTES_PER_SECTOR];
        for n in 0..self.sector_count() {
            self.read_sector(n, &mut buf);
            out.write_all(&buf)?;
        }
        Ok(())
    }

    fn unmodified_sector(&mut self, n: u32, buf: &mut Sector) {
        let (index, offset) = match self.layout.sector_source(n) {
            SectorSource::Static(data) => {
                buf.copy_from_slice(data);
                return;
            }
            SectorSource::Empty => {
                buf.fill(0);
                return;
            }
            SectorSource::File { index, offset } => (index, offset),
        };
        buf.fill(0);
        let Some(handle) = self.file_handle(index) else {
            return;
        };
        let res = self
            .drive
            .file_seek(handle, offset as i64, SeekMode::Set)
            .and_then(|_| read_exact_or_eof(&mut *self.drive, handle, buf));
        if let Err(e) = res {
            warn!(path = %self.layout.files[index].path, sector = n, error = %e, "reading file sector failed");
        }
    }

    /// Handle of file `index`, kept open in a small round-robin set.
    fn file_handle(&mut self, index: usize) -> Option<FileHandle> {
        if let Some((_, h)) = self.kept_open.iter().flatten().find(|(i, _)| *i == index) {
            return Some(*h);
        }
        self.open_cursor = (self.open_cursor + 1) % KEEP_OPEN_COUNT;
        if let Some((_, old)) = self.kept_open[self.open_cursor].take() {
            let _ = self.drive.file_close(old);
        }
        let path = &self.layout.files[index].path;
        match self.drive.file_open(path, OPEN_READ) {
            Ok(h) => {
                self.kept_open[self.open_cursor] = Some((index, h));
                Some(h)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "cannot open file for FAT disk");
                None
            }
        }
    }
}

impl Drop for FatBlockDevice {
    fn drop(&mut self) {
        for (_, h) in self.kept_open.iter_mut().filter_map(Option::take) {
            let _ = self.drive.file_close(h);
        }
    }
}
