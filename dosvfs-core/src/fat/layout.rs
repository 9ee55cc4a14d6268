//! FAT volume structure computed once from a drive tree.
//!
//! Disk order is fixed after construction:
//! MBR, boot sector (plus FS-info and backup for FAT32), FAT copy 1, FAT copy 2,
//! fixed root directory (FAT12/16 only), directory clusters, file clusters.

use std::collections::HashMap;

use tracing::debug;

use crate::error::DriveResult;
use crate::fs::{join_path, list_dir, walk_drive, Drive, FoundEntry, ATTR_DIRECTORY, ATTR_READ_ONLY, ATTR_VOLUME};

pub const BYTES_PER_SECTOR: usize = 512;
/// More than 128 heads so 4 GB still fits into CHS addressing.
pub const HEAD_COUNT: u32 = 240;
pub const SECTORS_PER_TRACK: u32 = 63;
pub const SECT_MBR: u32 = 0;
/// First sector of the partition.
pub const SECT_BOOT: u32 = 32;

const ENTRY_SIZE: usize = 32;
const FAT16_ROOT_ENTRIES: usize = 512;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_LONG_NAME_MASK: u8 = 0x3F;
const ATTR_PENDING_SHORT_NAME: u8 = 0x80;
const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFFF;
const FAT_BAD_CLUSTER: u32 = 0x0FFF_FFF7;
const SHORT_NAME_SPECIALS: &[u8] = b"$%'-_@~`!(){}^#&";

/// Sector ranges of the volume, each starting where the previous one ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Regions {
    pub fat1_start: u32,
    pub fat2_start: u32,
    pub root_start: u32,
    pub dirs_start: u32,
    pub files_start: u32,
    pub files_end: u32,
    pub disk_end: u32,
}

#[derive(Debug)]
pub(crate) struct FatFile {
    pub path: String,
    /// Relative to `Regions::files_start`.
    pub first_sector: u32,
}

/// Unmodified content of one sector.
pub(crate) enum SectorSource<'a> {
    Static(&'a [u8]),
    File { index: usize, offset: u32 },
    Empty,
}

/// Cluster size tier for the total volume size in MB.
pub fn size_tier(total_mb: u32) -> (u8, u32) {
    match total_mb {
        3072.. => (32, 64),
        2048.. => (32, 32),
        384.. => (16, 64),
        192.. => (16, 32),
        96.. => (16, 16),
        48.. => (16, 8),
        12.. => (16, 4),
        4.. => (16, 1),
        2.. => (12, 4),
        1 => (12, 2),
        0 => (12, 1),
    }
}

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn set_cluster(entry: &mut [u8], cluster: u32) {
    put16(entry, 20, (cluster >> 16) as u16);
    put16(entry, 26, cluster as u16);
}

/// Byte offset of UCS-2 character `j` inside a long-name entry.
fn lfn_char_offset(j: usize) -> usize {
    match j {
        0..=4 => 1 + j * 2,
        5..=10 => 14 + (j - 5) * 2,
        _ => 28 + (j - 11) * 2,
    }
}

/// Checksum of an 11-byte short name stored in its long-name entries.
pub fn lfn_checksum(name: &[u8]) -> u8 {
    name.iter().fold(0u8, |sum, &c| sum.rotate_right(1).wrapping_add(c))
}

fn padded_short_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let bytes = name.as_bytes();
    let (base, ext) = match name {
        "." | ".." => (bytes, &[][..]),
        _ => match name.rfind('.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &[][..]),
        },
    };
    let base = &base[..base.len().min(8)];
    let ext = &ext[..ext.len().min(3)];
    out[..base.len()].copy_from_slice(base);
    out[8..8 + ext.len()].copy_from_slice(ext);
    out
}

fn unpadded_short_name(name: &[u8]) -> String {
    let base = String::from_utf8_lossy(&name[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&name[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// Short name derived from a long name. Returns the padded name, the position
/// where a numeric tail goes, and whether characters were lost.
pub fn short_name_from_long(long: &str) -> ([u8; 11], usize, bool) {
    let mut name = [b' '; 11];
    let (mut ni, mut niext, mut lossy) = (0usize, 0usize, false);
    for &c in long.as_bytes() {
        if c == b'.' {
            if ni > 8 {
                name[8..11].fill(b' ');
                ni = 8;
            }
            if ni == 0 || niext != 0 {
                lossy = true;
            }
            niext = ni;
            continue;
        }
        if c == b' ' || ni == 11 || (ni == 8 && niext == 0) {
            lossy = true;
            continue;
        }
        let c = match c {
            b'A'..=b'Z' | b'0'..=b'9' => c,
            b'a'..=b'z' => c ^ 0x20,
            _ if SHORT_NAME_SPECIALS.contains(&c) => c,
            _ => {
                lossy = true;
                b'_'
            }
        };
        name[ni] = c;
        ni += 1;
    }
    lossy |= niext != 0 && ni - niext > 3;

    if niext != 0 && niext != 8 {
        for i in (0..3).rev() {
            name[8 + i] = name[niext + i];
            name[niext + i] = b' ';
        }
    }
    if niext != 0 && niext <= 4 && ni - niext > 3 {
        name[niext + 3..8].fill(b' ');
    }
    let tail_at = if niext == 0 { ni } else { niext };
    (name, tail_at, lossy)
}

/// Write a `~N` tail ending at most at column 8.
fn apply_tail(name: &mut [u8; 11], tail_at: usize, n: u32) {
    let digits = n.to_string();
    let tail_len = digits.len() + 1;
    let end = (tail_at + tail_len).min(8);
    let start = end - tail_len;
    name[start] = b'~';
    name[start + 1..end].copy_from_slice(digits.as_bytes());
}

/// Complete structure of a synthesized volume.
pub struct FatLayout {
    fat_bits: u8,
    sectors_per_cluster: u32,
    read_only: bool,
    serial: u32,
    pub(crate) mbr: [u8; BYTES_PER_SECTOR],
    boot: [u8; BYTES_PER_SECTOR],
    fsinfo: [u8; BYTES_PER_SECTOR],
    fat: Vec<u8>,
    root: Vec<u8>,
    dirs: Vec<u8>,
    pub(crate) files: Vec<FatFile>,
    file_at_sector: Vec<u32>,
    total_clusters: u32,
    regions: Regions,
}

impl FatLayout {
    /// Lay out every entry of `drive`. A `serial` of 0 derives one from the
    /// FAT and directory contents.
    pub fn build(drive: &mut dyn Drive, free_space_mb: u32, serial: u32, read_only: bool) -> DriveResult<Self> {
        let mut used_bytes = 0u64;
        // Counted in 32 KB clusters
        walk_drive(drive, |e| {
            if !e.is_dir {
                used_bytes += (e.size as u64).div_ceil(32 * 1024) * 32 * 1024;
            }
        })?;

        let read_only = read_only || free_space_mb == 0 || drive.allocation_info().free_clusters == 0;
        let add_free_mb = if read_only { 0 } else { free_space_mb };
        let total_mb = (used_bytes / (1024 * 1024)) as u32 + if add_free_mb != 0 { 1 + add_free_mb } else { 0 };
        let (fat_bits, sectors_per_cluster) = size_tier(total_mb);

        let mut layout = Self {
            fat_bits,
            sectors_per_cluster,
            read_only,
            serial,
            mbr: [0; BYTES_PER_SECTOR],
            boot: [0; BYTES_PER_SECTOR],
            fsinfo: [0; BYTES_PER_SECTOR],
            fat: Vec::new(),
            root: Vec::new(),
            dirs: Vec::new(),
            files: Vec::new(),
            file_at_sector: Vec::new(),
            total_clusters: 0,
            regions: Regions::default(),
        };

        // Media descriptor in the first FAT entry
        layout.set_fat(0, 0x0FFF_FFF8);
        layout.set_fat(1, FAT_END_OF_CHAIN);
        if fat_bits != 32 {
            layout.root = vec![0; FAT16_ROOT_ENTRIES * ENTRY_SIZE];
        }
        layout.parse_dir(drive, "", None, 0)?;
        if fat_bits == 32 && layout.dirs.is_empty() {
            let mut idx = 0;
            layout.add_entry(false, &mut idx);
        }

        let file_cluster = layout.assign_file_clusters();
        layout.finish(file_cluster, add_free_mb);
        debug!(
            fat = fat_bits,
            sectors_per_cluster,
            clusters = layout.total_clusters,
            files = layout.files.len(),
            read_only,
            "FAT layout computed"
        );
        Ok(layout)
    }

    pub fn fat_bits(&self) -> u8 {
        self.fat_bits
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    pub fn regions(&self) -> Regions {
        self.regions
    }

    pub fn sector_count(&self) -> u32 {
        self.regions.disk_end
    }

    fn entries_per_cluster(&self) -> usize {
        self.sectors_per_cluster as usize * BYTES_PER_SECTOR / ENTRY_SIZE
    }

    fn entry_count(&self, in_root: bool) -> usize {
        if in_root {
            self.root.len() / ENTRY_SIZE
        } else {
            self.dirs.len() / ENTRY_SIZE
        }
    }

    fn entry(&self, in_root: bool, idx: usize) -> &[u8] {
        let table = if in_root { &self.root } else { &self.dirs };
        &table[idx * ENTRY_SIZE..(idx + 1) * ENTRY_SIZE]
    }

    fn entry_mut(&mut self, in_root: bool, idx: usize) -> &mut [u8] {
        let table = if in_root { &mut self.root } else { &mut self.dirs };
        &mut table[idx * ENTRY_SIZE..(idx + 1) * ENTRY_SIZE]
    }

    fn set_fat(&mut self, idx: usize, val: u32) {
        let bits = self.fat_bits as usize;
        while idx >= self.fat.len() * 8 / bits {
            // FAT12 grows in 3-sector steps to keep entries aligned
            let add = if bits == 12 { BYTES_PER_SECTOR * 3 } else { BYTES_PER_SECTOR };
            self.fat.resize(self.fat.len() + add, 0);
        }
        match bits {
            32 => put32(&mut self.fat, idx * 4, val),
            16 => put16(&mut self.fat, idx * 2, val as u16),
            _ => {
                let at = idx + idx / 2;
                let cur = get16(&self.fat, at);
                let v = if idx & 1 != 0 {
                    (cur & 0x000F) | ((val as u16 & 0x0FFF) << 4)
                } else {
                    (cur & 0xF000) | (val as u16 & 0x0FFF)
                };
                put16(&mut self.fat, at, v);
            }
        }
    }

    /// Reserve the next entry of a directory, chaining a new cluster when the
    /// current one is full. `diridx` is 0 before the first entry.
    fn add_entry(&mut self, in_root: bool, diridx: &mut usize) -> usize {
        let epc = self.entries_per_cluster();
        if !in_root && *diridx % epc == 0 {
            let next = self.entry_count(false);
            if *diridx != 0 {
                self.set_fat(2 + (*diridx - 1) / epc, (2 + next / epc) as u32);
            }
            *diridx = next;
            self.dirs.resize(self.dirs.len() + epc * ENTRY_SIZE, 0);
            self.set_fat(2 + next / epc, 0xFFFF_FFFF);
        } else if in_root && *diridx != 0 && *diridx % FAT16_ROOT_ENTRIES == 0 {
            self.root.resize(self.root.len() + FAT16_ROOT_ENTRIES * ENTRY_SIZE, 0);
        }
        let idx = *diridx;
        *diridx += 1;
        idx
    }

    fn parse_dir(&mut self, drive: &mut dyn Drive, dir: &str, this: Option<&FoundEntry>, parent_cluster: u32) -> DriveResult<()> {
        let in_root = dir.is_empty() && self.fat_bits != 32;
        let epc = self.entries_per_cluster();
        let first_idx = if in_root { 0 } else { self.entry_count(false) };
        let my_cluster = if dir.is_empty() { 0 } else { (2 + first_idx / epc) as u32 };
        let bytes_per_cluster = self.sectors_per_cluster as u64 * BYTES_PER_SECTOR as u64;

        let mut found = Vec::new();
        if let Some(this) = this {
            for dot in [".", ".."] {
                found.push(FoundEntry {
                    name: dot.to_string(),
                    size: 0,
                    attr: this.attr | ATTR_DIRECTORY as u8,
                    ..this.clone()
                });
            }
        }
        found.extend(list_dir(drive, dir, 0xFF)?);

        let mut diridx = 0;
        let mut pending: HashMap<usize, String> = HashMap::new();
        for f in &found {
            let dot = f.name == ".";
            let dotdot = f.name == "..";
            let is_volume = f.attr as u16 & ATTR_VOLUME != 0;
            let path = join_path(dir, &f.name);
            let long = if dot || dotdot || is_volume {
                None
            } else {
                drive.get_long_file_name(&path)
            };

            if let Some(long) = &long {
                let bytes = long.as_bytes();
                let blocks = bytes.len().div_ceil(13);
                for i in 0..blocks {
                    let idx = self.add_entry(in_root, &mut diridx);
                    let e = self.entry_mut(in_root, idx);
                    e[0] = (blocks - i) as u8 | if i == 0 { 0x40 } else { 0 };
                    e[11] = ATTR_LONG_NAME;
                    let start = (blocks - i - 1) * 13;
                    for j in 0..13 {
                        let at = lfn_char_offset(j);
                        let (lo, hi) = match (start + j).cmp(&bytes.len()) {
                            std::cmp::Ordering::Less => (bytes[start + j], 0),
                            std::cmp::Ordering::Equal => (0, 0),
                            std::cmp::Ordering::Greater => (0xFF, 0xFF),
                        };
                        e[at] = lo;
                        e[at + 1] = hi;
                    }
                }
            }

            let idx = self.add_entry(in_root, &mut diridx);
            let read_only = self.read_only;
            let e = self.entry_mut(in_root, idx);
            e[..11].copy_from_slice(&padded_short_name(&f.name));
            e[11] = f.attr
                | if read_only { ATTR_READ_ONLY as u8 } else { 0 }
                | if long.is_some() { ATTR_PENDING_SHORT_NAME } else { 0 };
            put16(e, 18, f.date);
            put16(e, 22, f.time);
            put16(e, 24, f.date);

            if dot || dotdot {
                set_cluster(e, if dot { my_cluster } else { parent_cluster });
            } else if !is_volume && f.attr as u16 & ATTR_DIRECTORY == 0 {
                put32(e, 28, f.size);
                let file_idx = self.files.len() as u32;
                self.files.push(FatFile { path, first_sector: 0 });
                let sectors = (f.size as u64).div_ceil(bytes_per_cluster) * self.sectors_per_cluster as u64;
                self.file_at_sector.extend(std::iter::repeat(file_idx).take(sectors as usize));
            }
            if let Some(long) = long {
                pending.insert(idx, long);
            }
        }

        // Subdirectories go after this directory's own clusters
        let end = diridx.max(first_idx);
        for ei in first_idx..end {
            let e = self.entry(in_root, ei);
            let attr = e[11];
            if attr & ATTR_LONG_NAME_MASK == ATTR_LONG_NAME {
                continue;
            }
            let mut child = None;
            if attr & ATTR_DIRECTORY as u8 != 0 {
                if e[0] == b'.' {
                    continue;
                }
                let this = FoundEntry {
                    name: unpadded_short_name(&e[..11]),
                    size: 0,
                    date: get16(e, 24),
                    time: get16(e, 22),
                    attr: attr & !(ATTR_PENDING_SHORT_NAME | ATTR_READ_ONLY as u8),
                };
                child = Some((join_path(dir, &this.name), this));
            }
            if let Some(long) = pending.get(&ei) {
                self.assign_short_name(in_root, first_idx, end, ei, long);
            }
            if let Some((path, this)) = child {
                let cluster = (2 + self.entry_count(false) / epc) as u32;
                set_cluster(self.entry_mut(in_root, ei), cluster);
                self.parse_dir(drive, &path, Some(&this), my_cluster)?;
            }
        }
        Ok(())
    }

    /// Replace a long-named entry's short name with one derived from the long name.
    fn assign_short_name(&mut self, in_root: bool, first: usize, end: usize, ei: usize, long: &str) {
        let (mut name, tail_at, lossy) = short_name_from_long(long);
        if lossy {
            for n in 1..=999_999 {
                apply_tail(&mut name, tail_at, n);
                let conflict = (first..end).any(|other| {
                    let e = self.entry(in_root, other);
                    e[11] & (ATTR_VOLUME as u8 | ATTR_PENDING_SHORT_NAME) == 0 && e[..11] == name
                });
                if !conflict {
                    break;
                }
            }
        }
        let sum = lfn_checksum(&name);
        let blocks = long.len().div_ceil(13);
        for le in ei.saturating_sub(blocks)..ei {
            self.entry_mut(in_root, le)[13] = sum;
        }
        let e = self.entry_mut(in_root, ei);
        e[..11].copy_from_slice(&name);
        e[11] &= !ATTR_PENDING_SHORT_NAME;
    }

    /// Give every file its cluster chain, in directory order. Returns the first free cluster.
    fn assign_file_clusters(&mut self) -> u32 {
        let spc = self.sectors_per_cluster;
        let bytes_per_cluster = spc as u64 * BYTES_PER_SECTOR as u64;
        let mut file_cluster = (2 + self.entry_count(false) / self.entries_per_cluster()) as u32;
        let mut file_sector = 0u32;
        for in_root in [true, false] {
            for i in 0..self.entry_count(in_root) {
                let e = self.entry(in_root, i);
                let size = get32(e, 28);
                if size == 0 || e[11] & ATTR_LONG_NAME_MASK == ATTR_LONG_NAME {
                    continue;
                }
                set_cluster(self.entry_mut(in_root, i), file_cluster);
                let clusters = (size as u64).div_ceil(bytes_per_cluster) as u32;
                for c in file_cluster..file_cluster + clusters - 1 {
                    self.set_fat(c as usize, c + 1);
                }
                self.set_fat((file_cluster + clusters - 1) as usize, FAT_END_OF_CHAIN);

                let file_idx = self.file_at_sector[file_sector as usize] as usize;
                self.files[file_idx].first_sector = file_sector;
                file_cluster += clusters;
                file_sector += clusters * spc;
            }
        }
        file_cluster
    }

    fn finish(&mut self, file_cluster: u32, add_free_mb: u32) {
        let bits = self.fat_bits as u32;
        let spc = self.sectors_per_cluster;

        // At least one FAT page after the last file, and the FAT type minimum
        let page_clusters = BYTES_PER_SECTOR as u32 * 8 / bits;
        let min_clusters = match bits {
            32 => 65525,
            16 => 4085,
            _ => 0,
        } + page_clusters;
        let add_free_clusters = (add_free_mb * (1024 * 1024 / BYTES_PER_SECTOR as u32)).div_ceil(spc);
        let target = file_cluster + add_free_clusters.max(page_clusters);
        self.set_fat((target.max(min_clusters) - 1) as usize, 0);
        self.total_clusters = (self.fat.len() * 8 / bits as usize) as u32;

        if self.read_only {
            for c in file_cluster..self.total_clusters {
                self.set_fat(c as usize, FAT_BAD_CLUSTER);
            }
        }

        let sectors_per_fat = (self.fat.len() / BYTES_PER_SECTOR) as u32;
        let reserved: u32 = if bits == 32 { 32 } else { 1 };
        let mut r = Regions {
            fat1_start: SECT_BOOT + reserved,
            ..Default::default()
        };
        r.fat2_start = r.fat1_start + sectors_per_fat;
        r.root_start = r.fat2_start + sectors_per_fat;
        r.dirs_start = r.root_start + (self.root.len() / BYTES_PER_SECTOR) as u32;
        r.files_start = r.dirs_start + (self.dirs.len() / BYTES_PER_SECTOR) as u32;
        r.files_end = r.files_start + self.file_at_sector.len() as u32;
        r.disk_end = (SECT_BOOT + self.total_clusters * spc + reserved).max(r.files_end);
        self.regions = r;
        let part_size = r.disk_end - SECT_BOOT;

        if self.serial == 0 {
            let mut h = crc32fast::Hasher::new();
            h.update(&self.fat);
            h.update(&self.root);
            h.update(&self.dirs);
            self.serial = h.finalize();
        }
        self.write_mbr(part_size);
        self.write_boot(part_size, reserved, sectors_per_fat);
    }

    fn write_mbr(&mut self, part_size: u32) {
        let disk_end = self.regions.disk_end;
        let mbr = &mut self.mbr;
        put32(mbr, 440, self.serial);
        mbr[446] = 0x80;
        if (disk_end - 1) / (HEAD_COUNT * SECTORS_PER_TRACK) <= 0x3FF {
            mbr[447..450].copy_from_slice(&chs(SECT_BOOT));
            mbr[451..454].copy_from_slice(&chs(disk_end - 1));
        }
        mbr[450] = match self.fat_bits {
            12 => 0x01,
            16 if disk_end < 65536 => 0x04,
            16 => 0x06,
            _ => 0x0C,
        };
        put32(mbr, 454, SECT_BOOT);
        put32(mbr, 458, part_size);
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
    }

    fn write_boot(&mut self, part_size: u32, reserved: u32, sectors_per_fat: u32) {
        let serial = self.serial;
        let b = &mut self.boot;
        b[0..3].copy_from_slice(b"\xEB\x3C\x90");
        b[3..11].copy_from_slice(b"MSWIN4.1");
        put16(b, 11, BYTES_PER_SECTOR as u16);
        b[13] = self.sectors_per_cluster as u8;
        put16(b, 14, reserved as u16);
        b[16] = 2;
        b[21] = 0xF8;
        put16(b, 24, SECTORS_PER_TRACK as u16);
        put16(b, 26, HEAD_COUNT as u16);
        put32(b, 28, SECT_BOOT);
        put32(b, 32, part_size);
        b[510] = 0x55;
        b[511] = 0xAA;

        if self.fat_bits != 32 {
            put16(b, 17, (self.root.len() / ENTRY_SIZE) as u16);
            put16(b, 22, sectors_per_fat as u16);
            b[36] = 0x80;
            b[38] = 0x29;
            put32(b, 39, serial.wrapping_add(1));
            b[43..54].copy_from_slice(b"NO NAME    ");
            b[54..62].copy_from_slice(b"FAT1    ");
            b[58] = b'0' + self.fat_bits % 10;
        } else {
            put32(b, 36, sectors_per_fat);
            put32(b, 44, 2);
            put16(b, 48, 1);
            put16(b, 50, 6);
            b[64] = 0x80;
            b[66] = 0x29;
            put32(b, 67, serial.wrapping_add(1));
            b[71..82].copy_from_slice(b"NO NAME    ");
            b[82..90].copy_from_slice(b"FAT32   ");

            let fs = &mut self.fsinfo;
            put32(fs, 0, 0x4161_5252);
            put32(fs, 484, 0x6141_7272);
            put32(fs, 488, 0xFFFF_FFFF);
            put32(fs, 492, 0xFFFF_FFFF);
            put32(fs, 508, 0xAA55_0000);
        }
    }

    /// Where the unmodified content of sector `n` comes from.
    pub(crate) fn sector_source(&self, n: u32) -> SectorSource<'_> {
        let r = &self.regions;
        if n >= r.files_end {
            SectorSource::Empty
        } else if n >= r.files_start {
            let rel = n - r.files_start;
            let index = self.file_at_sector[rel as usize] as usize;
            let offset = (rel - self.files[index].first_sector) * BYTES_PER_SECTOR as u32;
            SectorSource::File { index, offset }
        } else if n >= r.dirs_start {
            sector_slice(&self.dirs, n - r.dirs_start)
        } else if n >= r.root_start {
            sector_slice(&self.root, n - r.root_start)
        } else if n >= r.fat2_start {
            sector_slice(&self.fat, n - r.fat2_start)
        } else if n >= r.fat1_start {
            sector_slice(&self.fat, n - r.fat1_start)
        } else if n == SECT_BOOT || n == SECT_BOOT + 6 {
            SectorSource::Static(&self.boot)
        } else if n == SECT_MBR {
            SectorSource::Static(&self.mbr)
        } else if [1, 2, 7, 8].contains(&(n.wrapping_sub(SECT_BOOT))) {
            // FS-info sector, the boot code sector and their backups
            SectorSource::Static(&self.fsinfo)
        } else {
            SectorSource::Empty
        }
    }
}

fn sector_slice(table: &[u8], sector: u32) -> SectorSource<'_> {
    let at = sector as usize * BYTES_PER_SECTOR;
    SectorSource::Static(&table[at..at + BYTES_PER_SECTOR])
}

/// Cylinder/head/sector triple of a partition table entry.
fn chs(lba: u32) -> [u8; 3] {
    let cylinder = lba / (HEAD_COUNT * SECTORS_PER_TRACK);
    let head = (lba / SECTORS_PER_TRACK) % HEAD_COUNT;
    let sector = (lba % SECTORS_PER_TRACK) + 1;
    [
        head as u8,
        (sector & 0x3F) as u8 | ((cylinder >> 8) & 0x3) as u8,
        cylinder as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryDrive;

    fn name(s: &[u8; 11]) -> &str {
        std::str::from_utf8(s).unwrap()
    }

    #[test]
    fn test_size_tiers() {
        assert_eq!(size_tier(0), (12, 1));
        assert_eq!(size_tier(1), (12, 2));
        assert_eq!(size_tier(3), (12, 4));
        assert_eq!(size_tier(4), (16, 1));
        assert_eq!(size_tier(100), (16, 16));
        assert_eq!(size_tier(500), (16, 64));
        assert_eq!(size_tier(2048), (32, 32));
        assert_eq!(size_tier(5000), (32, 64));
    }

    #[test]
    fn test_short_name_from_long() {
        let (n, _, lossy) = short_name_from_long("readme.txt");
        assert_eq!(name(&n), "README  TXT");
        assert!(!lossy);

        let (mut n, tail_at, lossy) = short_name_from_long("Long File Name.txt");
        assert_eq!(name(&n), "LONGFILETXT");
        assert!(lossy);
        apply_tail(&mut n, tail_at, 1);
        assert_eq!(name(&n), "LONGFI~1TXT");

        let (mut n, tail_at, lossy) = short_name_from_long("My Document.html");
        assert!(lossy);
        apply_tail(&mut n, tail_at, 12);
        assert_eq!(name(&n), "MYDOC~12HTM");

        let (mut n, tail_at, lossy) = short_name_from_long("a+b");
        assert!(lossy);
        apply_tail(&mut n, tail_at, 1);
        assert_eq!(name(&n), "A_B~1      ");
    }

    #[test]
    fn test_fat12_packing() {
        let mut drive = MemoryDrive::new();
        let mut layout = FatLayout::build(&mut drive, 0, 1, true).unwrap();
        assert_eq!(layout.fat_bits(), 12);
        assert_eq!(&layout.fat[..3], &[0xF8, 0xFF, 0xFF]);
        layout.set_fat(2, 0x123);
        layout.set_fat(3, 0x456);
        assert_eq!(&layout.fat[3..6], &[0x23, 0x61, 0x45]);
    }

    #[test]
    fn test_lfn_checksum() {
        assert_eq!(lfn_checksum(b"           "), lfn_checksum(b"           "));
        let a = lfn_checksum(b"LONGFI~1TXT");
        let b = lfn_checksum(b"LONGFI~2TXT");
        assert_ne!(a, b);
    }

    #[test]
    fn test_regions_are_ordered() {
        let mut drive = MemoryDrive::new();
        drive.add_file("A.TXT", vec![1u8; 3000]);
        drive.add_file("SUB\\B.TXT", vec![2u8; 10]);
        let layout = FatLayout::build(&mut drive, 0, 0, false).unwrap();
        let r = layout.regions();
        assert_eq!(r.fat1_start, SECT_BOOT + 1);
        assert!(r.fat1_start < r.fat2_start);
        assert!(r.fat2_start < r.root_start);
        assert!(r.root_start < r.dirs_start);
        assert!(r.dirs_start < r.files_start);
        assert!(r.files_start < r.files_end);
        assert!(r.files_end <= r.disk_end);
        assert_ne!(layout.serial(), 0);
    }

    #[test]
    fn test_chs() {
        assert_eq!(chs(32), [0, 33, 0]);
        assert_eq!(chs(HEAD_COUNT * SECTORS_PER_TRACK), [0, 1, 1]);
    }
}
