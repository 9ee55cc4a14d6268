//! Read-only drive over the central directory of a ZIP archive.
//!
//! - The directory tree is built once from the central directory (Zip64 aware)
//! - Member names become unique 8.3 names; the long name is read back from the
//!   local header on request
//! - Local headers are validated and decoders created lazily on first open

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::codec::{method_supported, open_unpacker, MemberData, Unpacker, METHOD_STORED};
use super::source::{le16, le32, le64, ArchiveSource, SeekSource};
use crate::config::ZipConfig;
use crate::error::{CoreError, CoreResult, DosError, DriveResult};
use crate::fs::drive::*;
use crate::fs::{DriveSession, HashDirectory};
use crate::fs::path::{canonical_path, join_path, make_8dot3, split_parent};

const ROOT: usize = 0;

const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD_SIZE: usize = 22;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_LOCATOR_SIZE: u64 = 20;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_EOCD_SIZE: usize = 56;
const CDH_SIG: u32 = 0x0201_4b50;
const CDH_SIZE: usize = 46;
const LDH_SIG: u32 = 0x0403_4b50;
const LDH_SIZE: usize = 30;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Chunk size of the backwards end-of-central-directory scan.
const EOCD_SCAN_CHUNK: usize = 4096;
/// Largest central directory accepted.
const MAX_CDIR_SIZE: u64 = 0x1000_0000;
/// Encrypted or patch data members are skipped.
const FLAG_ENCRYPTED: u16 = 1;
const FLAG_PATCHED: u16 = 32;
/// DOS directory bit in the external attributes.
const EXTATTR_DIRECTORY: u32 = 0x10;

#[derive(Debug, Clone)]
struct EntryMeta {
    name: String,
    date: u16,
    time: u16,
    attr: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    File(usize),
    Dir(usize),
}

struct ZipFile {
    meta: EntryMeta,
    member: MemberData,
    header_ofs: u64,
    header_checked: bool,
    unpacker: Option<Box<dyn Unpacker>>,
}

struct ZipDir {
    meta: EntryMeta,
    header_ofs: u64,
    entries: HashDirectory<Node>,
}

struct ZipHandle {
    file: usize,
    pos: u32,
    flags: u32,
}

struct ZipSearch {
    dir: usize,
    index: usize,
}

/// Central directory location read from the end records.
struct CentralDir {
    total: u64,
    size: u64,
    ofs: u64,
}

/// Drive presenting the members of one ZIP archive.
pub struct ZipDrive {
    source: Box<dyn ArchiveSource>,
    config: ZipConfig,
    files: Vec<ZipFile>,
    dirs: Vec<ZipDir>,
    directories: HashDirectory<usize>,
    session: DriveSession<ZipHandle, ZipSearch>,
    total_decomp_size: u64,
    skip_root_len: usize,
}

fn invalid(reason: &str) -> CoreError {
    CoreError::InvalidArchive(reason.to_string())
}

fn is_sep(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

/// Scan backwards from the end for the end-of-central-directory signature.
fn find_eocd(src: &mut dyn ArchiveSource, size: u64) -> CoreResult<Option<u64>> {
    let mut buf = [0u8; EOCD_SCAN_CHUNK];
    let mut ofs = size.saturating_sub(EOCD_SCAN_CHUNK as u64);
    loop {
        let n = (size - ofs).min(EOCD_SCAN_CHUNK as u64) as usize;
        if src.read_full_at(ofs, &mut buf[..n])? != n {
            return Ok(None);
        }
        if let Some(i) = (0..=n - 4).rev().find(|&i| le32(&buf, i) == EOCD_SIG) {
            return Ok(Some(ofs + i as u64));
        }
        // The comment field limits how far the record can be from the end
        if ofs == 0 || size - ofs >= 0xFFFF + EOCD_SIZE as u64 {
            return Ok(None);
        }
        // Overlap by three bytes so a signature split over two chunks is found
        ofs = ofs.saturating_sub((EOCD_SCAN_CHUNK - 3) as u64);
    }
}

fn read_zip64_end(src: &mut dyn ArchiveSource, eocd_ofs: u64) -> CoreResult<Option<CentralDir>> {
    let mut loc = [0u8; ZIP64_LOCATOR_SIZE as usize];
    if src.read_full_at(eocd_ofs - ZIP64_LOCATOR_SIZE, &mut loc)? != loc.len() || le32(&loc, 0) != ZIP64_LOCATOR_SIG {
        return Ok(None);
    }
    let rec_ofs = le64(&loc, 8);
    let mut rec = [0u8; ZIP64_EOCD_SIZE];
    if src.read_full_at(rec_ofs, &mut rec)? != rec.len() || le32(&rec, 0) != ZIP64_EOCD_SIG {
        return Ok(None);
    }
    Ok(Some(CentralDir {
        total: le64(&rec, 32),
        size: le64(&rec, 40),
        ofs: le64(&rec, 48),
    }))
}

/// Replace 32-bit sentinel fields with their values from the Zip64 extra field.
/// Returns false if a needed value is missing.
fn apply_zip64_extra(extra: &[u8], decomp: &mut u64, comp: &mut u64, header_ofs: &mut u64) -> bool {
    let mut x = 0;
    while x + 4 <= extra.len() {
        let id = le16(extra, x);
        let field_end = x + 4 + le16(extra, x + 2) as usize;
        if id != ZIP64_EXTRA_ID || field_end > extra.len() {
            x = field_end;
            continue;
        }
        let mut f = x + 4;
        for v in [&mut *decomp, &mut *comp, &mut *header_ofs] {
            if *v != 0xFFFF_FFFF {
                continue;
            }
            if field_end - f < 8 {
                return false;
            }
            *v = le64(extra, f);
            f += 8;
        }
        break;
    }
    true
}

/// Length of a directory prefix shared by every record, or 0.
fn solo_root_len(cdir: &[u8], total: u64) -> usize {
    let mut p = 0;
    let mut root_len = 0;
    let mut prev: &[u8] = &[];
    for _ in 0..total {
        if p + CDH_SIZE > cdir.len() || le32(cdir, p) != CDH_SIG {
            break;
        }
        let name_len = le16(cdir, p + 28) as usize;
        let header_len = CDH_SIZE + name_len + le16(cdir, p + 30) as usize + le16(cdir, p + 32) as usize;
        let Some(name) = cdir.get(p + CDH_SIZE..p + CDH_SIZE + name_len) else {
            break;
        };
        if name.is_empty() {
            return 0;
        }
        let root = match name[1..].iter().position(|&c| is_sep(c)) {
            Some(i) => i + 1,
            None if le32(cdir, p + 38) & EXTATTR_DIRECTORY == 0 => return 0,
            None => name.len(),
        };
        if root_len != 0 && (root_len != root || name[..root] != prev[..root]) {
            return 0;
        }
        root_len = root;
        prev = name;
        p += header_len;
    }
    root_len
}

/// Perturb a colliding 8.3 name until it is unique in `entries`.
fn unique_name(entries: &HashDirectory<Node>, name: String) -> Option<String> {
    let mut b = name.into_bytes();
    loop {
        let s = String::from_utf8(b.clone()).ok()?;
        if !entries.contains(&s) {
            return Some(s);
        }
        let base_len = b.iter().position(|&c| c == b'.').unwrap_or(b.len());
        let j = if base_len > 8 { 4 } else { base_len / 2 };
        let bumpable = |b: &[u8], k: usize| b.get(k).is_some_and(|&c| c < b'~');
        let k = if base_len >= 1 && bumpable(&b, j) {
            j
        } else if base_len >= 3 && bumpable(&b, j + 1) {
            j + 1
        } else if base_len >= 5 && bumpable(&b, j + 2) {
            j + 2
        } else {
            return None;
        };
        b[k] += 1;
    }
}

impl ZipDrive {
    /// Mount an archive from any random-access source.
    pub fn new(source: impl ArchiveSource + 'static, config: ZipConfig) -> CoreResult<Self> {
        let root = ZipDir {
            meta: EntryMeta {
                name: String::new(),
                date: 0xFFFF,
                time: 0xFFFF,
                attr: ATTR_VOLUME | ATTR_DIRECTORY,
            },
            header_ofs: 0,
            entries: HashDirectory::new(),
        };
        let mut drive = Self {
            source: Box::new(source),
            config,
            files: Vec::new(),
            dirs: vec![root],
            directories: HashDirectory::new(),
            session: DriveSession::new(),
            total_decomp_size: 0,
            skip_root_len: 0,
        };
        drive.parse()?;
        debug!(
            files = drive.files.len(),
            dirs = drive.dirs.len() - 1,
            size = drive.total_decomp_size,
            "mounted zip"
        );
        Ok(drive)
    }

    /// Mount an archive file from the host.
    pub fn open(path: impl AsRef<Path>, config: ZipConfig) -> CoreResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(SeekSource::new(BufReader::new(file))?, config)
    }

    /// Sum of the uncompressed sizes of all accepted members.
    pub fn total_uncompressed_size(&self) -> u64 {
        self.total_decomp_size
    }

    fn parse(&mut self) -> CoreResult<()> {
        let size = self.source.size();
        if size < EOCD_SIZE as u64 {
            return Err(invalid("too small"));
        }
        let eocd_ofs = find_eocd(&mut *self.source, size)?.ok_or_else(|| invalid("no end of central directory"))?;
        let mut eocd = [0u8; EOCD_SIZE];
        if self.source.read_full_at(eocd_ofs, &mut eocd)? != EOCD_SIZE {
            return Err(invalid("truncated end of central directory"));
        }
        let mut cd = CentralDir {
            total: le16(&eocd, 10) as u64,
            size: le32(&eocd, 12) as u64,
            ofs: le32(&eocd, 16) as u64,
        };
        let sentinel = cd.ofs == 0xFFFF_FFFF || cd.size == 0xFFFF_FFFF || cd.total == 0xFFFF;
        if sentinel && eocd_ofs >= ZIP64_LOCATOR_SIZE + ZIP64_EOCD_SIZE as u64 {
            if let Some(cd64) = read_zip64_end(&mut *self.source, eocd_ofs)? {
                cd = cd64;
            }
        }
        if cd.total == 0
            || cd.size >= MAX_CDIR_SIZE
            || cd.size < cd.total.saturating_mul(CDH_SIZE as u64)
            || cd.ofs.checked_add(cd.size).map_or(true, |end| end > size)
        {
            return Err(invalid("bad central directory"));
        }

        let mut cdir = vec![0u8; cd.size as usize];
        if self.source.read_full_at(cd.ofs, &mut cdir)? != cdir.len() {
            return Err(invalid("truncated central directory"));
        }
        if self.config.enter_solo_root_dir {
            self.skip_root_len = solo_root_len(&cdir, cd.total);
        }

        let mut p = 0;
        for _ in 0..cd.total {
            if p + CDH_SIZE > cdir.len() || le32(&cdir, p) != CDH_SIG {
                break;
            }
            let next = p
                + CDH_SIZE
                + le16(&cdir, p + 28) as usize
                + le16(&cdir, p + 30) as usize
                + le16(&cdir, p + 32) as usize;
            if next <= cdir.len() {
                self.add_record(&cdir[p..next], size);
            }
            p = next;
        }

        let root = &mut self.dirs[ROOT].meta;
        if root.time == 0xFFFF {
            root.date = 0;
            root.time = 0;
        }
        Ok(())
    }

    fn add_record(&mut self, rec: &[u8], archive_size: u64) {
        let flags = le16(rec, 8);
        let method = le16(rec, 10);
        let time = le16(rec, 12);
        let date = le16(rec, 14);
        let mut comp = le32(rec, 20) as u64;
        let mut decomp = le32(rec, 24) as u64;
        let name_len = le16(rec, 28) as usize;
        let extra_len = le16(rec, 30) as usize;
        let ext_attr = le32(rec, 38);
        let mut header_ofs = le32(rec, 42) as u64;
        let name = &rec[CDH_SIZE..CDH_SIZE + name_len];
        let extra = &rec[CDH_SIZE + name_len..CDH_SIZE + name_len + extra_len];

        if !method_supported(method) || flags & (FLAG_ENCRYPTED | FLAG_PATCHED) != 0 {
            debug!(name = %String::from_utf8_lossy(name), method, flags, "skipping unsupported member");
            return;
        }
        if (decomp == 0xFFFF_FFFF || comp == 0xFFFF_FFFF || header_ofs == 0xFFFF_FFFF)
            && !apply_zip64_extra(extra, &mut decomp, &mut comp, &mut header_ofs)
        {
            return;
        }
        if (method == METHOD_STORED && decomp != comp)
            || (decomp > 0 && comp == 0)
            || decomp > u32::MAX as u64
            || comp > u32::MAX as u64
            || header_ofs
                .checked_add(LDH_SIZE as u64 + comp)
                .map_or(true, |end| end > archive_size)
        {
            debug!(name = %String::from_utf8_lossy(name), "skipping member with inconsistent sizes");
            return;
        }

        self.total_decomp_size += decomp;
        let root = &mut self.dirs[ROOT].meta;
        if date < root.date || (date == root.date && time < root.time) {
            root.date = date;
            root.time = time;
        }

        let Some(&last) = name.last() else {
            return;
        };
        let is_dir = is_sep(last) || ext_attr & EXTATTR_DIRECTORY != 0;
        let name = &name[self.skip_root_len.min(name.len())..];
        let parts: Vec<&[u8]> = name.split(|&c| is_sep(c)).filter(|c| !c.is_empty()).collect();

        let mut parent = ROOT;
        let mut dos_path = String::new();
        for (i, part) in parts.iter().enumerate() {
            let short = make_8dot3(part);
            if i + 1 == parts.len() && !is_dir {
                let Some(unique) = unique_name(&self.dirs[parent].entries, short) else {
                    debug!(path = %dos_path, "no unique 8.3 name left for member");
                    return;
                };
                if join_path(&dos_path, &unique).len() > DOS_PATHLENGTH {
                    return;
                }
                let id = self.files.len();
                self.files.push(ZipFile {
                    meta: EntryMeta {
                        name: unique.clone(),
                        date,
                        time,
                        attr: ATTR_ARCHIVE,
                    },
                    member: MemberData {
                        data_ofs: header_ofs,
                        comp_size: comp as u32,
                        uncomp_size: decomp as u32,
                        bit_flags: flags,
                        method,
                    },
                    header_ofs,
                    header_checked: false,
                    unpacker: None,
                });
                self.dirs[parent].entries.put(&unique, Node::File(id));
                return;
            }

            let full = join_path(&dos_path, &short);
            if full.len() > DOS_PATHLENGTH {
                return;
            }
            let dir = match self.directories.get(&full) {
                Some(&d) => d,
                None => {
                    // A file already took this name
                    if self.dirs[parent].entries.contains(&short) {
                        return;
                    }
                    let id = self.dirs.len();
                    self.dirs.push(ZipDir {
                        meta: EntryMeta {
                            name: short.clone(),
                            date,
                            time,
                            attr: ATTR_DIRECTORY,
                        },
                        header_ofs,
                        entries: HashDirectory::new(),
                    });
                    self.dirs[parent].entries.put(&short, Node::Dir(id));
                    self.directories.put(&full, id);
                    id
                }
            };
            parent = dir;
            dos_path = full;
        }
    }

    fn dir_id(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            Some(ROOT)
        } else {
            self.directories.get(path).copied()
        }
    }

    fn lookup(&self, path: &str) -> Option<Node> {
        if path.is_empty() {
            return Some(Node::Dir(ROOT));
        }
        let (parent, name) = split_parent(path);
        let dir = self.dir_id(parent)?;
        self.dirs[dir].entries.get(name).copied()
    }

    fn stat_node(&self, node: Node) -> FileStat {
        let (meta, size) = match node {
            Node::File(f) => (&self.files[f].meta, self.files[f].member.uncomp_size),
            Node::Dir(d) => (&self.dirs[d].meta, 0),
        };
        FileStat {
            attr: meta.attr,
            size,
            date: meta.date,
            time: meta.time,
        }
    }

    fn seek_cache_path(&self, path: &str) -> Option<PathBuf> {
        let dir = self.config.seek_cache_dir.as_ref()?;
        let mut name = path.replace('\\', "_");
        if let Some(dot) = name.rfind('.') {
            if name.len() - dot <= 4 {
                name.truncate(dot);
            }
        }
        name.push_str(".SKC");
        Some(dir.join(name))
    }

    /// Validate the local header and move the data offset past it.
    fn check_local_header(&mut self, f: usize) -> DriveResult<()> {
        let size = self.source.size();
        let file = &mut self.files[f];
        if file.header_checked {
            return Ok(());
        }
        let mut hdr = [0u8; LDH_SIZE];
        let n = self
            .source
            .read_full_at(file.header_ofs, &mut hdr)
            .map_err(|_| DosError::DataInvalid)?;
        if n != LDH_SIZE || le32(&hdr, 0) != LDH_SIG {
            warn!(name = %file.meta.name, "bad local header");
            return Err(DosError::DataInvalid);
        }
        let header_len = LDH_SIZE as u64 + le16(&hdr, 26) as u64 + le16(&hdr, 28) as u64;
        let Some(data_ofs) = file.header_ofs.checked_add(header_len) else {
            return Err(DosError::DataInvalid);
        };
        if data_ofs
            .checked_add(file.member.comp_size as u64)
            .map_or(true, |end| end > size)
        {
            warn!(name = %file.meta.name, "member data past end of archive");
            return Err(DosError::DataInvalid);
        }
        file.member.data_ofs = data_ofs;
        file.header_checked = true;
        Ok(())
    }
}

impl Drive for ZipDrive {
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle> {
        check_access_code(flags)?;
        if open_is_writing(flags) {
            return Err(DosError::AccessDenied);
        }
        let path = canonical_path(path);
        let file = match self.lookup(&path) {
            Some(Node::File(f)) => f,
            _ => return Err(DosError::FileNotFound),
        };
        self.check_local_header(file)?;
        let cache = self.seek_cache_path(&path);
        let zf = &mut self.files[file];
        if zf.unpacker.is_none() && zf.member.uncomp_size > 0 {
            zf.unpacker = Some(open_unpacker(&mut *self.source, &zf.member, cache)?);
        }
        Ok(self.session.open(ZipHandle { file, pos: 0, flags }))
    }

    fn file_create(&mut self, _path: &str, _attr: u16) -> DriveResult<FileHandle> {
        Err(DosError::AccessDenied)
    }

    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
        let (file, pos) = {
            let h = self.session.handle(handle)?;
            (h.file, h.pos)
        };
        let zf = &mut self.files[file];
        if pos >= zf.member.uncomp_size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((zf.member.uncomp_size - pos) as usize);
        let unpacker = zf.unpacker.as_mut().ok_or(DosError::InvalidHandle)?;
        let n = unpacker.read(&mut *self.source, &zf.member, pos, &mut buf[..want])?;
        if n == 0 {
            warn!(name = %zf.meta.name, pos, "member read returned no data");
            return Err(DosError::DataInvalid);
        }
        self.session.handle_mut(handle)?.pos = pos + n as u32;
        Ok(n)
    }

    fn file_write(&mut self, _handle: FileHandle, _data: &[u8]) -> DriveResult<usize> {
        Err(DosError::AccessDenied)
    }

    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32> {
        let h = self.session.handle_mut(handle)?;
        let size = self.files[h.file].member.uncomp_size;
        h.pos = mode.resolve(offset, h.pos, size);
        Ok(h.pos)
    }

    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat> {
        let file = self.session.handle(handle)?.file;
        Ok(self.stat_node(Node::File(file)))
    }

    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.add_ref(handle)
    }

    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.release(handle).map(|_| ())
    }

    fn file_unlink(&mut self, _path: &str) -> DriveResult<()> {
        Err(DosError::AccessDenied)
    }

    fn make_dir(&mut self, _path: &str) -> DriveResult<()> {
        Err(DosError::AccessDenied)
    }

    fn remove_dir(&mut self, _path: &str) -> DriveResult<()> {
        Err(DosError::AccessDenied)
    }

    fn test_dir(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        path.is_empty() || self.directories.contains(&path)
    }

    fn find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()> {
        let dir = canonical_path(dir);
        let id = self.dir_id(&dir).ok_or(DosError::PathNotFound)?;
        dta.dir_id = self.session.start_search(ZipSearch { dir: id, index: 0 });
        if find_drive_volume(self.label(), &dir, dta) {
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
        let dir = &self.dirs[dir_id];
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
        while found.is_none() && index - 2 < dir.entries.capacity() {
            let slot = index - 2;
            index += 1;
            let Some(&node) = dir.entries.get_at_index(slot) else {
                continue;
            };
            let stat = self.stat_node(node);
            let name = match node {
                Node::File(f) => &self.files[f].meta.name,
                Node::Dir(d) => &self.dirs[d].meta.name,
            };
            if dta.skips(name, stat.attr) {
                continue;
            }
            found = Some(FoundEntry {
                name: name.clone(),
                size: stat.size,
                date: stat.date,
                time: stat.time,
                attr: stat.attr as u8,
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
            .map(|n| self.stat_node(n))
            .ok_or(DosError::FileNotFound)
    }

    fn file_exists(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        matches!(self.lookup(&path), Some(Node::File(_)))
    }

    fn rename(&mut self, _old_path: &str, _new_path: &str) -> DriveResult<()> {
        Err(DosError::AccessDenied)
    }

    fn allocation_info(&mut self) -> AllocationInfo {
        const BYTES_PER_SECTOR: u64 = 512;
        let show = self.total_decomp_size.min(0xFFFF_FFFF - (512 * 224 - 1));
        let sectors_per_cluster = if show > (32 << 24) { (show >> 29) << 5 } else { 32 };
        let cluster = BYTES_PER_SECTOR * sectors_per_cluster;
        AllocationInfo {
            bytes_per_sector: BYTES_PER_SECTOR as u16,
            sectors_per_cluster: sectors_per_cluster as u8,
            total_clusters: show.div_ceil(cluster) as u16,
            free_clusters: 0,
        }
    }

    fn get_long_file_name(&mut self, path: &str) -> Option<String> {
        let path = canonical_path(path);
        if path.is_empty() {
            return None;
        }
        let node = self.lookup(&path)?;
        let (header_ofs, short) = match node {
            Node::File(f) => (self.files[f].header_ofs, &self.files[f].meta.name),
            Node::Dir(d) => (self.dirs[d].header_ofs, &self.dirs[d].meta.name),
        };
        let mut ldh = [0u8; LDH_SIZE + 512];
        let n = self.source.read_full_at(header_ofs, &mut ldh).ok()?;
        if n <= LDH_SIZE || le32(&ldh, 0) != LDH_SIG {
            return None;
        }
        let name_len = le16(&ldh, 26) as usize;
        if name_len == 0 || LDH_SIZE + name_len > n {
            return None;
        }
        let mut long = &ldh[LDH_SIZE..LDH_SIZE + name_len];
        long = &long[self.skip_root_len.min(long.len())..];
        while long.first().is_some_and(|&c| is_sep(c)) {
            long = &long[1..];
        }
        if long.last().is_some_and(|&c| is_sep(c)) {
            long = &long[..long.len() - 1];
        }
        if let Node::Dir(_) = node {
            // A directory entry may come from a deeper member; cut at its own depth
            let depth = path.matches('\\').count();
            if let Some((cut, _)) = long.iter().enumerate().filter(|&(_, &c)| is_sep(c)).nth(depth) {
                long = &long[..cut];
            }
        }
        let start = long.iter().rposition(|&c| is_sep(c)).map_or(0, |i| i + 1);
        let long = &long[start..];
        if long.is_empty() || long.len() > 255 || long == short.as_bytes() {
            return None;
        }
        Some(String::from_utf8_lossy(long).into_owned())
    }

    fn label(&self) -> &str {
        "ZIP"
    }

    fn unmount(&mut self) -> DriveResult<()> {
        self.session.close_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::collect_tree;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    fn build_zip(members: &[(&str, &[u8], CompressionMethod)]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, method) in members {
            if name.ends_with('/') {
                w.add_directory(*name, SimpleFileOptions::default()).unwrap();
                continue;
            }
            w.start_file(*name, SimpleFileOptions::default().compression_method(*method))
                .unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    /// Hand-assembled archive for methods the writer crate can't produce.
    fn raw_zip(members: &[(&str, u16, u16, &[u8], u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cdir = Vec::new();
        for (name, method, flags, comp, uncomp) in members {
            let lho = out.len() as u32;
            out.extend(LDH_SIG.to_le_bytes());
            out.extend(20u16.to_le_bytes());
            out.extend(flags.to_le_bytes());
            out.extend(method.to_le_bytes());
            out.extend([0u8; 8]); // time, date, crc
            out.extend((comp.len() as u32).to_le_bytes());
            out.extend(uncomp.to_le_bytes());
            out.extend((name.len() as u16).to_le_bytes());
            out.extend(0u16.to_le_bytes());
            out.extend(name.as_bytes());
            out.extend(*comp);

            cdir.extend(CDH_SIG.to_le_bytes());
            cdir.extend([20u8, 0, 20, 0]);
            cdir.extend(flags.to_le_bytes());
            cdir.extend(method.to_le_bytes());
            cdir.extend([0u8; 8]);
            cdir.extend((comp.len() as u32).to_le_bytes());
            cdir.extend(uncomp.to_le_bytes());
            cdir.extend((name.len() as u16).to_le_bytes());
            cdir.extend([0u8; 12]); // extra, comment, disk, int attr, ext attr
            cdir.extend(lho.to_le_bytes());
            cdir.extend(name.as_bytes());
        }
        let cdir_ofs = out.len() as u32;
        out.extend(&cdir);
        out.extend(EOCD_SIG.to_le_bytes());
        out.extend([0u8; 4]);
        out.extend((members.len() as u16).to_le_bytes());
        out.extend((members.len() as u16).to_le_bytes());
        out.extend((cdir.len() as u32).to_le_bytes());
        out.extend(cdir_ofs.to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out
    }

    /// Zip64 archive with one stored member whose sizes and offset live in the extra field.
    fn zip64_zip(data: &[u8], header_ofs: u64, cdir_ofs: Option<u64>) -> Vec<u8> {
        let name = b"BIG.DAT";
        let mut out = Vec::new();
        out.extend(LDH_SIG.to_le_bytes());
        out.extend([45u8, 0, 0, 0, 0, 0]); // version, flags, method
        out.extend([0u8; 8]);
        out.extend([0xFFu8; 8]);
        out.extend((name.len() as u16).to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend(name);
        out.extend(data);

        let cdir_start = out.len() as u64;
        out.extend(CDH_SIG.to_le_bytes());
        out.extend([45u8, 0, 45, 0, 0, 0, 0, 0]); // made by, needed, flags, method
        out.extend([0u8; 8]);
        out.extend([0xFFu8; 8]);
        out.extend((name.len() as u16).to_le_bytes());
        out.extend(28u16.to_le_bytes());
        out.extend([0u8; 10]); // comment, disk, int attr, ext attr
        out.extend(0xFFFF_FFFFu32.to_le_bytes());
        out.extend(name);
        out.extend(ZIP64_EXTRA_ID.to_le_bytes());
        out.extend(24u16.to_le_bytes());
        out.extend((data.len() as u64).to_le_bytes());
        out.extend((data.len() as u64).to_le_bytes());
        out.extend(header_ofs.to_le_bytes());
        let cdir_size = out.len() as u64 - cdir_start;

        let rec_ofs = out.len() as u64;
        out.extend(ZIP64_EOCD_SIG.to_le_bytes());
        out.extend(44u64.to_le_bytes());
        out.extend([45u8, 0, 45, 0]);
        out.extend([0u8; 8]); // disks
        out.extend(1u64.to_le_bytes());
        out.extend(1u64.to_le_bytes());
        out.extend(cdir_size.to_le_bytes());
        out.extend(cdir_ofs.unwrap_or(cdir_start).to_le_bytes());

        out.extend(ZIP64_LOCATOR_SIG.to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend(rec_ofs.to_le_bytes());
        out.extend(1u32.to_le_bytes());

        out.extend(EOCD_SIG.to_le_bytes());
        out.extend([0xFFu8; 8]); // disks and entry counts
        out.extend([0xFFu8; 8]); // size and offset
        out.extend(0u16.to_le_bytes());
        out
    }

    fn mount(bytes: Vec<u8>) -> ZipDrive {
        ZipDrive::new(bytes, ZipConfig::default()).unwrap()
    }

    fn names(drive: &mut ZipDrive, dir: &str) -> Vec<String> {
        let mut v: Vec<String> = list_dir(drive, dir, SEARCH_ALL_FILES)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_reads_stored_and_deflated_members() {
        let text = b"The quick brown fox jumps over the lazy dog. ".repeat(50);
        let bytes = build_zip(&[
            ("readme.txt", b"hello", CompressionMethod::Stored),
            ("game/data.txt", &text, CompressionMethod::Deflated),
        ]);
        let mut drive = mount(bytes);
        assert_eq!(names(&mut drive, ""), vec!["GAME", "README.TXT"]);
        assert_eq!(read_file(&mut drive, "README.TXT").unwrap(), b"hello");
        assert_eq!(read_file(&mut drive, "game\\data.txt").unwrap(), text);
        assert_eq!(drive.file_stat("GAME\\DATA.TXT").unwrap().size, text.len() as u32);
        assert!(drive.test_dir("GAME"));
        assert!(!drive.test_dir("GAME\\DATA.TXT"));
        assert!(drive.file_exists("GAME\\DATA.TXT"));
        assert!(!drive.file_exists("GAME"));
        assert_eq!(drive.total_uncompressed_size(), 5 + text.len() as u64);
    }

    #[test]
    fn test_seek_and_partial_reads() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut drive = mount(build_zip(&[("big.bin", &data, CompressionMethod::Deflated)]));
        let h = drive.file_open("BIG.BIN", OPEN_READ).unwrap();
        assert_eq!(drive.file_seek(h, 50_000, SeekMode::Set).unwrap(), 50_000);
        let mut buf = [0u8; 16];
        assert_eq!(drive.file_read(h, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..], &data[50_000..50_016]);
        assert_eq!(drive.file_seek(h, -8, SeekMode::End).unwrap(), 99_992);
        assert_eq!(drive.file_read(h, &mut buf).unwrap(), 8);
        assert_eq!(drive.file_read(h, &mut buf).unwrap(), 0);
        assert_eq!(drive.file_seek(h, -1_000_000, SeekMode::Cur).unwrap(), 0);
        drive.file_close(h).unwrap();
    }

    #[test]
    fn test_large_deflated_member_streams() {
        let data: Vec<u8> = (0..600_000u32).map(|i| ((i / 3) ^ (i >> 9)) as u8).collect();
        let mut drive = mount(build_zip(&[("large.dat", &data, CompressionMethod::Deflated)]));
        let h = drive.file_open("LARGE.DAT", OPEN_READ).unwrap();
        let mut buf = vec![0u8; 4000];
        for &ofs in &[500_000u32, 10, 300_000, 599_000] {
            drive.file_seek(h, ofs as i64, SeekMode::Set).unwrap();
            let n = read_exact_or_eof(&mut drive, h, &mut buf).unwrap();
            let end = (ofs as usize + n).min(data.len());
            assert_eq!(&buf[..n], &data[ofs as usize..end]);
        }
    }

    #[test]
    fn test_mutations_are_denied() {
        let mut drive = mount(build_zip(&[("a.txt", b"x", CompressionMethod::Stored)]));
        assert_eq!(drive.file_open("A.TXT", OPEN_WRITE), Err(DosError::AccessDenied));
        assert_eq!(drive.file_open("A.TXT", OPEN_READWRITE), Err(DosError::AccessDenied));
        assert_eq!(drive.file_open("A.TXT", 7), Err(DosError::AccessCodeInvalid));
        assert_eq!(drive.file_create("B.TXT", ATTR_ARCHIVE), Err(DosError::AccessDenied));
        assert_eq!(drive.file_unlink("A.TXT"), Err(DosError::AccessDenied));
        assert_eq!(drive.make_dir("NEW"), Err(DosError::AccessDenied));
        assert_eq!(drive.rename("A.TXT", "C.TXT"), Err(DosError::AccessDenied));
        let h = drive.file_open("A.TXT", OPEN_READ).unwrap();
        assert_eq!(drive.file_write(h, b"y"), Err(DosError::AccessDenied));
        assert_eq!(drive.file_open("MISSING", OPEN_READ), Err(DosError::FileNotFound));
    }

    #[test]
    fn test_colliding_short_names_are_perturbed() {
        let bytes = build_zip(&[
            ("abcdefgh1wxyz.txt", b"one", CompressionMethod::Stored),
            ("abcdefgh2wxyz.txt", b"two", CompressionMethod::Stored),
        ]);
        let mut drive = mount(bytes);
        assert_eq!(names(&mut drive, ""), vec!["ABCDWXYZ.TXT", "ABCDXXYZ.TXT"]);
        assert_eq!(read_file(&mut drive, "ABCDXXYZ.TXT").unwrap(), b"two");
        assert_eq!(drive.get_long_file_name("ABCDWXYZ.TXT").as_deref(), Some("abcdefgh1wxyz.txt"));
        assert_eq!(drive.get_long_file_name("ABCDXXYZ.TXT").as_deref(), Some("abcdefgh2wxyz.txt"));
    }

    #[test]
    fn test_long_names_of_dirs_and_short_members() {
        let bytes = build_zip(&[
            ("Program Files/", b"", CompressionMethod::Stored),
            ("Program Files/setup.exe", b"MZ", CompressionMethod::Stored),
            ("README.TXT", b"r", CompressionMethod::Stored),
        ]);
        let mut drive = mount(bytes);
        assert_eq!(drive.get_long_file_name("PROGILES").as_deref(), Some("Program Files"));
        assert_eq!(drive.get_long_file_name("PROGILES\\SETUP.EXE").as_deref(), Some("setup.exe"));
        assert_eq!(drive.get_long_file_name("README.TXT"), None);
        assert_eq!(drive.get_long_file_name(""), None);
        assert_eq!(drive.get_long_file_name("NOPE"), None);
    }

    #[test]
    fn test_solo_root_dir_is_entered() {
        let bytes = build_zip(&[
            ("mygame/", b"", CompressionMethod::Stored),
            ("mygame/game.exe", b"MZ", CompressionMethod::Stored),
            ("mygame/data/level1.dat", b"L1", CompressionMethod::Stored),
        ]);
        let config = ZipConfig {
            enter_solo_root_dir: true,
            ..Default::default()
        };
        let mut drive = ZipDrive::new(bytes.clone(), config).unwrap();
        assert_eq!(names(&mut drive, ""), vec!["DATA", "GAME.EXE"]);
        assert_eq!(read_file(&mut drive, "DATA\\LEVEL1.DAT").unwrap(), b"L1");
        assert_eq!(drive.get_long_file_name("DATA\\LEVEL1.DAT").as_deref(), Some("level1.dat"));

        let mut plain = mount(bytes);
        assert_eq!(names(&mut plain, ""), vec!["MYGAME"]);
    }

    #[test]
    fn test_solo_root_needs_a_shared_prefix() {
        let bytes = build_zip(&[
            ("one/a.txt", b"a", CompressionMethod::Stored),
            ("two/b.txt", b"b", CompressionMethod::Stored),
        ]);
        let config = ZipConfig {
            enter_solo_root_dir: true,
            ..Default::default()
        };
        let mut drive = ZipDrive::new(bytes, config).unwrap();
        assert_eq!(names(&mut drive, ""), vec!["ONE", "TWO"]);
    }

    #[test]
    fn test_search_lists_dots_outside_root() {
        let mut drive = mount(build_zip(&[("dir/f.txt", b"f", CompressionMethod::Stored)]));
        let mut dta = Dta::new(SEARCH_ALL_FILES, "*.*");
        drive.find_first("DIR", &mut dta).unwrap();
        assert_eq!(dta.result.name, ".");
        drive.find_next(&mut dta).unwrap();
        assert_eq!(dta.result.name, "..");
        drive.find_next(&mut dta).unwrap();
        assert_eq!(dta.result.name, "F.TXT");
        assert_eq!(drive.find_next(&mut dta), Err(DosError::NoMoreFiles));

        let mut dta = Dta::new(ATTR_VOLUME as u8, "*.*");
        drive.find_first("", &mut dta).unwrap();
        assert_eq!(dta.result.name, "ZIP");
        assert_eq!(drive.find_first("NOPE", &mut dta), Err(DosError::PathNotFound));
    }

    #[test]
    fn test_allocation_info_reports_full_disk() {
        let data = vec![7u8; 3000];
        let mut drive = mount(build_zip(&[("f.bin", &data, CompressionMethod::Deflated)]));
        let info = drive.allocation_info();
        assert_eq!(info.bytes_per_sector, 512);
        assert_eq!(info.sectors_per_cluster, 32);
        assert_eq!(info.total_clusters, 1);
        assert_eq!(info.free_clusters, 0);
        assert_eq!(drive.media_byte(), 0xF8);
    }

    #[test]
    fn test_invalid_archives_are_rejected() {
        assert!(matches!(ZipDrive::new(b"not a zip".to_vec(), ZipConfig::default()), Err(CoreError::InvalidArchive(_))));
        assert!(ZipDrive::new(vec![0u8; 5000], ZipConfig::default()).is_err());
        let empty = zip::ZipWriter::new(Cursor::new(Vec::new())).finish().unwrap().into_inner();
        assert!(ZipDrive::new(empty, ZipConfig::default()).is_err());
    }

    #[test]
    fn test_trailing_comment_is_scanned_past() {
        let mut bytes = build_zip(&[("a.txt", b"abc", CompressionMethod::Stored)]);
        // Grow the comment length field and append 5000 comment bytes
        let n = bytes.len();
        bytes[n - 2..].copy_from_slice(&5000u16.to_le_bytes());
        bytes.extend(vec![b'c'; 5000]);
        let mut drive = mount(bytes);
        assert_eq!(read_file(&mut drive, "A.TXT").unwrap(), b"abc");
    }

    #[test]
    fn test_legacy_methods_and_skipped_members() {
        // Shrunk: every byte as a 9-bit literal code
        let mut shrunk = Vec::new();
        let (mut buf, mut cnt) = (0u32, 0);
        for &b in b"HELLO" {
            buf |= (b as u32) << cnt;
            cnt += 9;
            while cnt >= 8 {
                shrunk.push(buf as u8);
                buf >>= 8;
                cnt -= 8;
            }
        }
        shrunk.push(buf as u8);

        // Imploded: uniform trees, raw literals
        let mut imploded = vec![3u8, 0xF5, 0xF5, 0xF5, 0xF5, 3, 0xF5, 0xF5, 0xF5, 0xF5];
        let (mut buf, mut cnt) = (0u32, 0);
        for &b in b"WORLD" {
            buf |= (1 | (b as u32) << 1) << cnt;
            cnt += 9;
            while cnt >= 8 {
                imploded.push(buf as u8);
                buf >>= 8;
                cnt -= 8;
            }
        }
        imploded.push(buf as u8);

        let bytes = raw_zip(&[
            ("SHRUNK.TXT", 1, 0, &shrunk, 5),
            ("IMPLODE.TXT", 6, 0, &imploded, 5),
            ("BZIP2.TXT", 12, 0, b"xx", 2),
            ("SECRET.TXT", 0, 1, b"xx", 2),
            ("EMPTY.TXT", 0, 0, b"", 0),
        ]);
        let mut drive = mount(bytes);
        assert_eq!(read_file(&mut drive, "SHRUNK.TXT").unwrap(), b"HELLO");
        assert_eq!(read_file(&mut drive, "IMPLODE.TXT").unwrap(), b"WORLD");
        assert_eq!(read_file(&mut drive, "EMPTY.TXT").unwrap(), b"");
        assert!(!drive.file_exists("BZIP2.TXT"));
        assert!(!drive.file_exists("SECRET.TXT"));
    }

    #[test]
    fn test_bad_local_header_fails_open() {
        let mut bytes = raw_zip(&[("A.TXT", 0, 0, b"data", 4)]);
        bytes[0] = b'X';
        let mut drive = mount(bytes);
        assert!(drive.file_exists("A.TXT"));
        assert_eq!(drive.file_open("A.TXT", OPEN_READ), Err(DosError::DataInvalid));
    }

    #[test]
    fn test_walk_whole_tree() {
        let mut drive = mount(build_zip(&[
            ("a/b/c.txt", b"c", CompressionMethod::Stored),
            ("a/d.txt", b"d", CompressionMethod::Stored),
        ]));
        let mut paths: Vec<String> = collect_tree(&mut drive).unwrap().into_iter().map(|e| e.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["A", "A\\B", "A\\B\\C.TXT", "A\\D.TXT"]);
    }

    #[test]
    fn test_zip64_records_supply_sizes_and_offsets() {
        let data = b"sizes from the zip64 extra field";
        let mut drive = mount(zip64_zip(data, 0, None));
        assert_eq!(drive.file_stat("BIG.DAT").unwrap().size, data.len() as u32);
        assert_eq!(read_file(&mut drive, "BIG.DAT").unwrap(), data);
    }

    #[test]
    fn test_zip64_directory_past_u64_range_is_rejected() {
        let bytes = zip64_zip(b"x", 0, Some(u64::MAX - 10));
        assert!(matches!(ZipDrive::new(bytes, ZipConfig::default()), Err(CoreError::InvalidArchive(_))));
    }

    #[test]
    fn test_zip64_header_offset_past_u64_range_skips_member() {
        let mut drive = mount(zip64_zip(b"x", u64::MAX - 5, None));
        assert!(!drive.file_exists("BIG.DAT"));
        assert_eq!(drive.total_uncompressed_size(), 0);
    }
}
