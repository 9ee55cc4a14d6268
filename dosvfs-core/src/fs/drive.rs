//! Drive trait - the contract every virtual drive implements.
//!
//! Paths are canonical DOS paths relative to the drive root: backslash separated,
//! 8.3 components, no leading backslash. The empty path is the root directory.
//! Open files and directory searches are addressed by small integer ids that the
//! drive hands out and recycles (see [`DriveSession`](super::DriveSession)).

use crate::error::{DosError, DriveResult};

use super::path::wild_file_cmp;

/// DOS attribute bits.
pub const ATTR_READ_ONLY: u16 = 0x01;
pub const ATTR_HIDDEN: u16 = 0x02;
pub const ATTR_SYSTEM: u16 = 0x04;
pub const ATTR_VOLUME: u16 = 0x08;
pub const ATTR_DIRECTORY: u16 = 0x10;
pub const ATTR_ARCHIVE: u16 = 0x20;
pub const ATTR_DEVICE: u16 = 0x40;

/// Open flags (access code in the low nibble).
pub const OPEN_READ: u32 = 0;
pub const OPEN_WRITE: u32 = 1;
pub const OPEN_READWRITE: u32 = 2;
pub const OPEN_READ_NO_MOD: u32 = 4;

/// Maximum length of an 8.3 name including the dot.
pub const DOS_NAMELENGTH: usize = 12;
/// Maximum length of a drive-relative path.
pub const DOS_PATHLENGTH: usize = 80;

/// Search attribute used when walking a whole tree (everything but the label).
pub const SEARCH_ALL_FILES: u8 = 0xff & !(ATTR_VOLUME as u8);

/// Returns true if the open flags allow writing.
pub fn open_is_writing(flags: u32) -> bool {
    flags & 3 != 0
}

/// Returns true if the open flags allow reading.
pub fn open_is_reading(flags: u32) -> bool {
    flags & 3 != OPEN_WRITE
}

/// Validate the access code of open flags.
pub fn check_access_code(flags: u32) -> DriveResult<()> {
    if flags & 0xf <= 4 {
        Ok(())
    } else {
        Err(DosError::AccessCodeInvalid)
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
    Cur,
    End,
}

impl SeekMode {
    /// Convert an INT 21h/42h origin code.
    pub fn from_dos(mode: u32) -> DriveResult<Self> {
        match mode {
            0 => Ok(SeekMode::Set),
            1 => Ok(SeekMode::Cur),
            2 => Ok(SeekMode::End),
            _ => Err(DosError::FunctionNumberInvalid),
        }
    }

    /// Resolve a seek against the current position and file size, clamping at 0.
    pub fn resolve(self, offset: i64, pos: u32, size: u32) -> u32 {
        let target = match self {
            SeekMode::Set => offset,
            SeekMode::Cur => pos as i64 + offset,
            SeekMode::End => size as i64 + offset,
        };
        target.clamp(0, u32::MAX as i64) as u32
    }
}

/// Id of an open file on one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub(crate) u16);

impl FileHandle {
    pub fn id(self) -> u16 {
        self.0
    }
}

/// Metadata of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub attr: u16,
    pub size: u32,
    pub date: u16,
    pub time: u16,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

/// Fabricated capacity numbers reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationInfo {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_clusters: u16,
    pub free_clusters: u16,
}

/// One directory search result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FoundEntry {
    pub name: String,
    pub size: u32,
    pub date: u16,
    pub time: u16,
    pub attr: u8,
}

impl FoundEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Disk transfer area of a directory search: parameters in, result out.
#[derive(Debug, Clone, Default)]
pub struct Dta {
    pub search_attr: u8,
    pub pattern: String,
    pub dir_id: u16,
    pub result: FoundEntry,
}

impl Dta {
    pub fn new(search_attr: u8, pattern: &str) -> Self {
        Self {
            search_attr,
            pattern: pattern.to_ascii_uppercase(),
            ..Default::default()
        }
    }

    /// Store a search result.
    pub fn set_result(&mut self, name: &str, size: u32, date: u16, time: u16, attr: u16) {
        self.result = FoundEntry {
            name: name.to_string(),
            size,
            date,
            time,
            attr: attr as u8,
        };
    }

    /// Returns true if an entry with `name` and `attr` is filtered out by this search.
    pub fn skips(&self, name: &str, attr: u16) -> bool {
        !wild_file_cmp(name, &self.pattern) || attr_hidden_from(self.search_attr, attr)
    }
}

/// Attribute filter of FindFirst/FindNext.
pub fn attr_hidden_from(search_attr: u8, entry_attr: u16) -> bool {
    if search_attr as u16 == ATTR_VOLUME {
        return entry_attr & ATTR_VOLUME == 0;
    }
    !(search_attr as u16) & entry_attr & (ATTR_DIRECTORY | ATTR_HIDDEN | ATTR_SYSTEM) != 0
}

/// Report the drive label as first search result of a root directory search.
pub fn find_drive_volume(label: &str, dir: &str, dta: &mut Dta) -> bool {
    if !dir.is_empty() || label.is_empty() || dta.search_attr as u16 & ATTR_VOLUME == 0 {
        return false;
    }
    if !wild_file_cmp(label, &dta.pattern) {
        return false;
    }
    dta.set_result(label, 0, 0, 0, ATTR_VOLUME);
    true
}

/// Filesystem interface of one DOS drive.
///
/// Every fallible operation returns a [`DosError`]. Handle and search ids are only
/// meaningful on the drive that issued them.
pub trait Drive: Send {
    /// Open an existing file.
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle>;

    /// Create (or truncate) a file and open it read-write.
    fn file_create(&mut self, path: &str, attr: u16) -> DriveResult<FileHandle>;

    /// Read from the cursor, returning the number of bytes read (0 at end of file).
    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize>;

    /// Write at the cursor. A zero-length write truncates the file at the cursor.
    fn file_write(&mut self, handle: FileHandle, data: &[u8]) -> DriveResult<usize>;

    /// Move the cursor, returning the new absolute position.
    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32>;

    /// Metadata of an open file.
    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat>;

    /// Take an additional reference on an open file.
    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()>;

    /// Drop one reference; the file closes when the last reference goes away.
    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()>;

    fn file_unlink(&mut self, path: &str) -> DriveResult<()>;

    fn make_dir(&mut self, path: &str) -> DriveResult<()>;

    fn remove_dir(&mut self, path: &str) -> DriveResult<()>;

    fn test_dir(&mut self, path: &str) -> bool;

    /// Start a search in `dir` using the pattern and attribute in `dta`.
    fn find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()>;

    /// Continue the search identified by `dta.dir_id`.
    fn find_next(&mut self, dta: &mut Dta) -> DriveResult<()>;

    fn get_file_attr(&mut self, path: &str) -> DriveResult<u16>;

    fn file_stat(&mut self, path: &str) -> DriveResult<FileStat>;

    /// Returns true if `path` names an existing file (not a directory).
    fn file_exists(&mut self, path: &str) -> bool;

    fn rename(&mut self, old_path: &str, new_path: &str) -> DriveResult<()>;

    fn allocation_info(&mut self) -> AllocationInfo;

    /// Original long name of an entry when it differs from its 8.3 name.
    fn get_long_file_name(&mut self, _path: &str) -> Option<String> {
        None
    }

    fn media_byte(&self) -> u8 {
        0xF8
    }

    fn label(&self) -> &str {
        ""
    }

    /// Flush pending state before the drive goes away.
    fn unmount(&mut self) -> DriveResult<()> {
        Ok(())
    }
}

macro_rules! forward_drive {
    ($($name:ident(&mut self $(, $arg:ident: $ty:ty)*) -> $ret:ty;)*) => {
        $(fn $name(&mut self $(, $arg: $ty)*) -> $ret {
            (**self).$name($($arg),*)
        })*
    };
}

impl<D: Drive + ?Sized> Drive for Box<D> {
    forward_drive! {
        file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle>;
        file_create(&mut self, path: &str, attr: u16) -> DriveResult<FileHandle>;
        file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize>;
        file_write(&mut self, handle: FileHandle, data: &[u8]) -> DriveResult<usize>;
        file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32>;
        file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat>;
        file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()>;
        file_close(&mut self, handle: FileHandle) -> DriveResult<()>;
        file_unlink(&mut self, path: &str) -> DriveResult<()>;
        make_dir(&mut self, path: &str) -> DriveResult<()>;
        remove_dir(&mut self, path: &str) -> DriveResult<()>;
        test_dir(&mut self, path: &str) -> bool;
        find_first(&mut self, dir: &str, dta: &mut Dta) -> DriveResult<()>;
        find_next(&mut self, dta: &mut Dta) -> DriveResult<()>;
        get_file_attr(&mut self, path: &str) -> DriveResult<u16>;
        file_stat(&mut self, path: &str) -> DriveResult<FileStat>;
        file_exists(&mut self, path: &str) -> bool;
        rename(&mut self, old_path: &str, new_path: &str) -> DriveResult<()>;
        allocation_info(&mut self) -> AllocationInfo;
        get_long_file_name(&mut self, path: &str) -> Option<String>;
        unmount(&mut self) -> DriveResult<()>;
    }

    fn media_byte(&self) -> u8 {
        (**self).media_byte()
    }

    fn label(&self) -> &str {
        (**self).label()
    }
}

/// Read a whole file into memory.
pub fn read_file(drive: &mut dyn Drive, path: &str) -> DriveResult<Vec<u8>> {
    let handle = drive.file_open(path, OPEN_READ)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 0x4000];
    let res = loop {
        match drive.file_read(handle, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => break Err(e),
        }
    };
    drive.file_close(handle)?;
    res.map(|_| out)
}

/// Create a file with the given content.
pub fn write_file(drive: &mut dyn Drive, path: &str, data: &[u8]) -> DriveResult<()> {
    let handle = drive.file_create(path, ATTR_ARCHIVE)?;
    let res = write_all(drive, handle, data);
    drive.file_close(handle)?;
    res
}

/// Write the whole buffer through a handle.
pub fn write_all(drive: &mut dyn Drive, handle: FileHandle, mut data: &[u8]) -> DriveResult<()> {
    while !data.is_empty() {
        let n = drive.file_write(handle, data)?;
        if n == 0 {
            return Err(DosError::AccessDenied);
        }
        data = &data[n..];
    }
    Ok(())
}

/// Read until `buf` is full or end of file.
pub fn read_exact_or_eof(drive: &mut dyn Drive, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = drive.file_read(handle, &mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Collect every entry of a directory (dot entries excluded).
pub fn list_dir(drive: &mut dyn Drive, dir: &str, search_attr: u8) -> DriveResult<Vec<FoundEntry>> {
    let mut dta = Dta::new(search_attr, "*.*");
    let mut out = Vec::new();
    let mut res = drive.find_first(dir, &mut dta);
    loop {
        match res {
            Ok(()) => {
                if !dta.result.is_dot() {
                    out.push(dta.result.clone());
                }
            }
            Err(DosError::NoMoreFiles) => return Ok(out),
            Err(e) => return Err(e),
        }
        res = drive.find_next(&mut dta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(!open_is_writing(OPEN_READ));
        assert!(open_is_reading(OPEN_READ));
        assert!(open_is_writing(OPEN_WRITE));
        assert!(!open_is_reading(OPEN_WRITE));
        assert!(open_is_writing(OPEN_READWRITE));
        assert!(open_is_reading(OPEN_READWRITE));
        assert!(check_access_code(OPEN_READ_NO_MOD).is_ok());
        assert_eq!(check_access_code(5), Err(DosError::AccessCodeInvalid));
    }

    #[test]
    fn test_seek_resolve_clamps() {
        assert_eq!(SeekMode::Set.resolve(-5, 10, 20), 0);
        assert_eq!(SeekMode::Cur.resolve(-4, 10, 20), 6);
        assert_eq!(SeekMode::End.resolve(-1, 10, 20), 19);
        assert_eq!(SeekMode::from_dos(3), Err(DosError::FunctionNumberInvalid));
    }

    #[test]
    fn test_attr_filter() {
        let all = 0xff;
        assert!(!attr_hidden_from(all, ATTR_DIRECTORY));
        assert!(attr_hidden_from(0, ATTR_DIRECTORY));
        assert!(attr_hidden_from(0, ATTR_HIDDEN));
        assert!(!attr_hidden_from(0, ATTR_ARCHIVE | ATTR_READ_ONLY));
        // Label-only searches hide everything else
        assert!(attr_hidden_from(ATTR_VOLUME as u8, ATTR_ARCHIVE));
        assert!(!attr_hidden_from(ATTR_VOLUME as u8, ATTR_VOLUME));
    }

    #[test]
    fn test_find_drive_volume() {
        let mut dta = Dta::new(0xff, "*.*");
        assert!(find_drive_volume("ZIP", "", &mut dta));
        assert_eq!(dta.result.name, "ZIP");
        assert_eq!(dta.result.attr as u16, ATTR_VOLUME);

        let mut dta = Dta::new(SEARCH_ALL_FILES, "*.*");
        assert!(!find_drive_volume("ZIP", "", &mut dta));
        let mut dta = Dta::new(0xff, "*.*");
        assert!(!find_drive_volume("ZIP", "SUB", &mut dta));
    }
}
