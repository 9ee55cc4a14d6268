//! Save container of a union drive.
//!
//! The container is a plain ZIP with STORED members: the files and directories of
//! the writable drive plus the serialized modification log. Members are ordered by
//! (timestamp, size, path) so files that did not change keep their offsets between
//! saves, and every chunk is compared against the previous file before it is
//! written. DOS attributes are not stored; members load back as archive files.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::modlog::{ModLog, MODS_MEMBER};
use crate::config::ZipConfig;
use crate::error::{CoreError, CoreResult};
use crate::fs::path::split_parent;
use crate::fs::{collect_tree, read_file, Drive, MemoryDrive};
use crate::zip::ZipDrive;

const EOCD_SIZE: usize = 22;
/// Comparison chunk when checking a member against the previous save.
const COMPARE_CHUNK: usize = 64 * 1024;

/// Outcome of writing a save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub members: usize,
    /// Total bytes of file content stored.
    pub content_size: u64,
    pub file_size: u64,
    pub bytes_written: u64,
    pub bytes_unchanged: u64,
}

/// Writes over an existing file, touching only bytes that differ.
struct DiffWriter {
    file: File,
    pos: u64,
    old_len: u64,
    scratch: Vec<u8>,
    written: u64,
    unchanged: u64,
}

impl DiffWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let old_len = file.metadata()?.len();
        Ok(Self {
            file,
            pos: 0,
            old_len,
            scratch: vec![0; COMPARE_CHUNK],
            written: 0,
            unchanged: 0,
        })
    }

    fn put(&mut self, data: &[u8]) -> std::io::Result<()> {
        for chunk in data.chunks(COMPARE_CHUNK) {
            if self.same_as_old(chunk)? {
                self.unchanged += chunk.len() as u64;
            } else {
                self.file.seek(SeekFrom::Start(self.pos))?;
                self.file.write_all(chunk)?;
                self.written += chunk.len() as u64;
            }
            self.pos += chunk.len() as u64;
        }
        Ok(())
    }

    fn same_as_old(&mut self, chunk: &[u8]) -> std::io::Result<bool> {
        if self.pos + chunk.len() as u64 > self.old_len {
            return Ok(false);
        }
        let old = &mut self.scratch[..chunk.len()];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(old)?;
        Ok(old == chunk)
    }

    /// Cut off a stale tail and flush.
    fn finish(mut self) -> std::io::Result<(u64, u64)> {
        if self.old_len != self.pos {
            self.file.set_len(self.pos)?;
        }
        self.file.flush()?;
        Ok((self.written, self.unchanged))
    }
}

fn zip_name(path: &str) -> String {
    path.replace('\\', "/")
}

/// DOS date and time as a ZIP timestamp. Invalid stamps become 1980-01-01.
fn zip_time(date: u16, time: u16) -> zip::DateTime {
    zip::DateTime::from_date_and_time(
        1980 + (date >> 9),
        ((date >> 5) & 0x0f) as u8,
        (date & 0x1f) as u8,
        (time >> 11) as u8,
        ((time >> 5) & 0x3f) as u8,
        ((time & 0x1f) * 2) as u8,
    )
    .unwrap_or_default()
}

fn stored_member(date: u16, time: u16) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip_time(date, time))
}

/// Write the contents of `drive` and the log `mods` to `path`.
pub fn write_save(path: &Path, drive: &mut dyn Drive, mods: &ModLog) -> CoreResult<SaveStats> {
    let mut tree = collect_tree(drive)?;
    tree.sort_by(|a, b| {
        let ta = (a.date as u32) << 16 | a.time as u32;
        let tb = (b.date as u32) << 16 | b.time as u32;
        (ta, a.size, &a.path).cmp(&(tb, b.size, &b.path))
    });
    if tree.len() + 1 > u16::MAX as usize {
        return Err(CoreError::InvalidArchive(format!("too many files to save ({})", tree.len())));
    }

    // The container is assembled in memory so unchanged bytes are never rewritten
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut members = 0;
    let mut content_size = 0u64;
    for e in &tree {
        let options = stored_member(e.date, e.time);
        members += 1;
        if e.is_dir {
            zip.add_directory(format!("{}/", zip_name(&e.path)), options)?;
            continue;
        }
        let data = if e.size == 0 { Vec::new() } else { read_file(drive, &e.path)? };
        content_size += data.len() as u64;
        zip.start_file(zip_name(&e.path), options)?;
        zip.write_all(&data)?;
    }
    // The log changes most often, so it always goes last
    let mods_text = mods.serialize();
    if !mods_text.is_empty() {
        zip.start_file(MODS_MEMBER, stored_member(0, 0))?;
        zip.write_all(mods_text.as_bytes())?;
        members += 1;
    }
    let container = zip.finish()?.into_inner();

    let mut out = DiffWriter::open(path)?;
    out.put(&container)?;
    let (bytes_written, bytes_unchanged) = out.finish()?;
    Ok(SaveStats {
        members,
        content_size,
        file_size: container.len() as u64,
        bytes_written,
        bytes_unchanged,
    })
}

/// Contents of a loaded save.
pub struct LoadedSave {
    pub drive: MemoryDrive,
    pub mods: ModLog,
    /// Total bytes of file content loaded.
    pub size: u64,
}

/// Members skipped by strict loading.
fn skipped_in_strict_mode(path: &str) -> bool {
    path == "DOS.YML" || [".EXE", ".COM", ".BAT"].iter().any(|ext| path.ends_with(ext))
}

/// Load a save written by [`write_save`]. A missing file is an empty save.
pub fn load_save(path: &Path, strict: bool) -> CoreResult<LoadedSave> {
    let mut loaded = LoadedSave {
        drive: MemoryDrive::new(),
        mods: ModLog::new(),
        size: 0,
    };
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(loaded),
        Err(e) => return Err(e.into()),
    };
    if len <= EOCD_SIZE as u64 {
        // Nothing but an end record
        return Ok(loaded);
    }

    let mut zip = ZipDrive::open(path, ZipConfig::default())?;
    for e in collect_tree(&mut zip)? {
        if !e.is_dir && e.path == MODS_MEMBER {
            let text = read_file(&mut zip, &e.path)?;
            loaded.mods = ModLog::parse(&String::from_utf8_lossy(&text));
            continue;
        }
        if strict && !e.is_dir && skipped_in_strict_mode(&e.path) {
            debug!(path = %e.path, "strict mode skips saved file");
            continue;
        }
        let (parent, _) = split_parent(&e.path);
        loaded.drive.make_dirs(parent);
        match loaded.drive.clone_entry_from(&mut zip, &e.path) {
            Ok(()) => loaded.size += e.size as u64,
            Err(err) => warn!(path = %e.path, error = %err, "failed to restore saved file"),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{list_dir, write_file, SEARCH_ALL_FILES};
    use crate::union::modlog::{EntryKind, Modification};

    fn sample_drive() -> MemoryDrive {
        let mut m = MemoryDrive::new();
        m.add_file("SAVES\\SLOT1.SAV", b"slot one".to_vec());
        m.add_file("CONFIG.CFG", b"sound=1".to_vec());
        m.add_file("EMPTY.TXT", Vec::new());
        m
    }

    #[test]
    fn test_save_is_a_readable_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut mods = ModLog::new();
        mods.put("AUTOEXEC.BAT", Modification::Delete);
        let stats = write_save(&path, &mut sample_drive(), &mods).unwrap();
        assert_eq!(stats.members, 5);
        assert_eq!(stats.content_size, 15);
        assert_eq!(stats.file_size, std::fs::metadata(&path).unwrap().len());

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut text = String::new();
        archive.by_name("SAVES/SLOT1.SAV").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "slot one");
        let mut mods_text = String::new();
        archive.by_name(MODS_MEMBER).unwrap().read_to_string(&mut mods_text).unwrap();
        assert_eq!(mods_text, "DELETE|AUTOEXEC.BAT\r\n");
        assert!(archive.by_name("SAVES/").unwrap().is_dir());
    }

    #[test]
    fn test_load_restores_files_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut mods = ModLog::new();
        mods.put("B.EXE", Modification::redirect(EntryKind::File, "A.EXE"));
        write_save(&path, &mut sample_drive(), &mods).unwrap();

        let mut loaded = load_save(&path, false).unwrap();
        assert_eq!(loaded.size, 15);
        assert_eq!(read_file(&mut loaded.drive, "SAVES\\SLOT1.SAV").unwrap(), b"slot one");
        assert_eq!(read_file(&mut loaded.drive, "EMPTY.TXT").unwrap(), b"");
        assert!(!loaded.drive.file_exists(MODS_MEMBER));
        assert_eq!(loaded.mods.get("B.EXE").unwrap().redirect_source(EntryKind::File), Some("A.EXE"));
    }

    #[test]
    fn test_unchanged_save_rewrites_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut drive = sample_drive();
        let first = write_save(&path, &mut drive, &ModLog::new()).unwrap();
        assert_eq!(first.bytes_written, first.file_size);

        let second = write_save(&path, &mut drive, &ModLog::new()).unwrap();
        assert_eq!(second.bytes_written, 0);
        assert_eq!(second.bytes_unchanged, second.file_size);
    }

    #[test]
    fn test_shrinking_save_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut drive = sample_drive();
        write_save(&path, &mut drive, &ModLog::new()).unwrap();
        drive.file_unlink("CONFIG.CFG").unwrap();
        let stats = write_save(&path, &mut drive, &ModLog::new()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), stats.file_size);
        assert!(stats.bytes_written < stats.file_size);
        let mut loaded = load_save(&path, false).unwrap();
        assert!(!loaded.drive.file_exists("CONFIG.CFG"));
        assert!(loaded.drive.file_exists("SAVES\\SLOT1.SAV"));
    }

    #[test]
    fn test_strict_load_skips_executables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut drive = MemoryDrive::new();
        write_file(&mut drive, "GAME.EXE", b"MZ").unwrap();
        write_file(&mut drive, "RUN.BAT", b"@echo off").unwrap();
        write_file(&mut drive, "DOS.YML", b"cpu: auto").unwrap();
        write_file(&mut drive, "SCORES.DAT", b"100").unwrap();
        write_save(&path, &mut drive, &ModLog::new()).unwrap();

        let mut strict = load_save(&path, true).unwrap();
        let names: Vec<String> = list_dir(&mut strict.drive, "", SEARCH_ALL_FILES)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["SCORES.DAT"]);
        assert_eq!(strict.size, 3);

        let mut relaxed = load_save(&path, false).unwrap();
        assert!(relaxed.drive.file_exists("GAME.EXE"));
    }

    #[test]
    fn test_missing_or_empty_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.zip");
        let loaded = load_save(&path, false).unwrap();
        assert!(loaded.mods.is_empty());

        write_save(&path, &mut MemoryDrive::new(), &ModLog::new()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), EOCD_SIZE as u64);
        assert_eq!(load_save(&path, false).unwrap().size, 0);
    }

    #[test]
    fn test_timestamps_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.zip");
        let mut drive = sample_drive();
        write_save(&path, &mut drive, &ModLog::new()).unwrap();
        let mut loaded = load_save(&path, false).unwrap();
        for name in ["CONFIG.CFG", "SAVES\\SLOT1.SAV"] {
            let before = drive.file_stat(name).unwrap();
            let after = loaded.drive.file_stat(name).unwrap();
            assert_eq!((after.date, after.time, after.size), (before.date, before.time, before.size));
        }
    }
}
