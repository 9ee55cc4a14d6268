//! Recursive traversal of a drive tree.

use crate::error::{DosError, DriveResult};

use super::drive::{Drive, Dta, ATTR_DIRECTORY, DOS_NAMELENGTH, DOS_PATHLENGTH, SEARCH_ALL_FILES};
use super::path::join_path;

/// One entry found while walking a drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u32,
    pub date: u16,
    pub time: u16,
    pub attr: u8,
}

/// Visit every file and directory of a drive. Directories are reported before
/// their contents; subdirectories are visited depth-first from the last found.
pub fn walk_drive(drive: &mut dyn Drive, mut visit: impl FnMut(&WalkEntry)) -> DriveResult<()> {
    let mut dirs = vec![String::new()];
    while let Some(dir) = dirs.pop() {
        if dir.len() + DOS_NAMELENGTH >= DOS_PATHLENGTH {
            continue;
        }
        let mut dta = Dta::new(SEARCH_ALL_FILES, "*.*");
        let mut res = drive.find_first(&dir, &mut dta);
        loop {
            match res {
                Ok(()) => {}
                Err(DosError::NoMoreFiles) => break,
                Err(DosError::PathNotFound) if !dir.is_empty() => break,
                Err(e) => return Err(e),
            }
            let found = &dta.result;
            if !found.is_dot() {
                let entry = WalkEntry {
                    path: join_path(&dir, &found.name),
                    is_dir: found.attr as u16 & ATTR_DIRECTORY != 0,
                    size: found.size,
                    date: found.date,
                    time: found.time,
                    attr: found.attr,
                };
                if entry.is_dir {
                    dirs.push(entry.path.clone());
                }
                visit(&entry);
            }
            res = drive.find_next(&mut dta);
        }
    }
    Ok(())
}

/// Collect the whole tree of a drive.
pub fn collect_tree(drive: &mut dyn Drive) -> DriveResult<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk_drive(drive, |e| out.push(e.clone()))?;
    Ok(out)
}
