//! DOS path and name helpers.

use chrono::{Datelike, Local, Timelike};

/// Canonicalize a caller-supplied path: uppercase, backslashes, no leading
/// separator, no single trailing dots on components.
///
/// # Examples
/// ```
/// use dosvfs_core::canonical_path;
/// assert_eq!(canonical_path("\\games/doom.\\doom.exe"), "GAMES\\DOOM\\DOOM.EXE");
/// ```
pub fn canonical_path(path: &str) -> String {
    let upper: String = path
        .chars()
        .map(|c| if c == '/' { '\\' } else { c.to_ascii_uppercase() })
        .collect();
    remove_ending_dots(upper.trim_start_matches('\\'))
}

/// Remove a trailing dot from every component that isn't itself a run of dots.
/// `"aaa.\bbb.\.\..\ccc."` becomes `"aaa\bbb\.\..\ccc"`.
pub fn remove_ending_dots(path: &str) -> String {
    if path.len() < 2 {
        return path.to_string();
    }
    let mut out = String::with_capacity(path.len());
    for (i, part) in path.split('\\').enumerate() {
        if i > 0 {
            out.push('\\');
        }
        let bytes = part.as_bytes();
        let n = bytes.len();
        if n >= 2 && bytes[n - 1] == b'.' && bytes[n - 2] != b'.' {
            out.push_str(&part[..n - 1]);
        } else {
            out.push_str(part);
        }
    }
    out
}

/// Split a path into (parent directory, last component).
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('\\') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Join a directory and a name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", dir, name)
    }
}

/// Returns true if `path` lies inside directory `dir` (at any depth).
pub fn is_inside(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'\\')
}

fn pad_8_3(name: &str) -> ([u8; 8], [u8; 3]) {
    let mut base = [b' '; 8];
    let mut ext = [b' '; 3];
    let bytes = name.as_bytes();
    let (b, e) = match name.rfind('.') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &bytes[bytes.len()..]),
    };
    for (dst, src) in base.iter_mut().zip(b.iter()) {
        *dst = src.to_ascii_uppercase();
    }
    for (dst, src) in ext.iter_mut().zip(e.iter()) {
        *dst = src.to_ascii_uppercase();
    }
    (base, ext)
}

/// DOS wildcard comparison on padded 8.3 names (`*` and `?`).
pub fn wild_file_cmp(file: &str, wild: &str) -> bool {
    let (file_name, file_ext) = pad_8_3(file);
    let (wild_name, wild_ext) = pad_8_3(wild);
    for r in 0..8 {
        if wild_name[r] == b'*' {
            break;
        }
        if wild_name[r] != b'?' && wild_name[r] != file_name[r] {
            return false;
        }
    }
    for r in 0..3 {
        if wild_ext[r] == b'*' {
            return true;
        }
        if wild_ext[r] != b'?' && wild_ext[r] != file_ext[r] {
            return false;
        }
    }
    true
}

fn push_filtered(out: &mut String, src: &[u8]) {
    for &c in src {
        let c = if c <= b' ' || c == b'.' {
            b'-'
        } else if c >= 0x80 {
            b'_'
        } else {
            c.to_ascii_uppercase()
        };
        out.push(c as char);
    }
}

/// Synthesize an 8.3 name from an arbitrary (long) name.
///
/// Bases longer than 8 characters keep their first and last 4 characters.
///
/// # Examples
/// ```
/// use dosvfs_core::make_8dot3;
/// assert_eq!(make_8dot3(b"readme.txt"), "README.TXT");
/// assert_eq!(make_8dot3(b"VeryLongName.extension"), "VERYNAME.EXT");
/// assert_eq!(make_8dot3(b"my file.c"), "MY-FILE.C");
/// ```
pub fn make_8dot3(name: &[u8]) -> String {
    let dot = name.iter().rposition(|&c| c == b'.');
    let (base, ext) = match dot {
        Some(pos) => (&name[..pos], &name[pos + 1..]),
        None => (name, &name[name.len()..]),
    };
    let mut out = String::with_capacity(DOS_NAME_CAPACITY);
    if base.len() > 8 {
        push_filtered(&mut out, &base[..4]);
        push_filtered(&mut out, &base[base.len() - 4..]);
    } else {
        push_filtered(&mut out, base);
    }
    if base.is_empty() {
        out.push('-');
    }
    if !ext.is_empty() {
        out.push('.');
        push_filtered(&mut out, &ext[..ext.len().min(3)]);
    }
    out
}

const DOS_NAME_CAPACITY: usize = 12;

/// Pack a calendar date into DOS format.
pub fn pack_date(year: u16, month: u16, day: u16) -> u16 {
    (year.saturating_sub(1980) << 9) | ((month & 0xf) << 5) | (day & 0x1f)
}

/// Pack a wall-clock time into DOS format (2 second resolution).
pub fn pack_time(hour: u16, minute: u16, second: u16) -> u16 {
    ((hour & 0x1f) << 11) | ((minute & 0x3f) << 5) | ((second / 2) & 0x1f)
}

/// Current local time as packed (date, time).
pub fn dos_now() -> (u16, u16) {
    let now = Local::now();
    (
        pack_date(now.year() as u16, now.month() as u16, now.day() as u16),
        pack_time(now.hour() as u16, now.minute() as u16, now.second() as u16),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_ending_dots() {
        assert_eq!(remove_ending_dots("aaa.\\bbb.\\.\\..\\ccc."), "aaa\\bbb\\.\\..\\ccc");
        assert_eq!(remove_ending_dots("FILE.TXT"), "FILE.TXT");
        assert_eq!(remove_ending_dots("A.."), "A..");
        assert_eq!(remove_ending_dots("."), ".");
    }

    #[test]
    fn test_canonical_path() {
        assert_eq!(canonical_path("sub/file.txt"), "SUB\\FILE.TXT");
        assert_eq!(canonical_path("\\ROOT."), "ROOT");
        assert_eq!(canonical_path(""), "");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("A\\B\\C.TXT"), ("A\\B", "C.TXT"));
        assert_eq!(split_parent("C.TXT"), ("", "C.TXT"));
        assert!(is_inside("A\\B", "A"));
        assert!(!is_inside("AB", "A"));
        assert!(is_inside("X", ""));
    }

    #[test]
    fn test_wild_file_cmp() {
        assert!(wild_file_cmp("README.TXT", "*.*"));
        assert!(wild_file_cmp("README.TXT", "*.TXT"));
        assert!(wild_file_cmp("README.TXT", "READ????.T?T"));
        assert!(!wild_file_cmp("README.TXT", "*.DOC"));
        assert!(wild_file_cmp("readme.txt", "README.*"));
        assert!(wild_file_cmp("NOEXT", "*"));
        assert!(!wild_file_cmp("NOEXT.A", "NOEXT"));
        assert!(wild_file_cmp(".", "*.*"));
    }

    #[test]
    fn test_make_8dot3() {
        assert_eq!(make_8dot3(b"hello.txt"), "HELLO.TXT");
        assert_eq!(make_8dot3(b"Program Files"), "PROGILES");
        assert_eq!(make_8dot3(b".hidden"), "-.HID");
        assert_eq!(make_8dot3(b"a.b.c"), "A-B.C");
        assert_eq!(make_8dot3(b"noext"), "NOEXT");
    }

    #[test]
    fn test_pack_date_time() {
        assert_eq!(pack_date(1980, 1, 1), 0x21);
        assert_eq!(pack_time(23, 59, 58), (23 << 11) | (59 << 5) | 29);
    }
}
