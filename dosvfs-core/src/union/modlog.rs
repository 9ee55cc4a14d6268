//! Modification log of a union drive.
//!
//! Records what happened to paths of the read-only under drive:
//! - `Delete` hides an under entry
//! - a redirect makes an under entry visible at another path after a rename
//!
//! Persisted as text lines `REDIRECTDIR|path|source`, `REDIRECTFILE|path|source`
//! and `DELETE|path`.

use tracing::debug;

use crate::fs::HashDirectory;

/// Name of the save member holding the serialized log.
pub const MODS_MEMBER: &str = "FILEMODS.DBP";

/// Whether a log entry is about a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Log record for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Under entry `source` appears at this path.
    Redirect { kind: EntryKind, source: String },
    /// Under entry at this path is gone.
    Delete,
}

impl Modification {
    pub fn redirect(kind: EntryKind, source: impl Into<String>) -> Self {
        Modification::Redirect {
            kind,
            source: source.into(),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Modification::Delete)
    }

    /// Source path of a redirect of the given kind.
    pub fn redirect_source(&self, want: EntryKind) -> Option<&str> {
        match self {
            Modification::Redirect { kind, source } if *kind == want => Some(source),
            _ => None,
        }
    }

    pub fn redirect_kind(&self) -> Option<EntryKind> {
        match self {
            Modification::Redirect { kind, .. } => Some(*kind),
            Modification::Delete => None,
        }
    }
}

/// Path-keyed set of modifications.
#[derive(Debug, Clone, Default)]
pub struct ModLog {
    entries: HashDirectory<(String, Modification)>,
}

impl ModLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Modification> {
        self.entries.get(path).map(|(_, m)| m)
    }

    pub fn put(&mut self, path: &str, m: Modification) {
        self.entries.put(path, (path.to_string(), m));
    }

    pub fn remove(&mut self, path: &str) -> Option<Modification> {
        self.entries.remove(path).map(|(_, m)| m)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of slots, for index-based iteration that tolerates removals.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn get_at_index(&self, idx: usize) -> Option<(&str, &Modification)> {
        self.entries.get_at_index(idx).map(|(p, m)| (p.as_str(), m))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Modification)> {
        self.entries.iter().map(|(p, m)| (p.as_str(), m))
    }

    /// Text form, one CRLF-terminated line per entry, sorted by path.
    pub fn serialize(&self) -> String {
        let mut lines: Vec<(&str, &Modification)> = self.iter().collect();
        lines.sort_by_key(|(path, _)| *path);
        let mut out = String::new();
        for (path, m) in lines {
            match m {
                Modification::Redirect { kind, source } => {
                    out.push_str(match kind {
                        EntryKind::Dir => "REDIRECTDIR|",
                        EntryKind::File => "REDIRECTFILE|",
                    });
                    out.push_str(path);
                    out.push('|');
                    out.push_str(source);
                }
                Modification::Delete => {
                    out.push_str("DELETE|");
                    out.push_str(path);
                }
            }
            out.push_str("\r\n");
        }
        out
    }

    /// Parse the text form. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut log = Self::new();
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            let parsed = if let Some(rest) = line.strip_prefix("REDIRECTDIR|") {
                parse_redirect(rest, EntryKind::Dir)
            } else if let Some(rest) = line.strip_prefix("REDIRECTFILE|") {
                parse_redirect(rest, EntryKind::File)
            } else {
                line.strip_prefix("DELETE|")
                    .filter(|p| !p.is_empty())
                    .map(|p| (p, Modification::Delete))
            };
            match parsed {
                Some((path, m)) => log.put(path, m),
                None => debug!(line, "ignoring malformed modification"),
            }
        }
        log
    }
}

fn parse_redirect(rest: &str, kind: EntryKind) -> Option<(&str, Modification)> {
    let (path, source) = rest.split_once('|')?;
    if path.is_empty() || source.is_empty() {
        return None;
    }
    Some((path, Modification::redirect(kind, source)))
}
