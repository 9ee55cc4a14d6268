//! Read-only drive stacking patch layers over base drives.
//!
//! Each layer pairs an `under` drive with an optional ZIP of override and patch
//! files. The visible tree is rebuilt from scratch whenever a layer is added or
//! the active variant changes:
//! - Pass one collects `[Variant]` folders at the root of every patch archive
//! - Pass two ingests every layer bottom to top; upper layers shadow lower ones
//! - Files with a patch extension appear under their stripped name and are
//!   materialized in memory on first use

use tracing::{debug, warn};

use super::{apply_patch, PatchFormat, XorHeader};
use crate::error::{DosError, DriveResult};
use crate::fs::drive::*;
use crate::fs::path::{canonical_path, join_path, make_8dot3, split_parent};
use crate::fs::{collect_tree, DriveSession, HashDirectory, WalkEntry};
use crate::zip::ZipDrive;

const ROOT: usize = 0;
/// Bytes read from a patch to find an embedded XOR source path.
const XOR_HEAD_SIZE: usize = 3 + DOS_PATHLENGTH + 1 + 20;

/// One level of the stack.
pub struct PatchLayer {
    pub under: Box<dyn Drive>,
    pub patches: Option<ZipDrive>,
}

impl PatchLayer {
    pub fn new(under: impl Drive + 'static, patches: Option<ZipDrive>) -> Self {
        Self {
            under: Box::new(under),
            patches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Under,
    Patches,
}

#[derive(Debug, Clone)]
struct EntryMeta {
    name: String,
    date: u16,
    time: u16,
    attr: u16,
}

impl EntryMeta {
    fn from_walk(name: &str, e: &WalkEntry) -> Self {
        Self {
            name: name.to_string(),
            date: e.date,
            time: e.time,
            attr: e.attr as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    File(usize),
    Dir(usize),
}

#[derive(Debug, Clone)]
enum FileSource {
    /// Served directly by a drive of a layer.
    Direct { layer: usize, side: Side, path: String },
    /// Result of applying a patch from the layer's archive to a file of its under drive.
    Patch {
        layer: usize,
        patch_path: String,
        source_path: String,
    },
}

struct PatchFile {
    meta: EntryMeta,
    size: Option<u32>,
    source: FileSource,
    long_name: Option<String>,
    data: Option<Vec<u8>>,
    failed: bool,
}

struct PatchDir {
    meta: EntryMeta,
    origin: Option<(usize, Side, String)>,
    entries: HashDirectory<Node>,
}

#[derive(Clone, Copy)]
enum PatchHandle {
    Delegated { layer: usize, side: Side, inner: FileHandle },
    Memory { file: usize, pos: u32, flags: u32 },
}

struct PatchSearch {
    dir: usize,
    index: usize,
}

/// A file or directory found in one layer, ready to be merged into the tree.
enum Planned {
    Dir { path: String, meta: EntryMeta, origin: (usize, Side, String) },
    File { path: String, file: PatchFile },
}

/// Layered read-only drive with binary patches and selectable variants.
pub struct PatchDrive {
    layers: Vec<PatchLayer>,
    variant: usize,
    variants: Vec<String>,
    /// Per layer: short names of root folders of its patch archive that hold variants.
    variant_dirs: Vec<Vec<(String, usize)>>,
    files: Vec<PatchFile>,
    dirs: Vec<PatchDir>,
    directories: HashDirectory<usize>,
    session: DriveSession<PatchHandle, PatchSearch>,
}

fn root_dir() -> PatchDir {
    PatchDir {
        meta: EntryMeta {
            name: String::new(),
            date: 0,
            time: 0,
            attr: ATTR_VOLUME | ATTR_DIRECTORY,
        },
        origin: None,
        entries: HashDirectory::new(),
    }
}

fn is_variant_name(name: &str) -> bool {
    name.len() > 2 && name.starts_with('[') && name.ends_with(']')
}

/// Read the first bytes of a file.
fn read_head(drive: &mut dyn Drive, path: &str, len: usize) -> DriveResult<Vec<u8>> {
    let handle = drive.file_open(path, OPEN_READ)?;
    let mut buf = vec![0u8; len];
    let res = read_exact_or_eof(drive, handle, &mut buf);
    drive.file_close(handle)?;
    buf.truncate(res?);
    Ok(buf)
}

impl PatchDrive {
    /// Build a drive from a bottom-to-top list of layers and a variant (0 = none).
    pub fn new(layers: Vec<PatchLayer>, variant: usize) -> Self {
        let mut drive = Self {
            layers,
            variant,
            variants: Vec::new(),
            variant_dirs: Vec::new(),
            files: Vec::new(),
            dirs: vec![root_dir()],
            directories: HashDirectory::new(),
            session: DriveSession::new(),
        };
        drive.reload();
        drive
    }

    /// Push a layer on top and rebuild.
    pub fn add_layer(&mut self, layer: PatchLayer) {
        self.layers.push(layer);
        self.reload();
    }

    /// Switch the active variant (1-based index into [`variants`](Self::variants), 0 = none).
    pub fn set_variant(&mut self, variant: usize) {
        if variant != self.variant {
            self.variant = variant;
            self.reload();
        }
    }

    pub fn variant(&self) -> usize {
        self.variant
    }

    /// Variant folder names found in the patch archives, brackets included.
    pub fn variants(&self) -> &[String] {
        &self.variants
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Rebuild the whole tree. Open handles are closed.
    pub fn reload(&mut self) {
        self.close_all_handles();
        self.files.clear();
        self.dirs.clear();
        self.dirs.push(root_dir());
        self.directories.clear();
        self.discover_variants();
        for layer in 0..self.layers.len() {
            let planned = self.plan_under(layer);
            self.merge(planned, true);
            let (common, active) = self.plan_patches(layer);
            // Within one archive the first entry wins, the active variant overrides it
            self.merge(common, false);
            self.merge(active, true);
        }
        debug!(
            layers = self.layers.len(),
            files = self.files.len(),
            dirs = self.dirs.len() - 1,
            variant = self.variant,
            "patch drive loaded"
        );
    }

    fn close_all_handles(&mut self) {
        for h in self.session.close_all() {
            if let PatchHandle::Delegated { layer, side, inner } = h {
                if let Ok(drive) = self.side_drive(layer, side) {
                    let _ = drive.file_close(inner);
                }
            }
        }
    }

    fn discover_variants(&mut self) {
        let mut found: Vec<Vec<(String, String)>> = Vec::new();
        for layer in &mut self.layers {
            let mut dirs = Vec::new();
            if let Some(zip) = layer.patches.as_mut() {
                let root = list_dir(zip, "", SEARCH_ALL_FILES).unwrap_or_default();
                for e in root.iter().filter(|e| e.attr as u16 & ATTR_DIRECTORY != 0) {
                    let long = zip.get_long_file_name(&e.name).unwrap_or_else(|| e.name.clone());
                    if is_variant_name(&long) {
                        dirs.push((e.name.clone(), long));
                    }
                }
            }
            found.push(dirs);
        }

        // Sorted so indices do not depend on archive order
        let mut variants: Vec<String> = found.iter().flatten().map(|(_, long)| long.clone()).collect();
        variants.sort_by_key(|v| v.to_ascii_uppercase());
        variants.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        self.variant_dirs = found
            .into_iter()
            .map(|dirs| {
                dirs.into_iter()
                    .filter_map(|(short, long)| {
                        let idx = variants.iter().position(|v| v.eq_ignore_ascii_case(&long))?;
                        Some((short, idx + 1))
                    })
                    .collect()
            })
            .collect();
        self.variants = variants;
    }

    fn plan_under(&mut self, layer: usize) -> Vec<Planned> {
        let under = &mut *self.layers[layer].under;
        let tree = match collect_tree(under) {
            Ok(t) => t,
            Err(e) => {
                warn!(layer, error = %e, "failed to list layer");
                return Vec::new();
            }
        };
        tree.into_iter()
            .map(|e| {
                let (_, name) = split_parent(&e.path);
                let meta = EntryMeta::from_walk(name, &e);
                if e.is_dir {
                    Planned::Dir {
                        origin: (layer, Side::Under, e.path.clone()),
                        path: e.path,
                        meta,
                    }
                } else {
                    Planned::File {
                        file: PatchFile {
                            meta,
                            size: Some(e.size),
                            source: FileSource::Direct {
                                layer,
                                side: Side::Under,
                                path: e.path.clone(),
                            },
                            long_name: None,
                            data: None,
                            failed: false,
                        },
                        path: e.path,
                    }
                }
            })
            .collect()
    }

    /// Split the entries of a layer's patch archive into common and active-variant entries.
    fn plan_patches(&mut self, layer: usize) -> (Vec<Planned>, Vec<Planned>) {
        let variant = self.variant;
        let variant_dirs = &self.variant_dirs[layer];
        let PatchLayer { under, patches } = &mut self.layers[layer];
        let Some(zip) = patches.as_mut() else {
            return (Vec::new(), Vec::new());
        };
        let tree = match collect_tree(zip) {
            Ok(t) => t,
            Err(e) => {
                warn!(layer, error = %e, "failed to list patch archive");
                return (Vec::new(), Vec::new());
            }
        };

        let mut common = Vec::new();
        let mut active = Vec::new();
        for e in tree {
            let (first, rest) = e.path.split_once('\\').unwrap_or((e.path.as_str(), ""));
            let (path, out) = match variant_dirs.iter().find(|(short, _)| short == first) {
                Some(&(_, idx)) if idx == variant && !rest.is_empty() => (rest.to_string(), &mut active),
                Some(_) => continue,
                None => (e.path.clone(), &mut common),
            };
            let (parent, name) = split_parent(&path);
            if e.is_dir {
                out.push(Planned::Dir {
                    meta: EntryMeta::from_walk(name, &e),
                    origin: (layer, Side::Patches, e.path.clone()),
                    path,
                });
                continue;
            }

            if !PatchFormat::is_patch_name(name) {
                // Raw override; keeps the base file's metadata when one exists
                let meta = match under.file_stat(&path) {
                    Ok(stat) if !stat.is_dir() => EntryMeta {
                        name: name.to_string(),
                        date: stat.date,
                        time: stat.time,
                        attr: stat.attr,
                    },
                    _ => EntryMeta::from_walk(name, &e),
                };
                out.push(Planned::File {
                    file: PatchFile {
                        meta,
                        size: Some(e.size),
                        source: FileSource::Direct {
                            layer,
                            side: Side::Patches,
                            path: e.path.clone(),
                        },
                        long_name: None,
                        data: None,
                        failed: false,
                    },
                    path,
                });
                continue;
            }

            let long = zip.get_long_file_name(&e.path).unwrap_or_else(|| name.to_string());
            let stem = match long.rfind('.') {
                Some(dot) if dot > 0 => &long[..dot],
                _ => continue,
            };
            let short = make_8dot3(stem.as_bytes());
            let target_path = join_path(parent, &short);

            let head = read_head(zip, &e.path, XOR_HEAD_SIZE).unwrap_or_default();
            let xor = match PatchFormat::sniff(&head) {
                Ok(PatchFormat::Xor) => XorHeader::parse(&head).ok(),
                Ok(_) => None,
                Err(_) => {
                    warn!(patch = %e.path, "unrecognized patch file");
                    continue;
                }
            };
            let source_path = xor
                .as_ref()
                .and_then(|h| h.source_path.as_deref())
                .map(canonical_path)
                .unwrap_or_else(|| target_path.clone());
            let stat = match under.file_stat(&source_path) {
                Ok(stat) if !stat.is_dir() => stat,
                _ => {
                    warn!(source = %source_path, patch = %e.path, "base file to patch not found");
                    continue;
                }
            };
            out.push(Planned::File {
                file: PatchFile {
                    meta: EntryMeta {
                        name: short.clone(),
                        date: stat.date,
                        time: stat.time,
                        attr: stat.attr,
                    },
                    size: xor.map(|h| h.target_size as u32),
                    source: FileSource::Patch {
                        layer,
                        patch_path: e.path.clone(),
                        source_path,
                    },
                    long_name: (stem != short).then(|| stem.to_string()),
                    data: None,
                    failed: false,
                },
                path: target_path,
            });
        }
        (common, active)
    }

    fn merge(&mut self, planned: Vec<Planned>, overwrite: bool) {
        let mut claimed = HashDirectory::<()>::new();
        for p in planned {
            match p {
                Planned::Dir { path, meta, origin } => {
                    self.ensure_dir(&path, meta, origin);
                }
                Planned::File { path, file } => {
                    if !overwrite && claimed.contains(&path) {
                        continue;
                    }
                    if self.put_file(&path, file) {
                        claimed.put(&path, ());
                    }
                }
            }
        }
    }

    fn ensure_dir(&mut self, path: &str, meta: EntryMeta, origin: (usize, Side, String)) -> Option<usize> {
        if let Some(&id) = self.directories.get(path) {
            return Some(id);
        }
        let (parent, name) = split_parent(path);
        let parent = self.dir_id(parent)?;
        if let Some(Node::File(_)) = self.dirs[parent].entries.get(name) {
            debug!(path, "directory replaces file of a lower layer");
        }
        let id = self.dirs.len();
        self.dirs.push(PatchDir {
            meta: EntryMeta {
                attr: meta.attr | ATTR_DIRECTORY,
                ..meta
            },
            origin: Some(origin),
            entries: HashDirectory::new(),
        });
        self.dirs[parent].entries.put(name, Node::Dir(id));
        self.directories.put(path, id);
        Some(id)
    }

    fn put_file(&mut self, path: &str, file: PatchFile) -> bool {
        let (parent, name) = split_parent(path);
        let Some(parent) = self.dir_id(parent) else {
            return false;
        };
        match self.dirs[parent].entries.get(name).copied() {
            Some(Node::Dir(_)) => false,
            Some(Node::File(id)) => {
                self.files[id] = file;
                true
            }
            None => {
                self.files.push(file);
                self.dirs[parent].entries.put(name, Node::File(self.files.len() - 1));
                true
            }
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
        self.dirs[self.dir_id(parent)?].entries.get(name).copied()
    }

    fn side_drive(&mut self, layer: usize, side: Side) -> DriveResult<&mut dyn Drive> {
        let l = self.layers.get_mut(layer).ok_or(DosError::InvalidHandle)?;
        match side {
            Side::Under => Ok(&mut *l.under),
            Side::Patches => match l.patches.as_mut() {
                Some(zip) => Ok(zip as &mut dyn Drive),
                None => Err(DosError::InvalidHandle),
            },
        }
    }

    /// Apply the patch of a file once and keep the result.
    fn materialize(&mut self, f: usize) -> DriveResult<()> {
        let file = &self.files[f];
        if file.data.is_some() {
            return Ok(());
        }
        if file.failed {
            return Err(DosError::DataInvalid);
        }
        let FileSource::Patch {
            layer,
            patch_path,
            source_path,
        } = file.source.clone()
        else {
            return Ok(());
        };
        let PatchLayer { under, patches } = &mut self.layers[layer];
        let result = match patches.as_mut() {
            Some(zip) => read_file(zip, &patch_path).and_then(|patch| {
                let source = read_file(&mut **under, &source_path)?;
                apply_patch(&source, &patch).map_err(|e| {
                    warn!(source = %source_path, patch = %patch_path, error = %e, "failed to apply patch");
                    DosError::from(e)
                })
            }),
            None => Err(DosError::DataInvalid),
        };
        let file = &mut self.files[f];
        match result {
            Ok(data) => {
                file.size = Some(data.len() as u32);
                file.data = Some(data);
                Ok(())
            }
            Err(e) => {
                file.failed = true;
                Err(e)
            }
        }
    }

    fn stat_node(&mut self, node: Node) -> FileStat {
        match node {
            Node::Dir(d) => {
                let meta = &self.dirs[d].meta;
                FileStat {
                    attr: meta.attr,
                    size: 0,
                    date: meta.date,
                    time: meta.time,
                }
            }
            Node::File(f) => {
                if self.files[f].size.is_none() {
                    // Size of a patched file is only known once it is produced
                    let _ = self.materialize(f);
                }
                let file = &self.files[f];
                FileStat {
                    attr: file.meta.attr,
                    size: file.size.unwrap_or(0),
                    date: file.meta.date,
                    time: file.meta.time,
                }
            }
        }
    }
}

impl Drive for PatchDrive {
    fn file_open(&mut self, path: &str, flags: u32) -> DriveResult<FileHandle> {
        check_access_code(flags)?;
        if open_is_writing(flags) {
            return Err(DosError::AccessDenied);
        }
        let path = canonical_path(path);
        let f = match self.lookup(&path) {
            Some(Node::File(f)) => f,
            _ => return Err(DosError::FileNotFound),
        };
        let state = match self.files[f].source.clone() {
            FileSource::Direct { layer, side, path } => {
                let inner = self.side_drive(layer, side)?.file_open(&path, flags)?;
                PatchHandle::Delegated { layer, side, inner }
            }
            FileSource::Patch { .. } => {
                self.materialize(f)?;
                PatchHandle::Memory { file: f, pos: 0, flags }
            }
        };
        Ok(self.session.open(state))
    }

    fn file_create(&mut self, _path: &str, _attr: u16) -> DriveResult<FileHandle> {
        Err(DosError::AccessDenied)
    }

    fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> DriveResult<usize> {
        let state = *self.session.handle(handle)?;
        match state {
            PatchHandle::Delegated { layer, side, inner } => self.side_drive(layer, side)?.file_read(inner, buf),
            PatchHandle::Memory { file, pos, flags } => {
                if !open_is_reading(flags) {
                    return Err(DosError::AccessDenied);
                }
                let data = self.files[file].data.as_deref().unwrap_or_default();
                let pos = pos as usize;
                if pos >= data.len() || buf.is_empty() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - pos);
                buf[..n].copy_from_slice(&data[pos..pos + n]);
                if let PatchHandle::Memory { pos: p, .. } = self.session.handle_mut(handle)? {
                    *p += n as u32;
                }
                Ok(n)
            }
        }
    }

    fn file_write(&mut self, _handle: FileHandle, _data: &[u8]) -> DriveResult<usize> {
        Err(DosError::AccessDenied)
    }

    fn file_seek(&mut self, handle: FileHandle, offset: i64, mode: SeekMode) -> DriveResult<u32> {
        let state = *self.session.handle(handle)?;
        match state {
            PatchHandle::Delegated { layer, side, inner } => {
                self.side_drive(layer, side)?.file_seek(inner, offset, mode)
            }
            PatchHandle::Memory { file, .. } => {
                let size = self.files[file].data.as_ref().map_or(0, |d| d.len() as u32);
                match self.session.handle_mut(handle)? {
                    PatchHandle::Memory { pos, .. } => {
                        *pos = mode.resolve(offset, *pos, size);
                        Ok(*pos)
                    }
                    PatchHandle::Delegated { .. } => Err(DosError::InvalidHandle),
                }
            }
        }
    }

    fn file_info(&mut self, handle: FileHandle) -> DriveResult<FileStat> {
        let state = *self.session.handle(handle)?;
        match state {
            PatchHandle::Delegated { layer, side, inner } => self.side_drive(layer, side)?.file_info(inner),
            PatchHandle::Memory { file, .. } => Ok(self.stat_node(Node::File(file))),
        }
    }

    fn file_add_ref(&mut self, handle: FileHandle) -> DriveResult<()> {
        self.session.add_ref(handle)
    }

    fn file_close(&mut self, handle: FileHandle) -> DriveResult<()> {
        if let Some(PatchHandle::Delegated { layer, side, inner }) = self.session.release(handle)? {
            self.side_drive(layer, side)?.file_close(inner)?;
        }
        Ok(())
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
        dta.dir_id = self.session.start_search(PatchSearch { dir: id, index: 0 });
        let label = self.layers.first().map(|l| l.under.label().to_string()).unwrap_or_default();
        if find_drive_volume(&label, &dir, dta) {
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
        let mut found: Option<FoundEntry> = None;
        while index < 2 && found.is_none() {
            let dotted = if index == 0 { "." } else { ".." };
            index += 1;
            let meta = &self.dirs[dir_id].meta;
            if meta.attr & ATTR_VOLUME != 0 || dta.skips(dotted, meta.attr) {
                continue;
            }
            found = Some(FoundEntry {
                name: dotted.to_string(),
                size: 0,
                date: meta.date,
                time: meta.time,
                attr: meta.attr as u8,
            });
        }
        while found.is_none() && index - 2 < self.dirs[dir_id].entries.capacity() {
            let slot = index - 2;
            index += 1;
            let Some(&node) = self.dirs[dir_id].entries.get_at_index(slot) else {
                continue;
            };
            let (name, attr) = match node {
                Node::File(f) => (self.files[f].meta.name.clone(), self.files[f].meta.attr),
                Node::Dir(d) => (self.dirs[d].meta.name.clone(), self.dirs[d].meta.attr),
            };
            if dta.skips(&name, attr) {
                continue;
            }
            let stat = self.stat_node(node);
            found = Some(FoundEntry {
                name,
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
        let path = canonical_path(path);
        match self.lookup(&path) {
            Some(Node::File(f)) => Ok(self.files[f].meta.attr),
            Some(Node::Dir(d)) => Ok(self.dirs[d].meta.attr),
            None => Err(DosError::FileNotFound),
        }
    }

    fn file_stat(&mut self, path: &str) -> DriveResult<FileStat> {
        let path = canonical_path(path);
        let node = self.lookup(&path).ok_or(DosError::FileNotFound)?;
        Ok(self.stat_node(node))
    }

    fn file_exists(&mut self, path: &str) -> bool {
        let path = canonical_path(path);
        matches!(self.lookup(&path), Some(Node::File(_)))
    }

    fn rename(&mut self, _old_path: &str, _new_path: &str) -> DriveResult<()> {
        Err(DosError::AccessDenied)
    }

    fn allocation_info(&mut self) -> AllocationInfo {
        let mut info = match self.layers.first_mut() {
            Some(l) => l.under.allocation_info(),
            None => AllocationInfo {
                bytes_per_sector: 512,
                sectors_per_cluster: 32,
                ..Default::default()
            },
        };
        info.free_clusters = 0;
        info
    }

    fn get_long_file_name(&mut self, path: &str) -> Option<String> {
        let path = canonical_path(path);
        let (layer, side, inner) = match self.lookup(&path)? {
            Node::File(f) => match &self.files[f].source {
                FileSource::Patch { .. } => return self.files[f].long_name.clone(),
                FileSource::Direct { layer, side, path } => (*layer, *side, path.clone()),
            },
            Node::Dir(d) => self.dirs[d].origin.clone()?,
        };
        self.side_drive(layer, side).ok()?.get_long_file_name(&inner)
    }

    fn label(&self) -> &str {
        self.layers.first().map_or("", |l| l.under.label())
    }

    fn unmount(&mut self) -> DriveResult<()> {
        self.close_all_handles();
        for layer in &mut self.layers {
            layer.under.unmount()?;
            if let Some(zip) = layer.patches.as_mut() {
                zip.unmount()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZipConfig;
    use crate::fs::MemoryDrive;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn patch_zip(members: &[(&str, &[u8])]) -> ZipDrive {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            if name.ends_with('/') {
                w.add_directory(*name, SimpleFileOptions::default()).unwrap();
                continue;
            }
            w.start_file(*name, SimpleFileOptions::default()).unwrap();
            w.write_all(data).unwrap();
        }
        let bytes = w.finish().unwrap().into_inner();
        ZipDrive::new(bytes, ZipConfig::default()).unwrap()
    }

    fn base() -> MemoryDrive {
        let mut m = MemoryDrive::new();
        m.add_file("GAME.EXE", b"MZ original".to_vec());
        m.add_file("DATA\\LEVEL.DAT", vec![0u8; 5]);
        m.add_file("README.TXT", b"read me".to_vec());
        m
    }

    fn names(drive: &mut PatchDrive, dir: &str) -> Vec<String> {
        let mut v: Vec<String> = list_dir(drive, dir, SEARCH_ALL_FILES)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_ips_member_patches_base_file() {
        let ips: &[u8] = b"PATCH\x00\x00\x02\x00\x02\xAA\xBBEOF";
        let zip = patch_zip(&[("data/level.dat.ips", ips)]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert_eq!(names(&mut drive, "DATA"), vec!["LEVEL.DAT"]);
        assert_eq!(read_file(&mut drive, "DATA\\LEVEL.DAT").unwrap(), vec![0, 0, 0xAA, 0xBB, 0]);
        assert_eq!(drive.file_stat("DATA\\LEVEL.DAT").unwrap().size, 5);
        assert!(!drive.file_exists("DATA\\LEVEL.DAT.IPS"));
    }

    #[test]
    fn test_raw_files_shadow_base() {
        let zip = patch_zip(&[("readme.txt", b"patched readme"), ("new.txt", b"brand new")]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert_eq!(names(&mut drive, ""), vec!["DATA", "GAME.EXE", "NEW.TXT", "README.TXT"]);
        assert_eq!(read_file(&mut drive, "README.TXT").unwrap(), b"patched readme");
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), b"MZ original");
        assert_eq!(drive.file_stat("README.TXT").unwrap().size, 14);
    }

    #[test]
    fn test_variant_folders() {
        let zip = patch_zip(&[
            ("[Expansion]/", b""),
            ("[Expansion]/game.exe", b"MZ expansion"),
            ("[Demo]/game.exe", b"MZ demo"),
        ]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert_eq!(drive.variants(), ["[Demo]", "[Expansion]"]);
        assert_eq!(names(&mut drive, ""), vec!["DATA", "GAME.EXE", "README.TXT"]);
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), b"MZ original");

        drive.set_variant(2);
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), b"MZ expansion");
        drive.set_variant(1);
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), b"MZ demo");
        assert_eq!(names(&mut drive, ""), vec!["DATA", "GAME.EXE", "README.TXT"]);
    }

    #[test]
    fn test_missing_patch_source_is_skipped() {
        let ips: &[u8] = b"PATCH\x00\x00\x00\x00\x01\x01EOF";
        let zip = patch_zip(&[("missing.dat.ips", ips)]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert!(!drive.file_exists("MISSING.DAT"));
        assert!(!drive.file_exists("MISSING.DAT.IPS"));
    }

    #[test]
    fn test_invalid_patch_fails_open() {
        let bps: &[u8] = b"BPS1\x80\x80\x80garbagegarbage";
        let zip = patch_zip(&[("readme.txt.bps", bps)]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert!(drive.file_exists("README.TXT"));
        assert_eq!(drive.file_open("README.TXT", OPEN_READ), Err(DosError::DataInvalid));
        assert_eq!(drive.file_stat("README.TXT").unwrap().size, 0);
    }

    #[test]
    fn test_xor_patch_with_embedded_source() {
        let source = b"MZ original";
        let target = b"MZ cracked!";
        let mut xor = b"XORGAME.EXE\0".to_vec();
        xor.push(0);
        xor.push(target.len() as u8);
        xor.extend(target.iter().zip(source.iter()).map(|(t, s)| t ^ s));
        let zip = patch_zip(&[("cracked.exe.xor", &xor)]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert_eq!(drive.file_stat("CRACKED.EXE").unwrap().size, 11);
        assert_eq!(read_file(&mut drive, "CRACKED.EXE").unwrap(), target);
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), source);
    }

    #[test]
    fn test_upper_layer_shadows_lower() {
        let mut top = MemoryDrive::new();
        top.add_file("README.TXT", b"layer two".to_vec());
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), None)], 0);
        drive.add_layer(PatchLayer::new(top, None));
        assert_eq!(drive.layer_count(), 2);
        assert_eq!(read_file(&mut drive, "README.TXT").unwrap(), b"layer two");
        assert_eq!(read_file(&mut drive, "GAME.EXE").unwrap(), b"MZ original");
    }

    #[test]
    fn test_mutations_denied_and_handles() {
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), None)], 0);
        assert_eq!(drive.file_create("X.TXT", ATTR_ARCHIVE), Err(DosError::AccessDenied));
        assert_eq!(drive.file_unlink("GAME.EXE"), Err(DosError::AccessDenied));
        assert_eq!(drive.rename("GAME.EXE", "G.EXE"), Err(DosError::AccessDenied));
        assert_eq!(drive.make_dir("NEW"), Err(DosError::AccessDenied));
        assert_eq!(drive.remove_dir("DATA"), Err(DosError::AccessDenied));
        assert_eq!(drive.file_open("GAME.EXE", OPEN_READWRITE), Err(DosError::AccessDenied));
        assert_eq!(drive.allocation_info().free_clusters, 0);

        let h = drive.file_open("GAME.EXE", OPEN_READ).unwrap();
        drive.file_add_ref(h).unwrap();
        drive.file_close(h).unwrap();
        assert_eq!(drive.file_seek(h, 3, SeekMode::Set).unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read_exact_or_eof(&mut drive, h, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"original");
        drive.file_close(h).unwrap();
        assert_eq!(drive.file_close(h), Err(DosError::InvalidHandle));
    }

    #[test]
    fn test_long_names_pass_through() {
        let zip = patch_zip(&[("LongPatchedName.txt", b"long")]);
        let mut drive = PatchDrive::new(vec![PatchLayer::new(base(), Some(zip))], 0);
        assert_eq!(drive.get_long_file_name("LONGNAME.TXT").as_deref(), Some("LongPatchedName.txt"));
        assert_eq!(drive.get_long_file_name("GAME.EXE"), None);
    }
}
