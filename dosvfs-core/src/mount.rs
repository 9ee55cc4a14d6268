//! Drive stacks assembled from a [`MountConfig`].
//!
//! Every layer is a ZIP archive, optionally paired with an archive of patches
//! and override files. The layers form one [`PatchDrive`]; a [`UnionDrive`]
//! on top makes it writable and a [`FatBlockDevice`] exposes it as a disk.

use std::path::PathBuf;

use tracing::info;

use crate::config::{FatConfig, MountConfig};
use crate::error::CoreResult;
use crate::fat::FatBlockDevice;
use crate::patch::{PatchDrive, PatchLayer};
use crate::union::UnionDrive;
use crate::zip::ZipDrive;

impl MountConfig {
    /// Single-layer configuration for one archive.
    pub fn for_archive(archive: impl Into<PathBuf>) -> Self {
        Self {
            layers: vec![crate::config::LayerConfig {
                archive: archive.into(),
                patches: None,
            }],
            ..Default::default()
        }
    }

    /// Read-only stack of every configured layer.
    pub fn mount_layers(&self) -> CoreResult<PatchDrive> {
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let base = ZipDrive::open(&layer.archive, self.zip.clone())?;
            let patches = match &layer.patches {
                Some(path) => Some(ZipDrive::open(path, self.zip.clone())?),
                None => None,
            };
            info!(
                archive = %layer.archive.display(),
                patched = patches.is_some(),
                "mounted layer"
            );
            layers.push(PatchLayer::new(base, patches));
        }
        Ok(PatchDrive::new(layers, self.variant))
    }

    /// Writable view of the layers, persisted to `union.save_path` when set.
    pub fn mount_union(&self) -> CoreResult<UnionDrive> {
        UnionDrive::with_save(self.mount_layers()?, self.union.clone())
    }

    /// FAT disk of the writable view. Without FAT options the disk is read-only.
    pub fn mount_fat(&self) -> CoreResult<FatBlockDevice> {
        let fat = self.fat.clone().unwrap_or(FatConfig {
            read_only: true,
            ..Default::default()
        });
        Ok(FatBlockDevice::new(self.mount_union()?, &fat)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{list_dir, read_file, Drive, SEARCH_ALL_FILES};
    use std::io::{Cursor, Write};
    use std::path::Path;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            w.start_file(*name, SimpleFileOptions::default()).unwrap();
            w.write_all(data).unwrap();
        }
        std::fs::write(path, w.finish().unwrap().into_inner()).unwrap();
    }

    #[test]
    fn test_layers_stack_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("A.ZIP"), dir.path().join("B.ZIP"));
        write_zip(&a, &[("SHARED.TXT", b"first"), ("ONLY_A.TXT", b"a")]);
        write_zip(&b, &[("SHARED.TXT", b"second")]);

        let mut config = MountConfig::for_archive(&a);
        config.layers.push(crate::config::LayerConfig {
            archive: b,
            patches: None,
        });
        let mut drive = config.mount_layers().unwrap();
        assert_eq!(read_file(&mut drive, "SHARED.TXT").unwrap(), b"second");
        assert_eq!(read_file(&mut drive, "ONLY_A.TXT").unwrap(), b"a");
    }

    #[test]
    fn test_missing_archive_is_an_error() {
        let config = MountConfig::for_archive("/nonexistent/GAME.ZIP");
        assert!(config.mount_layers().is_err());
    }

    #[test]
    fn test_union_persists_to_save_path() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("GAME.ZIP");
        write_zip(&archive, &[("GAME.EXE", b"MZ")]);
        let mut config = MountConfig::for_archive(&archive);
        config.union.save_path = Some(dir.path().join("SAVE.ZIP"));
        {
            let mut drive = config.mount_union().unwrap();
            crate::fs::write_file(&mut drive, "SCORES.DAT", b"999").unwrap();
            drive.unmount().unwrap();
        }
        let mut drive = config.mount_union().unwrap();
        assert_eq!(read_file(&mut drive, "SCORES.DAT").unwrap(), b"999");
        let mut names: Vec<String> = list_dir(&mut drive, "", SEARCH_ALL_FILES)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, ["GAME.EXE", "SCORES.DAT"]);
    }

    #[test]
    fn test_fat_defaults_to_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("GAME.ZIP");
        write_zip(&archive, &[("GAME.EXE", b"MZ")]);
        let config = MountConfig::for_archive(&archive);
        assert!(config.mount_fat().unwrap().is_read_only());
    }
}
