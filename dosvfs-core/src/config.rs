//! Mount configuration.
//!
//! Every struct defaults its fields so partial JSON files are accepted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Options for opening ZIP archives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZipConfig {
    /// Skip a single directory that contains every member.
    pub enter_solo_root_dir: bool,
    /// Host directory for DEFLATE seek caches (`*.SKC`); `None` disables them.
    pub seek_cache_dir: Option<PathBuf>,
}

/// Persistence options of a union drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnionConfig {
    /// Save container; `None` keeps changes in memory only.
    pub save_path: Option<PathBuf>,
    /// Skip executables and DOS.YML when loading a save.
    pub strict: bool,
    pub save_delay_base_ms: u64,
    pub save_delay_per_mb_ms: u64,
    pub save_delay_max_ms: u64,
    pub save_retry_ms: u64,
}

impl Default for UnionConfig {
    fn default() -> Self {
        Self {
            save_path: None,
            strict: false,
            save_delay_base_ms: 1000,
            save_delay_per_mb_ms: 1000,
            save_delay_max_ms: 60000,
            save_retry_ms: 5000,
        }
    }
}

impl UnionConfig {
    /// Delay before saving `dirty_bytes` of accumulated changes.
    pub fn save_delay(&self, dirty_bytes: u64) -> Duration {
        let per_mb = dirty_bytes.saturating_mul(self.save_delay_per_mb_ms) / (1024 * 1024);
        let ms = self.save_delay_base_ms.saturating_add(per_mb).min(self.save_delay_max_ms);
        Duration::from_millis(ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.save_retry_ms)
    }
}

/// Options of a synthesized FAT block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FatConfig {
    /// Extra free space on the volume.
    pub free_space_mb: u32,
    /// Volume serial; 0 derives one from the layout.
    pub serial: u32,
    /// Differencing file capturing sector writes; `None` keeps them in memory.
    pub diff_path: Option<PathBuf>,
    /// Refuse writes instead of capturing them.
    pub read_only: bool,
}

/// One layer of a mounted drive stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LayerConfig {
    /// Base archive of the layer.
    pub archive: PathBuf,
    /// Archive of patch and override files applied on top of `archive`.
    pub patches: Option<PathBuf>,
}

/// Everything needed to mount a drive from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MountConfig {
    pub layers: Vec<LayerConfig>,
    /// Active `[Variant]` folder index (0 = none).
    pub variant: usize,
    pub zip: ZipConfig,
    pub union: UnionConfig,
    pub fat: Option<FatConfig>,
}

impl MountConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_json_str(text: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = MountConfig::from_json_str(r#"{"layers":[{"archive":"GAME.ZIP"}],"union":{"strict":true}}"#).unwrap();
        assert_eq!(cfg.layers.len(), 1);
        assert_eq!(cfg.layers[0].patches, None);
        assert!(cfg.union.strict);
        assert_eq!(cfg.union.save_retry_ms, 5000);
        assert!(cfg.fat.is_none());
        assert!(!cfg.zip.enter_solo_root_dir);
    }

    #[test]
    fn test_save_delay_is_capped() {
        let cfg = UnionConfig::default();
        assert_eq!(cfg.save_delay(0), Duration::from_millis(1000));
        assert_eq!(cfg.save_delay(3 * 1024 * 1024), Duration::from_millis(4000));
        assert_eq!(cfg.save_delay(u64::MAX), Duration::from_millis(60000));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(&path, r#"{"fat":{"freeSpaceMb":8},"zip":{"seekCacheDir":"cache"}}"#).unwrap();
        let cfg = MountConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.fat.unwrap().free_space_mb, 8);
        assert_eq!(cfg.zip.seek_cache_dir, Some(PathBuf::from("cache")));
        assert!(MountConfig::from_json_str("{not json").is_err());
    }
}
