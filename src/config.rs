use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// number of descriptors reserved beyond those an image needs when writing a
/// container, so overlays and signatures can be added without a rewrite
pub const DEFAULT_SPARE_DESCRIPTOR_CAPACITY: u32 = 8;

/// library configuration, stored as toml
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// spare descriptor slots allocated by every container write
    pub spare_descriptor_capacity: u32,
    /// root for scratch directories when the caller does not pass one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,
    /// host binaries used for filesystem work
    pub tools: ToolPaths,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// scratch root: configured tmp_dir, else the system temp directory
    pub fn scratch_root(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spare_descriptor_capacity: DEFAULT_SPARE_DESCRIPTOR_CAPACITY,
            tmp_dir: None,
            tools: ToolPaths::default(),
        }
    }
}

/// paths (or PATH-resolved names) of external filesystem tools
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub mksquashfs: PathBuf,
    pub sqfs2tar: PathBuf,
    pub fuse2fs: PathBuf,
    pub fusermount: PathBuf,
    /// `-processors` passed to mksquashfs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mksquashfs_processors: Option<u32>,
    /// `-mem` passed to mksquashfs, e.g. "512M"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mksquashfs_mem: Option<String>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            mksquashfs: PathBuf::from("mksquashfs"),
            sqfs2tar: PathBuf::from("sqfs2tar"),
            fuse2fs: PathBuf::from("fuse2fs"),
            fusermount: PathBuf::from("fusermount"),
            mksquashfs_processors: None,
            mksquashfs_mem: None,
        }
    }
}
