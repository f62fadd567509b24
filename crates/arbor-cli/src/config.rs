//! Configuration file loading and the resolved run configuration

use anyhow::Result;
use arbor_discovery::{LoadOptions, ProcessOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::format::OutputRequest;
use crate::render::{RenderOptions, DEFAULT_VERBOSITY};

/// Configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub input: InputSection,
    #[serde(default)]
    pub augment: AugmentSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySection {
    /// Show logical indices rather than OS indices
    #[serde(default = "default_true")]
    pub logical: bool,
    #[serde(default = "default_verbosity")]
    pub verbosity: i32,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            logical: true,
            verbosity: default_verbosity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_verbosity() -> i32 {
    DEFAULT_VERBOSITY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSection {
    /// XML file, sysfs root or synthetic description
    pub path: Option<String>,
    /// xml, synthetic or fsroot
    pub format: Option<String>,
    #[serde(default)]
    pub whole_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentSection {
    /// Attach running processes
    #[serde(default)]
    pub processes: bool,
    /// Attach DRM render nodes
    #[serde(default)]
    pub devices: bool,
    #[serde(default = "default_drm_root")]
    pub drm_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default)]
    pub include_kernel_threads: bool,
}

impl Default for AugmentSection {
    fn default() -> Self {
        Self {
            processes: false,
            devices: false,
            drm_root: default_drm_root(),
            proc_root: default_proc_root(),
            include_kernel_threads: false,
        }
    }
}

fn default_drm_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

/// Load configuration from file, falling back to defaults when it is absent
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Fully resolved settings of one run, built once from the command line
/// and the configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    pub load: LoadOptions,
    pub render: RenderOptions,
    pub output: OutputRequest,
    pub attach_processes: bool,
    pub process_options: ProcessOptions,
    pub attach_devices: bool,
    pub drm_root: PathBuf,
    pub proc_root: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("arbor.toml")).unwrap();
        assert!(config.display.logical);
        assert_eq!(config.display.verbosity, DEFAULT_VERBOSITY);
        assert_eq!(config.augment.proc_root, PathBuf::from("/proc"));
        assert!(config.input.path.is_none());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbor.toml");
        std::fs::write(
            &path,
            r#"
[display]
logical = false

[input]
path = "package:2 core:2 pu:2"
format = "synthetic"

[augment]
devices = true
drm_root = "/tmp/fake-sys"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.display.logical);
        assert_eq!(config.display.verbosity, DEFAULT_VERBOSITY);
        assert_eq!(config.input.format.as_deref(), Some("synthetic"));
        assert!(config.augment.devices);
        assert!(!config.augment.processes);
        assert_eq!(config.augment.drm_root, PathBuf::from("/tmp/fake-sys"));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbor.toml");
        std::fs::write(&path, "[display]\nverbosity = \"loud\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
