// Configuration for the passthrough lifecycle manager
//
// Loaded from a JSON file; every field has a default so a missing or
// partial file is fine.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PassthroughError, Result};

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV: &str = "VFIO_PASSTHROUGH_CONFIG";

/// Remote display transport restored when passthrough is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteDisplay {
    Spice,
    Vnc,
}

/// Where VM descriptors are read from and committed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorBackend {
    /// libvirt's persistent domain definitions (`virsh dumpxml`/`define`)
    Libvirt,
    /// JSON files in `descriptor_dir`, for a VM manager that reads them itself
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
    /// Mount point of sysfs
    pub sysfs_root: PathBuf,
    /// Device node directory (DRM and vendor nodes live here)
    pub dev_root: PathBuf,
    pub libvirt_uri: String,
    pub descriptor_backend: DescriptorBackend,
    /// JSON descriptors, or defined domain XML and its backups
    pub descriptor_dir: PathBuf,
    /// Host audio driver commonly attached to the GPU's HDMI function
    pub audio_driver: String,
    /// Per-vendor host module lists in load order, keyed by vendor ID ("10de")
    pub host_modules: HashMap<String, Vec<String>>,
    /// Guest-side PCI bus reserved for passthrough functions
    pub guest_bus: u8,
    pub remote_display: RemoteDisplay,
    /// QXL video memory in KiB
    pub video_ram_kb: u32,
    pub module_timeout_ms: u64,
    pub sysfs_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub watcher_poll_interval_ms: u64,
    pub watcher_ceiling_ms: u64,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            libvirt_uri: "qemu:///system".to_string(),
            descriptor_backend: DescriptorBackend::Libvirt,
            descriptor_dir: default_data_dir().join("descriptors"),
            audio_driver: "snd_hda_intel".to_string(),
            host_modules: HashMap::new(),
            guest_bus: 0x06,
            remote_display: RemoteDisplay::Vnc,
            video_ram_kb: 65536,
            module_timeout_ms: 5_000,
            sysfs_timeout_ms: 3_000,
            command_timeout_ms: 5_000,
            scan_timeout_ms: 10_000,
            settle_delay_ms: 200,
            watcher_poll_interval_ms: 1_000,
            watcher_ceiling_ms: 30_000,
        }
    }
}

impl PassthroughConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        config_home().join("vfio-passthrough").join("config.json")
    }

    /// Loads the config from an explicit path, `$VFIO_PASSTHROUGH_CONFIG`,
    /// or the default location, falling back to defaults when none exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(Self::default_path),
        };

        if !path.exists() {
            if explicit.is_some() {
                return Err(PassthroughError::InvalidConfig {
                    reason: format!("config file {} does not exist", path.display()),
                });
            }
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        Self::from_file(&path)
    }

    /// Parses a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| PassthroughError::InvalidConfig {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| PassthroughError::InvalidConfig {
                reason: format!("failed to parse {}: {}", path.display(), e),
            })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Saves the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PassthroughError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| PassthroughError::InvalidConfig {
                reason: format!("failed to serialize config: {}", e),
            })?;
        fs::write(path, content).map_err(|e| PassthroughError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.watcher_poll_interval_ms == 0 {
            return Err(PassthroughError::InvalidConfig {
                reason: "watcher_poll_interval_ms must be non-zero".to_string(),
            });
        }
        if self.watcher_ceiling_ms < self.watcher_poll_interval_ms {
            return Err(PassthroughError::InvalidConfig {
                reason: "watcher_ceiling_ms must be at least one poll interval".to_string(),
            });
        }
        if self.guest_bus == 0 {
            return Err(PassthroughError::InvalidConfig {
                reason: "guest_bus 0 is the root bus and cannot be reserved".to_string(),
            });
        }
        Ok(())
    }

    /// Host module override for a vendor, if configured
    pub fn modules_for_vendor(&self, vendor_id: &str) -> Option<&[String]> {
        self.host_modules.get(vendor_id).map(Vec::as_slice)
    }

    pub fn module_timeout(&self) -> Duration {
        Duration::from_millis(self.module_timeout_ms)
    }

    pub fn sysfs_timeout(&self) -> Duration {
        Duration::from_millis(self.sysfs_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn watcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_interval_ms)
    }

    pub fn watcher_ceiling(&self) -> Duration {
        Duration::from_millis(self.watcher_ceiling_ms)
    }
}

fn config_home() -> PathBuf {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/etc"))
}

fn default_data_dir() -> PathBuf {
    env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("vfio-passthrough")
}
