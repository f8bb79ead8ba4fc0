// Descriptor storage
//
// A store hands out descriptors by VM name and takes them back whole.
// `replace` is the only commit point, so a caller never leaves a
// descriptor half-written.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{PassthroughError, Result};
use crate::utils;
use crate::vm::descriptor::VmDescriptor;

/// Source of truth for VM hardware descriptors
pub trait DescriptorStore: Send + Sync {
    /// Loads a descriptor; `VmNotFound` when the VM is unknown
    fn load(&self, vm: &str) -> Result<VmDescriptor>;

    /// Replaces the stored descriptor with `descriptor` in one step
    fn replace(&self, descriptor: &VmDescriptor) -> Result<()>;

    /// Names of every known VM
    fn list(&self) -> Result<Vec<String>>;
}

/// Keeps descriptors in memory
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    descriptors: Mutex<HashMap<String, VmDescriptor>>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: VmDescriptor) {
        let mut map = self.descriptors.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(descriptor.name.clone(), descriptor);
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn load(&self, vm: &str) -> Result<VmDescriptor> {
        let map = self.descriptors.lock().unwrap_or_else(|e| e.into_inner());
        map.get(vm).cloned().ok_or_else(|| PassthroughError::VmNotFound { vm: vm.to_string() })
    }

    fn replace(&self, descriptor: &VmDescriptor) -> Result<()> {
        let mut map = self.descriptors.lock().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(&descriptor.name) {
            return Err(PassthroughError::VmNotFound { vm: descriptor.name.clone() });
        }
        map.insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let map = self.descriptors.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// One pretty-printed JSON file per VM in a directory
#[derive(Debug, Clone)]
pub struct JsonDescriptorStore {
    dir: PathBuf,
}

impl JsonDescriptorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes a descriptor for a VM that does not exist yet
    pub fn create(&self, descriptor: &VmDescriptor) -> Result<()> {
        let path = self.path_for(&descriptor.name)?;
        if path.exists() {
            return Err(PassthroughError::DescriptorMutationFailed {
                vm: descriptor.name.clone(),
                reason: format!("{} already exists", path.display()),
            });
        }
        self.commit(&path, descriptor)
    }

    fn path_for(&self, vm: &str) -> Result<PathBuf> {
        if vm.is_empty() || vm.starts_with('.') || vm.contains(['/', '\\']) {
            return Err(PassthroughError::VmNotFound { vm: vm.to_string() });
        }
        Ok(self.dir.join(format!("{}.json", vm)))
    }

    /// Serializes to a sibling temp file and renames it over the target
    fn commit(&self, path: &Path, descriptor: &VmDescriptor) -> Result<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| PassthroughError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let content = serde_json::to_string_pretty(descriptor).map_err(|e| {
            PassthroughError::DescriptorMutationFailed {
                vm: descriptor.name.clone(),
                reason: format!("failed to serialize descriptor: {}", e),
            }
        })?;

        let tmp = self.dir.join(format!(".{}.json.tmp", descriptor.name));
        fs::write(&tmp, content).map_err(io_err(&tmp))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(PassthroughError::Io { path: path.to_path_buf(), source: e });
        }
        debug!(vm = %descriptor.name, path = %path.display(), "Descriptor committed");
        Ok(())
    }
}

impl DescriptorStore for JsonDescriptorStore {
    fn load(&self, vm: &str) -> Result<VmDescriptor> {
        let path = self.path_for(vm)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PassthroughError::VmNotFound { vm: vm.to_string() })
            }
            Err(e) => return Err(PassthroughError::Io { path, source: e }),
        };
        serde_json::from_str(&content).map_err(|e| PassthroughError::DescriptorMutationFailed {
            vm: vm.to_string(),
            reason: format!("malformed descriptor {}: {}", path.display(), e),
        })
    }

    fn replace(&self, descriptor: &VmDescriptor) -> Result<()> {
        let path = self.path_for(&descriptor.name)?;
        if !path.exists() {
            return Err(PassthroughError::VmNotFound { vm: descriptor.name.clone() });
        }
        let backup = utils::create_timestamped_backup(&path)
            .map_err(|e| PassthroughError::Io { path: path.clone(), source: e })?;
        if let Some(backup) = backup {
            info!(vm = %descriptor.name, backup = %backup.display(), "Created descriptor backup");
        }
        self.commit(&path, descriptor)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PassthroughError::Io { path: self.dir.clone(), source: e }),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PassthroughError::Io { path: self.dir.clone(), source: e })?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(".json") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
