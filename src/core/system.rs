// Host system surface for the passthrough lifecycle manager
//
// Everything the core does to the host goes through the `Host` trait:
// running helper programs (lspci, modprobe, fuser) and reading/writing
// files under sysfs. Every call that can block takes an explicit timeout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gpu::PciAddress;
use crate::utils::{self, CommandOutput};

/// Name of the VFIO stub driver
pub const VFIO_DRIVER: &str = "vfio-pci";
/// Name of the legacy PCI stub driver
pub const PCI_STUB_DRIVER: &str = "pci-stub";

/// Operations the core needs from the host
pub trait Host: Send + Sync {
    /// Runs a program to completion; `ErrorKind::TimedOut` once `timeout` passes
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> io::Result<CommandOutput>;

    /// Writes a kernel control file; `ErrorKind::TimedOut` once `timeout` passes
    fn write(&self, path: &Path, value: &str, timeout: Duration) -> io::Result<()>;

    /// Target of a symbolic link, `None` when absent
    fn read_link(&self, path: &Path) -> Option<PathBuf>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Entry names of a directory
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;
}

/// The real Linux host
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl Host for LinuxHost {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> io::Result<CommandOutput> {
        utils::run_command(program, args, timeout)
    }

    fn write(&self, path: &Path, value: &str, timeout: Duration) -> io::Result<()> {
        utils::write_with_timeout(path, value, timeout)
    }

    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        fs::read_link(path).ok()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }
}

/// Paths of the sysfs files the core touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsLayout {
    root: PathBuf,
}

impl Default for SysfsLayout {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/sys/kernel/iommu_groups`
    pub fn iommu_groups(&self) -> PathBuf {
        self.root.join("kernel/iommu_groups")
    }

    pub fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.root.join("bus/pci/devices").join(address.to_string())
    }

    pub fn device_driver_link(&self, address: &PciAddress) -> PathBuf {
        self.device_dir(address).join("driver")
    }

    pub fn device_iommu_group_link(&self, address: &PciAddress) -> PathBuf {
        self.device_dir(address).join("iommu_group")
    }

    pub fn device_boot_vga(&self, address: &PciAddress) -> PathBuf {
        self.device_dir(address).join("boot_vga")
    }

    pub fn device_driver_override(&self, address: &PciAddress) -> PathBuf {
        self.device_dir(address).join("driver_override")
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.root.join("bus/pci/drivers").join(driver)
    }

    pub fn driver_bind(&self, driver: &str) -> PathBuf {
        self.driver_dir(driver).join("bind")
    }

    pub fn driver_unbind(&self, driver: &str) -> PathBuf {
        self.driver_dir(driver).join("unbind")
    }

    pub fn driver_new_id(&self, driver: &str) -> PathBuf {
        self.driver_dir(driver).join("new_id")
    }

    /// `/sys/bus/pci/drivers_probe`
    pub fn drivers_probe(&self) -> PathBuf {
        self.root.join("bus/pci/drivers_probe")
    }

    /// Present while a kernel module is loaded
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join("module").join(module)
    }
}

/// Resolves the name of the driver currently bound to a device
pub fn current_driver(host: &dyn Host, layout: &SysfsLayout, address: &PciAddress) -> Option<String> {
    link_name(host, &layout.device_driver_link(address))
}

/// Resolves the IOMMU group number of a device
pub fn iommu_group(host: &dyn Host, layout: &SysfsLayout, address: &PciAddress) -> Option<u32> {
    link_name(host, &layout.device_iommu_group_link(address)).and_then(|name| name.parse().ok())
}

fn link_name(host: &dyn Host, link: &Path) -> Option<String> {
    host.read_link(link)
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}
