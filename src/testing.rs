// Test fixtures
//
// An in-memory `Host` that models the sysfs driver core closely enough
// for the binding engine, plus canned GPUs, descriptors and a scripted
// VM runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::PassthroughConfig;
use crate::core::system::{Host, SysfsLayout, VFIO_DRIVER};
use crate::error::{PassthroughError, Result};
use crate::gpu::{Gpu, GpuVendor, PciAddress, PciDevice};
use crate::utils::CommandOutput;
use crate::vm::descriptor::{DeviceEntry, GraphicsKind, VideoModel, VmDescriptor};
use crate::vm::runtime::VmRuntime;

const FAKE_SYSFS: &str = "/fake/sys";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn addr(address: &str) -> PciAddress {
    address.parse().unwrap()
}

/// Kernel module providing a driver
fn module_of(driver: &str) -> String {
    driver.replace('-', "_")
}

fn class_name(class: &str) -> &'static str {
    match class {
        "0300" => "VGA compatible controller",
        "0380" => "Display controller",
        "0403" => "Audio device",
        "0604" => "PCI bridge",
        _ => "Device",
    }
}

fn other(message: impl Into<String>) -> io::Error {
    io::Error::other(message.into())
}

/// One simulated PCI function
#[derive(Debug, Clone)]
pub struct FakeDevice {
    vendor: String,
    device: String,
    class: String,
    name: String,
    group: Option<u32>,
    driver: Option<String>,
    /// Driver the kernel would pick on a plain probe
    host_driver: Option<String>,
    boot_vga: bool,
    driver_override: Option<String>,
}

impl FakeDevice {
    pub fn new(vendor: &str, device: &str, class: &str, name: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            device: device.to_string(),
            class: class.to_string(),
            name: name.to_string(),
            group: None,
            driver: None,
            host_driver: None,
            boot_vga: false,
            driver_override: None,
        }
    }

    pub fn group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    /// Bound driver; also the probe default unless one was given
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = Some(driver.to_string());
        if self.host_driver.is_none() {
            self.host_driver = Some(driver.to_string());
        }
        self
    }

    pub fn host_driver(mut self, driver: &str) -> Self {
        self.host_driver = Some(driver.to_string());
        self
    }

    pub fn boot_vga(mut self) -> Self {
        self.boot_vga = true;
        self
    }

    fn lspci_line(&self, address: &PciAddress) -> String {
        format!(
            "{} {} [{}]: {} [{}:{}] (rev a1)",
            address,
            class_name(&self.class),
            self.class,
            self.name,
            self.vendor,
            self.device
        )
    }
}

#[derive(Default)]
struct FakeState {
    devices: BTreeMap<PciAddress, FakeDevice>,
    modules: BTreeSet<String>,
    iommu: bool,
    lspci_missing: bool,
    lspci_noise: Vec<String>,
    /// `Some` overrides what `lspci -k` reports as the bound driver
    lspci_driver: Option<Option<String>>,
    refused_unloads: HashSet<String>,
    fail_probe: bool,
    fail_bind: HashSet<PciAddress>,
    hung_writes: HashSet<PathBuf>,
    new_ids: HashSet<String>,
    scripts: HashMap<String, CommandOutput>,
    commands: Vec<String>,
    writes: Vec<(PathBuf, String)>,
}

impl FakeState {
    fn module_loaded(&self, driver: &str) -> bool {
        self.modules.contains(&module_of(driver))
    }

    fn device_mut(&mut self, address: &str) -> io::Result<&mut FakeDevice> {
        let address: PciAddress = address
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad address"))?;
        self.devices
            .get_mut(&address)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))
    }

    /// Loads a module and lets it claim the devices it matches
    fn insert_module(&mut self, module: &str) {
        self.modules.insert(module.to_string());
        for device in self.devices.values_mut().filter(|d| d.driver.is_none()) {
            let wanted = match &device.driver_override {
                Some(over) => Some(over),
                None => device.host_driver.as_ref(),
            };
            if let Some(driver) = wanted.filter(|d| module_of(d) == module) {
                device.driver = Some(driver.clone());
            }
        }
    }

    fn remove_module(&mut self, module: &str) {
        self.modules.remove(module);
        for device in self.devices.values_mut() {
            if device.driver.as_deref().is_some_and(|d| module_of(d) == module) {
                device.driver = None;
            }
        }
    }

    fn modprobe(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["-r", module] => {
                if self.refused_unloads.contains(*module) {
                    return CommandOutput::failed(1, format!("modprobe: FATAL: Module {} is in use.", module));
                }
                self.remove_module(module);
                CommandOutput::ok("")
            }
            [module] => {
                self.insert_module(module);
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "modprobe: bad arguments"),
        }
    }

    fn lspci(&self, args: &[&str]) -> io::Result<CommandOutput> {
        if self.lspci_missing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "lspci not installed"));
        }
        match args {
            ["-nn", "-D"] => {
                let mut lines: Vec<String> =
                    self.devices.iter().map(|(a, d)| d.lspci_line(a)).collect();
                lines.extend(self.lspci_noise.iter().cloned());
                Ok(CommandOutput::ok(lines.join("\n") + "\n"))
            }
            ["-k", "-s", address] => {
                let address: PciAddress = address
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad slot"))?;
                let Some(device) = self.devices.get(&address) else {
                    return Ok(CommandOutput::ok(""));
                };
                let driver = match &self.lspci_driver {
                    Some(reported) => reported.clone(),
                    None => device.driver.clone(),
                };
                let mut out = format!("{} {}: {}\n", address, class_name(&device.class), device.name);
                if let Some(driver) = driver {
                    out.push_str(&format!("\tKernel driver in use: {}\n", driver));
                }
                Ok(CommandOutput::ok(out))
            }
            _ => Ok(CommandOutput::failed(1, "lspci: unsupported arguments")),
        }
    }

    fn write(&mut self, parts: &[&str], value: &str) -> io::Result<()> {
        match parts {
            ["bus", "pci", "devices", address, "driver_override"] => {
                let device = self.device_mut(address)?;
                let value = value.trim();
                device.driver_override = (!value.is_empty()).then(|| value.to_string());
                Ok(())
            }
            ["bus", "pci", "drivers", driver, "unbind"] => {
                let device = self.device_mut(value)?;
                if device.driver.as_deref() != Some(*driver) {
                    return Err(other(format!("{} is not bound to {}", value, driver)));
                }
                device.driver = None;
                Ok(())
            }
            ["bus", "pci", "drivers", driver, "bind"] => {
                if !self.module_loaded(driver) {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "driver not loaded"));
                }
                let address: PciAddress = value
                    .trim()
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad address"))?;
                if self.fail_bind.contains(&address) {
                    return Err(other("probe failed"));
                }
                let device = self.device_mut(value)?;
                if device.driver.is_some() {
                    return Err(other("device busy"));
                }
                if device.driver_override.as_deref().is_some_and(|o| o != *driver) {
                    return Err(other("driver_override mismatch"));
                }
                device.driver = Some(driver.to_string());
                Ok(())
            }
            ["bus", "pci", "drivers", driver, "new_id"] => {
                if !self.module_loaded(driver) {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "driver not loaded"));
                }
                if !self.new_ids.insert(format!("{} {}", driver, value.trim())) {
                    return Err(io::Error::new(io::ErrorKind::AlreadyExists, "ID already added"));
                }
                Ok(())
            }
            ["bus", "pci", "drivers_probe"] => {
                if self.fail_probe {
                    return Err(other("probe failed"));
                }
                let loaded = self.modules.clone();
                let device = self.device_mut(value)?;
                if device.driver.is_some() {
                    return Ok(());
                }
                let wanted = match &device.driver_override {
                    Some(over) => Some(over.clone()),
                    None => device.host_driver.clone(),
                };
                if let Some(driver) = wanted.filter(|d| loaded.contains(&module_of(d))) {
                    device.driver = Some(driver);
                }
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such control file")),
        }
    }
}

/// In-memory host with a sysfs tree rooted at `/fake/sys`
pub struct FakeHost {
    layout: SysfsLayout,
    state: Mutex<FakeState>,
}

impl FakeHost {
    /// No devices, IOMMU on, lspci present
    pub fn empty() -> Self {
        Self {
            layout: SysfsLayout::new(FAKE_SYSFS),
            state: Mutex::new(FakeState { iommu: true, ..FakeState::default() }),
        }
    }

    /// Intel iGPU driving the display plus an unbound NVIDIA card with
    /// its HDMI audio function
    pub fn dual_gpu() -> Self {
        let host = Self::empty();
        host.add_device(
            "0000:00:01.0",
            FakeDevice::new("8086", "1901", "0604", "Intel Corporation 6th-10th Gen Core Processor PCIe Controller (x16)")
                .group(1),
        );
        host.add_device(
            "0000:00:02.0",
            FakeDevice::new("8086", "3e92", "0300", "Intel Corporation CoffeeLake-S GT2 [UHD Graphics 630]")
                .group(0)
                .driver("i915")
                .boot_vga(),
        );
        host.add_device(
            "0000:00:1f.3",
            FakeDevice::new("8086", "a348", "0403", "Intel Corporation Cannon Lake PCH cAVS")
                .group(2)
                .driver("snd_hda_intel"),
        );
        host.add_device(
            "0000:01:00.0",
            FakeDevice::new("10de", "1f08", "0300", "NVIDIA Corporation TU106 [GeForce RTX 2060]")
                .group(1)
                .host_driver("nvidia"),
        );
        host.add_device(
            "0000:01:00.1",
            FakeDevice::new("10de", "10f9", "0403", "NVIDIA Corporation TU106 High Definition Audio Controller")
                .group(1)
                .driver("snd_hda_intel"),
        );
        host
    }

    pub fn layout(&self) -> &SysfsLayout {
        &self.layout
    }

    pub fn device_count(&self) -> usize {
        lock(&self.state).devices.len()
    }

    pub fn add_device(&self, address: &str, device: FakeDevice) {
        let mut state = lock(&self.state);
        if let Some(driver) = &device.driver {
            state.modules.insert(module_of(driver));
        }
        state.devices.insert(addr(address), device);
    }

    pub fn set_driver(&self, address: &str, driver: Option<&str>) {
        let mut state = lock(&self.state);
        if let Some(driver) = driver {
            state.modules.insert(module_of(driver));
        }
        if let Some(device) = state.devices.get_mut(&addr(address)) {
            device.driver = driver.map(String::from);
        }
    }

    pub fn driver_of(&self, address: &str) -> Option<String> {
        lock(&self.state).devices.get(&addr(address)).and_then(|d| d.driver.clone())
    }

    pub fn override_of(&self, address: &str) -> Option<String> {
        lock(&self.state)
            .devices
            .get(&addr(address))
            .and_then(|d| d.driver_override.clone())
    }

    pub fn disable_iommu(&self) {
        lock(&self.state).iommu = false;
    }

    pub fn remove_lspci(&self) {
        lock(&self.state).lspci_missing = true;
    }

    pub fn add_lspci_noise(&self, line: &str) {
        lock(&self.state).lspci_noise.push(line.to_string());
    }

    pub fn load_module(&self, module: &str) {
        lock(&self.state).modules.insert(module.to_string());
    }

    pub fn module_loaded(&self, module: &str) -> bool {
        lock(&self.state).modules.contains(module)
    }

    pub fn refuse_unload(&self, module: &str) {
        lock(&self.state).refused_unloads.insert(module.to_string());
    }

    pub fn fail_probe(&self) {
        lock(&self.state).fail_probe = true;
    }

    pub fn fail_bind(&self, address: &str) {
        lock(&self.state).fail_bind.insert(addr(address));
    }

    /// Writes to `path` time out from now on
    pub fn hang_write(&self, path: PathBuf) {
        lock(&self.state).hung_writes.insert(path);
    }

    /// Makes `lspci -k` report `driver` regardless of the real binding
    pub fn report_lspci_driver(&self, driver: Option<&str>) {
        lock(&self.state).lspci_driver = Some(driver.map(String::from));
    }

    /// Canned output for one exact command line
    pub fn script(&self, command_line: &str, output: CommandOutput) {
        lock(&self.state).scripts.insert(command_line.to_string(), output);
    }

    /// Every command line run so far
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Every control-file write attempted so far
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        lock(&self.state).writes.clone()
    }

    fn relative(&self, path: &Path) -> Option<Vec<String>> {
        let rel = path.strip_prefix(self.layout.root()).ok()?;
        Some(rel.iter().map(|c| c.to_string_lossy().into_owned()).collect())
    }
}

impl Host for FakeHost {
    fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> io::Result<CommandOutput> {
        let mut state = lock(&self.state);
        let command_line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        state.commands.push(command_line.clone());

        if let Some(output) = state.scripts.get(&command_line) {
            return Ok(output.clone());
        }
        match program {
            "lspci" => state.lspci(args),
            "modprobe" => Ok(state.modprobe(args)),
            "fuser" | "pkill" => Ok(CommandOutput::failed(1, "")),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, format!("{}: command not found", program))),
        }
    }

    fn write(&self, path: &Path, value: &str, _timeout: Duration) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.writes.push((path.to_path_buf(), value.to_string()));
        if state.hung_writes.contains(path) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        // the kernel never sees an empty store
        if value.is_empty() {
            return Ok(());
        }
        let parts = self
            .relative(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "outside sysfs"))?;
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        state.write(&parts, value)
    }

    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        let parts = self.relative(path)?;
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let state = lock(&self.state);
        match parts.as_slice() {
            ["bus", "pci", "devices", address, "driver"] => {
                let device = state.devices.get(&address.parse::<PciAddress>().ok()?)?;
                device.driver.as_ref().map(|d| self.layout.driver_dir(d))
            }
            ["bus", "pci", "devices", address, "iommu_group"] => {
                if !state.iommu {
                    return None;
                }
                let device = state.devices.get(&address.parse::<PciAddress>().ok()?)?;
                device
                    .group
                    .map(|g| self.layout.iommu_groups().join(g.to_string()))
            }
            _ => None,
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let not_found = || io::Error::new(io::ErrorKind::NotFound, "no such file");
        let parts = self.relative(path).ok_or_else(not_found)?;
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let state = lock(&self.state);
        match parts.as_slice() {
            ["bus", "pci", "devices", address, "boot_vga"] => {
                let address: PciAddress = address.parse().map_err(|_| not_found())?;
                let device = state.devices.get(&address).ok_or_else(not_found)?;
                if !matches!(device.class.as_str(), "0300" | "0380") {
                    return Err(not_found());
                }
                Ok(if device.boot_vga { "1\n" } else { "0\n" }.to_string())
            }
            _ => Err(not_found()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let Some(parts) = self.relative(path) else {
            return false;
        };
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let state = lock(&self.state);
        match parts.as_slice() {
            ["module", module] => state.modules.contains(*module),
            ["bus", "pci", "devices", address] => address
                .parse::<PciAddress>()
                .is_ok_and(|a| state.devices.contains_key(&a)),
            ["bus", "pci", "drivers", driver] => state.module_loaded(driver),
            _ => false,
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let not_found = || io::Error::new(io::ErrorKind::NotFound, "no such directory");
        let parts = self.relative(path).ok_or_else(not_found)?;
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let state = lock(&self.state);
        match parts.as_slice() {
            ["kernel", "iommu_groups"] => {
                if !state.iommu {
                    return Err(not_found());
                }
                let groups: BTreeSet<u32> = state.devices.values().filter_map(|d| d.group).collect();
                Ok(groups.iter().map(u32::to_string).collect())
            }
            ["bus", "pci", "drivers", driver] => {
                if !state.module_loaded(driver) {
                    return Err(not_found());
                }
                let mut entries: Vec<String> = state
                    .devices
                    .iter()
                    .filter(|(_, d)| d.driver.as_deref() == Some(*driver))
                    .map(|(a, _)| a.to_string())
                    .collect();
                entries.extend(["bind", "new_id", "unbind"].map(String::from));
                Ok(entries)
            }
            _ => Err(not_found()),
        }
    }
}

/// Display-class GPU at `address` with no companions
pub fn gpu_with(vendor_id: &str, address: &str, driver: Option<&str>) -> Gpu {
    Gpu {
        primary: PciDevice {
            address: addr(address),
            vendor_id: vendor_id.to_string(),
            device_id: "0001".to_string(),
            class_code: "0300".to_string(),
            vendor_name: GpuVendor::from_vendor_id(vendor_id).to_string(),
            device_name: format!("Test GPU {}", address),
            iommu_group: Some(1),
            driver: driver.map(String::from),
        },
        vendor: GpuVendor::from_vendor_id(vendor_id),
        related: Vec::new(),
        is_primary: false,
        can_passthrough: true,
    }
}

/// The dual-GPU host's NVIDIA card as a scan would report it
pub fn nvidia_gpu() -> Gpu {
    let mut gpu = gpu_with("10de", "0000:01:00.0", None);
    gpu.primary.device_id = "1f08".to_string();
    gpu.primary.device_name = "NVIDIA Corporation TU106 [GeForce RTX 2060]".to_string();
    gpu.related.push(PciDevice {
        address: addr("0000:01:00.1"),
        vendor_id: "10de".to_string(),
        device_id: "10f9".to_string(),
        class_code: "0403".to_string(),
        vendor_name: "NVIDIA".to_string(),
        device_name: "NVIDIA Corporation TU106 High Definition Audio Controller".to_string(),
        iommu_group: Some(1),
        driver: Some("snd_hda_intel".to_string()),
    });
    gpu
}

/// A typical SPICE desktop VM without passthrough
pub fn sample_descriptor() -> VmDescriptor {
    let mut descriptor = VmDescriptor::new("win11");
    descriptor.devices = vec![
        DeviceEntry::Other {
            element: "disk".to_string(),
            raw: "<disk type='file' device='disk'><source file='/var/lib/libvirt/images/win11.qcow2'/><target dev='vda' bus='virtio'/></disk>".to_string(),
        },
        DeviceEntry::Video { model: VideoModel::Qxl, vram_kb: 65536, heads: 1, primary: true },
        DeviceEntry::Graphics { graphics: GraphicsKind::Spice, listen: Some("127.0.0.1".to_string()), autoport: true },
        DeviceEntry::Sound { model: "ich9".to_string() },
        DeviceEntry::Audio { id: 1, backend: "spice".to_string() },
        DeviceEntry::Channel { target: "com.redhat.spice.0".to_string() },
        DeviceEntry::Redirdev { bus: "usb".to_string() },
        DeviceEntry::Smartcard,
        DeviceEntry::Input { input: "tablet".to_string(), bus: "usb".to_string() },
        DeviceEntry::Input { input: "keyboard".to_string(), bus: "ps2".to_string() },
    ];
    descriptor.metadata = serde_json::json!({
        "memory_mb": 8192,
        "vcpus": 4,
        "notes": "gaming"
    });
    descriptor
}

/// Config pointing at the fake host with no settle delays
pub fn test_config(host: &FakeHost) -> PassthroughConfig {
    PassthroughConfig {
        sysfs_root: host.layout().root().to_path_buf(),
        dev_root: PathBuf::from("/fake/dev"),
        settle_delay_ms: 0,
        watcher_poll_interval_ms: 5,
        watcher_ceiling_ms: 50,
        ..PassthroughConfig::default()
    }
}

/// How a `ScriptedRuntime` VM reacts to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    Immediate,
    Never,
    /// Still running for this many state queries
    AfterPolls(usize),
}

#[derive(Debug)]
struct RuntimeState {
    running: HashSet<String>,
    behavior: StopBehavior,
    stopping: HashMap<String, usize>,
    fail_start: bool,
    starts: Vec<String>,
    stops: Vec<(String, bool)>,
}

/// VM runtime whose guests stop on cue
#[derive(Debug)]
pub struct ScriptedRuntime {
    state: Mutex<RuntimeState>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                running: HashSet::new(),
                behavior: StopBehavior::Immediate,
                stopping: HashMap::new(),
                fail_start: false,
                starts: Vec::new(),
                stops: Vec::new(),
            }),
        }
    }

    pub fn set_running(&self, vm: &str, running: bool) {
        let mut state = lock(&self.state);
        if running {
            state.running.insert(vm.to_string());
        } else {
            state.running.remove(vm);
        }
    }

    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        lock(&self.state).behavior = behavior;
    }

    pub fn fail_start(&self) {
        lock(&self.state).fail_start = true;
    }

    pub fn starts(&self) -> Vec<String> {
        lock(&self.state).starts.clone()
    }

    pub fn stops(&self) -> Vec<(String, bool)> {
        lock(&self.state).stops.clone()
    }
}

impl VmRuntime for ScriptedRuntime {
    fn is_running(&self, vm: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        if let Some(remaining) = state.stopping.get_mut(vm) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(true);
            }
            if state.behavior == StopBehavior::Never {
                return Ok(true);
            }
            state.stopping.remove(vm);
            state.running.remove(vm);
        }
        Ok(state.running.contains(vm))
    }

    fn start(&self, vm: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_start {
            return Err(PassthroughError::Runtime { vm: vm.to_string(), reason: "start refused".to_string() });
        }
        state.starts.push(vm.to_string());
        state.running.insert(vm.to_string());
        Ok(())
    }

    fn stop(&self, vm: &str, force: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.stops.push((vm.to_string(), force));
        match state.behavior {
            StopBehavior::Immediate => {
                state.running.remove(vm);
            }
            StopBehavior::Never => {
                state.stopping.insert(vm.to_string(), 0);
            }
            StopBehavior::AfterPolls(polls) => {
                state.stopping.insert(vm.to_string(), polls);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_honours_override_and_loaded_modules() {
        let host = FakeHost::dual_gpu();
        let layout = host.layout().clone();
        let dgpu = addr("0000:01:00.0");
        let t = Duration::from_secs(1);

        host.write(&layout.drivers_probe(), "0000:01:00.0", t).unwrap();
        assert_eq!(host.driver_of("0000:01:00.0"), None, "nvidia is not loaded");

        host.write(&layout.device_driver_override(&dgpu), VFIO_DRIVER, t).unwrap();
        host.run("modprobe", &["vfio_pci"], t).unwrap();
        assert_eq!(host.driver_of("0000:01:00.0").as_deref(), Some(VFIO_DRIVER));
        assert!(host.exists(&layout.module_dir("vfio_pci")));
    }

    #[test]
    fn unloading_a_module_releases_its_devices() {
        let host = FakeHost::dual_gpu();
        host.run("modprobe", &["-r", "snd_hda_intel"], Duration::from_secs(1)).unwrap();
        assert_eq!(host.driver_of("0000:01:00.1"), None);
        assert_eq!(host.driver_of("0000:00:1f.3"), None);
        assert!(host.list_dir(&host.layout().driver_dir("snd_hda_intel")).is_err());
    }
}
