// VFIO binding engine
//
// Moves every function of a GPU between its host drivers and vfio-pci.
// Steps run in a fixed order and each one is recorded in a `BindReport`
// as either best-effort (failure is logged and the sequence goes on) or
// required (failure aborts, after rolling back what this call changed).

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::PassthroughConfig;
use crate::core::system::{self, Host, SysfsLayout, PCI_STUB_DRIVER, VFIO_DRIVER};
use crate::error::{PassthroughError, Result};
use crate::gpu::detection::TopologyScanner;
use crate::gpu::vendor::{self, GpuVendorHandler};
use crate::gpu::{Gpu, PciAddress, PciDevice, Topology};
use crate::utils::CommandOutput;

/// Kernel modules that make up VFIO
pub const VFIO_MODULES: [&str; 3] = ["vfio", "vfio_pci", "vfio_iommu_type1"];

/// Clears `driver_override`; sysfs drops zero-length stores, so it must be a newline
pub const CLEAR_OVERRIDE: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDirection {
    ToVfio,
    ToHost,
}

/// The unit of work handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    /// `gpu.all_devices()` in order
    pub devices: Vec<PciAddress>,
    pub direction: BindDirection,
    /// Driver the display function goes back to (`ToHost` only)
    pub host_driver: Option<String>,
}

impl BindingRequest {
    pub fn to_vfio(gpu: &Gpu) -> Self {
        Self {
            devices: gpu.addresses(),
            direction: BindDirection::ToVfio,
            host_driver: None,
        }
    }

    pub fn to_host(gpu: &Gpu, host_driver: Option<String>) -> Self {
        Self {
            devices: gpu.addresses(),
            direction: BindDirection::ToHost,
            host_driver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Failure is logged, the sequence continues
    BestEffort,
    /// Failure aborts the sequence
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub kind: StepKind,
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed(_))
    }
}

/// Everything one bind or unbind call did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindReport {
    pub request: BindingRequest,
    pub steps: Vec<StepRecord>,
}

impl BindReport {
    fn new(request: BindingRequest) -> Self {
        Self { request, steps: Vec::new() }
    }

    fn record(&mut self, step: impl Into<String>, kind: StepKind, outcome: StepOutcome) {
        let step = step.into();
        match &outcome {
            StepOutcome::Failed(reason) => warn!(step = %step, ?kind, reason = %reason, "Step failed"),
            StepOutcome::Skipped(reason) => debug!(step = %step, reason = %reason, "Step skipped"),
            StepOutcome::Done => debug!(step = %step, "Step done"),
        }
        self.steps.push(StepRecord { step, kind, outcome });
    }

    /// Failed steps of the given kind
    pub fn failures(&self, kind: StepKind) -> Vec<&StepRecord> {
        self.steps.iter().filter(|s| s.kind == kind && s.failed()).collect()
    }

    /// First record with this exact step name
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Per-GPU serialization: one bind or unbind in flight per address set
#[derive(Debug, Clone, Default)]
pub struct GpuLockTable {
    held: Arc<Mutex<HashSet<PciAddress>>>,
}

impl GpuLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for every function of `gpu`; `AlreadyInProgress`
    /// if any of them is already leased
    pub fn acquire(&self, gpu: &Gpu) -> Result<GpuLease> {
        let addresses = gpu.addresses();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = addresses.iter().find(|a| held.contains(a)) {
            return Err(PassthroughError::AlreadyInProgress { key: busy.to_string() });
        }
        held.extend(addresses.iter().copied());
        debug!(gpu = %gpu.address(), "GPU lease acquired");
        Ok(GpuLease { table: Arc::clone(&self.held), addresses })
    }

    pub fn is_locked(&self, address: &PciAddress) -> bool {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).contains(address)
    }
}

/// Held while a bind or unbind runs; released on drop
#[derive(Debug)]
pub struct GpuLease {
    table: Arc<Mutex<HashSet<PciAddress>>>,
    addresses: Vec<PciAddress>,
}

impl GpuLease {
    pub fn covers(&self, gpu: &Gpu) -> bool {
        gpu.addresses().iter().all(|a| self.addresses.contains(a))
    }

    pub fn addresses(&self) -> &[PciAddress] {
        &self.addresses
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        let mut held = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for address in &self.addresses {
            held.remove(address);
        }
    }
}

/// Performs driver rebinds against a `Host`
pub struct BindingEngine {
    host: Arc<dyn Host>,
    layout: SysfsLayout,
    config: PassthroughConfig,
    vfio_ready: OnceLock<()>,
}

impl BindingEngine {
    pub fn new(host: Arc<dyn Host>, config: PassthroughConfig) -> Self {
        let layout = SysfsLayout::new(config.sysfs_root.clone());
        Self { host, layout, config, vfio_ready: OnceLock::new() }
    }

    pub fn config(&self) -> &PassthroughConfig {
        &self.config
    }

    pub fn layout(&self) -> &SysfsLayout {
        &self.layout
    }

    /// Fresh topology scan of the host this engine drives
    pub fn scan(&self) -> Topology {
        TopologyScanner::new(self.host.as_ref(), &self.layout, self.config.scan_timeout()).scan()
    }

    /// True when every function of `gpu` is currently owned by vfio-pci
    pub fn is_bound_to_vfio(&self, gpu: &Gpu) -> bool {
        gpu.all_devices()
            .iter()
            .all(|d| self.driver_of(&d.address).as_deref() == Some(VFIO_DRIVER))
    }

    /// Hands every function of `gpu` to vfio-pci.
    ///
    /// On failure, functions this call already moved are unbound from
    /// vfio-pci and modules it unloaded are loaded again before the error
    /// is returned.
    pub fn bind_to_vfio(&self, lease: &GpuLease, gpu: &Gpu) -> Result<BindReport> {
        self.check_lease(lease, gpu)?;
        self.ensure_vfio_modules();

        let handler = vendor::handler_for(gpu);
        let mut report = BindReport::new(BindingRequest::to_vfio(gpu));
        info!(gpu = %gpu.full_name(), address = %gpu.address(), functions = gpu.related.len() + 1, "Binding GPU to vfio-pci");

        self.stop_host_consumers(gpu, handler.as_deref(), &mut report);

        let mut unloaded = Vec::new();
        let audio = self.config.audio_driver.clone();
        if self.unload_module(&audio, None, &mut report) {
            unloaded.push(audio);
        }
        for module in self.host_modules(gpu, handler.as_deref()).iter().rev() {
            if self.unload_module(module, Some(gpu), &mut report) {
                unloaded.push(module.clone());
            }
        }
        self.settle();

        let devices = gpu.all_devices();
        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = self.move_to_vfio(device, &mut report) {
                error!(address = %device.address, error = %e, "Binding to vfio-pci failed, rolling back");
                self.rollback(&devices[..=index], &unloaded, &mut report);
                return Err(e);
            }
        }

        if let Err(e) = self.verify_listing(&gpu.primary.address, &mut report) {
            error!(address = %gpu.address(), error = %e, "vfio-pci verification failed, rolling back");
            self.rollback(&devices, &unloaded, &mut report);
            return Err(e);
        }

        info!(gpu = %gpu.full_name(), address = %gpu.address(), "GPU bound to vfio-pci");
        Ok(report)
    }

    /// Returns every function of `gpu` to a host driver.
    ///
    /// `hint` names the display function's driver; when absent the
    /// scan-time driver or the vendor default is used. Only releasing a
    /// function from vfio-pci is required, and a failed release is returned
    /// after the other functions, the host modules and the audio driver have
    /// been dealt with. The rebinds are best-effort.
    pub fn bind_to_host(&self, lease: &GpuLease, gpu: &Gpu, hint: Option<&str>) -> Result<BindReport> {
        self.check_lease(lease, gpu)?;

        let handler = vendor::handler_for(gpu);
        let primary_driver = self.primary_host_driver(gpu, handler.as_deref(), hint);
        let mut report = BindReport::new(BindingRequest::to_host(gpu, primary_driver.clone()));
        info!(gpu = %gpu.full_name(), address = %gpu.address(), driver = ?primary_driver, "Returning GPU to host");

        let mut released: Result<()> = Ok(());
        for device in gpu.all_devices() {
            let address = device.address;
            self.best_effort_write(
                &mut report,
                format!("driver_override {}", address),
                &self.layout.device_driver_override(&address),
                CLEAR_OVERRIDE,
            );
            if self.driver_of(&address).as_deref() == Some(VFIO_DRIVER) {
                let unbind = self.layout.driver_unbind(VFIO_DRIVER);
                if let Err(e) = self.required_write(&mut report, &address, "unbind", &unbind, &address.to_string()) {
                    error!(address = %address, error = %e, "Could not release function from vfio-pci");
                    if released.is_ok() {
                        released = Err(e);
                    }
                }
            }
        }
        self.settle();

        for module in self.host_modules(gpu, handler.as_deref()) {
            self.load_module(&module, &mut report);
        }
        let audio = self.config.audio_driver.clone();
        self.load_module(&audio, &mut report);
        self.settle();

        for device in gpu.all_devices() {
            let target = if device.address == gpu.address() {
                primary_driver.clone()
            } else {
                self.related_host_driver(device)
            };
            self.rebind_to_host(device, target.as_deref(), &mut report);
        }

        released?;
        info!(gpu = %gpu.full_name(), address = %gpu.address(), "GPU returned to host");
        Ok(report)
    }

    fn check_lease(&self, lease: &GpuLease, gpu: &Gpu) -> Result<()> {
        if lease.covers(gpu) {
            Ok(())
        } else {
            Err(PassthroughError::AlreadyInProgress {
                key: format!("{} (lease not held)", gpu.address()),
            })
        }
    }

    fn driver_of(&self, address: &PciAddress) -> Option<String> {
        system::current_driver(self.host.as_ref(), &self.layout, address)
    }

    fn settle(&self) {
        let delay = self.config.settle_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    /// Loads the VFIO modules the first time any bind needs them
    fn ensure_vfio_modules(&self) {
        self.vfio_ready.get_or_init(|| {
            for module in VFIO_MODULES {
                match self.modprobe(&[module]) {
                    Ok(output) if output.success() => debug!(module, "Loaded VFIO module"),
                    Ok(output) => {
                        warn!(module, stderr = %output.stderr.trim(), "Could not load VFIO module, it may be built in")
                    }
                    Err(e) => warn!(module, error = %e, "Could not load VFIO module, it may be built in"),
                }
            }
        });
    }

    fn modprobe(&self, args: &[&str]) -> io::Result<CommandOutput> {
        self.host.run("modprobe", args, self.config.module_timeout())
    }

    /// Module list for the GPU's vendor, config override first
    fn host_modules(&self, gpu: &Gpu, handler: Option<&dyn GpuVendorHandler>) -> Vec<String> {
        if let Some(modules) = self.config.modules_for_vendor(&gpu.primary.vendor_id) {
            return modules.to_vec();
        }
        handler
            .map(|h| h.host_modules().into_iter().map(String::from).collect())
            .unwrap_or_default()
    }

    fn primary_host_driver(&self, gpu: &Gpu, handler: Option<&dyn GpuVendorHandler>, hint: Option<&str>) -> Option<String> {
        hint.filter(|d| !is_stub(d))
            .map(String::from)
            .or_else(|| gpu.primary.driver.clone().filter(|d| !is_stub(d)))
            .or_else(|| handler.map(|h| h.default_host_driver().to_string()))
    }

    fn related_host_driver(&self, device: &PciDevice) -> Option<String> {
        device
            .driver
            .clone()
            .filter(|d| !is_stub(d))
            .or_else(|| device.is_audio().then(|| self.config.audio_driver.clone()))
    }

    /// Step 1: close the GPU's device nodes and stop vendor daemons
    fn stop_host_consumers(&self, gpu: &Gpu, handler: Option<&dyn GpuVendorHandler>, report: &mut BindReport) {
        let dev_root = &self.config.dev_root;
        let mut nodes: Vec<PathBuf> = Vec::new();
        for device in gpu.all_devices() {
            for kind in ["card", "render"] {
                nodes.push(dev_root.join("dri/by-path").join(format!("pci-{}-{}", device.address, kind)));
            }
        }
        if let Some(handler) = handler {
            nodes.extend(handler.device_nodes().iter().map(|n| dev_root.join(n)));
        }

        for node in nodes.iter().filter(|n| self.host.exists(n)) {
            let node = node.to_string_lossy();
            let outcome = match self.host.run("fuser", &["-k", &node], self.config.command_timeout()) {
                Ok(output) if output.success() => StepOutcome::Done,
                // fuser exits 1 when nobody holds the node
                Ok(output) if output.code == Some(1) => StepOutcome::Skipped("not in use".to_string()),
                Ok(output) => StepOutcome::Failed(format!("exit {:?}", output.code)),
                Err(e) => StepOutcome::Failed(e.to_string()),
            };
            report.record(format!("fuser {}", node), StepKind::BestEffort, outcome);
        }

        for process in handler.map(|h| h.host_processes()).unwrap_or_default() {
            let outcome = match self.host.run("pkill", &["-x", process], self.config.command_timeout()) {
                Ok(output) if output.success() => StepOutcome::Done,
                Ok(output) if output.code == Some(1) => StepOutcome::Skipped("not running".to_string()),
                Ok(output) => StepOutcome::Failed(format!("exit {:?}", output.code)),
                Err(e) => StepOutcome::Failed(e.to_string()),
            };
            report.record(format!("pkill {}", process), StepKind::BestEffort, outcome);
        }
    }

    /// Best-effort `modprobe -r`; true when the module was loaded and is now gone.
    ///
    /// With `owner` set, a module still driving a device outside that GPU is
    /// left alone so the host display keeps its driver.
    fn unload_module(&self, module: &str, owner: Option<&Gpu>, report: &mut BindReport) -> bool {
        let step = format!("unload {}", module);
        if !self.host.exists(&self.layout.module_dir(module)) {
            report.record(step, StepKind::BestEffort, StepOutcome::Skipped("not loaded".to_string()));
            return false;
        }
        if let Some(gpu) = owner {
            if let Some(other) = self.foreign_user(module, gpu) {
                report.record(step, StepKind::BestEffort, StepOutcome::Skipped(format!("still drives {}", other)));
                return false;
            }
        }

        let outcome = match self.modprobe(&["-r", module]) {
            Ok(output) if output.success() => StepOutcome::Done,
            Ok(output) => StepOutcome::Failed(format!("exit {:?}: {}", output.code, output.stderr.trim())),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => StepOutcome::Failed("timed out".to_string()),
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        let unloaded = outcome == StepOutcome::Done;
        report.record(step, StepKind::BestEffort, outcome);
        unloaded
    }

    /// A device outside `gpu` bound to the driver named `module`
    fn foreign_user(&self, module: &str, gpu: &Gpu) -> Option<PciAddress> {
        let ours = gpu.addresses();
        self.host
            .list_dir(&self.layout.driver_dir(module))
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| entry.parse::<PciAddress>().ok())
            .find(|address| !ours.contains(address))
    }

    fn load_module(&self, module: &str, report: &mut BindReport) {
        let step = format!("load {}", module);
        if self.host.exists(&self.layout.module_dir(module)) {
            report.record(step, StepKind::BestEffort, StepOutcome::Skipped("already loaded".to_string()));
            return;
        }
        let outcome = match self.modprobe(&[module]) {
            Ok(output) if output.success() => StepOutcome::Done,
            Ok(output) => StepOutcome::Failed(format!("exit {:?}: {}", output.code, output.stderr.trim())),
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        report.record(step, StepKind::BestEffort, outcome);
    }

    /// Step 4 for one function: unbind, override, register, probe, fall back, verify
    fn move_to_vfio(&self, device: &PciDevice, report: &mut BindReport) -> Result<()> {
        let address = device.address;
        let addr = address.to_string();

        match self.driver_of(&address) {
            Some(driver) if driver == VFIO_DRIVER => report.record(
                format!("unbind {}", addr),
                StepKind::Required,
                StepOutcome::Skipped("already bound to vfio-pci".to_string()),
            ),
            Some(driver) => {
                self.required_write(report, &address, "unbind", &self.layout.driver_unbind(&driver), &addr)?
            }
            None => report.record(
                format!("unbind {}", addr),
                StepKind::Required,
                StepOutcome::Skipped("no driver bound".to_string()),
            ),
        }

        self.required_write(report, &address, "driver_override", &self.layout.device_driver_override(&address), VFIO_DRIVER)?;

        let outcome = match self.host.write(&self.layout.driver_new_id(VFIO_DRIVER), &device.id_pair(), self.config.sysfs_timeout()) {
            Ok(()) => StepOutcome::Done,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => StepOutcome::Skipped("ID already registered".to_string()),
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        report.record(format!("new_id {}", device.id_pair()), StepKind::BestEffort, outcome);

        if self.driver_of(&address).as_deref() != Some(VFIO_DRIVER) {
            let probed = match self.host.write(&self.layout.drivers_probe(), &addr, self.config.sysfs_timeout()) {
                Ok(()) => {
                    report.record(format!("drivers_probe {}", addr), StepKind::BestEffort, StepOutcome::Done);
                    true
                }
                Err(e) => {
                    report.record(format!("drivers_probe {}", addr), StepKind::BestEffort, StepOutcome::Failed(e.to_string()));
                    false
                }
            };

            if !probed || self.driver_of(&address).as_deref() != Some(VFIO_DRIVER) {
                info!(address = %address, "Probe did not bind vfio-pci, binding directly");
                match self.host.write(&self.layout.driver_bind(VFIO_DRIVER), &addr, self.config.sysfs_timeout()) {
                    Ok(()) => report.record(format!("bind {}", addr), StepKind::Required, StepOutcome::Done),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        report.record(format!("bind {}", addr), StepKind::Required, StepOutcome::Failed(e.to_string()));
                        return Err(PassthroughError::BindTimeout { address: addr, step: "bind".to_string() });
                    }
                    // verification below turns this into the error
                    Err(e) => report.record(format!("bind {}", addr), StepKind::Required, StepOutcome::Failed(e.to_string())),
                }
            }
        }

        match self.driver_of(&address) {
            Some(driver) if driver == VFIO_DRIVER => {
                report.record(format!("verify {}", addr), StepKind::Required, StepOutcome::Done);
                Ok(())
            }
            found => {
                report.record(
                    format!("verify {}", addr),
                    StepKind::Required,
                    StepOutcome::Failed(format!("driver is {:?}", found)),
                );
                Err(PassthroughError::BindVerificationFailed { address: addr, found })
            }
        }
    }

    /// Step 5: independent confirmation through `lspci -k`
    fn verify_listing(&self, address: &PciAddress, report: &mut BindReport) -> Result<()> {
        let addr = address.to_string();
        let step = format!("lspci {}", addr);
        let output = match self.host.run("lspci", &["-k", "-s", &addr], self.config.command_timeout()) {
            Ok(output) if output.success() => output,
            Ok(output) => {
                report.record(step, StepKind::Required, StepOutcome::Failed(format!("exit {:?}", output.code)));
                return Err(PassthroughError::BindVerificationFailed { address: addr, found: None });
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                report.record(step, StepKind::Required, StepOutcome::Failed(e.to_string()));
                return Err(PassthroughError::BindTimeout { address: addr, step: "lspci".to_string() });
            }
            Err(e) => {
                report.record(step, StepKind::Required, StepOutcome::Failed(e.to_string()));
                return Err(PassthroughError::Io { path: PathBuf::from("lspci"), source: e });
            }
        };

        match parse_kernel_driver(&output.stdout) {
            Some(driver) if driver == VFIO_DRIVER => {
                report.record(step, StepKind::Required, StepOutcome::Done);
                Ok(())
            }
            found => {
                report.record(step, StepKind::Required, StepOutcome::Failed(format!("listing shows {:?}", found)));
                Err(PassthroughError::BindVerificationFailed { address: addr, found })
            }
        }
    }

    /// Undoes a failed `bind_to_vfio`: release from vfio-pci, reload what was
    /// unloaded, re-probe functions that had a driver before
    fn rollback(&self, devices: &[&PciDevice], unloaded: &[String], report: &mut BindReport) {
        warn!(functions = devices.len(), "Rolling back vfio-pci binding");
        for device in devices {
            let address = device.address;
            self.best_effort_write(
                report,
                format!("rollback driver_override {}", address),
                &self.layout.device_driver_override(&address),
                CLEAR_OVERRIDE,
            );
            if self.driver_of(&address).as_deref() == Some(VFIO_DRIVER) {
                self.best_effort_write(
                    report,
                    format!("rollback unbind {}", address),
                    &self.layout.driver_unbind(VFIO_DRIVER),
                    &address.to_string(),
                );
            }
        }

        for module in unloaded.iter().rev() {
            self.load_module(module, report);
        }
        self.settle();

        for device in devices {
            let had_driver = device.driver.as_deref().is_some_and(|d| !is_stub(d));
            if had_driver && self.driver_of(&device.address).is_none() {
                self.best_effort_write(
                    report,
                    format!("rollback drivers_probe {}", device.address),
                    &self.layout.drivers_probe(),
                    &device.address.to_string(),
                );
            }
        }
    }

    /// Binds one released function to `target`, falling back to a probe
    fn rebind_to_host(&self, device: &PciDevice, target: Option<&str>, report: &mut BindReport) {
        let address = device.address;
        let current = self.driver_of(&address);
        match (target, current) {
            (Some(target), Some(current)) if current == target => report.record(
                format!("bind {} to {}", address, target),
                StepKind::BestEffort,
                StepOutcome::Skipped("already bound".to_string()),
            ),
            (_, Some(current)) => report.record(
                format!("bind {}", address),
                StepKind::BestEffort,
                StepOutcome::Skipped(format!("claimed by {}", current)),
            ),
            (Some(target), None) => {
                let bound = self.best_effort_write(
                    report,
                    format!("bind {} to {}", address, target),
                    &self.layout.driver_bind(target),
                    &address.to_string(),
                );
                if !bound {
                    self.best_effort_write(report, format!("drivers_probe {}", address), &self.layout.drivers_probe(), &address.to_string());
                }
            }
            (None, None) => {
                self.best_effort_write(report, format!("drivers_probe {}", address), &self.layout.drivers_probe(), &address.to_string());
            }
        }

        if self.driver_of(&address).is_none() {
            warn!(address = %address, "Function has no host driver after restore");
        }
    }

    fn required_write(&self, report: &mut BindReport, address: &PciAddress, step: &str, path: &Path, value: &str) -> Result<()> {
        let name = format!("{} {}", step, address);
        match self.host.write(path, value, self.config.sysfs_timeout()) {
            Ok(()) => {
                report.record(name, StepKind::Required, StepOutcome::Done);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                report.record(name, StepKind::Required, StepOutcome::Failed(e.to_string()));
                Err(PassthroughError::BindTimeout {
                    address: address.to_string(),
                    step: step.to_string(),
                })
            }
            Err(e) => {
                report.record(name, StepKind::Required, StepOutcome::Failed(e.to_string()));
                Err(PassthroughError::Io { path: path.to_path_buf(), source: e })
            }
        }
    }

    fn best_effort_write(&self, report: &mut BindReport, step: String, path: &Path, value: &str) -> bool {
        match self.host.write(path, value, self.config.sysfs_timeout()) {
            Ok(()) => {
                report.record(step, StepKind::BestEffort, StepOutcome::Done);
                true
            }
            Err(e) => {
                report.record(step, StepKind::BestEffort, StepOutcome::Failed(e.to_string()));
                false
            }
        }
    }
}

fn is_stub(driver: &str) -> bool {
    driver == VFIO_DRIVER || driver == PCI_STUB_DRIVER
}

/// Pulls "Kernel driver in use" out of `lspci -k` output
pub fn parse_kernel_driver(listing: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Kernel driver in use:")
            .map(|driver| driver.trim().to_string())
    })
}
