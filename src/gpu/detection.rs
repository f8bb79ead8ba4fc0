// GPU detection module
//
// Enumerates PCI devices with `lspci -nn -D`, augments each one with its
// IOMMU group and bound driver from sysfs, and groups every display-class
// device with the functions that must travel with it.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::system::{self, Host, SysfsLayout, PCI_STUB_DRIVER, VFIO_DRIVER};
use crate::gpu::eligibility;
use crate::gpu::{Gpu, GpuVendor, PciAddress, PciDevice, Topology};

fn lspci_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 0000:01:00.0 VGA compatible controller [0300]: NVIDIA Corporation TU106 [GeForce RTX 2060] [10de:1f08] (rev a1)
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<addr>[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]) .*?\[(?P<class>[0-9a-fA-F]{4})\]: (?P<name>.+) \[(?P<vendor>[0-9a-fA-F]{4}):(?P<device>[0-9a-fA-F]{4})\]",
        )
        .expect("static lspci regex")
    })
}

/// Scans the host PCI topology
pub struct TopologyScanner<'a> {
    host: &'a dyn Host,
    layout: &'a SysfsLayout,
    timeout: Duration,
}

impl<'a> TopologyScanner<'a> {
    pub fn new(host: &'a dyn Host, layout: &'a SysfsLayout, timeout: Duration) -> Self {
        Self { host, layout, timeout }
    }

    /// Runs one full pass: IOMMU check, enumeration, GPU grouping and
    /// eligibility analysis. Never fails; a broken host yields an empty,
    /// IOMMU-disabled topology.
    pub fn scan(&self) -> Topology {
        info!("Starting GPU detection scan");

        let devices = match self.enumerate() {
            Some(devices) => devices,
            None => {
                warn!("PCI enumeration failed; reporting empty topology");
                return Topology::default();
            }
        };
        let iommu_enabled = self.check_iommu();

        let mut gpus = classify_gpus(&devices, |dev| self.is_primary_display(dev));
        let analysis = eligibility::analyze(iommu_enabled, &mut gpus);

        for gpu in &gpus {
            info!(
                gpu = %gpu.full_name(),
                address = %gpu.address(),
                iommu_group = ?gpu.iommu_group(),
                related = gpu.related.len(),
                primary = gpu.is_primary,
                eligible = gpu.can_passthrough,
                "Detected GPU"
            );
        }
        info!(gpus = gpus.len(), devices = devices.len(), iommu_enabled, "GPU detection complete");

        Topology {
            iommu_enabled,
            devices,
            gpus,
            warnings: analysis.warnings,
        }
    }

    /// IOMMU is enabled when the groups directory exists and holds a group
    pub fn check_iommu(&self) -> bool {
        match self.host.list_dir(&self.layout.iommu_groups()) {
            Ok(groups) if !groups.is_empty() => {
                debug!(groups = groups.len(), "IOMMU enabled");
                true
            }
            Ok(_) => {
                warn!("IOMMU groups directory is empty - GPU passthrough unavailable");
                false
            }
            Err(e) => {
                warn!(error = %e, "IOMMU not enabled - GPU passthrough unavailable");
                false
            }
        }
    }

    /// Lists every PCI device; `None` when `lspci` itself is unusable.
    /// Malformed lines are skipped individually.
    pub fn enumerate(&self) -> Option<Vec<PciDevice>> {
        let output = match self.host.run("lspci", &["-nn", "-D"], self.timeout) {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(code = ?output.code, stderr = %output.stderr.trim(), "lspci failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Could not run lspci");
                return None;
            }
        };

        let mut devices: Vec<PciDevice> = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let Some(mut device) = parse_lspci_line(line) else {
                debug!(line, "Skipping unparsable lspci line");
                continue;
            };
            if devices.iter().any(|d| d.address == device.address) {
                debug!(address = %device.address, "Skipping duplicate lspci entry");
                continue;
            }
            device.iommu_group = system::iommu_group(self.host, self.layout, &device.address);
            device.driver = system::current_driver(self.host, self.layout, &device.address);
            devices.push(device);
        }
        debug!(count = devices.len(), "Scanned PCI devices");
        Some(devices)
    }

    /// Boot-VGA flag first, then "owned by a live, non-stub driver"
    fn is_primary_display(&self, device: &PciDevice) -> bool {
        if let Ok(flag) = self.host.read_to_string(&self.layout.device_boot_vga(&device.address)) {
            if flag.trim() == "1" {
                return true;
            }
        }
        matches!(device.driver.as_deref(), Some(d) if d != VFIO_DRIVER && d != PCI_STUB_DRIVER)
    }
}

/// Parses one line of `lspci -nn -D`
pub fn parse_lspci_line(line: &str) -> Option<PciDevice> {
    let caps = lspci_regex().captures(line.trim())?;
    let address: PciAddress = caps["addr"].parse().ok()?;
    let vendor_id = caps["vendor"].to_ascii_lowercase();
    let vendor_name = GpuVendor::from_vendor_id(&vendor_id).to_string();

    Some(PciDevice {
        address,
        device_id: caps["device"].to_ascii_lowercase(),
        class_code: caps["class"].to_ascii_lowercase(),
        vendor_name,
        device_name: caps["name"].trim().to_string(),
        vendor_id,
        iommu_group: None,
        driver: None,
    })
}

/// Builds one `Gpu` per display-class device. Eligibility is left false;
/// `eligibility::analyze` decides it.
pub fn classify_gpus(devices: &[PciDevice], is_primary: impl Fn(&PciDevice) -> bool) -> Vec<Gpu> {
    devices
        .iter()
        .filter(|dev| dev.is_gpu())
        .map(|dev| Gpu {
            primary: dev.clone(),
            vendor: GpuVendor::from_vendor_id(&dev.vendor_id),
            related: find_related_devices(dev, devices),
            is_primary: is_primary(dev),
            can_passthrough: false,
        })
        .collect()
}

/// Devices sharing both the IOMMU group and the bus segment of `gpu`.
///
/// Group alone is too wide: a group can span a root port or unrelated
/// bridges. This also means an HDMI function placed on another bus
/// segment of the same group is not picked up.
pub fn find_related_devices(gpu: &PciDevice, devices: &[PciDevice]) -> Vec<PciDevice> {
    let Some(group) = gpu.iommu_group else {
        return Vec::new();
    };
    let segment = gpu.address.bus_segment();

    devices
        .iter()
        .filter(|dev| dev.address != gpu.address)
        .filter(|dev| dev.iommu_group == Some(group) && dev.address.bus_segment() == segment)
        .inspect(|dev| debug!(gpu = %gpu.address, related = %dev.address, "Found related device"))
        .cloned()
        .collect()
}
