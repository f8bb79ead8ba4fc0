// GPU management module
//
// This module holds the PCI/GPU data model produced by a topology scan,
// the scanner itself, the eligibility analysis and vendor-specific handling.

pub mod detection;
pub mod eligibility;
pub mod vendor;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PassthroughError, PassthroughWarning, Result};

/// PCI class code of a VGA compatible controller
pub const VGA_CLASS_CODE: &str = "0300";
/// PCI class code of a generic display controller
pub const DISPLAY_CLASS_CODE: &str = "0380";
/// PCI class code of an audio device (the GPU's HDMI function)
pub const AUDIO_CLASS_CODE: &str = "0403";

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{4}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
            .expect("static PCI address regex")
    })
}

/// A PCI function address in `domain:bus:slot.function` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Self {
        Self { domain, bus, slot, function }
    }

    /// `domain:bus`, used to keep related functions on the same segment
    pub fn bus_segment(&self) -> String {
        format!("{:04x}:{:02x}", self.domain, self.bus)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PassthroughError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PassthroughError::InvalidAddress { address: s.to_string() };
        let caps = address_regex().captures(s.trim()).ok_or_else(invalid)?;
        let hex_u8 = |i: usize| u8::from_str_radix(&caps[i], 16).map_err(|_| invalid());
        Ok(Self {
            domain: u16::from_str_radix(&caps[1], 16).map_err(|_| invalid())?,
            bus: hex_u8(2)?,
            slot: hex_u8(3)?,
            function: hex_u8(4)?,
        })
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PassthroughError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> Self {
        address.to_string()
    }
}

/// One physical PCI function as seen by a single scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor_id: String,   // e.g. "10de"
    pub device_id: String,   // e.g. "1c03"
    pub class_code: String,  // e.g. "0300"
    pub vendor_name: String,
    pub device_name: String,
    pub iommu_group: Option<u32>,
    pub driver: Option<String>,
}

impl PciDevice {
    /// GPU-likeness depends on the class code only
    pub fn is_gpu(&self) -> bool {
        self.class_code == VGA_CLASS_CODE || self.class_code == DISPLAY_CLASS_CODE
    }

    pub fn is_audio(&self) -> bool {
        self.class_code == AUDIO_CLASS_CODE
    }

    /// Vendor/device pair as written to a driver's `new_id` file
    pub fn id_pair(&self) -> String {
        format!("{} {}", self.vendor_id, self.device_id)
    }
}

/// GPU vendors known to the static lookup table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    NVIDIA,
    AMD,
    Intel,
    ASPEED,
    Matrox,
    Other(String),
}

impl GpuVendor {
    pub fn from_vendor_id(vendor_id: &str) -> Self {
        match vendor_id.to_ascii_lowercase().as_str() {
            "10de" => GpuVendor::NVIDIA,
            "1002" => GpuVendor::AMD,
            "8086" => GpuVendor::Intel,
            "1a03" => GpuVendor::ASPEED,
            "102b" => GpuVendor::Matrox,
            other => GpuVendor::Other(other.to_string()),
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GpuVendor::NVIDIA => write!(f, "NVIDIA"),
            GpuVendor::AMD => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::ASPEED => write!(f, "ASPEED"),
            GpuVendor::Matrox => write!(f, "Matrox"),
            GpuVendor::Other(id) => write!(f, "Vendor {}", id),
        }
    }
}

/// A logical GPU: the display function plus its co-grouped companions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gpu {
    pub primary: PciDevice,
    pub vendor: GpuVendor,
    /// Same IOMMU group and same bus segment as `primary`
    pub related: Vec<PciDevice>,
    /// Drives the host's boot display
    pub is_primary: bool,
    pub can_passthrough: bool,
}

impl Gpu {
    pub fn address(&self) -> PciAddress {
        self.primary.address
    }

    pub fn iommu_group(&self) -> Option<u32> {
        self.primary.iommu_group
    }

    /// `[primary] + related`
    pub fn all_devices(&self) -> Vec<&PciDevice> {
        std::iter::once(&self.primary).chain(self.related.iter()).collect()
    }

    pub fn addresses(&self) -> Vec<PciAddress> {
        self.all_devices().iter().map(|d| d.address).collect()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.vendor, self.primary.device_name)
    }
}

/// Result of one scan, after eligibility analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub iommu_enabled: bool,
    pub devices: Vec<PciDevice>,
    pub gpus: Vec<Gpu>,
    #[serde(skip)]
    pub warnings: Vec<PassthroughWarning>,
}

impl Topology {
    pub fn eligible_gpus(&self) -> Vec<&Gpu> {
        self.gpus.iter().filter(|g| g.can_passthrough).collect()
    }

    /// First GPU flagged as driving the host display
    pub fn primary_gpu(&self) -> Option<&Gpu> {
        self.gpus.iter().find(|g| g.is_primary)
    }

    pub fn gpu_by_address(&self, address: &PciAddress) -> Option<&Gpu> {
        self.gpus.iter().find(|g| g.address() == *address)
    }

    /// Checks the invariants a well-formed scan upholds: unique device
    /// addresses, and every GPU member present exactly once in its GPU
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.address) {
                return Err(PassthroughError::TopologyUnavailable {
                    reason: format!("device {} listed twice", device.address),
                });
            }
        }
        for gpu in &self.gpus {
            let mut members = std::collections::HashSet::new();
            for address in gpu.addresses() {
                if !members.insert(address) {
                    return Err(PassthroughError::TopologyUnavailable {
                        reason: format!("GPU {} lists {} twice", gpu.address(), address),
                    });
                }
                if !seen.contains(&address) {
                    return Err(PassthroughError::TopologyUnavailable {
                        reason: format!("GPU {} references unknown device {}", gpu.address(), address),
                    });
                }
            }
        }
        Ok(())
    }
}
