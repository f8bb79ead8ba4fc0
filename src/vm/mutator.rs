// Descriptor mutation for GPU passthrough
//
// Pure functions over `VmDescriptor`: callers stage the result in memory
// and commit it with a single replace.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::{PassthroughConfig, RemoteDisplay};
use crate::error::{PassthroughError, Result};
use crate::gpu::{Gpu, PciAddress};
use crate::vm::descriptor::{DeviceEntry, GraphicsKind, VideoModel, VmDescriptor};

/// Highest usable slot on a PCI bus
const MAX_SLOT: u8 = 0x1f;

/// Settings the mutator needs from the config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatorSettings {
    pub guest_bus: u8,
    pub video_ram_kb: u32,
    pub remote_display: RemoteDisplay,
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self::from(&PassthroughConfig::default())
    }
}

impl From<&PassthroughConfig> for MutatorSettings {
    fn from(config: &PassthroughConfig) -> Self {
        Self {
            guest_bus: config.guest_bus,
            video_ram_kb: config.video_ram_kb,
            remote_display: config.remote_display,
        }
    }
}

/// Returns `descriptor` with every function of `gpu` passed through.
///
/// Existing entries for the same host addresses are replaced, so attaching
/// twice yields the same device count as attaching once. Virtual sound and
/// SPICE agent plumbing are dropped, a SPICE transport is kept for input,
/// and exactly one virtual display remains, non-primary.
pub fn attach_gpu(descriptor: &VmDescriptor, gpu: &Gpu, settings: &MutatorSettings) -> Result<VmDescriptor> {
    let mut out = descriptor.clone();
    let addresses: HashSet<PciAddress> = gpu.addresses().into_iter().collect();

    out.devices.retain(|entry| match entry {
        DeviceEntry::Hostdev { source, .. } if addresses.contains(source) => {
            debug!(address = %source, "Removing existing hostdev");
            false
        }
        DeviceEntry::Audio { .. } | DeviceEntry::Sound { .. } => false,
        DeviceEntry::Channel { .. } | DeviceEntry::Redirdev { .. } | DeviceEntry::Smartcard => false,
        DeviceEntry::Input { input, bus } if input == "tablet" && bus == "usb" => false,
        _ => true,
    });

    if !out.devices.iter().any(|d| matches!(d, DeviceEntry::Graphics { graphics: GraphicsKind::Spice, .. })) {
        out.devices.push(DeviceEntry::Graphics {
            graphics: GraphicsKind::Spice,
            listen: Some("127.0.0.1".to_string()),
            autoport: true,
        });
    }

    let mut free_slots = free_guest_slots(&out, settings.guest_bus);
    for device in gpu.all_devices() {
        let slot = free_slots.next().ok_or_else(|| PassthroughError::DescriptorMutationFailed {
            vm: descriptor.name.clone(),
            reason: format!("no free slot left on guest bus 0x{:02x}", settings.guest_bus),
        })?;
        out.devices.push(DeviceEntry::Hostdev {
            source: device.address,
            guest: PciAddress::new(0, settings.guest_bus, slot, 0),
            managed: false,
        });
        info!(vm = %out.name, address = %device.address, guest_slot = slot, "Added hostdev");
    }

    normalize_video(&mut out, settings);
    Ok(out)
}

/// Returns `descriptor` with `gpu`'s passthrough entries removed, a single
/// standalone virtual display and a remote display transport.
pub fn detach_gpu(descriptor: &VmDescriptor, gpu: &Gpu, settings: &MutatorSettings) -> Result<VmDescriptor> {
    let mut out = descriptor.clone();
    let addresses: HashSet<PciAddress> = gpu.addresses().into_iter().collect();

    let before = out.devices.len();
    out.devices
        .retain(|entry| !matches!(entry.hostdev_source(), Some(source) if addresses.contains(&source)));
    debug!(vm = %out.name, removed = before - out.devices.len(), "Removed GPU hostdevs");

    if !out.devices.iter().any(DeviceEntry::is_graphics) {
        let graphics = match settings.remote_display {
            RemoteDisplay::Spice => GraphicsKind::Spice,
            RemoteDisplay::Vnc => GraphicsKind::Vnc,
        };
        out.devices.push(DeviceEntry::Graphics { graphics, listen: None, autoport: true });
        info!(vm = %out.name, ?graphics, "Added remote display");
    }

    normalize_video(&mut out, settings);
    Ok(out)
}

/// Slots on the reserved bus not taken by remaining passthrough entries
fn free_guest_slots(descriptor: &VmDescriptor, bus: u8) -> impl Iterator<Item = u8> {
    let taken: HashSet<u8> = descriptor
        .devices
        .iter()
        .filter_map(|d| match d {
            DeviceEntry::Hostdev { guest, .. } if guest.bus == bus => Some(guest.slot),
            _ => None,
        })
        .collect();
    (0..=MAX_SLOT).filter(move |slot| !taken.contains(slot))
}

/// Keeps exactly one virtual display; primary only while nothing is passed through
fn normalize_video(descriptor: &mut VmDescriptor, settings: &MutatorSettings) {
    let want_primary = !descriptor.has_passthrough();

    let mut seen = false;
    descriptor.devices.retain(|d| {
        if d.is_video() {
            let keep = !seen;
            seen = true;
            keep
        } else {
            true
        }
    });

    if !seen {
        descriptor.devices.push(DeviceEntry::Video {
            model: VideoModel::Qxl,
            vram_kb: settings.video_ram_kb,
            heads: 1,
            primary: want_primary,
        });
        return;
    }

    for device in descriptor.devices.iter_mut() {
        if let DeviceEntry::Video { primary, .. } = device {
            *primary = want_primary;
        }
    }
}
