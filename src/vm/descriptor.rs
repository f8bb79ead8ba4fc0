// VM hardware descriptor model
//
// The subset of a libvirt domain's <devices> section the passthrough core
// reasons about. Anything else travels through untouched as `Other`, and
// the `metadata` blob belongs to UI collaborators.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::gpu::PciAddress;

/// Hardware descriptor of one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    /// Opaque settings owned by other components; never interpreted here
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoModel {
    Qxl,
    Virtio,
    Vga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsKind {
    Spice,
    Vnc,
}

/// One element of the descriptor's device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEntry {
    /// PCI passthrough of a host function to a guest slot
    Hostdev {
        source: PciAddress,
        guest: PciAddress,
        managed: bool,
    },
    Video {
        model: VideoModel,
        vram_kb: u32,
        heads: u32,
        primary: bool,
    },
    Graphics {
        graphics: GraphicsKind,
        listen: Option<String>,
        autoport: bool,
    },
    Sound {
        model: String,
    },
    Audio {
        id: u32,
        backend: String,
    },
    Channel {
        target: String,
    },
    Redirdev {
        bus: String,
    },
    Smartcard,
    Input {
        input: String,
        bus: String,
    },
    /// Anything the core does not model, kept verbatim
    Other {
        element: String,
        raw: String,
    },
}

impl DeviceEntry {
    pub fn is_hostdev(&self) -> bool {
        matches!(self, DeviceEntry::Hostdev { .. })
    }

    pub fn is_video(&self) -> bool {
        matches!(self, DeviceEntry::Video { .. })
    }

    pub fn is_graphics(&self) -> bool {
        matches!(self, DeviceEntry::Graphics { .. })
    }

    /// Host source address of a passthrough entry
    pub fn hostdev_source(&self) -> Option<PciAddress> {
        match self {
            DeviceEntry::Hostdev { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Renders the entry as libvirt domain XML
    pub fn to_xml(&self) -> String {
        match self {
            DeviceEntry::Hostdev { source, guest, managed } => format!(
                "<hostdev mode='subsystem' type='pci' managed='{}'>\n  <source>\n    {}\n  </source>\n  {}\n</hostdev>",
                if *managed { "yes" } else { "no" },
                address_xml(None, source),
                address_xml(Some("pci"), guest),
            ),
            DeviceEntry::Video { model, vram_kb, heads, primary } => format!(
                "<video>\n  <model type='{}' ram='{vram_kb}' vram='{vram_kb}' vgamem='16384' heads='{heads}'{}/>\n</video>",
                video_model_name(*model),
                if *primary { " primary='yes'" } else { "" },
            ),
            DeviceEntry::Graphics { graphics, listen, autoport } => {
                let kind = match graphics {
                    GraphicsKind::Spice => "spice",
                    GraphicsKind::Vnc => "vnc",
                };
                let mut xml = format!(
                    "<graphics type='{}' autoport='{}'",
                    kind,
                    if *autoport { "yes" } else { "no" }
                );
                match listen {
                    Some(addr) => {
                        let _ = write!(
                            xml,
                            ">\n  <listen type='address' address='{}'/>\n</graphics>",
                            addr
                        );
                    }
                    None => xml.push_str("/>"),
                }
                xml
            }
            DeviceEntry::Sound { model } => format!("<sound model='{}'/>", model),
            DeviceEntry::Audio { id, backend } => format!("<audio id='{}' type='{}'/>", id, backend),
            DeviceEntry::Channel { target } => {
                format!("<channel type='spicevmc'>\n  <target type='virtio' name='{}'/>\n</channel>", target)
            }
            DeviceEntry::Redirdev { bus } => format!("<redirdev bus='{}' type='spicevmc'/>", bus),
            DeviceEntry::Smartcard => "<smartcard mode='passthrough' type='spicevmc'/>".to_string(),
            DeviceEntry::Input { input, bus } => format!("<input type='{}' bus='{}'/>", input, bus),
            DeviceEntry::Other { raw, .. } => raw.clone(),
        }
    }
}

fn video_model_name(model: VideoModel) -> &'static str {
    match model {
        VideoModel::Qxl => "qxl",
        VideoModel::Virtio => "virtio",
        VideoModel::Vga => "vga",
    }
}

fn address_xml(kind: Option<&str>, address: &PciAddress) -> String {
    let type_attr = kind.map(|k| format!("type='{}' ", k)).unwrap_or_default();
    format!(
        "<address {}domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>",
        type_attr, address.domain, address.bus, address.slot, address.function
    )
}

impl VmDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devices: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Host addresses of every passthrough entry
    pub fn hostdev_sources(&self) -> Vec<PciAddress> {
        self.devices.iter().filter_map(DeviceEntry::hostdev_source).collect()
    }

    pub fn has_passthrough(&self) -> bool {
        self.devices.iter().any(DeviceEntry::is_hostdev)
    }

    pub fn video_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_video()).count()
    }

    /// The `<devices>` section as libvirt XML
    pub fn devices_xml(&self) -> String {
        let mut xml = String::from("<devices>\n");
        for device in &self.devices {
            for line in device.to_xml().lines() {
                let _ = writeln!(xml, "  {}", line);
            }
        }
        xml.push_str("</devices>");
        xml
    }
}
