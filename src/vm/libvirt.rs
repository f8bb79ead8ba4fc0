// libvirt-backed descriptor store
//
// Reads a domain's persistent definition with `virsh dumpxml --inactive`,
// maps its <devices> children onto `DeviceEntry` and commits by splicing a
// freshly rendered <devices> section into the same document and handing it
// to `virsh define`. Everything outside <devices> is passed through byte for
// byte.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info};

use crate::error::{PassthroughError, Result};
use crate::gpu::PciAddress;
use crate::utils;
use crate::vm::descriptor::{DeviceEntry, GraphicsKind, VideoModel, VmDescriptor};
use crate::vm::runtime::Virsh;
use crate::vm::store::DescriptorStore;

/// One element of a parsed document with its byte span in the source
#[derive(Debug, Clone)]
struct XmlElement {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<XmlElement>,
    start: usize,
    end: usize,
}

impl XmlElement {
    fn open(tag: &BytesStart, start: usize) -> std::result::Result<Self, String> {
        let mut attrs = HashMap::new();
        for attr in tag.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
            attrs.insert(key, value);
        }
        Ok(Self {
            name: String::from_utf8_lossy(tag.name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
            start,
            end: start,
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Parses `xml` into an element tree; the error is a human-readable reason
fn parse_tree(xml: &str) -> std::result::Result<XmlElement, String> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root = None;

    loop {
        let start = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => return Err(format!("at byte {}: {}", reader.error_position(), e)),
        };
        let end = reader.buffer_position() as usize;

        let finished = match event {
            Event::Start(tag) => {
                stack.push(XmlElement::open(&tag, start)?);
                continue;
            }
            Event::Empty(tag) => XmlElement::open(&tag, start)?,
            Event::End(_) => stack.pop().ok_or_else(|| format!("unbalanced end tag at byte {}", start))?,
            Event::Eof => break,
            _ => continue,
        };
        let finished = XmlElement { end, ..finished };
        match stack.last_mut() {
            Some(parent) => parent.children.push(finished),
            None if root.is_none() => root = Some(finished),
            None => return Err("more than one root element".to_string()),
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("<{}> is never closed", open.name));
    }
    root.ok_or_else(|| "empty document".to_string())
}

fn parse_hex<T: TryFrom<u32>>(value: Option<&str>) -> Option<T> {
    let value = value?.trim();
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(digits, 16).ok().and_then(|v| T::try_from(v).ok())
}

fn parse_address(element: &XmlElement) -> Option<PciAddress> {
    Some(PciAddress::new(
        parse_hex(element.attr("domain"))?,
        parse_hex(element.attr("bus"))?,
        parse_hex(element.attr("slot"))?,
        parse_hex(element.attr("function"))?,
    ))
}

fn is_yes(value: Option<&str>) -> bool {
    value == Some("yes")
}

/// Typed entry for elements the core reasons about, `None` for the rest
fn typed_entry(element: &XmlElement) -> Option<DeviceEntry> {
    match element.name.as_str() {
        "hostdev" => {
            if element.attr("mode") != Some("subsystem") || element.attr("type") != Some("pci") {
                return None;
            }
            let source = parse_address(element.child("source")?.child("address")?)?;
            let guest = element
                .children
                .iter()
                .find(|c| c.name == "address" && c.attr("type") == Some("pci"))
                .and_then(parse_address)?;
            Some(DeviceEntry::Hostdev { source, guest, managed: is_yes(element.attr("managed")) })
        }
        "video" => {
            let model = element.child("model")?;
            let kind = match model.attr("type")? {
                "qxl" => VideoModel::Qxl,
                "virtio" => VideoModel::Virtio,
                "vga" => VideoModel::Vga,
                _ => return None,
            };
            let vram_kb = model
                .attr("vram")
                .or_else(|| model.attr("ram"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(16384);
            let heads = model.attr("heads").and_then(|v| v.parse().ok()).unwrap_or(1);
            Some(DeviceEntry::Video { model: kind, vram_kb, heads, primary: is_yes(model.attr("primary")) })
        }
        "graphics" => {
            let graphics = match element.attr("type")? {
                "spice" => GraphicsKind::Spice,
                "vnc" => GraphicsKind::Vnc,
                _ => return None,
            };
            let listen = element
                .child("listen")
                .filter(|l| l.attr("type") == Some("address"))
                .and_then(|l| l.attr("address"))
                .or_else(|| element.attr("listen"))
                .map(String::from);
            Some(DeviceEntry::Graphics { graphics, listen, autoport: is_yes(element.attr("autoport")) })
        }
        "sound" => Some(DeviceEntry::Sound { model: element.attr("model")?.to_string() }),
        "audio" => Some(DeviceEntry::Audio {
            id: element.attr("id")?.parse().ok()?,
            backend: element.attr("type")?.to_string(),
        }),
        "channel" if element.attr("type") == Some("spicevmc") => Some(DeviceEntry::Channel {
            target: element.child("target")?.attr("name")?.to_string(),
        }),
        "redirdev" if element.attr("type") == Some("spicevmc") => {
            Some(DeviceEntry::Redirdev { bus: element.attr("bus")?.to_string() })
        }
        "smartcard" if element.attr("type") == Some("spicevmc") => Some(DeviceEntry::Smartcard),
        "input" => Some(DeviceEntry::Input {
            input: element.attr("type")?.to_string(),
            bus: element.attr("bus")?.to_string(),
        }),
        _ => None,
    }
}

fn find_devices(domain: &XmlElement) -> std::result::Result<&XmlElement, String> {
    if domain.name != "domain" {
        return Err(format!("root element is <{}>, expected <domain>", domain.name));
    }
    domain.child("devices").ok_or_else(|| "domain has no <devices> section".to_string())
}

/// Builds a descriptor from domain XML. Elements the model has no typed
/// form for keep their source text as `Other`.
pub fn descriptor_from_domain_xml(vm: &str, xml: &str) -> Result<VmDescriptor> {
    let malformed = |reason: String| PassthroughError::DescriptorMutationFailed {
        vm: vm.to_string(),
        reason: format!("malformed domain XML: {}", reason),
    };
    let domain = parse_tree(xml).map_err(malformed)?;
    let devices = find_devices(&domain).map_err(malformed)?;

    let mut descriptor = VmDescriptor::new(vm);
    for element in &devices.children {
        let entry = typed_entry(element).unwrap_or_else(|| DeviceEntry::Other {
            element: element.name.clone(),
            raw: xml[element.start..element.end].to_string(),
        });
        descriptor.devices.push(entry);
    }
    debug!(vm, devices = descriptor.devices.len(), "Parsed domain devices");
    Ok(descriptor)
}

/// Replaces the <devices> section of `xml` with `devices_xml`
pub fn splice_devices(vm: &str, xml: &str, devices_xml: &str) -> Result<String> {
    let malformed = |reason: String| PassthroughError::DescriptorMutationFailed {
        vm: vm.to_string(),
        reason: format!("malformed domain XML: {}", reason),
    };
    let domain = parse_tree(xml).map_err(malformed)?;
    let devices = find_devices(&domain).map_err(malformed)?;
    Ok(format!("{}{}{}", &xml[..devices.start], devices_xml, &xml[devices.end..]))
}

/// Descriptors are libvirt's persistent domain definitions
pub struct LibvirtDescriptorStore {
    virsh: Virsh,
    /// Last defined XML per VM, plus timestamped copies of what it replaced
    dir: PathBuf,
}

impl LibvirtDescriptorStore {
    pub fn new(virsh: Virsh, dir: impl Into<PathBuf>) -> Self {
        Self { virsh, dir: dir.into() }
    }

    fn dump(&self, vm: &str) -> Result<String> {
        Ok(self.virsh.run(vm, &["dumpxml", "--inactive", vm])?.stdout)
    }

    fn path_for(&self, vm: &str) -> Result<PathBuf> {
        if vm.is_empty() || vm.starts_with('.') || vm.contains(['/', '\\']) {
            return Err(PassthroughError::VmNotFound { vm: vm.to_string() });
        }
        Ok(self.dir.join(format!("{}.xml", vm)))
    }

    fn write_file(path: &Path, content: &str) -> Result<()> {
        fs::write(path, content).map_err(|e| PassthroughError::Io { path: path.to_path_buf(), source: e })
    }
}

impl DescriptorStore for LibvirtDescriptorStore {
    fn load(&self, vm: &str) -> Result<VmDescriptor> {
        let xml = self.dump(vm)?;
        descriptor_from_domain_xml(vm, &xml)
    }

    fn replace(&self, descriptor: &VmDescriptor) -> Result<()> {
        let vm = descriptor.name.as_str();
        let path = self.path_for(vm)?;
        let current = self.dump(vm)?;
        let updated = splice_devices(vm, &current, &descriptor.devices_xml())?;

        fs::create_dir_all(&self.dir).map_err(|e| PassthroughError::Io { path: self.dir.clone(), source: e })?;
        let backup = utils::timestamped_backup_path(&path);
        Self::write_file(&backup, &current)?;
        info!(vm, backup = %backup.display(), "Saved domain definition");

        let tmp = self.dir.join(format!(".{}.xml.tmp", vm));
        Self::write_file(&tmp, &updated)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(PassthroughError::Io { path, source: e });
        }

        let path_arg = path.to_string_lossy();
        self.virsh.run(vm, &["define", path_arg.as_ref()])?;
        info!(vm, path = %path.display(), "Domain redefined");
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let output = self.virsh.run("", &["list", "--all", "--name"])?;
        let mut names: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::testing::{nvidia_gpu, FakeHost};
    use crate::utils::CommandOutput;
    use crate::vm::mutator::{attach_gpu, MutatorSettings};

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>win11</name>
  <memory unit='KiB'>16777216</memory>
  <os>
    <type arch='x86_64' machine='pc-q35-8.2'>hvm</type>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/win11.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <channel type='spicevmc'>
      <target type='virtio' name='com.redhat.spice.0'/>
    </channel>
    <input type='tablet' bus='usb'/>
    <graphics type='spice' autoport='yes'>
      <listen type='address'/>
    </graphics>
    <sound model='ich9'/>
    <audio id='1' type='spice'/>
    <video>
      <model type='qxl' ram='65536' vram='65536' vgamem='16384' heads='1' primary='yes'/>
    </video>
    <redirdev bus='usb' type='spicevmc'/>
    <hostdev mode='subsystem' type='usb' managed='yes'>
      <source>
        <vendor id='0x046d'/>
        <product id='0xc52b'/>
      </source>
    </hostdev>
  </devices>
</domain>
"#;

    fn store(host: &Arc<FakeHost>, dir: &Path) -> LibvirtDescriptorStore {
        let virsh = Virsh::new(host.clone(), "qemu:///system", Duration::from_secs(1));
        LibvirtDescriptorStore::new(virsh, dir)
    }

    #[test]
    fn maps_modelled_devices_and_keeps_the_rest_verbatim() {
        let descriptor = descriptor_from_domain_xml("win11", DOMAIN).unwrap();

        let kinds: Vec<&str> = descriptor
            .devices
            .iter()
            .map(|d| match d {
                DeviceEntry::Other { element, .. } => element.as_str(),
                DeviceEntry::Channel { .. } => "spice-channel",
                DeviceEntry::Input { .. } => "input",
                DeviceEntry::Graphics { .. } => "graphics",
                DeviceEntry::Sound { .. } => "sound",
                DeviceEntry::Audio { .. } => "audio",
                DeviceEntry::Video { .. } => "video",
                DeviceEntry::Redirdev { .. } => "redirdev",
                _ => "?",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "emulator", "disk", "channel", "spice-channel", "input", "graphics", "sound", "audio", "video",
                "redirdev", "hostdev",
            ]
        );
        // the USB hostdev is not a PCI passthrough entry
        assert!(!descriptor.has_passthrough());
        assert!(matches!(
            &descriptor.devices[1],
            DeviceEntry::Other { raw, .. } if raw.starts_with("<disk") && raw.ends_with("</disk>") && raw.contains("win11.qcow2")
        ));
        assert_eq!(
            descriptor.devices[8],
            DeviceEntry::Video { model: VideoModel::Qxl, vram_kb: 65536, heads: 1, primary: true }
        );
    }

    #[test]
    fn reads_pci_hostdev_addresses() {
        let xml = r#"<domain><devices>
  <hostdev mode='subsystem' type='pci' managed='no'>
    <driver name='vfio'/>
    <source><address domain='0x0000' bus='0x01' slot='0x00' function='0x1'/></source>
    <address type='pci' domain='0x0000' bus='0x06' slot='0x01' function='0x0'/>
  </hostdev>
</devices></domain>"#;
        let descriptor = descriptor_from_domain_xml("vm", xml).unwrap();
        assert_eq!(
            descriptor.devices,
            vec![DeviceEntry::Hostdev {
                source: PciAddress::new(0, 1, 0, 1),
                guest: PciAddress::new(0, 6, 1, 0),
                managed: false,
            }]
        );
    }

    #[test]
    fn splice_only_touches_devices() {
        let spliced = splice_devices("win11", DOMAIN, "<devices>\n  <smartcard mode='passthrough' type='spicevmc'/>\n</devices>").unwrap();
        assert!(spliced.starts_with("<domain type='kvm'>\n  <name>win11</name>"));
        assert!(spliced.contains("<type arch='x86_64' machine='pc-q35-8.2'>hvm</type>"));
        assert!(!spliced.contains("qcow2"));
        assert!(spliced.trim_end().ends_with("</devices>\n</domain>"));

        let back = descriptor_from_domain_xml("win11", &spliced).unwrap();
        assert_eq!(back.devices, vec![DeviceEntry::Smartcard]);
    }

    #[test]
    fn malformed_xml_is_reported() {
        for xml in ["<domain><devices></domain>", "<vm><devices/></vm>", "<domain><name>x</name></domain>", ""] {
            assert!(
                matches!(descriptor_from_domain_xml("x", xml), Err(PassthroughError::DescriptorMutationFailed { .. })),
                "{:?} should be rejected",
                xml
            );
        }
    }

    #[test]
    fn replace_backs_up_and_defines_spliced_domain() {
        let host = Arc::new(FakeHost::empty());
        host.script("virsh -c qemu:///system dumpxml --inactive win11", CommandOutput::ok(DOMAIN));
        let dir = tempfile::tempdir().unwrap();
        let store = store(&host, dir.path());
        let defined = dir.path().join("win11.xml");
        host.script(
            &format!("virsh -c qemu:///system define {}", defined.display()),
            CommandOutput::ok("Domain 'win11' defined\n"),
        );

        let descriptor = store.load("win11").unwrap();
        let gpu = nvidia_gpu();
        let staged = attach_gpu(&descriptor, &gpu, &MutatorSettings::default()).unwrap();
        store.replace(&staged).unwrap();

        let written = fs::read_to_string(&defined).unwrap();
        let reparsed = descriptor_from_domain_xml("win11", &written).unwrap();
        assert_eq!(reparsed.hostdev_sources(), gpu.addresses());
        assert!(written.contains("<memory unit='KiB'>16777216</memory>"));
        // the guest agent channel is not SPICE plumbing and survives
        assert!(written.contains("org.qemu.guest_agent.0"));
        assert!(!written.contains("com.redhat.spice.0"));

        let backups: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("win11.xml.backup_"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join(&backups[0])).unwrap(), DOMAIN);
        assert!(!dir.path().join(".win11.xml.tmp").exists());
        assert_eq!(
            host.commands().last().unwrap(),
            &format!("virsh -c qemu:///system define {}", defined.display())
        );
    }

    #[test]
    fn unknown_domain_is_not_found() {
        let host = Arc::new(FakeHost::empty());
        host.script(
            "virsh -c qemu:///system dumpxml --inactive ghost",
            CommandOutput::failed(1, "error: failed to get domain 'ghost'\n"),
        );
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(store(&host, dir.path()).load("ghost"), Err(PassthroughError::VmNotFound { .. })));
    }

    #[test]
    fn lists_all_domains() {
        let host = Arc::new(FakeHost::empty());
        host.script("virsh -c qemu:///system list --all --name", CommandOutput::ok("win11\narch\n\n"));
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&host, dir.path()).list().unwrap(), vec!["arch".to_string(), "win11".to_string()]);
    }
}
