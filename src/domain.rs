use crate::error::Result;
use serde::Deserialize;
use std::collections::BTreeSet;

/// The values this service cares about from one libvirt domain XML document,
/// handed over by the QEMU hook on VM start and stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Pinned CPUs from cputune/vcpupin, in document order.
    pub cpus: Vec<u32>,

    /// 1 GiB hugepages backing the domain memory.
    pub hugepages_1g: u64,

    /// Residual 2 MiB hugepages.
    pub hugepages_2m: u64,

    /// Requested passthrough device paths, each of the form
    /// `/dev/input/by-id/{name}-{device-id}`.
    pub devices: BTreeSet<String>,
}

// Deserialization mirror of the domain XML, limited to the elements the
// extraction below reads. Everything else in the document is ignored.

#[derive(Debug, Deserialize)]
struct Domain {
    name: String,
    memory: Option<Memory>,
    #[serde(rename = "memoryBacking")]
    memory_backing: Option<MemoryBacking>,
    cputune: Option<Cputune>,
    devices: Option<Devices>,
    #[serde(rename = "qemu:commandline")]
    commandline: Option<QemuCommandline>,
}

#[derive(Debug, Deserialize)]
struct Memory {
    // libvirt stores memory in KiB regardless of the unit attribute.
    #[serde(rename = "$text")]
    value: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MemoryBacking {
    hugepages: Option<HugepagesFlag>,
}

/// Presence marker for `<hugepages/>`; page-size children are irrelevant.
#[derive(Debug, Deserialize)]
struct HugepagesFlag {}

#[derive(Debug, Deserialize)]
struct Cputune {
    #[serde(rename = "vcpupin", default)]
    vcpupin: Vec<Vcpupin>,
}

#[derive(Debug, Deserialize)]
struct Vcpupin {
    #[serde(rename = "@cpuset")]
    cpuset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Devices {
    #[serde(rename = "input", default)]
    input: Vec<Input>,
}

#[derive(Debug, Deserialize)]
struct Input {
    #[serde(rename = "@type")]
    kind: Option<String>,
    source: Option<InputSource>,
}

#[derive(Debug, Deserialize)]
struct InputSource {
    #[serde(rename = "@evdev")]
    evdev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QemuCommandline {
    #[serde(rename = "qemu:arg", default)]
    args: Vec<QemuArg>,
}

#[derive(Debug, Deserialize)]
struct QemuArg {
    #[serde(rename = "@value")]
    value: Option<String>,
}

impl VmConfig {
    /// Parse a libvirt domain XML document.
    ///
    /// Device paths are collected from `<input type="passthrough">` sources
    /// and from raw `qemu:arg` evdev= parameters, keeping only paths under
    /// `/dev/input/by-id/` whose basename carries the domain name as prefix.
    pub fn parse(xml: &str) -> Result<Self> {
        let domain: Domain = quick_xml::de::from_str(xml)?;
        let prefix = format!("/dev/input/by-id/{}-", domain.name);

        let hugepages = domain
            .memory_backing
            .as_ref()
            .is_some_and(|backing| backing.hugepages.is_some());
        let memory_kib = domain.memory.as_ref().and_then(|m| m.value).unwrap_or(0);
        let mib = memory_kib / 1024;
        let (hugepages_1g, hugepages_2m) = if hugepages {
            (mib / 1024, (mib % 1024).div_ceil(2))
        } else {
            (0, 0)
        };

        let cpus = domain
            .cputune
            .map(|tune| {
                tune.vcpupin
                    .into_iter()
                    .map(|pin| pin.cpuset.unwrap_or(0))
                    .collect()
            })
            .unwrap_or_default();

        let mut devices = BTreeSet::new();
        if let Some(listed) = domain.devices {
            for input in listed.input {
                if input.kind.as_deref() != Some("passthrough") {
                    continue;
                }
                if let Some(evdev) = input.source.and_then(|source| source.evdev) {
                    if evdev.starts_with(&prefix) {
                        devices.insert(evdev);
                    }
                }
            }
        }
        if let Some(commandline) = domain.commandline {
            for arg in commandline.args {
                let Some(value) = arg.value else { continue };
                for param in value.split(',') {
                    if let Some(path) = param.strip_prefix("evdev=") {
                        if path.starts_with(&prefix) {
                            devices.insert(path.to_string());
                        }
                    }
                }
            }
        }

        Ok(Self {
            cpus,
            hugepages_1g,
            hugepages_2m,
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_XML: &str = r#"
<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>win10</name>
  <uuid>4b3d4a5c-48c8-4f22-b3b4-5ee3ee73a476</uuid>
  <memory unit='KiB'>16777216</memory>
  <currentMemory unit='KiB'>16777216</currentMemory>
  <memoryBacking>
    <hugepages/>
  </memoryBacking>
  <vcpu placement='static'>4</vcpu>
  <cputune>
    <vcpupin vcpu='0' cpuset='2'/>
    <vcpupin vcpu='1' cpuset='3'/>
    <vcpupin vcpu='2' cpuset='6'/>
    <vcpupin vcpu='3' cpuset='7'/>
  </cputune>
  <os>
    <type arch='x86_64' machine='pc-q35-5.1'>hvm</type>
  </os>
  <devices>
    <input type='passthrough' bus='virtio'>
      <source evdev='/dev/input/by-id/win10-usb-Keyboard-event-kbd'/>
    </input>
    <input type='mouse' bus='ps2'/>
    <input type='keyboard' bus='ps2'/>
  </devices>
  <qemu:commandline>
    <qemu:arg value='-object'/>
    <qemu:arg value='input-linux,id=mouse1,evdev=/dev/input/by-id/win10-usb-Mouse-event-mouse'/>
  </qemu:commandline>
</domain>
"#;

    #[test]
    fn test_parse_full_domain() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = VmConfig::parse(FULL_XML).unwrap();

        assert_eq!(config.cpus, vec![2, 3, 6, 7]);
        // 16 GiB fits in 1G pages with no remainder.
        assert_eq!(config.hugepages_1g, 16);
        assert_eq!(config.hugepages_2m, 0);
        assert_eq!(
            config.devices.into_iter().collect::<Vec<_>>(),
            vec![
                "/dev/input/by-id/win10-usb-Keyboard-event-kbd".to_string(),
                "/dev/input/by-id/win10-usb-Mouse-event-mouse".to_string(),
            ],
        );
    }

    #[test]
    fn test_no_hugepages_element_means_no_pages() {
        let config = VmConfig::parse(
            "<domain><name>vm</name><memory unit='KiB'>16777216</memory></domain>",
        )
        .unwrap();
        assert_eq!(config.hugepages_1g, 0);
        assert_eq!(config.hugepages_2m, 0);
    }

    #[test]
    fn test_residual_memory_rounds_up_to_2m_pages() {
        // 16.5 GiB = 16896 MiB: 16 full 1G pages plus 512 MiB in 2M pages.
        let config = VmConfig::parse(
            "<domain><name>vm</name>\
             <memory unit='KiB'>17301504</memory>\
             <memoryBacking><hugepages/></memoryBacking>\
             </domain>",
        )
        .unwrap();
        assert_eq!(config.hugepages_1g, 16);
        assert_eq!(config.hugepages_2m, 256);
    }

    #[test]
    fn test_odd_residual_rounds_up() {
        // 1025 MiB: one 1G page and ceil(1/2) = 1 two-meg page.
        let config = VmConfig::parse(
            "<domain><name>vm</name>\
             <memory>1049600</memory>\
             <memoryBacking><hugepages/></memoryBacking>\
             </domain>",
        )
        .unwrap();
        assert_eq!(config.hugepages_1g, 1);
        assert_eq!(config.hugepages_2m, 1);
    }

    #[test]
    fn test_missing_memory_defaults_to_zero() {
        let config = VmConfig::parse(
            "<domain><name>vm</name><memoryBacking><hugepages/></memoryBacking></domain>",
        )
        .unwrap();
        assert_eq!(config.hugepages_1g, 0);
        assert_eq!(config.hugepages_2m, 0);
    }

    #[test]
    fn test_missing_cpuset_defaults_to_zero() {
        let config = VmConfig::parse(
            "<domain><name>vm</name>\
             <cputune><vcpupin vcpu='0'/><vcpupin vcpu='1' cpuset='5'/></cputune>\
             </domain>",
        )
        .unwrap();
        assert_eq!(config.cpus, vec![0, 5]);
    }

    #[test]
    fn test_foreign_prefix_devices_are_ignored() {
        let config = VmConfig::parse(
            "<domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>\
             <name>win10</name>\
             <devices>\
               <input type='passthrough'>\
                 <source evdev='/dev/input/by-id/mac-kbd'/>\
               </input>\
               <input type='passthrough'>\
                 <source evdev='/dev/input/event3'/>\
               </input>\
             </devices>\
             <qemu:commandline>\
               <qemu:arg value='input-linux,evdev=/dev/input/by-id/mac-mouse'/>\
             </qemu:commandline>\
             </domain>",
        )
        .unwrap();
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_qemu_arg_without_evdev_param_is_ignored() {
        let config = VmConfig::parse(
            "<domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>\
             <name>vm</name>\
             <qemu:commandline>\
               <qemu:arg value='-cpu'/>\
               <qemu:arg value='host,topoext=on'/>\
             </qemu:commandline>\
             </domain>",
        )
        .unwrap();
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(VmConfig::parse("<domain><name>vm</domain>").is_err());
        assert!(VmConfig::parse("not xml at all").is_err());
    }

    #[test]
    fn test_missing_name_is_an_error() {
        assert!(VmConfig::parse("<domain><memory>1024</memory></domain>").is_err());
    }

    #[test]
    fn test_malformed_cpuset_is_an_error() {
        assert!(
            VmConfig::parse(
                "<domain><name>vm</name>\
                 <cputune><vcpupin vcpu='0' cpuset='0-3'/></cputune>\
                 </domain>",
            )
            .is_err()
        );
    }
}
