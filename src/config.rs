use crate::hotkey::{self, Hotkey};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Configuration file consulted when no --config flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vfio-kvm.yaml";

const DEFAULT_BUS_NAME: &str = "vfio.kvm";
const DEFAULT_OBJECT_PATH: &str = "/vfio/kvm";

/// The grab-toggle combination QEMU ships with.
const DEFAULT_QEMU_HOTKEY: [&str; 2] = ["KEY_LEFTCTRL", "KEY_RIGHTCTRL"];

/// Top-level configuration as it appears in the YAML file.
///
/// Every key is optional; a missing or empty file runs the service on pure
/// defaults.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// D-Bus bus name to request on the system bus.
    pub dbus_bus_name: Option<String>,

    /// Object path exported on the requested bus.
    pub dbus_object_path: Option<String>,

    /// Restrict kernel processes away from pinned CPUs on VM start.
    #[serde(default)]
    pub manage_cpu: bool,

    /// Allocate hugepages for VMs whose XML requests them.
    #[serde(default)]
    pub manage_hugepages: bool,

    /// Keys that cycle the active target. Defaults to qemu_hotkey.
    pub hotkey: Option<Vec<String>>,

    /// Keys QEMU uses to toggle its own input grab; replayed into a guest
    /// when it becomes the target so it re-acquires its devices.
    pub qemu_hotkey: Option<Vec<String>>,

    /// Keys that temporarily return input to the host without moving the
    /// target cycle.
    pub release_hotkey: Option<Vec<String>>,

    /// Host-specific options (direct-select hotkey).
    pub host: Option<VmSection>,

    /// Per-VM options keyed by libvirt domain name.
    #[serde(default)]
    pub vm: HashMap<String, VmSection>,
}

/// Options understood under `host:` and each `vm.<name>:` mapping.
#[derive(Debug, Default, Deserialize)]
pub struct VmSection {
    pub hotkey: Option<Vec<String>>,
}

/// Options for one virtual machine (or the host) after key resolution.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Direct-select hotkey for this machine, if configured and resolvable.
    pub hotkey: Option<Hotkey>,
}

/// Validated configuration with every hotkey resolved to key-code sets.
#[derive(Debug)]
pub struct ServiceOptions {
    pub bus_name: String,
    pub object_path: String,
    pub manage_cpu: bool,
    pub manage_hugepages: bool,
    pub hotkey: Option<Hotkey>,
    pub qemu_hotkey: Option<Hotkey>,
    pub release_hotkey: Option<Hotkey>,
    pub host: VmOptions,
    pub vms: HashMap<String, VmOptions>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        resolve_config(Config::default())
    }
}

/// Load service options from a YAML file.
///
/// Configuration problems are never fatal: a missing file, an empty file, or
/// a file that fails to parse all degrade to defaults (with a warning for the
/// parse failure), and individually unresolvable hotkeys degrade to unset.
pub fn load(path: &Path) -> ServiceOptions {
    if !path.is_file() {
        log::info!("No configuration at {}, using defaults", path.display());
        return ServiceOptions::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}", path.display(), e);
            return ServiceOptions::default();
        }
    };

    if content.trim().is_empty() {
        return ServiceOptions::default();
    }

    let config: Config = match serde_yaml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}", path.display(), e);
            return ServiceOptions::default();
        }
    };

    resolve_config(config)
}

/// Resolve raw key-name lists into hotkeys and fill in defaults.
fn resolve_config(config: Config) -> ServiceOptions {
    let qemu_names: Vec<String> = config
        .qemu_hotkey
        .unwrap_or_else(|| DEFAULT_QEMU_HOTKEY.iter().map(|s| s.to_string()).collect());
    // The cycle hotkey falls back to whatever QEMU itself toggles with.
    let hotkey_names = config.hotkey.unwrap_or_else(|| qemu_names.clone());

    let host = VmOptions {
        hotkey: config
            .host
            .and_then(|section| section.hotkey)
            .and_then(|names| hotkey::resolve(&names)),
    };

    let vms: HashMap<String, VmOptions> = config
        .vm
        .into_iter()
        .map(|(name, section)| {
            let hotkey = section.hotkey.and_then(|names| hotkey::resolve(&names));
            (name, VmOptions { hotkey })
        })
        .collect();

    let options = ServiceOptions {
        bus_name: config.dbus_bus_name.unwrap_or_else(|| DEFAULT_BUS_NAME.to_string()),
        object_path: config
            .dbus_object_path
            .unwrap_or_else(|| DEFAULT_OBJECT_PATH.to_string()),
        manage_cpu: config.manage_cpu,
        manage_hugepages: config.manage_hugepages,
        hotkey: hotkey::resolve(&hotkey_names),
        qemu_hotkey: hotkey::resolve(&qemu_names),
        release_hotkey: config
            .release_hotkey
            .and_then(|names| hotkey::resolve(&names)),
        host,
        vms,
    };

    log::info!(
        "Config loaded: bus {} at {}, {} per-VM hotkeys, manage_cpu={}, manage_hugepages={}",
        options.bus_name,
        options.object_path,
        options.vms.len(),
        options.manage_cpu,
        options.manage_hugepages,
    );

    options
}
