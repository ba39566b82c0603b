use crate::config::ServiceOptions;
use crate::device::{ReplicatedDevice, SinkKey, source_for};
use crate::domain::VmConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::Notify;
use zbus::names::InterfaceName;
use zbus::object_server::SignalContext;
use zbus::zvariant::Value;

/// The target ring: which machines exist, which one owns input, and whether
/// input is transiently released back to the host.
#[derive(Debug)]
struct Ring {
    /// Cycle order; index 0 is always the host.
    targets: Vec<SinkKey>,
    /// Currently selected target. Stays put while released.
    target: SinkKey,
    /// While set, input routes to the host and the reported target is the
    /// host, without moving the cycle position.
    released: bool,
}

/// The registry orchestrating every replicated device.
///
/// Driven by the libvirt hook through D-Bus (Prepare/Release), by external
/// UIs (Toggle, the Target property), and by the per-device hotkey monitors
/// feeding back target changes.
pub struct Service {
    options: ServiceOptions,
    ring: Mutex<Ring>,
    devices: tokio::sync::Mutex<HashMap<PathBuf, ReplicatedDevice>>,
    connection: OnceLock<zbus::Connection>,
    failure: Notify,
    weak: Weak<Service>,
}

impl Service {
    pub fn new(options: ServiceOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            options,
            ring: Mutex::new(Ring {
                targets: vec![SinkKey::Host],
                target: SinkKey::Host,
                released: false,
            }),
            devices: tokio::sync::Mutex::new(HashMap::new()),
            connection: OnceLock::new(),
            failure: Notify::new(),
            weak: weak.clone(),
        })
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Install the bus connection once the name is acquired; needed for
    /// property-change signals.
    pub fn set_connection(&self, connection: zbus::Connection) {
        let _ = self.connection.set(connection);
    }

    /// Flag an unrecoverable background-task failure, waking the entry point
    /// so the process can exit and be restarted.
    pub fn fail(&self) {
        self.failure.notify_one();
    }

    /// Resolves once a background task has failed.
    pub async fn failed(&self) {
        self.failure.notified().await;
    }

    /// The target events route to right now: the host while released,
    /// otherwise the selected target.
    pub fn routing_target_now(&self) -> SinkKey {
        let ring = self.ring.lock().unwrap();
        if ring.released {
            SinkKey::Host
        } else {
            ring.target.clone()
        }
    }

    /// Routing target in the string form reported on D-Bus.
    pub fn reported_target(&self) -> String {
        self.routing_target_now().wire().to_string()
    }

    /// Flip the released flag, returning input to the host (or back) without
    /// moving the target cycle.
    pub fn toggle_released(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.released = !ring.released;
        log::debug!("Released state set to {}", ring.released);
    }

    /// Select a new target.
    ///
    /// Selecting the already-active target is a no-op that leaves the
    /// released flag alone and emits nothing. Otherwise the released flag
    /// clears, every device re-asserts guest ownership of its active sink,
    /// and a Target property change goes out with the display form.
    pub async fn set_target(&self, target: SinkKey) {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.target == target {
                log::debug!("{target} selected but {target} is already active");
                return;
            }
            log::info!("{target} selected");
            ring.released = false;
            ring.target = target.clone();
        }
        {
            let devices = self.devices.lock().await;
            for device in devices.values() {
                device.grab(&target, self.options.qemu_hotkey.as_ref());
            }
        }
        self.emit_target_changed(&target).await;
    }

    /// Advance the target to the next entry in the ring and return the new
    /// routing target.
    pub async fn toggle(&self) -> SinkKey {
        let next = {
            let ring = self.ring.lock().unwrap();
            let index = ring
                .targets
                .iter()
                .position(|candidate| *candidate == ring.target)
                .unwrap_or(0);
            ring.targets[(index + 1) % ring.targets.len()].clone()
        };
        self.set_target(next).await;
        self.routing_target_now()
    }

    /// libvirt hook entry point: provision devices for a VM that is about to
    /// start. Failures are logged and reported as `false`, which makes
    /// libvirt abort the VM start.
    pub async fn prepare(&self, vm_name: &str, sub_op: &str, extra_op: &str, xml: &str) -> bool {
        log::info!("VM {vm_name} preparing to start");
        log::debug!("libvirtd: {vm_name} {sub_op} {extra_op}\n{xml}");
        match self.try_prepare(vm_name, xml).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to prepare VM {vm_name}: {e}");
                false
            }
        }
    }

    async fn try_prepare(&self, vm_name: &str, xml: &str) -> Result<()> {
        let config = VmConfig::parse(xml)?;
        self.pin_cpus(&config.cpus);
        self.allocate_hugepages(config.hugepages_1g, config.hugepages_2m);

        let host_hotkey = self.options.host.hotkey.clone();
        let guest_hotkey = self
            .options
            .vms
            .get(vm_name)
            .and_then(|options| options.hotkey.clone());

        {
            let mut devices = self.devices.lock().await;
            for guest_path in &config.devices {
                let source = source_for(guest_path, vm_name)?;
                let device = match devices.entry(source.clone()) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(entry) => entry.insert(
                        ReplicatedDevice::new(&source, self.weak.clone(), host_hotkey.clone())?,
                    ),
                };
                device.add(vm_name, guest_hotkey.clone())?;
            }
        }

        // The VM joins the cycle only once its devices exist, so a failed
        // Prepare leaves the ring untouched.
        self.ring
            .lock()
            .unwrap()
            .targets
            .push(SinkKey::Vm(vm_name.to_string()));
        Ok(())
    }

    /// libvirt hook exit point: reclaim everything provisioned for a stopped
    /// VM. Unknown VMs and parse failures report `false` with state
    /// untouched.
    pub async fn release(&self, vm_name: &str, sub_op: &str, extra_op: &str, xml: &str) -> bool {
        let key = SinkKey::Vm(vm_name.to_string());
        if !self.ring.lock().unwrap().targets.contains(&key) {
            log::debug!("Attempted to release devices for unmanaged VM {vm_name}");
            return false;
        }
        log::info!("VM {vm_name} shutting down");
        log::debug!("libvirtd: {vm_name} {sub_op} {extra_op}\n{xml}");
        match self.try_release(vm_name, xml).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to release VM {vm_name}: {e}");
                false
            }
        }
    }

    async fn try_release(&self, vm_name: &str, xml: &str) -> Result<()> {
        let config = VmConfig::parse(xml)?;
        let key = SinkKey::Vm(vm_name.to_string());

        let reset_target = {
            let mut ring = self.ring.lock().unwrap();
            if let Some(index) = ring.targets.iter().position(|candidate| *candidate == key) {
                ring.targets.remove(index);
            }
            ring.target == key
        };
        if reset_target {
            self.set_target(SinkKey::Host).await;
        }

        let last_vm = self.ring.lock().unwrap().targets.len() == 1;
        {
            let mut devices = self.devices.lock().await;
            for guest_path in &config.devices {
                let source = source_for(guest_path, vm_name)?;
                let Some(device) = devices.get_mut(&source) else {
                    return Err(Error::UnmanagedDevice(source));
                };
                device.remove(vm_name, None).await;
                if last_vm {
                    devices.remove(&source);
                }
            }
        }

        self.deallocate_hugepages(config.hugepages_1g, config.hugepages_2m);
        self.unpin_cpus(&config.cpus);
        Ok(())
    }

    /// Tear down every replicated device. Invoked on signal-driven shutdown.
    pub async fn stop(&self) {
        let mut devices = self.devices.lock().await;
        for device in devices.values_mut() {
            device.stop().await;
        }
    }

    fn pin_cpus(&self, cpus: &[u32]) {
        if !self.options.manage_cpu || cpus.is_empty() {
            return;
        }
        log::info!("Pinning CPUs: {}", format_cpus(cpus));
    }

    fn unpin_cpus(&self, cpus: &[u32]) {
        if !self.options.manage_cpu || cpus.is_empty() {
            return;
        }
        log::info!("Unpinning CPUs: {}", format_cpus(cpus));
    }

    fn allocate_hugepages(&self, gb_pages: u64, mb_pages: u64) {
        if !self.options.manage_hugepages || (gb_pages == 0 && mb_pages == 0) {
            return;
        }
        log::info!("Allocating {gb_pages} 1G hugepages and {mb_pages} 2M hugepages");
    }

    fn deallocate_hugepages(&self, gb_pages: u64, mb_pages: u64) {
        if !self.options.manage_hugepages || (gb_pages == 0 && mb_pages == 0) {
            return;
        }
        log::info!("Deallocating {gb_pages} 1G hugepages and {mb_pages} 2M hugepages");
    }

    /// Emit a Target PropertiesChanged signal carrying the display form
    /// ("host device" for the host sentinel). Silently skipped before the
    /// bus connection exists.
    async fn emit_target_changed(&self, target: &SinkKey) {
        let Some(connection) = self.connection.get() else {
            return;
        };
        let context = match SignalContext::new(connection, self.options.object_path.as_str()) {
            Ok(context) => context,
            Err(e) => {
                log::warn!("Failed to build signal context: {e}");
                return;
            }
        };
        let interface = match InterfaceName::try_from(crate::dbus::INTERFACE_NAME) {
            Ok(interface) => interface,
            Err(e) => {
                log::warn!("Invalid interface name: {e}");
                return;
            }
        };

        let display = target.to_string();
        let value = Value::from(display.as_str());
        let changed = HashMap::from([("Target", &value)]);
        if let Err(e) =
            zbus::fdo::Properties::properties_changed(&context, interface, &changed, &[]).await
        {
            log::warn!("Failed to emit Target property change: {e}");
        }
    }
}

fn format_cpus(cpus: &[u32]) -> String {
    let mut sorted: Vec<u32> = cpus.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
