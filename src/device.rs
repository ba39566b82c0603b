use crate::error::{Error, Result};
use crate::hotkey::Hotkey;
use crate::service::Service;
use evdev::uinput::VirtualDevice;
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, Device, EventStream, EventType, InputEvent, KeyCode,
    RelativeAxisCode, SwitchCode, UinputAbsSetup,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

/// Directory where source devices live and sink symlinks are published.
const BY_ID_DIR: &str = "/dev/input/by-id";

/// Cadence of exclusive-grab attempts on the source device. The source may
/// briefly be owned by the X server or logind, so failures are retried.
const GRAB_RETRY: Duration = Duration::from_secs(5);

/// Pause between a fired hotkey's SYN flush and its effect, long enough for
/// the kernel to drain the queued events to the guest before focus moves.
const SWITCH_DRAIN: Duration = Duration::from_millis(100);

/// Identifies which consumer a sink feeds: the host or one named VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SinkKey {
    Host,
    Vm(String),
}

impl SinkKey {
    /// Name used in this sink's /dev/input/by-id symlink.
    pub fn link_name(&self) -> &str {
        match self {
            Self::Host => "host",
            Self::Vm(name) => name,
        }
    }

    /// String form crossing the D-Bus wire; the empty string is the host.
    pub fn wire(&self) -> &str {
        match self {
            Self::Host => "",
            Self::Vm(name) => name,
        }
    }

    pub fn from_wire(value: &str) -> Self {
        if value.is_empty() {
            Self::Host
        } else {
            Self::Vm(value.to_string())
        }
    }
}

impl fmt::Display for SinkKey {
    /// Human-readable form used in logs and property-change signals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host device"),
            Self::Vm(name) => f.write_str(name),
        }
    }
}

/// Derive the real source path from a guest-facing device path by stripping
/// the "{vm}-" prefix from its basename:
/// /dev/input/by-id/{vm}-{id} -> /dev/input/by-id/{id}.
pub fn source_for(guest_path: &str, vm_name: &str) -> Result<PathBuf> {
    let base = Path::new(guest_path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let id = base
        .strip_prefix(&format!("{vm_name}-"))
        .ok_or_else(|| Error::BadDevicePath {
            path: guest_path.to_string(),
            vm: vm_name.to_string(),
        })?;
    Ok(Path::new(BY_ID_DIR).join(id))
}

/// One synthetic uinput device plus its published by-id symlink.
struct Sink {
    device: VirtualDevice,
    link_path: PathBuf,
}

impl Sink {
    fn destroy(self, key: &SinkKey) {
        log::info!("Destroying {} device {}", key, self.link_path.display());
        if self.link_path.is_symlink() {
            log::debug!("Removing symlink {}", self.link_path.display());
            if let Err(e) = std::fs::remove_file(&self.link_path) {
                log::warn!(
                    "Failed to remove symlink {}: {}",
                    self.link_path.display(),
                    e
                );
            }
        }
        // Dropping the uinput handle destroys the kernel device.
    }
}

/// Capability snapshot of the source device.
///
/// Sinks are created while the event stream owns the source handle, so the
/// capabilities are captured up front. Each sink must be able to emit every
/// event type the source can produce (keys, mouse axes, switches) for events
/// to pass through transparently.
struct SinkFactory {
    id: String,
    keys: Option<AttributeSet<KeyCode>>,
    relative_axes: Option<AttributeSet<RelativeAxisCode>>,
    absolute_axes: Vec<(AbsoluteAxisCode, AbsInfo)>,
    switches: Option<AttributeSet<SwitchCode>>,
}

impl SinkFactory {
    fn from_source(device: &Device, id: &str) -> Self {
        let keys = device.supported_keys().map(|set| {
            let mut copy = AttributeSet::new();
            for key in set.iter() {
                copy.insert(key);
            }
            copy
        });

        let relative_axes = device.supported_relative_axes().map(|set| {
            let mut copy = AttributeSet::new();
            for axis in set.iter() {
                copy.insert(axis);
            }
            copy
        });

        let absolute_axes = device
            .get_absinfo()
            .map(|axes| axes.collect())
            .unwrap_or_default();

        let switches = device.supported_switches().map(|set| {
            let mut copy = AttributeSet::new();
            for switch in set.iter() {
                copy.insert(switch);
            }
            copy
        });

        Self {
            id: id.to_string(),
            keys,
            relative_axes,
            absolute_axes,
            switches,
        }
    }

    /// Build one uinput sink mirroring the captured capabilities and publish
    /// its by-id symlink, replacing any stale link at the same path.
    fn create(&self, key: &SinkKey) -> Result<Sink> {
        let name = format!("{}-{}", key.link_name(), self.id);
        let link_path = Path::new(BY_ID_DIR).join(&name);
        log::info!("Creating {} device {}", key, link_path.display());

        let mut builder = VirtualDevice::builder()?.name(name.as_bytes());
        if let Some(keys) = &self.keys {
            builder = builder.with_keys(keys)?;
        }
        if let Some(axes) = &self.relative_axes {
            builder = builder.with_relative_axes(axes)?;
        }
        for (axis, info) in &self.absolute_axes {
            builder = builder.with_absolute_axis(&UinputAbsSetup::new(*axis, *info))?;
        }
        if let Some(switches) = &self.switches {
            builder = builder.with_switches(switches)?;
        }
        let mut device = builder.build()?;

        let node = device
            .enumerate_dev_nodes_blocking()?
            .next()
            .transpose()?
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "uinput device has no /dev node",
                ))
            })?;

        if link_path.is_symlink() {
            log::debug!("Removing existing symlink {}", link_path.display());
            std::fs::remove_file(&link_path)?;
        }
        std::os::unix::fs::symlink(&node, &link_path)?;

        Ok(Sink { device, link_path })
    }
}

/// State shared between the replicated device and its background tasks.
struct Shared {
    source_path: PathBuf,
    sinks: Mutex<HashMap<SinkKey, Sink>>,
    hotkeys: Mutex<HashMap<Hotkey, SinkKey>>,
    grab_tick: Notify,
}

/// Per-source-path engine: grabs the physical device exclusively, mirrors it
/// into one sink per registered consumer, and routes every event batch to
/// whichever sink the service's current target names.
///
/// Created on the first Prepare that references the source and torn down when
/// the last VM referencing it is released.
pub struct ReplicatedDevice {
    source_path: PathBuf,
    id: String,
    service: Weak<Service>,
    shared: Arc<Shared>,
    factory: Option<SinkFactory>,
    grab_task: Option<JoinHandle<()>>,
    replicate_task: Option<JoinHandle<()>>,
}

impl ReplicatedDevice {
    /// Validate the source path and register the host direct-select hotkey.
    /// The source is not opened until the first VM is added.
    pub fn new(
        source_path: &Path,
        service: Weak<Service>,
        host_hotkey: Option<Hotkey>,
    ) -> Result<Self> {
        let is_char_device = std::fs::metadata(source_path)
            .map(|meta| meta.file_type().is_char_device())
            .unwrap_or(false);
        if !is_char_device {
            return Err(Error::NotADevice(source_path.to_path_buf()));
        }

        let id = source_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();

        let shared = Arc::new(Shared {
            source_path: source_path.to_path_buf(),
            sinks: Mutex::new(HashMap::new()),
            hotkeys: Mutex::new(HashMap::new()),
            grab_tick: Notify::new(),
        });
        if let Some(hotkey) = host_hotkey {
            shared.hotkeys.lock().unwrap().insert(hotkey, SinkKey::Host);
        }

        Ok(Self {
            source_path: source_path.to_path_buf(),
            id,
            service,
            shared,
            factory: None,
            grab_task: None,
            replicate_task: None,
        })
    }

    /// Register a VM as a consumer: install its direct-select hotkey, make
    /// sure the source is open and the background tasks are running, and
    /// create its sink.
    pub fn add(&mut self, vm_name: &str, guest_hotkey: Option<Hotkey>) -> Result<()> {
        if let Some(hotkey) = guest_hotkey {
            log::debug!("Adding hotkey {:?} for VM {}", hotkey, vm_name);
            self.shared
                .hotkeys
                .lock()
                .unwrap()
                .insert(hotkey, SinkKey::Vm(vm_name.to_string()));
        }
        self.ensure_started()?;
        self.create_sink(SinkKey::Vm(vm_name.to_string()))
    }

    /// Drop a VM's sink (and optionally its hotkey). Once only the host sink
    /// remains the whole device shuts down, releasing the source.
    pub async fn remove(&mut self, vm_name: &str, guest_hotkey: Option<&Hotkey>) {
        let key = SinkKey::Vm(vm_name.to_string());
        let sink = self.shared.sinks.lock().unwrap().remove(&key);
        if let Some(sink) = sink {
            sink.destroy(&key);
        }
        if let Some(hotkey) = guest_hotkey {
            self.shared.hotkeys.lock().unwrap().remove(hotkey);
        }

        let only_host_left = self.shared.sinks.lock().unwrap().len() <= 1;
        if only_host_left {
            self.stop().await;
        }
    }

    /// Re-assert guest ownership of the active sink after a target change.
    ///
    /// The sink is probed with a grab/ungrab pair; if that fails, QEMU
    /// already holds it and nothing needs to happen. Otherwise the QEMU
    /// grab-toggle combination is replayed into the sink so the guest's input
    /// thread re-acquires the device.
    pub fn grab(&self, target: &SinkKey, qemu_hotkey: Option<&Hotkey>) {
        if *target == SinkKey::Host {
            return;
        }
        let mut sinks = self.shared.sinks.lock().unwrap();
        let Some(sink) = sinks.get_mut(target) else {
            return;
        };

        match Device::open(&sink.link_path) {
            Ok(mut probe) => {
                if probe.grab().is_err() {
                    return;
                }
                let _ = probe.ungrab();
            }
            Err(_) => return,
        }

        log::debug!("Grabbing device {}", sink.link_path.display());
        let mut events = Vec::new();
        for value in [1, 0] {
            for &code in qemu_hotkey.into_iter().flatten() {
                events.push(InputEvent::new(EventType::KEY.0, code, value));
            }
        }
        if let Err(e) = sink.device.emit(&events) {
            log::warn!(
                "Failed to replay QEMU hotkey into {}: {}",
                sink.link_path.display(),
                e
            );
        }
    }

    /// Cancel both background tasks, then destroy every sink including the
    /// host's. The tasks are awaited so the source handle is closed (and the
    /// kernel grab released) before teardown continues.
    pub async fn stop(&mut self) {
        if let Some(task) = self.replicate_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.grab_task.take() {
            task.abort();
            let _ = task.await;
        }

        let sinks: Vec<(SinkKey, Sink)> = self.shared.sinks.lock().unwrap().drain().collect();
        for (key, sink) in sinks {
            sink.destroy(&key);
        }

        if self.factory.take().is_some() {
            log::info!("Ungrabbed device {}", self.source_path.display());
        }
    }

    /// Open the source, capture its capabilities, create the host sink, and
    /// start the grab-keeper and replicator tasks. Idempotent.
    fn ensure_started(&mut self) -> Result<()> {
        if self.factory.is_some() {
            return Ok(());
        }

        let source = Device::open(&self.source_path)?;
        let source_name = source.name().unwrap_or("(unnamed)");
        log::info!(
            "Opened source device {} ({})",
            self.source_path.display(),
            source_name
        );

        let factory = SinkFactory::from_source(&source, &self.id);
        let stream = source.into_event_stream()?;

        let host = factory.create(&SinkKey::Host)?;
        self.shared.sinks.lock().unwrap().insert(SinkKey::Host, host);

        self.replicate_task = Some(tokio::spawn(replicate(
            stream,
            Arc::clone(&self.shared),
            self.service.clone(),
        )));
        self.grab_task = Some(tokio::spawn(grab_keeper(Arc::clone(&self.shared))));
        self.factory = Some(factory);
        Ok(())
    }

    fn create_sink(&mut self, key: SinkKey) -> Result<()> {
        let Some(factory) = &self.factory else {
            return Ok(());
        };
        let sink = factory.create(&key)?;
        self.shared.sinks.lock().unwrap().insert(key, sink);
        Ok(())
    }
}

/// Background task A: paces exclusive-grab attempts at a fixed cadence.
///
/// The replicator owns the source handle, so this task only signals it; the
/// grab ioctl itself is applied between reads.
async fn grab_keeper(shared: Arc<Shared>) {
    let mut tick = interval(GRAB_RETRY);
    loop {
        tick.tick().await;
        shared.grab_tick.notify_one();
    }
}

/// Latch-then-fire detector used by the hotkey sub-machines: a key press
/// whose pressed-set equals the configured hotkey arms it, and it fires once
/// every key has been released.
#[derive(Debug, Default)]
struct FireLatch {
    armed: bool,
}

impl FireLatch {
    fn step(&mut self, value: i32, hotkey: Option<&Hotkey>, pressed: &Hotkey) -> bool {
        if value == 1 && hotkey.is_some_and(|configured| configured == pressed) {
            self.armed = true;
        } else if self.armed && pressed.is_empty() {
            self.armed = false;
            return true;
        }
        false
    }
}

/// Like [`FireLatch`], but armed by any key set present in the per-device
/// hotkey map; fires with the matched set.
#[derive(Debug, Default)]
struct DirectLatch {
    armed: Option<Hotkey>,
}

impl DirectLatch {
    fn step(
        &mut self,
        value: i32,
        hotkeys: &HashMap<Hotkey, SinkKey>,
        pressed: &Hotkey,
    ) -> Option<Hotkey> {
        if value == 1 && hotkeys.contains_key(pressed) {
            self.armed = Some(pressed.clone());
        } else if self.armed.is_some() && pressed.is_empty() {
            return self.armed.take();
        }
        None
    }
}

#[derive(Debug, Default)]
struct Machines {
    release: FireLatch,
    toggle: FireLatch,
    direct: DirectLatch,
}

/// Background task B: the event replicator and hotkey monitor.
///
/// Reads the source in a single-reader loop, forwards each SYN-delimited
/// batch verbatim to the sink owned by the current routing target, and runs
/// the release/toggle/direct hotkey machines over every key event. Grab
/// attempts signalled by the keeper are applied between reads.
async fn replicate(mut stream: EventStream, shared: Arc<Shared>, service: Weak<Service>) {
    let mut grabbed = false;
    let mut batch: Vec<InputEvent> = Vec::new();
    let mut machines = Machines::default();

    loop {
        tokio::select! {
            _ = shared.grab_tick.notified(), if !grabbed => {
                if stream.device_mut().grab().is_ok() {
                    grabbed = true;
                    log::debug!("Grabbed source device {}", shared.source_path.display());
                }
            }
            event = stream.next_event() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        fatal(&service, &format!(
                            "Error reading events from {}: {}",
                            shared.source_path.display(),
                            e
                        ));
                        return;
                    }
                };
                if handle_event(&stream, &shared, &service, &mut batch, &mut machines, event)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Process one source event: batch it for forwarding and drive the hotkey
/// machines. `Err` means the task must die (service gone or no usable sink).
async fn handle_event(
    stream: &EventStream,
    shared: &Shared,
    service: &Weak<Service>,
    batch: &mut Vec<InputEvent>,
    machines: &mut Machines,
    event: InputEvent,
) -> std::result::Result<(), ()> {
    let Some(service) = service.upgrade() else {
        return Err(());
    };

    if event.event_type() == EventType::SYNCHRONIZATION {
        if !batch.is_empty() {
            flush(shared, &service, batch)?;
        }
        return Ok(());
    }
    batch.push(event);

    if event.event_type() != EventType::KEY {
        return Ok(());
    }

    // Snapshot of the currently-pressed keys, compared for exact equality
    // against each configured hotkey.
    let pressed: Hotkey = match stream.device().get_key_state() {
        Ok(keys) => keys.iter().map(|key| key.code()).collect(),
        Err(e) => {
            fatal_with(&service, &format!(
                "Failed to read key state of {}: {}",
                shared.source_path.display(),
                e
            ));
            return Err(());
        }
    };

    // Dispatch order release -> toggle -> direct; with distinct hotkeys at
    // most one machine fires per event.
    let release_hotkey = service.options().release_hotkey.as_ref();
    if machines.release.step(event.value(), release_hotkey, &pressed) {
        settle(shared, &service, batch).await?;
        service.toggle_released();
    }

    let toggle_hotkey = service.options().hotkey.as_ref();
    if machines.toggle.step(event.value(), toggle_hotkey, &pressed) {
        settle(shared, &service, batch).await?;
        service.toggle().await;
    }

    let matched = {
        let hotkeys = shared.hotkeys.lock().unwrap();
        machines.direct.step(event.value(), &hotkeys, &pressed)
    };
    if let Some(matched) = matched {
        settle(shared, &service, batch).await?;
        let target = shared.hotkeys.lock().unwrap().get(&matched).cloned();
        if let Some(target) = target {
            service.set_target(target).await;
        }
    }

    Ok(())
}

/// Flush queued events and give the kernel time to deliver them to the guest
/// before a fired hotkey's focus change takes effect.
async fn settle(
    shared: &Shared,
    service: &Service,
    batch: &mut Vec<InputEvent>,
) -> std::result::Result<(), ()> {
    flush(shared, service, batch)?;
    sleep(SWITCH_DRAIN).await;
    Ok(())
}

/// Forward the accumulated batch to the sink owned by the current routing
/// target; the uinput emit appends the closing SYN. An empty batch still
/// produces the bare SYN a fired hotkey needs.
fn flush(
    shared: &Shared,
    service: &Service,
    batch: &mut Vec<InputEvent>,
) -> std::result::Result<(), ()> {
    let target = service.routing_target_now();
    let mut sinks = shared.sinks.lock().unwrap();
    match sinks.get_mut(&target) {
        Some(sink) => {
            if let Err(e) = sink.device.emit(batch) {
                log::warn!("Failed to forward events to {} sink: {}", target, e);
            }
            batch.clear();
            Ok(())
        }
        None => {
            // A target without a sink on this device is unrecoverable; take
            // the whole service down so systemd restarts it.
            log::error!(
                "No {} sink on {}",
                target,
                shared.source_path.display()
            );
            service.fail();
            Err(())
        }
    }
}

fn fatal(service: &Weak<Service>, message: &str) {
    log::error!("{message}");
    if let Some(service) = service.upgrade() {
        service.fail();
    }
}

fn fatal_with(service: &Service, message: &str) {
    log::error!("{message}");
    service.fail();
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::KeyCode;

    fn key(code: KeyCode) -> u16 {
        code.code()
    }

    fn set(codes: &[KeyCode]) -> Hotkey {
        codes.iter().map(|code| code.code()).collect()
    }

    #[test]
    fn test_sink_key_naming() {
        assert_eq!(SinkKey::Host.link_name(), "host");
        assert_eq!(SinkKey::Vm("win10".into()).link_name(), "win10");

        assert_eq!(SinkKey::Host.wire(), "");
        assert_eq!(SinkKey::Vm("win10".into()).wire(), "win10");

        assert_eq!(SinkKey::Host.to_string(), "host device");
        assert_eq!(SinkKey::Vm("win10".into()).to_string(), "win10");

        assert_eq!(SinkKey::from_wire(""), SinkKey::Host);
        assert_eq!(SinkKey::from_wire("mac"), SinkKey::Vm("mac".into()));
    }

    #[test]
    fn test_source_for_strips_vm_prefix() {
        let source = source_for("/dev/input/by-id/win10-usb-kbd-event", "win10").unwrap();
        assert_eq!(
            source,
            Path::new("/dev/input/by-id/usb-kbd-event").to_path_buf()
        );
    }

    #[test]
    fn test_source_for_rejects_foreign_prefix() {
        assert!(source_for("/dev/input/by-id/mac-usb-kbd", "win10").is_err());
    }

    #[test]
    fn test_new_rejects_missing_path() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let result = ReplicatedDevice::new(&dir.path().join("kbd"), Weak::new(), None);
        assert!(matches!(result, Err(Error::NotADevice(_))));
    }

    #[test]
    fn test_new_rejects_regular_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbd");
        std::fs::write(&path, b"not a device").unwrap();

        let result = ReplicatedDevice::new(&path, Weak::new(), None);
        assert!(matches!(result, Err(Error::NotADevice(_))));
    }

    #[test]
    fn test_new_accepts_character_device() {
        let _ = env_logger::builder().is_test(true).try_init();
        // /dev/null is a character device on any Linux system.
        let device = ReplicatedDevice::new(Path::new("/dev/null"), Weak::new(), None).unwrap();
        assert_eq!(device.id, "null");
    }

    #[test]
    fn test_fire_latch_arms_on_exact_match_and_fires_on_empty() {
        let hotkey = set(&[KeyCode::KEY_LEFTCTRL, KeyCode::KEY_RIGHTCTRL]);
        let mut latch = FireLatch::default();

        // First key down: pressed set is a subset, no arming.
        let pressed = set(&[KeyCode::KEY_LEFTCTRL]);
        assert!(!latch.step(1, Some(&hotkey), &pressed));
        assert!(!latch.armed);

        // Second key down completes the combination.
        let pressed = set(&[KeyCode::KEY_LEFTCTRL, KeyCode::KEY_RIGHTCTRL]);
        assert!(!latch.step(1, Some(&hotkey), &pressed));
        assert!(latch.armed);

        // First release: still a key down, no fire.
        let pressed = set(&[KeyCode::KEY_RIGHTCTRL]);
        assert!(!latch.step(0, Some(&hotkey), &pressed));

        // Last release empties the set: fire, and disarm.
        assert!(latch.step(0, Some(&hotkey), &Hotkey::new()));
        assert!(!latch.armed);

        // Nothing pending afterwards.
        assert!(!latch.step(0, Some(&hotkey), &Hotkey::new()));
    }

    #[test]
    fn test_fire_latch_superset_does_not_arm() {
        let hotkey = set(&[KeyCode::KEY_PAUSE]);
        let mut latch = FireLatch::default();

        let pressed = set(&[KeyCode::KEY_PAUSE, KeyCode::KEY_LEFTSHIFT]);
        assert!(!latch.step(1, Some(&hotkey), &pressed));
        assert!(!latch.step(0, Some(&hotkey), &Hotkey::new()));
    }

    #[test]
    fn test_fire_latch_unset_hotkey_never_fires() {
        let mut latch = FireLatch::default();
        let pressed = set(&[KeyCode::KEY_PAUSE]);
        assert!(!latch.step(1, None, &pressed));
        assert!(!latch.step(0, None, &Hotkey::new()));
    }

    #[test]
    fn test_fire_latch_survives_interleaved_keys() {
        // Arm, press an unrelated key, then release everything: still fires
        // once the set is empty.
        let hotkey = set(&[KeyCode::KEY_PAUSE]);
        let mut latch = FireLatch::default();

        assert!(!latch.step(1, Some(&hotkey), &set(&[KeyCode::KEY_PAUSE])));
        assert!(latch.armed);
        assert!(!latch.step(
            1,
            Some(&hotkey),
            &set(&[KeyCode::KEY_PAUSE, KeyCode::KEY_A])
        ));
        assert!(!latch.step(0, Some(&hotkey), &set(&[KeyCode::KEY_A])));
        assert!(latch.step(0, Some(&hotkey), &Hotkey::new()));
    }

    #[test]
    fn test_direct_latch_fires_matched_hotkey() {
        let meta = set(&[KeyCode::KEY_LEFTMETA]);
        let home = set(&[KeyCode::KEY_HOME]);
        let mut hotkeys = HashMap::new();
        hotkeys.insert(meta.clone(), SinkKey::Vm("win10".into()));
        hotkeys.insert(home.clone(), SinkKey::Host);

        let mut latch = DirectLatch::default();
        assert!(latch.step(1, &hotkeys, &meta).is_none());
        assert_eq!(latch.step(0, &hotkeys, &Hotkey::new()), Some(meta.clone()));
        assert_eq!(hotkeys[&meta], SinkKey::Vm("win10".into()));

        // And again for the host selector.
        assert!(latch.step(1, &hotkeys, &home).is_none());
        assert_eq!(latch.step(0, &hotkeys, &Hotkey::new()), Some(home));
    }

    #[test]
    fn test_direct_latch_ignores_unmapped_sets() {
        let hotkeys: HashMap<Hotkey, SinkKey> = HashMap::new();
        let mut latch = DirectLatch::default();
        assert!(latch.step(1, &hotkeys, &set(&[KeyCode::KEY_LEFTMETA])).is_none());
        assert!(latch.step(0, &hotkeys, &Hotkey::new()).is_none());
    }

    #[test]
    fn test_pressed_set_uses_key_codes() {
        let pressed = set(&[KeyCode::KEY_LEFTCTRL, KeyCode::KEY_RIGHTCTRL]);
        assert!(pressed.contains(&key(KeyCode::KEY_LEFTCTRL)));
        assert!(pressed.contains(&key(KeyCode::KEY_RIGHTCTRL)));
        assert_eq!(pressed.len(), 2);
    }
}
