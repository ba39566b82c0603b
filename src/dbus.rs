use crate::device::SinkKey;
use crate::service::Service;
use std::sync::Arc;
use zbus::interface;

/// Interface name under which the methods are exported. A zbus interface
/// name is fixed at compile time, so this stays at the default bus name even
/// when a different bus name is configured.
pub const INTERFACE_NAME: &str = "vfio.kvm";

/// D-Bus face of the service: the protocol by which the libvirt QEMU hook
/// and external UIs drive the input-replication core.
pub struct KvmInterface {
    service: Arc<Service>,
}

impl KvmInterface {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

#[interface(name = "vfio.kvm")]
impl KvmInterface {
    /// The machine currently receiving input; empty while the host owns it.
    ///
    /// Change notifications are emitted by the service itself with the
    /// display form, so the automatic signal is disabled here.
    #[zbus(property(emits_changed_signal = "false"))]
    fn target(&self) -> String {
        self.service.reported_target()
    }

    #[zbus(property)]
    async fn set_target(&self, value: String) {
        self.service.set_target(SinkKey::from_wire(&value)).await;
    }

    /// Cycle the active target to the next machine in the ring and return
    /// the new target.
    async fn toggle(&self) -> String {
        self.service.toggle().await.wire().to_string()
    }

    /// QEMU hook "prepare/begin": provision replicated devices, pinned CPUs
    /// and hugepages for a starting VM. A false return aborts the VM start.
    async fn prepare(
        &self,
        vm_name: String,
        sub_op: String,
        extra_op: String,
        xml_config: String,
    ) -> bool {
        self.service
            .prepare(&vm_name, &sub_op, &extra_op, &xml_config)
            .await
    }

    /// QEMU hook "release/end": reclaim everything provisioned for a VM that
    /// has shut down.
    async fn release(
        &self,
        vm_name: String,
        sub_op: String,
        extra_op: String,
        xml_config: String,
    ) -> bool {
        self.service
            .release(&vm_name, &sub_op, &extra_op, &xml_config)
            .await
    }
}
