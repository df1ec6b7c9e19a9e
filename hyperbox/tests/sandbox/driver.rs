use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use hyperbox::{
    hypervisor::{
        DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver,
        InterfaceCreated, InterfaceDescription, NetworkSettings, SandboxInfo, SandboxStats,
        VmEvent,
    },
    HyperboxResult,
};
use tokio::sync::{mpsc, oneshot};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A backend whose VMs exist only as far as the controller can tell. Every request succeeds.
#[derive(Debug, Clone, Default)]
pub struct NullDriver {
    calls: Arc<Mutex<Vec<String>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NullDriver {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl HypervisorDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn init_context(&self, _home_dir: &Path) -> HyperboxResult<Arc<dyn DriverContext>> {
        Ok(Arc::new(self.clone()))
    }

    fn load_context(&self, _persisted: &serde_json::Value) -> HyperboxResult<Arc<dyn DriverContext>> {
        Ok(Arc::new(self.clone()))
    }

    fn supports_vsock(&self) -> bool {
        false
    }
}

#[async_trait]
impl DriverContext for NullDriver {
    fn launch(&self, sandbox: &SandboxInfo, _hub: mpsc::Sender<VmEvent>) {
        self.record(format!("launch:{}", sandbox.get_id()));
    }

    fn associate(&self, sandbox: &SandboxInfo, _hub: mpsc::Sender<VmEvent>) {
        self.record(format!("associate:{}", sandbox.get_id()));
    }

    fn dump(&self) -> HyperboxResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn add_disk(
        &self,
        _sandbox: &SandboxInfo,
        source_type: &str,
        disk: &DiskDescriptor,
        result: oneshot::Sender<VmEvent>,
    ) {
        self.record(format!("add_disk:{}", disk.name));
        let _ = result.send(VmEvent::BlockdevInserted {
            name: disk.name.clone(),
            source_type: source_type.to_string(),
            device_name: "sdb".to_string(),
            scsi_addr: format!("0:0:{}:0", disk.scsi_id),
        });
    }

    fn remove_disk(
        &self,
        _sandbox: &SandboxInfo,
        disk: &DiskDescriptor,
        callback: VmEvent,
        result: oneshot::Sender<VmEvent>,
    ) {
        self.record(format!("remove_disk:{}", disk.name));
        let _ = result.send(callback);
    }

    fn add_nic(
        &self,
        _sandbox: &SandboxInfo,
        _host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: oneshot::Sender<VmEvent>,
    ) {
        let _ = result.send(VmEvent::NetDevInserted {
            index: guest.index,
            device_name: guest.device.clone(),
            address: guest.bus_addr,
        });
    }

    fn remove_nic(
        &self,
        _sandbox: &SandboxInfo,
        _nic: &InterfaceCreated,
        callback: VmEvent,
        result: oneshot::Sender<VmEvent>,
    ) {
        let _ = result.send(callback);
    }

    async fn configure_network(
        &self,
        _sandbox: &SandboxInfo,
        config: &InterfaceDescription,
    ) -> HyperboxResult<NetworkSettings> {
        Ok(NetworkSettings {
            mac: "52:54:00:12:34:56".to_string(),
            ip_address: "192.168.123.2".to_string(),
            ip_prefix_len: 24,
            gateway: config.gateway.clone(),
            bridge: config.bridge.clone(),
            device: format!("tap-{}", config.id),
            automatic: config.ip.is_empty(),
        })
    }

    fn set_cpus(&self, _sandbox: &SandboxInfo, _cpus: u32, result: oneshot::Sender<HyperboxResult<()>>) {
        let _ = result.send(Ok(()));
    }

    fn add_mem(
        &self,
        _sandbox: &SandboxInfo,
        _slot: u32,
        _size_mib: u32,
        result: oneshot::Sender<HyperboxResult<()>>,
    ) {
        let _ = result.send(Ok(()));
    }

    fn save(&self, _sandbox: &SandboxInfo, _path: &Path, result: oneshot::Sender<HyperboxResult<()>>) {
        let _ = result.send(Ok(()));
    }

    fn pause(&self, _sandbox: &SandboxInfo, _pause: bool, result: oneshot::Sender<HyperboxResult<()>>) {
        let _ = result.send(Ok(()));
    }

    fn stats(&self, _sandbox: &SandboxInfo, result: oneshot::Sender<HyperboxResult<SandboxStats>>) {
        let _ = result.send(Ok(SandboxStats::empty()));
    }

    fn shutdown(&self, _sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record("shutdown");
        let _ = hub.try_send(VmEvent::VmExit);
    }

    fn kill(&self, _sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record("kill");
        let _ = hub.try_send(VmEvent::VmKilled { success: true });
    }

    fn close(&self) {
        self.record("close");
    }
}
