//! A scripted hypervisor backend for controller tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::BootConfig,
    hypervisor::{DiskDescriptor, InterfaceCreated, InterfaceDescription, VmEvent},
    HyperboxError, HyperboxResult,
};

use super::{
    DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, NetworkSettings, SandboxInfo,
    SandboxStats,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Answers every backend request right away unless told otherwise, and records what it was
/// asked to do.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Vec<String>,
    hub: Option<mpsc::Sender<VmEvent>>,
    hold_disks: bool,
    held: HashMap<String, (oneshot::Sender<VmEvent>, VmEvent)>,
    failing_disks: HashSet<String>,
    fail_nics: bool,
    ignore_shutdown: bool,
    next_auto_ip: u8,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScriptedDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded calls, e.g. `add_disk:data`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Returns the recorded calls starting with `prefix`.
    pub(crate) fn calls_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Keeps disk insertions pending until [`release_disk`](Self::release_disk).
    pub(crate) fn hold_disks(&self, hold: bool) {
        self.lock().hold_disks = hold;
    }

    /// Completes a held disk insertion.
    pub(crate) fn release_disk(&self, name: &str) {
        if let Some((tx, event)) = self.lock().held.remove(name) {
            let _ = tx.send(event);
        }
    }

    /// Returns `true` if an insertion of `name` is held.
    pub(crate) fn is_held(&self, name: &str) -> bool {
        self.lock().held.contains_key(name)
    }

    /// Makes insertions of `name` fail.
    pub(crate) fn fail_disk(&self, name: &str) {
        self.lock().failing_disks.insert(name.to_string());
    }

    /// Makes network device hotplug fail.
    pub(crate) fn fail_nics(&self, fail: bool) {
        self.lock().fail_nics = fail;
    }

    /// Makes shutdown requests go unanswered.
    pub(crate) fn ignore_shutdown(&self, ignore: bool) {
        self.lock().ignore_shutdown = ignore;
    }

    /// Posts an event to the hub of the launched sandbox.
    pub(crate) async fn post(&self, event: VmEvent) -> anyhow::Result<()> {
        let hub = self
            .lock()
            .hub
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sandbox not launched"))?;
        hub.send(event).await?;
        Ok(())
    }

    /// Returns a sandbox description for tests that use the backend directly.
    pub(crate) fn sandbox_info(&self, id: &str) -> SandboxInfo {
        let home = PathBuf::from("/tmp/hyperbox-test").join(id);
        SandboxInfo::new(
            id,
            home.clone(),
            home.join("share_dir"),
            0,
            BootConfig::builder().kernel("/kernel").initrd("/initrd").build(),
        )
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl HypervisorDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init_context(&self, _home_dir: &Path) -> HyperboxResult<Arc<dyn DriverContext>> {
        Ok(Arc::new(self.clone()))
    }

    fn load_context(&self, persisted: &serde_json::Value) -> HyperboxResult<Arc<dyn DriverContext>> {
        if persisted["driver"] != "scripted" {
            return Err(HyperboxError::Persist("not a scripted driver blob".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }

    fn supports_vsock(&self) -> bool {
        false
    }
}

#[async_trait]
impl DriverContext for ScriptedDriver {
    fn launch(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record(format!("launch:{}", sandbox.get_id()));
        self.lock().hub = Some(hub);
    }

    fn associate(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record(format!("associate:{}", sandbox.get_id()));
        self.lock().hub = Some(hub);
    }

    fn dump(&self) -> HyperboxResult<serde_json::Value> {
        Ok(serde_json::json!({ "driver": "scripted" }))
    }

    fn add_disk(
        &self,
        _sandbox: &SandboxInfo,
        source_type: &str,
        disk: &DiskDescriptor,
        result: oneshot::Sender<VmEvent>,
    ) {
        self.record(format!("add_disk:{}", disk.name));
        let mut state = self.lock();
        let event = if state.failing_disks.contains(&disk.name) {
            VmEvent::DeviceFailed {
                reason: format!("cannot attach {}", disk.filename),
            }
        } else {
            let letter = (b'a' + (disk.scsi_id % 26) as u8) as char;
            VmEvent::BlockdevInserted {
                name: disk.name.clone(),
                source_type: source_type.to_string(),
                device_name: format!("sd{letter}"),
                scsi_addr: format!("0:0:{}:0", disk.scsi_id),
            }
        };

        if state.hold_disks {
            state.held.insert(disk.name.clone(), (result, event));
        } else {
            let _ = result.send(event);
        }
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
        self.record(format!("add_nic:{}", guest.device));
        let event = if self.lock().fail_nics {
            VmEvent::DeviceFailed {
                reason: format!("cannot attach {}", guest.device),
            }
        } else {
            VmEvent::NetDevInserted {
                index: guest.index,
                device_name: guest.device.clone(),
                address: guest.bus_addr,
            }
        };
        let _ = result.send(event);
    }

    fn remove_nic(
        &self,
        _sandbox: &SandboxInfo,
        nic: &InterfaceCreated,
        callback: VmEvent,
        result: oneshot::Sender<VmEvent>,
    ) {
        self.record(format!("remove_nic:{}", nic.device_name));
        let _ = result.send(callback);
    }

    async fn configure_network(
        &self,
        _sandbox: &SandboxInfo,
        config: &InterfaceDescription,
    ) -> HyperboxResult<NetworkSettings> {
        self.record(format!("configure_network:{}", config.id));
        let (ip_address, ip_prefix_len, automatic) = if config.ip.is_empty() {
            let mut state = self.lock();
            state.next_auto_ip += 1;
            (format!("10.0.0.{}", state.next_auto_ip + 1), 24, true)
        } else {
            let (ip, len) = config.ip.split_once('/').unwrap_or((config.ip.as_str(), "32"));
            let len = len
                .parse()
                .map_err(|_| HyperboxError::Spec(format!("bad prefix in {}", config.ip)))?;
            (ip.to_string(), len, false)
        };

        Ok(NetworkSettings {
            mac: if config.mac.is_empty() {
                "52:54:00:00:00:01".to_string()
            } else {
                config.mac.clone()
            },
            ip_address,
            ip_prefix_len,
            gateway: config.gateway.clone(),
            bridge: config.bridge.clone(),
            device: format!("tap-{}", config.id),
            automatic,
        })
    }

    fn set_cpus(&self, _sandbox: &SandboxInfo, cpus: u32, result: oneshot::Sender<HyperboxResult<()>>) {
        self.record(format!("set_cpus:{cpus}"));
        let _ = result.send(Ok(()));
    }

    fn add_mem(
        &self,
        _sandbox: &SandboxInfo,
        slot: u32,
        size_mib: u32,
        result: oneshot::Sender<HyperboxResult<()>>,
    ) {
        self.record(format!("add_mem:{slot}:{size_mib}"));
        let _ = result.send(Ok(()));
    }

    fn save(&self, _sandbox: &SandboxInfo, path: &Path, result: oneshot::Sender<HyperboxResult<()>>) {
        self.record(format!("save:{}", path.display()));
        let _ = result.send(Ok(()));
    }

    fn pause(&self, _sandbox: &SandboxInfo, pause: bool, result: oneshot::Sender<HyperboxResult<()>>) {
        self.record(format!("pause:{pause}"));
        let _ = result.send(Ok(()));
    }

    fn stats(&self, _sandbox: &SandboxInfo, result: oneshot::Sender<HyperboxResult<SandboxStats>>) {
        self.record("stats".to_string());
        let _ = result.send(Ok(SandboxStats::empty()));
    }

    fn shutdown(&self, _sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record("shutdown".to_string());
        if !self.lock().ignore_shutdown {
            let _ = hub.try_send(VmEvent::VmExit);
        }
    }

    fn kill(&self, _sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>) {
        self.record("kill".to_string());
        if !self.lock().ignore_shutdown {
            let _ = hub.try_send(VmEvent::VmKilled { success: true });
        }
    }

    fn close(&self) {
        self.record("close".to_string());
    }
}
