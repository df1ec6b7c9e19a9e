//! The contract between the sandbox controller and a hypervisor backend.
//!
//! A backend is injected into a [`Hypervisor`](super::Hypervisor) as a [`HypervisorDriver`],
//! which creates one [`DriverContext`] per sandbox. Operations that touch the VM report their
//! outcome on the channel they are given instead of returning it, so the controller never
//! waits on the backend.

#[cfg(test)]
pub(crate) mod testing;

use std::{fmt::Debug, path::{Path, PathBuf}, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{config::BootConfig, HyperboxResult};

use super::{DiskDescriptor, InterfaceCreated, InterfaceDescription, VmEvent};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A hypervisor backend.
pub trait HypervisorDriver: Debug + Send + Sync {
    /// Returns the name of the backend.
    fn name(&self) -> &str;

    /// Creates the context of a new sandbox whose files live in `home_dir`.
    fn init_context(&self, home_dir: &Path) -> HyperboxResult<Arc<dyn DriverContext>>;

    /// Recreates the context of a running sandbox from the blob returned by
    /// [`DriverContext::dump`].
    fn load_context(&self, persisted: &serde_json::Value) -> HyperboxResult<Arc<dyn DriverContext>>;

    /// Returns `true` if guests can be reached over vsock.
    fn supports_vsock(&self) -> bool;
}

/// The backend side of one sandbox.
#[async_trait]
pub trait DriverContext: Debug + Send + Sync {
    /// Starts the VM. Lifecycle events such as [`VmEvent::VmExit`] are posted to `hub`.
    fn launch(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>);

    /// Takes over a VM that is already running.
    fn associate(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>);

    /// Returns the backend state needed by [`HypervisorDriver::load_context`].
    fn dump(&self) -> HyperboxResult<serde_json::Value>;

    /// Hotplugs a disk and answers [`VmEvent::BlockdevInserted`] or [`VmEvent::DeviceFailed`].
    fn add_disk(
        &self,
        sandbox: &SandboxInfo,
        source_type: &str,
        disk: &DiskDescriptor,
        result: oneshot::Sender<VmEvent>,
    );

    /// Unplugs a disk and answers `callback` on success.
    fn remove_disk(
        &self,
        sandbox: &SandboxInfo,
        disk: &DiskDescriptor,
        callback: VmEvent,
        result: oneshot::Sender<VmEvent>,
    );

    /// Hotplugs a network device and answers [`VmEvent::NetDevInserted`] or
    /// [`VmEvent::DeviceFailed`].
    fn add_nic(
        &self,
        sandbox: &SandboxInfo,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: oneshot::Sender<VmEvent>,
    );

    /// Unplugs a network device and answers `callback` on success.
    fn remove_nic(
        &self,
        sandbox: &SandboxInfo,
        nic: &InterfaceCreated,
        callback: VmEvent,
        result: oneshot::Sender<VmEvent>,
    );

    /// Prepares the host side of an interface.
    async fn configure_network(
        &self,
        sandbox: &SandboxInfo,
        config: &InterfaceDescription,
    ) -> HyperboxResult<NetworkSettings>;

    /// Grows the VM to `cpus` vCPUs.
    fn set_cpus(&self, sandbox: &SandboxInfo, cpus: u32, result: oneshot::Sender<HyperboxResult<()>>);

    /// Hotplugs `size_mib` MiB of memory into `slot`.
    fn add_mem(
        &self,
        sandbox: &SandboxInfo,
        slot: u32,
        size_mib: u32,
        result: oneshot::Sender<HyperboxResult<()>>,
    );

    /// Saves the state of a paused VM to `path`.
    fn save(&self, sandbox: &SandboxInfo, path: &Path, result: oneshot::Sender<HyperboxResult<()>>);

    /// Pauses or resumes every vCPU.
    fn pause(&self, sandbox: &SandboxInfo, pause: bool, result: oneshot::Sender<HyperboxResult<()>>);

    /// Collects resource usage.
    fn stats(&self, sandbox: &SandboxInfo, result: oneshot::Sender<HyperboxResult<SandboxStats>>);

    /// Asks the VM to power down and posts [`VmEvent::VmExit`] once it has.
    fn shutdown(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>);

    /// Kills the VM and posts [`VmEvent::VmKilled`].
    fn kill(&self, sandbox: &SandboxInfo, hub: mpsc::Sender<VmEvent>);

    /// Releases backend resources. Called once, when the sandbox closes.
    fn close(&self);
}

/// What a backend needs to know about a sandbox.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxInfo {
    /// The sandbox id.
    id: String,

    /// The directory holding the sockets and the shared directory.
    home_dir: PathBuf,

    /// The control socket the guest agent listens on.
    hyper_sock: PathBuf,

    /// The stream socket the guest agent listens on.
    tty_sock: PathBuf,

    /// The serial console socket.
    console_sock: PathBuf,

    /// The directory shared with the guest.
    share_dir: PathBuf,

    /// The vsock guest context id, or `0` when vsock is not used.
    guest_cid: u32,

    /// How the VM is booted.
    boot: BootConfig,
}

/// The host side of an interface as prepared by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// The MAC address.
    pub mac: String,

    /// The IPv4 address of the guest side.
    pub ip_address: String,

    /// The prefix length of the guest network.
    pub ip_prefix_len: u8,

    /// The gateway.
    pub gateway: String,

    /// The bridge the host device is attached to.
    pub bridge: String,

    /// The host device, e.g. a tap device.
    pub device: String,

    /// Whether the address was allocated by the host rather than requested.
    pub automatic: bool,
}

/// The host side of a network device to hotplug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNicInfo {
    /// The interface id.
    pub id: String,

    /// The host device.
    pub device: String,

    /// The MAC address.
    pub mac: String,

    /// The bridge.
    pub bridge: String,

    /// The gateway.
    pub gateway: String,
}

/// The guest side of a network device to hotplug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestNicInfo {
    /// The device name inside the guest.
    pub device: String,

    /// The IPv4 address.
    pub ip_addr: String,

    /// The eth slot.
    pub index: usize,

    /// The PCI address.
    pub bus_addr: u32,
}

/// Resource usage of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    /// When the numbers were collected.
    pub collected_at: DateTime<Utc>,

    /// Total CPU time consumed, in nanoseconds.
    pub cpu_time_ns: u64,

    /// Memory in use, in bytes.
    pub memory_bytes: u64,

    /// Bytes read from block devices.
    pub block_read_bytes: u64,

    /// Bytes written to block devices.
    pub block_write_bytes: u64,

    /// Bytes received on network devices.
    pub network_rx_bytes: u64,

    /// Bytes sent on network devices.
    pub network_tx_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxInfo {
    pub(crate) fn new(id: &str, home_dir: PathBuf, share_dir: PathBuf, guest_cid: u32, boot: BootConfig) -> Self {
        use crate::config::{CONSOLE_SOCK_NAME, HYPER_SOCK_NAME, TTY_SOCK_NAME};

        Self {
            id: id.to_string(),
            hyper_sock: home_dir.join(HYPER_SOCK_NAME),
            tty_sock: home_dir.join(TTY_SOCK_NAME),
            console_sock: home_dir.join(CONSOLE_SOCK_NAME),
            home_dir,
            share_dir,
            guest_cid,
            boot,
        }
    }
}

impl SandboxStats {
    /// Creates an empty sample taken now.
    pub fn empty() -> Self {
        Self {
            collected_at: Utc::now(),
            cpu_time_ns: 0,
            memory_bytes: 0,
            block_read_bytes: 0,
            block_write_bytes: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }
}
