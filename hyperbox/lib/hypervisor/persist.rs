//! Snapshots that let a restarted controller take over a running sandbox.
//!
//! A snapshot records the hardware counters, every volume with the containers observing it,
//! every container with its guest descriptor, and every interface. Restoring fills a fresh
//! context with the same state, so counters resume where they stopped and no device is
//! attached twice.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    config::{BootConfig, SandboxConfig},
    hyperstart::Container,
    HyperboxError, HyperboxResult,
};

use super::{
    context::VmContext, ContainerContext, ContainerDescription, DiskContext, DiskDescriptor,
    InterfaceCreated,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The snapshot format written by this build. It is the only one it reads.
pub const PERSIST_VERSION: u32 = 20170224;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sandbox snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistInfo {
    /// The snapshot format.
    pub persist_version: u32,

    /// The sandbox id.
    pub id: String,

    /// What the hypervisor backend needs to reattach, see
    /// [`DriverContext::dump`](super::DriverContext::dump).
    pub driver_info: serde_json::Value,

    /// How the VM was booted.
    pub boot: BootConfig,

    /// The sandbox-wide network environment.
    pub vm_spec: SandboxConfig,

    /// Hardware counters.
    pub hw_stat: PersistHwStatus,

    /// Every volume, container roots included.
    #[serde(default)]
    pub volume_list: Vec<PersistVolumeInfo>,

    /// Every interface.
    #[serde(default)]
    pub network_list: Vec<InterfaceCreated>,

    /// Every container.
    #[serde(default)]
    pub containers: Vec<PersistContainerInfo>,
}

/// Hardware counters of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistHwStatus {
    /// The next PCI address.
    pub pci_addr: u32,

    /// The next SCSI id.
    pub scsi_id: u32,

    /// The next stream session id.
    pub attach_id: u64,

    /// The vsock guest context id, `0` without vsock.
    #[serde(default)]
    pub guest_cid: u32,

    /// The number of vCPUs.
    pub cpus: u32,

    /// The amount of memory in MiB.
    pub memory_mib: u32,

    /// The next memory hotplug slot.
    #[serde(default)]
    pub mem_slot: u32,
}

/// A volume in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistVolumeInfo {
    /// The disk as the backend knows it.
    #[serde(flatten)]
    pub disk: DiskDescriptor,

    /// The containers observing the volume.
    #[serde(default)]
    pub container_ids: Vec<String>,

    /// Whether the volume is the root of a container.
    #[serde(default)]
    pub is_root_vol: bool,
}

/// A container in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistContainerInfo {
    /// The container id.
    pub id: String,

    /// The name of the root volume record.
    pub root_volume: String,

    /// The description the container was added with.
    pub description: ContainerDescription,

    /// The guest descriptor, including the stream sessions of the init process.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub guest: Option<Container>,
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    persist_version: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PersistInfo {
    /// Parses a snapshot, rejecting any format other than [`PERSIST_VERSION`].
    pub fn from_slice(data: &[u8]) -> HyperboxResult<Self> {
        let probe: VersionProbe = serde_json::from_slice(data)?;
        if probe.persist_version != PERSIST_VERSION {
            return Err(HyperboxError::UnsupportedPersistVersion {
                found: probe.persist_version,
                supported: PERSIST_VERSION,
            });
        }

        let info: Self = serde_json::from_slice(data)?;
        info.validate()?;
        Ok(info)
    }

    /// Serializes the snapshot.
    pub fn to_vec(&self) -> HyperboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn validate(&self) -> HyperboxResult<()> {
        for vol in self.volume_list.iter().filter(|v| v.is_root_vol) {
            if vol.container_ids.len() != 1 {
                return Err(HyperboxError::Persist(format!(
                    "root volume {} must belong to exactly one container, found {}",
                    vol.disk.name,
                    vol.container_ids.len()
                )));
            }
        }
        Ok(())
    }
}

impl VmContext {
    /// Takes a snapshot of the sandbox.
    pub(crate) fn persist(&self) -> HyperboxResult<PersistInfo> {
        let driver_info = self.dctx().dump()?;
        let attach_id = self.hyperstart().last_stream_seq();

        let state = self.lock();
        let mut volume_list: Vec<_> = state
            .volumes
            .values()
            .map(|disk| volume_record(disk))
            .collect();
        let mut containers = Vec::with_capacity(state.containers.len());
        for container in state.containers.values() {
            let root = container.root();
            volume_list.push(volume_record(root));
            containers.push(PersistContainerInfo {
                id: container.id().to_string(),
                root_volume: root.name(),
                description: container.description().clone(),
                guest: container.guest(),
            });
        }

        let info = PersistInfo {
            persist_version: PERSIST_VERSION,
            id: self.id().to_string(),
            driver_info,
            boot: self.info().get_boot().clone(),
            vm_spec: self.networks().config(),
            hw_stat: PersistHwStatus {
                pci_addr: state.pci_addr,
                scsi_id: state.scsi_id,
                attach_id,
                guest_cid: *self.info().get_guest_cid(),
                cpus: state.cpus,
                memory_mib: state.memory_mib,
                mem_slot: state.mem_slot,
            },
            volume_list,
            network_list: self.networks().interfaces(),
            containers,
        };

        tracing::debug!(
            sandbox = %self.id(),
            volumes = info.volume_list.len(),
            containers = info.containers.len(),
            interfaces = info.network_list.len(),
            "sandbox persisted"
        );
        Ok(info)
    }

    /// Fills a freshly created context from a snapshot. Nothing is changed if the snapshot
    /// is inconsistent.
    pub(crate) fn restore(&self, info: &PersistInfo) -> HyperboxResult<()> {
        info.validate()?;

        let mut volumes = Vec::new();
        let mut roots = HashMap::new();
        for vol in &info.volume_list {
            let disk = Arc::new(DiskContext::restored(
                vol.disk.clone(),
                vol.is_root_vol,
                &vol.container_ids,
            ));
            if vol.is_root_vol {
                roots.insert(vol.container_ids[0].clone(), disk);
            } else {
                volumes.push((vol.disk.name.clone(), disk));
            }
        }

        let mut containers = Vec::with_capacity(info.containers.len());
        for c in &info.containers {
            let root = roots
                .remove(&c.id)
                .filter(|root| root.name() == c.root_volume)
                .ok_or_else(|| {
                    HyperboxError::Persist(format!(
                        "container {} has no root volume {}",
                        c.id, c.root_volume
                    ))
                })?;
            containers.push(Arc::new(ContainerContext::restored(
                c.description.clone(),
                root,
                c.guest.clone(),
            )));
        }

        {
            let mut state = self.lock();
            state.pci_addr = info.hw_stat.pci_addr;
            state.scsi_id = info.hw_stat.scsi_id;
            state.cpus = info.hw_stat.cpus;
            state.memory_mib = info.hw_stat.memory_mib;
            state.mem_slot = info.hw_stat.mem_slot;
            state.volumes.extend(volumes);
            state
                .containers
                .extend(containers.into_iter().map(|c| (c.id().to_string(), c)));
        }

        self.networks().set_config(info.vm_spec.clone());
        for inf in &info.network_list {
            self.networks().restore(inf.clone());
        }

        tracing::info!(sandbox = %self.id(), "sandbox restored");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn volume_record(disk: &DiskContext) -> PersistVolumeInfo {
    PersistVolumeInfo {
        disk: disk.descriptor(),
        container_ids: disk.observers(),
        is_root_vol: disk.is_root_vol(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::HyperboxConfig,
        hyperstart::testing::FakeAgent,
        hypervisor::{
            context::{resolve, ContextInit},
            driver::testing::ScriptedDriver,
            InterfaceDescription, VolumeDescription, VolumeMount, VolumeReference,
            VsockCidAllocator,
        },
    };

    fn context(driver: &ScriptedDriver) -> (Arc<VmContext>, FakeAgent) {
        let (agent, hyperstart) = FakeAgent::connected(false);
        let (hub, _) = mpsc::channel(16);
        let (client, _) = mpsc::unbounded_channel();
        let ctx = VmContext::new(ContextInit {
            id: "vm-test".to_string(),
            config: HyperboxConfig::default(),
            info: driver.sandbox_info("vm-test"),
            dctx: Arc::new(driver.clone()),
            hyperstart,
            hub,
            client,
            cids: Arc::new(VsockCidAllocator::new()),
        });
        (ctx, agent)
    }

    fn volume(name: &str) -> VolumeDescription {
        VolumeDescription {
            name: name.to_string(),
            source: format!("/dev/mapper/{name}"),
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            ..Default::default()
        }
    }

    fn container(id: &str) -> ContainerDescription {
        ContainerDescription {
            id: id.to_string(),
            root_volume: volume(&format!("{id}-root")),
            path: "/bin/true".to_string(),
            volumes: BTreeMap::from([(
                "data".to_string(),
                VolumeReference {
                    name: "data".to_string(),
                    mount_points: vec![VolumeMount {
                        path: "/data".to_string(),
                        read_only: false,
                    }],
                },
            )]),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_restore_resumes_counters_and_observers() -> anyhow::Result<()> {
        let driver = ScriptedDriver::new();
        let (ctx, _agent) = context(&driver);
        resolve("vm-test", ctx.add_volume(volume("data"))?).await?;
        resolve("vm-test", ctx.add_container(container("c1"))?).await?;
        resolve("vm-test", ctx.add_container(container("c2"))?).await?;
        let inf = InterfaceDescription {
            id: "net0".to_string(),
            ..Default::default()
        };
        resolve("vm-test", ctx.add_interface(inf)?).await?;

        let snapshot = ctx.persist()?;
        assert_eq!(snapshot.hw_stat.scsi_id, 3);
        assert_eq!(snapshot.volume_list.len(), 3);
        let data = PersistInfo::from_slice(&snapshot.to_vec()?)?;
        assert_eq!(data, snapshot);

        let (restored, _agent) = context(&driver);
        restored.restore(&data)?;

        assert_eq!(restored.next_scsi_id(), 3);
        assert_eq!(restored.next_pci_addr(), snapshot.hw_stat.pci_addr);
        let shared = restored.volume("data").ok_or_else(|| anyhow::anyhow!("no volume"))?;
        assert!(shared.is_ready());
        assert_eq!(shared.observers(), vec!["c1", "c2"]);

        let c1 = restored.container("c1").ok_or_else(|| anyhow::anyhow!("no container"))?;
        assert_eq!(c1.root().observers(), vec!["c1"]);
        assert!(c1.root().is_root_vol());
        assert_eq!(c1.guest(), ctx.container("c1").and_then(|c| c.guest()));
        assert!(restored.networks().get_interface("net0").is_some());
        Ok(())
    }

    #[test]
    fn test_other_versions_are_rejected() -> anyhow::Result<()> {
        let newer = serde_json::json!({ "persist_version": PERSIST_VERSION + 1, "id": "vm-1" });
        let err = PersistInfo::from_slice(&serde_json::to_vec(&newer)?).unwrap_err();
        assert!(matches!(
            err,
            HyperboxError::UnsupportedPersistVersion { found, .. } if found == PERSIST_VERSION + 1
        ));

        let legacy = serde_json::json!({ "id": "vm-1", "containers": [] });
        let err = PersistInfo::from_slice(&serde_json::to_vec(&legacy)?).unwrap_err();
        assert_eq!(err.kind(), "PERSIST_ERROR");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_shared_root_volume_is_rejected() -> anyhow::Result<()> {
        let driver = ScriptedDriver::new();
        let (ctx, _agent) = context(&driver);
        resolve("vm-test", ctx.add_volume(volume("data"))?).await?;
        resolve("vm-test", ctx.add_container(container("c1"))?).await?;

        let mut snapshot = ctx.persist()?;
        for vol in snapshot.volume_list.iter_mut().filter(|v| v.is_root_vol) {
            vol.container_ids.push("c2".to_string());
        }

        let (restored, _agent) = context(&driver);
        assert!(matches!(
            restored.restore(&snapshot),
            Err(HyperboxError::Persist(_))
        ));
        assert!(restored.container_ids().is_empty());
        Ok(())
    }
}
