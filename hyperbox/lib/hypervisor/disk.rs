//! Block devices and directory shares backing container roots and volumes.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use hyperutils::WaitGroup;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::{HyperboxError, HyperboxResult};

use super::{DriverContext, SandboxInfo, VmEvent};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The format of a host directory shared into the guest.
pub const FORMAT_DIR: &str = "vfs";

/// The format of a network filesystem mounted by the guest itself.
pub const FORMAT_NAS: &str = "nas";

/// The disk usage reported to the backend for a container root.
pub const USAGE_IMAGE: &str = "image";

/// The disk usage reported to the backend for a volume.
pub const USAGE_VOLUME: &str = "volume";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A disk as the hypervisor backend sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// The volume name.
    pub name: String,

    /// The image file, block device or shared directory on the host.
    pub filename: String,

    /// `raw`, `qcow2`, `vfs` for a shared directory or `nas`.
    pub format: String,

    /// The filesystem on the disk.
    pub fstype: String,

    /// The device name inside the guest, known once inserted.
    pub device_name: String,

    /// The SCSI id assigned at insertion.
    pub scsi_id: u32,

    /// The SCSI address inside the guest, known once inserted.
    pub scsi_addr: String,

    /// Whether the volume must be populated from the image.
    pub docker_volume: bool,

    /// Whether the disk is attached read-only.
    pub read_only: bool,

    /// Backend specific options.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub options: BTreeMap<String, String>,
}

/// A disk attached, or being attached, to a sandbox, and the containers waiting on it.
///
/// A container registers as an observer with [`wait`](Self::wait). Until the disk is inserted,
/// every observer holds one unit of its wait group; insertion or failure releases them all.
#[derive(Debug)]
pub struct DiskContext {
    state: Mutex<DiskState>,
    insertion: watch::Sender<Insertion>,
}

/// How the hotplug of a disk ended, if it has.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Insertion {
    Pending,
    Inserted,
    Failed(String),
}

#[derive(Debug)]
struct DiskState {
    desc: DiskDescriptor,
    ready: bool,
    is_root_vol: bool,
    observers: HashMap<String, Observer>,
}

#[derive(Debug)]
struct Observer {
    wg: WaitGroup,
    pending: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DiskDescriptor {
    /// Returns `true` for a shared directory.
    pub fn is_dir(&self) -> bool {
        self.format == FORMAT_DIR
    }

    /// Returns `true` for a network filesystem.
    pub fn is_nas(&self) -> bool {
        self.format == FORMAT_NAS
    }
}

impl DiskContext {
    /// Creates the context of a disk. Shared directories and network filesystems need no
    /// hotplug and are ready right away.
    pub fn new(desc: DiskDescriptor, is_root_vol: bool) -> Self {
        let ready = desc.is_dir() || desc.is_nas();
        let (insertion, _) = watch::channel(if ready {
            Insertion::Inserted
        } else {
            Insertion::Pending
        });
        Self {
            state: Mutex::new(DiskState {
                desc,
                ready,
                is_root_vol,
                observers: HashMap::new(),
            }),
            insertion,
        }
    }

    /// Recreates an inserted disk with its observers, none of them pending.
    pub(crate) fn restored(desc: DiskDescriptor, is_root_vol: bool, observers: &[String]) -> Self {
        let observers = observers
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Observer {
                        wg: WaitGroup::new(),
                        pending: false,
                    },
                )
            })
            .collect();

        let (insertion, _) = watch::channel(Insertion::Inserted);
        Self {
            state: Mutex::new(DiskState {
                desc,
                ready: true,
                is_root_vol,
                observers,
            }),
            insertion,
        }
    }

    /// Returns a copy of the descriptor.
    pub fn descriptor(&self) -> DiskDescriptor {
        self.lock().desc.clone()
    }

    /// Returns the volume name.
    pub fn name(&self) -> String {
        self.lock().desc.name.clone()
    }

    /// Returns `true` once the disk is usable by the guest.
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Returns `true` if the disk is the root of a container.
    pub fn is_root_vol(&self) -> bool {
        self.lock().is_root_vol
    }

    /// Returns the number of containers observing the disk.
    pub fn containers(&self) -> usize {
        self.lock().observers.len()
    }

    /// Returns the ids of the containers observing the disk, sorted.
    pub fn observers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().observers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers `container` as an observer. If the disk is not ready yet, `wg` is held until
    /// it is inserted or fails. Registering twice is a no-op.
    pub fn wait(&self, container: &str, wg: &WaitGroup) {
        let mut state = self.lock();
        if state.observers.contains_key(container) {
            return;
        }

        let pending = !state.ready;
        if pending {
            wg.add(1);
        }

        state.observers.insert(
            container.to_string(),
            Observer {
                wg: wg.clone(),
                pending,
            },
        );
    }

    /// Unregisters `container`, releasing its wait group if it was still held.
    pub fn unwait(&self, container: &str) {
        let mut state = self.lock();
        if let Some(observer) = state.observers.remove(container) {
            tracing::debug!(container, disk = %state.desc.name, "container stops waiting on disk");
            if observer.pending {
                observer.wg.done();
            }
        }
    }

    /// Waits until the first hotplug of the disk has ended and returns its outcome.
    ///
    /// Resolves immediately for a disk that needed no hotplug or was restored.
    pub async fn inserted_or_failed(&self) -> HyperboxResult<()> {
        let mut rx = self.insertion.subscribe();
        let outcome = match rx.wait_for(|i| *i != Insertion::Pending).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Insertion::Failed("disk context dropped".to_string()),
        };

        match outcome {
            Insertion::Failed(reason) => Err(HyperboxError::Device(reason)),
            _ => Ok(()),
        }
    }

    /// Hotplugs the disk and waits for the backend to report it.
    ///
    /// `next_scsi_id` is only called when a hotplug is actually needed, so a disk that is
    /// already ready does not consume an id.
    pub async fn insert(
        &self,
        dctx: &dyn DriverContext,
        sandbox: &SandboxInfo,
        next_scsi_id: impl FnOnce() -> u32,
    ) -> HyperboxResult<()> {
        if self.is_ready() {
            tracing::debug!(disk = %self.name(), "disk already inserted");
            return Ok(());
        }

        // The id comes from the sandbox counters, which must not be taken under the disk lock.
        let scsi_id = next_scsi_id();
        let (desc, usage) = {
            let mut state = self.lock();
            state.desc.scsi_id = scsi_id;
            let usage = if state.is_root_vol {
                USAGE_IMAGE
            } else {
                USAGE_VOLUME
            };
            (state.desc.clone(), usage)
        };

        tracing::debug!(disk = %desc.name, scsi_id = desc.scsi_id, usage, "inserting disk");
        let (tx, rx) = oneshot::channel();
        dctx.add_disk(sandbox, usage, &desc, tx);

        match rx.await {
            Ok(VmEvent::BlockdevInserted {
                device_name,
                scsi_addr,
                ..
            }) => {
                self.inserted(device_name, scsi_addr);
                self.insertion.send_replace(Insertion::Inserted);
                Ok(())
            }
            Ok(event) => {
                tracing::error!(disk = %desc.name, %event, "disk insert failed");
                self.insert_failed(format!(
                    "disk {} insert failed: {}",
                    desc.name,
                    failure_reason(&event)
                ))
            }
            Err(_) => self.insert_failed(format!("disk {} insert session broken", desc.name)),
        }
    }

    /// Unplugs the disk. Shared directories and network filesystems need no unplug.
    pub async fn remove(&self, dctx: &dyn DriverContext, sandbox: &SandboxInfo) -> HyperboxResult<()> {
        let desc = self.descriptor();
        if desc.is_dir() || desc.is_nas() {
            tracing::debug!(disk = %desc.name, "no need to unplug");
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let callback = VmEvent::VolumeUnmounted {
            name: desc.name.clone(),
            success: true,
        };
        dctx.remove_disk(sandbox, &desc, callback, tx);

        match rx.await {
            Ok(VmEvent::VolumeUnmounted { success: true, .. }) => {
                tracing::debug!(disk = %desc.name, "disk unplugged");
                self.lock().ready = false;
                Ok(())
            }
            Ok(event) => {
                self.failed();
                Err(HyperboxError::Device(format!(
                    "disk {} remove failed: {}",
                    desc.name,
                    failure_reason(&event)
                )))
            }
            Err(_) => {
                self.failed();
                Err(HyperboxError::Device(format!(
                    "disk {} remove session broken",
                    desc.name
                )))
            }
        }
    }

    fn inserted(&self, device_name: String, scsi_addr: String) {
        let mut state = self.lock();
        state.desc.device_name = device_name;
        state.desc.scsi_addr = scsi_addr;
        state.ready = true;

        let DiskState {
            desc, observers, ..
        } = &mut *state;
        for (container, observer) in observers.iter_mut() {
            tracing::info!(disk = %desc.name, device = %desc.device_name, container, "disk inserted");
            observer.release();
        }
    }

    fn insert_failed(&self, reason: String) -> HyperboxResult<()> {
        self.failed();
        self.insertion.send_replace(Insertion::Failed(reason.clone()));
        Err(HyperboxError::Device(reason))
    }

    fn failed(&self) {
        let mut state = self.lock();
        state.ready = false;
        for observer in state.observers.values_mut() {
            observer.release();
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Observer {
    fn release(&mut self) {
        if self.pending {
            self.pending = false;
            self.wg.done();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn failure_reason(event: &VmEvent) -> String {
    match event {
        VmEvent::DeviceFailed { reason } => reason.clone(),
        other => format!("unexpected {other}"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hypervisor::driver::testing::ScriptedDriver;

    fn block(name: &str) -> DiskDescriptor {
        DiskDescriptor {
            name: name.to_string(),
            filename: format!("/images/{name}.img"),
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dir_and_nas_volumes_are_ready() {
        let dir = DiskContext::new(
            DiskDescriptor {
                format: FORMAT_DIR.to_string(),
                ..block("shared")
            },
            false,
        );
        assert!(dir.is_ready());

        let wg = WaitGroup::new();
        dir.wait("c1", &wg);
        assert_eq!(wg.outstanding(), 0);
        assert_eq!(dir.containers(), 1);
    }

    #[tokio::test]
    async fn test_insert_releases_observers() -> anyhow::Result<()> {
        let driver = ScriptedDriver::new();
        driver.hold_disks(true);
        let sandbox = driver.sandbox_info("vm-1");
        let disk = std::sync::Arc::new(DiskContext::new(block("data"), false));

        let wg = WaitGroup::new();
        disk.wait("c1", &wg);
        disk.wait("c1", &wg);
        disk.wait("c2", &wg);
        assert_eq!(wg.outstanding(), 2);

        let insert = tokio::spawn({
            let disk = disk.clone();
            let driver = driver.clone();
            let sandbox = sandbox.clone();
            async move { disk.insert(&driver, &sandbox, || 4).await }
        });

        let settled = tokio::spawn({
            let disk = disk.clone();
            async move { disk.inserted_or_failed().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!disk.is_ready());
        assert!(!settled.is_finished());
        driver.release_disk("data");

        insert.await??;
        tokio::time::timeout(Duration::from_secs(1), settled).await???;
        tokio::time::timeout(Duration::from_secs(1), wg.wait()).await?;
        let desc = disk.descriptor();
        assert!(disk.is_ready());
        assert_eq!(desc.scsi_id, 4);
        assert_eq!(desc.scsi_addr, "0:0:4:0");
        assert_eq!(desc.device_name, "sde");

        let mut ids = 10;
        disk.insert(&driver, &sandbox, || {
            ids += 1;
            ids
        })
        .await?;
        assert_eq!(ids, 10);

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_insert_releases_observers_without_readiness() -> anyhow::Result<()> {
        let driver = ScriptedDriver::new();
        driver.fail_disk("broken");
        let sandbox = driver.sandbox_info("vm-1");
        let disk = DiskContext::new(block("broken"), true);

        let wg = WaitGroup::new();
        disk.wait("c1", &wg);
        let result = disk.insert(&driver, &sandbox, || 0).await;
        assert!(matches!(result, Err(HyperboxError::Device(_))));
        assert_eq!(wg.outstanding(), 0);
        assert!(!disk.is_ready());
        assert!(matches!(
            disk.inserted_or_failed().await,
            Err(HyperboxError::Device(reason)) if reason.contains("broken")
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_unwait_releases_pending_observer() -> anyhow::Result<()> {
        let disk = DiskContext::new(block("data"), false);
        let wg = WaitGroup::new();
        disk.wait("c1", &wg);
        assert_eq!(wg.outstanding(), 1);

        disk.unwait("c1");
        disk.unwait("c1");
        assert_eq!(wg.outstanding(), 0);
        assert_eq!(disk.containers(), 0);

        Ok(())
    }
}
