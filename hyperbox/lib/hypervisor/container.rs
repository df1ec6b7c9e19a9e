//! Containers added to a sandbox and the guest descriptors composed for them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    hyperstart::{
        Container, EnvironmentVar, FsmapDescriptor, Process, ProcessIo, Rlimit, VolumeDescriptor,
        INIT_PROCESS_ID, RESTART_POLICY_NEVER,
    },
    HyperboxError, HyperboxResult,
};

use super::{DiskContext, DiskDescriptor, FORMAT_DIR, FORMAT_NAS};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A container to add to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescription {
    /// The container id.
    pub id: String,

    /// A human readable name.
    #[serde(default)]
    pub name: String,

    /// The image the container was created from.
    #[serde(default)]
    pub image: String,

    /// The rootfs directory inside the root volume.
    pub rootfs: String,

    /// The volume holding the container filesystem.
    pub root_volume: VolumeDescription,

    /// Whether the init process gets a terminal.
    #[serde(default)]
    pub tty: bool,

    /// The user the init process runs as.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<UserGroupInfo>,

    /// The environment of the init process.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub envs: BTreeMap<String, String>,

    /// The working directory of the init process.
    #[serde(default)]
    pub workdir: String,

    /// The program of the init process.
    pub path: String,

    /// The arguments of the init process.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub args: Vec<String>,

    /// Resource limits of the init process.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rlimits: Vec<Rlimit>,

    /// Sysctl settings.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub sysctl: BTreeMap<String, String>,

    /// Sandbox volumes mounted into the container, by volume name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub volumes: BTreeMap<String, VolumeReference>,

    /// Whether the agent initializes the rootfs.
    #[serde(default)]
    pub initialize: bool,
}

/// A volume backing a container root or declared on the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescription {
    /// The volume name.
    pub name: String,

    /// The image file, block device or directory on the host.
    pub source: String,

    /// `raw`, `qcow2`, `vfs` for a shared directory or `nas`.
    pub format: String,

    /// The filesystem on the volume.
    #[serde(default)]
    pub fstype: String,

    /// Whether the volume must be populated from the image.
    #[serde(default)]
    pub docker_volume: bool,

    /// Whether the volume is attached read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Backend specific options.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub options: BTreeMap<String, String>,
}

/// The user and groups of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupInfo {
    /// The user.
    pub user: String,

    /// The primary group.
    #[serde(default)]
    pub group: String,

    /// Supplementary groups.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub additional_groups: Vec<String>,
}

/// How a container uses one sandbox volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReference {
    /// The volume name.
    pub name: String,

    /// Where the volume is mounted.
    pub mount_points: Vec<VolumeMount>,
}

/// One mount of a volume inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// The mount point.
    pub path: String,

    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// A container known to a sandbox.
#[derive(Debug)]
pub struct ContainerContext {
    desc: ContainerDescription,
    root: Arc<DiskContext>,
    state: Mutex<ContainerState>,
}

#[derive(Debug, Default)]
struct ContainerState {
    guest: Option<Container>,
    io: Option<ProcessIo>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VolumeDescription {
    /// Returns `true` for a shared directory.
    pub fn is_dir(&self) -> bool {
        self.format == FORMAT_DIR
    }

    /// Returns `true` for a network filesystem.
    pub fn is_nas(&self) -> bool {
        self.format == FORMAT_NAS
    }

    /// Returns the disk that backs the volume.
    pub fn disk(&self) -> DiskDescriptor {
        DiskDescriptor {
            name: self.name.clone(),
            filename: self.source.clone(),
            format: self.format.clone(),
            fstype: self.fstype.clone(),
            docker_volume: self.docker_volume,
            read_only: self.read_only,
            options: self.options.clone(),
            ..Default::default()
        }
    }
}

impl ContainerDescription {
    /// Builds the init process of the container. Stream sessions are assigned by the agent
    /// connection when the container is started.
    pub fn process(&self) -> Process {
        let (user, group, additional_groups) = match &self.user {
            Some(ugi) => (
                ugi.user.clone(),
                ugi.group.clone(),
                ugi.additional_groups.clone(),
            ),
            None => Default::default(),
        };

        Process {
            id: INIT_PROCESS_ID.to_string(),
            user,
            group,
            additional_groups,
            terminal: self.tty,
            args: std::iter::once(self.path.clone())
                .chain(self.args.iter().cloned())
                .collect(),
            envs: self
                .envs
                .iter()
                .map(|(env, value)| EnvironmentVar {
                    env: env.clone(),
                    value: value.clone(),
                })
                .collect(),
            workdir: self.workdir.clone(),
            rlimits: self.rlimits.clone(),
            ..Default::default()
        }
    }
}

impl ContainerContext {
    /// Creates the context of a container whose root volume is `root`.
    pub fn new(desc: ContainerDescription, root: Arc<DiskContext>) -> Self {
        Self {
            desc,
            root,
            state: Mutex::new(ContainerState::default()),
        }
    }

    /// Recreates a container that was running before the controller restarted.
    pub(crate) fn restored(
        desc: ContainerDescription,
        root: Arc<DiskContext>,
        guest: Option<Container>,
    ) -> Self {
        Self {
            desc,
            root,
            state: Mutex::new(ContainerState { guest, io: None }),
        }
    }

    /// Returns the container id.
    pub fn id(&self) -> &str {
        &self.desc.id
    }

    /// Returns the description the container was added with.
    pub fn description(&self) -> &ContainerDescription {
        &self.desc
    }

    /// Returns the root volume.
    pub fn root(&self) -> &Arc<DiskContext> {
        &self.root
    }

    /// Returns the guest descriptor, once composed.
    pub fn guest(&self) -> Option<Container> {
        self.lock().guest.clone()
    }

    pub(crate) fn set_guest(&self, guest: Container) {
        self.lock().guest = Some(guest);
    }

    /// Keeps the stdio of the started init process until it is attached.
    pub(crate) fn set_io(&self, io: ProcessIo) {
        self.lock().io = Some(io);
    }

    /// Hands the init process stdio out. Only the first call after a start gets it.
    pub(crate) fn take_io(&self) -> Option<ProcessIo> {
        self.lock().io.take()
    }

    /// Drops the stdio of an init process that has exited.
    pub(crate) fn clear_io(&self) {
        self.lock().io = None;
    }

    /// Composes the guest descriptor once the root volume and every referenced volume are
    /// ready.
    pub fn compose(&self, volumes: &BTreeMap<String, Arc<DiskContext>>) -> HyperboxResult<Container> {
        let mut fsmap = Vec::new();
        let mut guest_volumes = Vec::new();

        for (name, reference) in &self.desc.volumes {
            let disk = volumes
                .get(name)
                .filter(|disk| disk.is_ready())
                .ok_or_else(|| HyperboxError::Device(format!("volume {name} failed to insert")))?;
            let vol = disk.descriptor();

            for mount in &reference.mount_points {
                if vol.is_dir() {
                    tracing::debug!(container = %self.desc.id, volume = %name, "fs mapping is ready");
                    fsmap.push(FsmapDescriptor {
                        source: vol.filename.clone(),
                        path: mount.path.clone(),
                        read_only: mount.read_only,
                        docker_volume: vol.docker_volume,
                    });
                } else {
                    tracing::debug!(container = %self.desc.id, volume = %name, "disk volume is ready");
                    guest_volumes.push(VolumeDescriptor {
                        device: vol.device_name.clone(),
                        addr: vol.scsi_addr.clone(),
                        mount: mount.path.clone(),
                        fstype: vol.fstype.clone(),
                        read_only: mount.read_only,
                        docker_volume: vol.docker_volume,
                    });
                }
            }
        }

        if !self.root.is_ready() {
            return Err(HyperboxError::Device(format!(
                "root volume of container {} failed to insert",
                self.desc.id
            )));
        }

        let root = self.root.descriptor();
        let (image, addr, fstype) = if self.desc.root_volume.is_dir() {
            (self.desc.root_volume.source.clone(), String::new(), String::new())
        } else {
            (root.device_name, root.scsi_addr, root.fstype)
        };

        let guest = Container {
            id: self.desc.id.clone(),
            rootfs: self.desc.rootfs.clone(),
            fstype,
            image,
            addr,
            volumes: guest_volumes,
            fsmap,
            sysctl: self.desc.sysctl.clone(),
            process: self.desc.process(),
            restart_policy: RESTART_POLICY_NEVER.to_string(),
            initialize: self.desc.initialize,
        };

        tracing::trace!(container = %self.desc.id, ?guest, "composed guest container");
        self.set_guest(guest.clone());
        Ok(guest)
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
