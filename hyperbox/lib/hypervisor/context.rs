//! The state of one sandbox, shared by its event loop, its public handle and the background
//! tasks that attach devices.
//!
//! Every operation that needs the guest or the backend runs as a spawned task and hands its
//! outcome back on a [`Completion`], so neither the event loop nor the sandbox locks are held
//! while devices are being attached.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use hyperutils::{clean_mount_path, is_root_mount, WaitGroup};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{HyperboxConfig, SandboxConfig, PCI_ADDR_FROM, SCSI_ID_FROM},
    hyperstart::{Hyperstart, Process, ProcessIo, Route, INIT_PROCESS_ID},
    HyperboxError, HyperboxResult,
};

use super::{
    disk::failure_reason, stream_copy, ContainerContext, ContainerDescription, DiskContext,
    DriverContext, GuestNicInfo, HostNicInfo, InterfaceCreated, InterfaceDescription,
    NetworkContext, ProcessFinished, ResponseCode, SandboxInfo, SandboxStats, TtyIo, VmEvent,
    VmResponse, VolumeDescription, VsockCidAllocator,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome of an operation that finishes in the background.
pub(crate) type Completion<T = ()> = oneshot::Receiver<HyperboxResult<T>>;

/// The lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// The VM is up and accepts requests.
    Running,

    /// The guest has been asked to shut down.
    Terminating,

    /// The sandbox is closed or released. Terminal.
    Closed,
}

/// Everything a [`VmContext`] is built from.
pub(crate) struct ContextInit {
    pub(crate) id: String,
    pub(crate) config: HyperboxConfig,
    pub(crate) info: SandboxInfo,
    pub(crate) dctx: Arc<dyn DriverContext>,
    pub(crate) hyperstart: Hyperstart,
    pub(crate) hub: mpsc::Sender<VmEvent>,
    pub(crate) client: mpsc::UnboundedSender<VmResponse>,
    pub(crate) cids: Arc<VsockCidAllocator>,
}

#[derive(Debug)]
pub(crate) struct VmContext {
    id: String,
    config: HyperboxConfig,
    info: SandboxInfo,
    dctx: Arc<dyn DriverContext>,
    hyperstart: Hyperstart,
    hub: mpsc::Sender<VmEvent>,
    client: Mutex<Option<mpsc::UnboundedSender<VmResponse>>>,
    cids: Arc<VsockCidAllocator>,
    networks: NetworkContext,
    state: Mutex<ContextState>,
    paused: tokio::sync::Mutex<bool>,
    closed: CancellationToken,
}

#[derive(Debug)]
pub(super) struct ContextState {
    pub(super) current: VmState,
    pub(super) pci_addr: u32,
    pub(super) scsi_id: u32,
    pub(super) mem_slot: u32,
    pub(super) cpus: u32,
    pub(super) memory_mib: u32,
    pub(super) volumes: BTreeMap<String, Arc<DiskContext>>,
    pub(super) containers: BTreeMap<String, Arc<ContainerContext>>,
    removing: HashMap<String, Vec<oneshot::Sender<HyperboxResult<()>>>>,
    timer: Option<JoinHandle<()>>,
    agent_connected: bool,
    shutdown_reported: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmContext {
    pub(crate) fn new(init: ContextInit) -> Arc<Self> {
        let boot = init.info.get_boot();
        let state = ContextState {
            current: VmState::Running,
            pci_addr: PCI_ADDR_FROM,
            scsi_id: SCSI_ID_FROM,
            mem_slot: 0,
            cpus: *boot.get_cpus(),
            memory_mib: *boot.get_memory_mib(),
            volumes: BTreeMap::new(),
            containers: BTreeMap::new(),
            removing: HashMap::new(),
            timer: None,
            agent_connected: false,
            shutdown_reported: false,
        };

        Arc::new(Self {
            networks: NetworkContext::new(*init.config.get_max_nics()),
            id: init.id,
            config: init.config,
            info: init.info,
            dctx: init.dctx,
            hyperstart: init.hyperstart,
            hub: init.hub,
            client: Mutex::new(Some(init.client)),
            cids: init.cids,
            state: Mutex::new(state),
            paused: tokio::sync::Mutex::new(false),
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn config(&self) -> &HyperboxConfig {
        &self.config
    }

    pub(crate) fn info(&self) -> &SandboxInfo {
        &self.info
    }

    pub(crate) fn dctx(&self) -> &Arc<dyn DriverContext> {
        &self.dctx
    }

    pub(crate) fn hyperstart(&self) -> &Hyperstart {
        &self.hyperstart
    }

    pub(crate) fn hub(&self) -> &mpsc::Sender<VmEvent> {
        &self.hub
    }

    pub(crate) fn networks(&self) -> &NetworkContext {
        &self.networks
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn current(&self) -> VmState {
        self.lock().current
    }

    pub(crate) fn set_current(&self, next: VmState) {
        let mut state = self.lock();
        if state.current != next {
            tracing::info!(sandbox = %self.id, from = %state.current, to = %next, "state changed");
            state.current = next;
        }
    }

    /// Records that the guest agent answered its first probe.
    pub(crate) fn mark_connected(&self) {
        self.lock().agent_connected = true;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().agent_connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn ensure_running(&self) -> HyperboxResult<()> {
        if self.current() != VmState::Running {
            return Err(HyperboxError::NotReady(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn next_scsi_id(&self) -> u32 {
        let mut state = self.lock();
        let id = state.scsi_id;
        state.scsi_id += 1;
        id
    }

    pub(crate) fn next_pci_addr(&self) -> u32 {
        let mut state = self.lock();
        let addr = state.pci_addr;
        state.pci_addr += 1;
        addr
    }

    pub(crate) fn container(&self, id: &str) -> Option<Arc<ContainerContext>> {
        self.lock().containers.get(id).cloned()
    }

    pub(crate) fn volume(&self, name: &str) -> Option<Arc<DiskContext>> {
        self.lock().volumes.get(name).cloned()
    }

    pub(crate) fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub(crate) fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    /// Registers a container, waits for its root volume and every volume it mounts, then
    /// composes its guest descriptor.
    ///
    /// The container is visible right away, but the completion resolves only once every
    /// disk it depends on is ready.
    pub(crate) fn add_container(
        self: &Arc<Self>,
        mut desc: ContainerDescription,
    ) -> HyperboxResult<Completion> {
        for (name, reference) in desc.volumes.iter_mut() {
            for mount in reference.mount_points.iter_mut() {
                let path = clean_mount_path(&mount.path).map_err(|e| {
                    HyperboxError::Spec(format!("container {}: volume {name}: {e}", desc.id))
                })?;
                if is_root_mount(&path) {
                    return Err(HyperboxError::Spec(format!(
                        "container {} mounts volume {name} onto its rootfs",
                        desc.id
                    )));
                }
                mount.path = path;
            }
        }

        let wg = WaitGroup::new();
        let root = Arc::new(DiskContext::new(desc.root_volume.disk(), true));
        let id = desc.id.clone();
        {
            let mut state = self.lock();
            if state.current != VmState::Running {
                return Err(HyperboxError::NotReady(self.id.clone()));
            }
            if state.containers.contains_key(&id) {
                return Err(HyperboxError::Spec(format!("container {id} already exists")));
            }

            let mut volumes = Vec::with_capacity(desc.volumes.len());
            for name in desc.volumes.keys() {
                match state.volumes.get(name) {
                    Some(disk) => volumes.push(disk.clone()),
                    None => {
                        return Err(HyperboxError::Spec(format!(
                            "container {id} references undeclared volume {name}"
                        )))
                    }
                }
            }

            for disk in &volumes {
                disk.wait(&id, &wg);
            }
            root.wait(&id, &wg);
            state.containers.insert(
                id.clone(),
                Arc::new(ContainerContext::new(desc, root.clone())),
            );
        }
        tracing::info!(sandbox = %self.id, container = %id, waiting = wg.outstanding(), "container added");

        let ctx = self.clone();
        tokio::spawn(async move {
            if let Err(e) = root.insert(&*ctx.dctx, &ctx.info, || ctx.next_scsi_id()).await {
                tracing::error!(sandbox = %ctx.id, error = %e, "root volume insert failed");
            }
        });

        let (tx, rx) = oneshot::channel();
        let ctx = self.clone();
        tokio::spawn(async move {
            let ready = tokio::select! {
                _ = wg.wait() => true,
                _ = ctx.closed.cancelled() => false,
            };

            let result = if !ready {
                Err(HyperboxError::NotReady(ctx.id.clone()))
            } else {
                match ctx.container(&id) {
                    Some(container) => {
                        let volumes = ctx.lock().volumes.clone();
                        container.compose(&volumes).map(drop)
                    }
                    None => Err(HyperboxError::NotFound(format!(
                        "container {id} was removed while its volumes were inserted"
                    ))),
                }
            };

            match &result {
                Ok(()) => tracing::info!(sandbox = %ctx.id, container = %id, "container ready"),
                Err(e) => tracing::error!(sandbox = %ctx.id, container = %id, error = %e, "container failed"),
            }
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    /// Unregisters a container from its volumes and unplugs its root volume.
    ///
    /// Volumes it mounted stay attached; a volume whose removal was requested while in use is
    /// unplugged once its last container is gone.
    pub(crate) fn remove_container(self: &Arc<Self>, id: &str) -> HyperboxResult<Completion> {
        let (container, volumes) = {
            let mut state = self.lock();
            if state.current != VmState::Running {
                return Err(HyperboxError::NotReady(self.id.clone()));
            }
            let Some(container) = state.containers.remove(id) else {
                tracing::debug!(sandbox = %self.id, container = id, "container already absent");
                return Ok(completed(Ok(())));
            };
            let volumes: Vec<_> = container
                .description()
                .volumes
                .keys()
                .filter_map(|name| state.volumes.get(name).cloned())
                .collect();
            (container, volumes)
        };

        for disk in &volumes {
            disk.unwait(id);
        }
        container.root().unwait(id);
        self.hyperstart.forget_container(id);
        tracing::info!(sandbox = %self.id, container = id, "container removed");

        for disk in &volumes {
            self.finish_pending_removal(&disk.name());
        }

        // A root still being inserted is unplugged once its insert lands.
        let root = container.root().clone();
        let ctx = self.clone();
        Ok(self.spawn_completion(async move {
            if !root.is_ready() {
                let inserted = tokio::select! {
                    result = root.inserted_or_failed() => result.is_ok(),
                    _ = ctx.closed.cancelled() => false,
                };
                if !inserted || !root.is_ready() {
                    tracing::debug!(sandbox = %ctx.id, disk = %root.name(), "root volume was never inserted");
                    return Ok(());
                }
            }
            root.remove(&*ctx.dctx, &ctx.info).await
        }))
    }

    /// Declares a volume and inserts it unless it is already known.
    pub(crate) fn add_volume(self: &Arc<Self>, desc: VolumeDescription) -> HyperboxResult<Completion> {
        let disk = {
            let mut state = self.lock();
            if state.current != VmState::Running {
                return Err(HyperboxError::NotReady(self.id.clone()));
            }
            if let Some(known) = state.volumes.get(&desc.name).cloned() {
                if let Some(waiters) = state.removing.remove(&desc.name) {
                    tracing::info!(sandbox = %self.id, volume = %desc.name, "pending volume removal cancelled");
                    for waiter in waiters {
                        let _ = waiter.send(Err(HyperboxError::Conflict(format!(
                            "volume {} was added again before its removal",
                            desc.name
                        ))));
                    }
                }

                tracing::warn!(sandbox = %self.id, volume = %desc.name, "volume already added");
                if known.is_ready() {
                    return Ok(completed(Ok(())));
                }
                drop(state);
                let ctx = self.clone();
                return Ok(self.spawn_completion(async move {
                    tokio::select! {
                        result = known.inserted_or_failed() => result,
                        _ = ctx.closed.cancelled() => Err(HyperboxError::NotReady(ctx.id.clone())),
                    }
                }));
            }

            let disk = Arc::new(DiskContext::new(desc.disk(), false));
            state.volumes.insert(desc.name.clone(), disk.clone());
            disk
        };

        if disk.is_ready() {
            tracing::debug!(sandbox = %self.id, volume = %desc.name, "volume needs no hotplug");
            return Ok(completed(Ok(())));
        }

        let ctx = self.clone();
        Ok(self.spawn_completion(async move {
            let result = disk.insert(&*ctx.dctx, &ctx.info, || ctx.next_scsi_id()).await;
            if result.is_err() {
                // A failed volume is forgotten so that it can be added again.
                let mut state = ctx.lock();
                if state
                    .volumes
                    .get(&desc.name)
                    .is_some_and(|known| Arc::ptr_eq(known, &disk))
                {
                    state.volumes.remove(&desc.name);
                }
            }
            result
        }))
    }

    /// Removes a volume. A volume still used by containers is removed once the last of them
    /// is gone, and the completion resolves then.
    pub(crate) fn remove_volume(self: &Arc<Self>, name: &str) -> HyperboxResult<Completion> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.current != VmState::Running {
                return Err(HyperboxError::NotReady(self.id.clone()));
            }
            let Some(disk) = state.volumes.get(name) else {
                tracing::debug!(sandbox = %self.id, volume = name, "volume already absent");
                return Ok(completed(Ok(())));
            };

            let users = disk.containers();
            state.removing.entry(name.to_string()).or_default().push(tx);
            if users > 0 {
                tracing::info!(sandbox = %self.id, volume = name, users, "volume removal deferred");
                return Ok(rx);
            }
        }

        self.finish_pending_removal(name);
        Ok(rx)
    }

    fn finish_pending_removal(self: &Arc<Self>, name: &str) {
        let (disk, waiters) = {
            let mut state = self.lock();
            let idle = state
                .volumes
                .get(name)
                .is_some_and(|disk| disk.containers() == 0);
            if !idle || !state.removing.contains_key(name) {
                return;
            }

            let waiters = state.removing.remove(name).unwrap_or_default();
            match state.volumes.remove(name) {
                Some(disk) => (disk, waiters),
                None => return,
            }
        };

        tracing::info!(sandbox = %self.id, volume = name, "removing volume");
        let ctx = self.clone();
        tokio::spawn(async move {
            let result = disk.remove(&*ctx.dctx, &ctx.info).await;
            if let Err(e) = &result {
                tracing::error!(sandbox = %ctx.id, volume = %disk.name(), error = %e, "volume removal failed");
            }
            for waiter in waiters {
                let _ = waiter.send(clone_result(&result));
            }
        });
    }

    /// Hotplugs a network interface. Loopback aliases only record their address.
    pub(crate) fn add_interface(
        self: &Arc<Self>,
        inf: InterfaceDescription,
    ) -> HyperboxResult<Completion> {
        self.ensure_running()?;
        if inf.lo {
            self.networks.add_lo(&inf)?;
            return Ok(completed(Ok(())));
        }

        let (slot, device_name) = self.networks.apply_slot(&inf.id)?;
        let ctx = self.clone();
        Ok(self.spawn_completion(async move {
            let result = ctx.insert_interface(&inf, slot, device_name).await;
            if result.is_err() {
                ctx.networks.free_slot(slot);
            }
            result
        }))
    }

    async fn insert_interface(
        &self,
        inf: &InterfaceDescription,
        slot: usize,
        device_name: String,
    ) -> HyperboxResult<()> {
        let pci_addr = self.next_pci_addr();
        let settings = self
            .dctx
            .configure_network(&self.info, inf)
            .await
            .map_err(|e| HyperboxError::Device(format!("interface {}: {e}", inf.id)))?;
        let created =
            InterfaceCreated::from_settings(&inf.id, slot, pci_addr, device_name, &settings)?;

        let host = HostNicInfo {
            id: inf.id.clone(),
            device: settings.device.clone(),
            mac: settings.mac.clone(),
            bridge: settings.bridge.clone(),
            gateway: settings.gateway.clone(),
        };
        let guest = GuestNicInfo {
            device: created.device_name.clone(),
            ip_addr: created.ip_addr.clone(),
            index: slot,
            bus_addr: pci_addr,
        };

        tracing::debug!(sandbox = %self.id, interface = %inf.id, slot, pci_addr, "inserting interface");
        let (tx, rx) = oneshot::channel();
        self.dctx.add_nic(&self.info, &host, &guest, tx);
        match rx.await {
            Ok(VmEvent::NetDevInserted { .. }) => {
                tracing::info!(sandbox = %self.id, interface = %inf.id, device = %created.device_name, "interface inserted");
                self.networks.configured(created);
                Ok(())
            }
            Ok(event) => Err(HyperboxError::Device(format!(
                "interface {} insert failed: {}",
                inf.id,
                failure_reason(&event)
            ))),
            Err(_) => Err(HyperboxError::Device(format!(
                "interface {} insert session broken",
                inf.id
            ))),
        }
    }

    /// Unplugs a network interface.
    pub(crate) fn remove_interface(self: &Arc<Self>, id: &str) -> HyperboxResult<Completion> {
        self.ensure_running()?;
        let Some(inf) = self.networks.get_interface(id) else {
            tracing::debug!(sandbox = %self.id, interface = id, "interface already absent");
            return Ok(completed(Ok(())));
        };

        if inf.is_lo() {
            self.networks.remove_lo(id);
            return Ok(completed(Ok(())));
        }
        if !self.networks.has_slot(inf.index) {
            self.networks.forget(id);
            return Ok(completed(Ok(())));
        }

        let ctx = self.clone();
        Ok(self.spawn_completion(async move {
            let (tx, rx) = oneshot::channel();
            let callback = VmEvent::NetDevRemoved { index: inf.index };
            ctx.dctx.remove_nic(&ctx.info, &inf, callback, tx);
            match rx.await {
                Ok(VmEvent::NetDevRemoved { .. }) => {
                    tracing::info!(sandbox = %ctx.id, interface = %inf.id, "interface removed");
                    ctx.networks.free_slot(inf.index);
                    Ok(())
                }
                Ok(event) => Err(HyperboxError::Device(format!(
                    "interface {} remove failed: {}",
                    inf.id,
                    failure_reason(&event)
                ))),
                Err(_) => Err(HyperboxError::Device(format!(
                    "interface {} remove session broken",
                    inf.id
                ))),
            }
        }))
    }

    /// Configures an inserted interface inside the guest and installs its routes.
    pub(crate) async fn update_interface(&self, id: &str) -> HyperboxResult<()> {
        let inf = self
            .networks
            .get_interface(id)
            .ok_or_else(|| HyperboxError::NotFound(format!("interface {id}")))?;

        self.hyperstart
            .update_interface(&inf.device_name, &inf.ip_addr, &inf.net_mask)
            .await?;

        let routes: Vec<_> = inf
            .route_table
            .iter()
            .map(|rule| Route {
                dest: rule.destination.clone(),
                gateway: rule.gateway.clone(),
                device: inf.device_name.clone(),
            })
            .collect();
        if !routes.is_empty() {
            self.hyperstart.add_route(&routes).await?;
        }
        Ok(())
    }

    /// Sends the sandbox description to the guest and reports the outcome.
    pub(crate) async fn init_sandbox(&self, config: SandboxConfig) -> HyperboxResult<()> {
        self.ensure_running()?;
        self.networks.set_config(config);
        let pod = self.networks.sandbox_info();

        match self.hyperstart.start_sandbox(&pod).await {
            Ok(()) => {
                tracing::info!(sandbox = %self.id, hostname = %pod.hostname, "sandbox started");
                self.report(VmResponse::new(&self.id, ResponseCode::PodRunning, "sandbox started"));
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox = %self.id, error = %e, "sandbox start failed");
                self.report(VmResponse::new(&self.id, ResponseCode::Failed, e.to_string()));
                Err(e)
            }
        }
    }

    /// Creates a composed container in the guest and starts its init process.
    pub(crate) async fn start_container(self: &Arc<Self>, id: &str) -> HyperboxResult<()> {
        self.ensure_running()?;
        let container = self
            .container(id)
            .ok_or_else(|| HyperboxError::NotFound(format!("container {id}")))?;
        let mut guest = container
            .guest()
            .ok_or_else(|| HyperboxError::Spec(format!("container {id} is not ready")))?;

        let io = self.hyperstart.new_container(guest.clone()).await?;
        guest.process.id = INIT_PROCESS_ID.to_string();
        guest.process.stdio = io.stdio_seq;
        guest.process.stderr = io.stderr_seq;
        container.set_guest(guest);
        container.set_io(io);
        tracing::info!(sandbox = %self.id, container = id, "container started");

        self.watch_container(id.to_string());
        Ok(())
    }

    /// Reattaches to a container that was running before the controller restarted.
    ///
    /// Returns `false` if the guest no longer runs it. Connection errors are returned.
    pub(crate) async fn restore_container(self: &Arc<Self>, id: &str) -> HyperboxResult<bool> {
        let container = self
            .container(id)
            .ok_or_else(|| HyperboxError::NotFound(format!("container {id}")))?;
        let guest = container
            .guest()
            .ok_or_else(|| HyperboxError::Spec(format!("container {id} was never started")))?;

        match self.hyperstart.restore_container(&guest).await {
            Ok(io) => {
                container.set_io(io);
                self.watch_container(id.to_string());
                tracing::info!(sandbox = %self.id, container = id, "container restored");
                Ok(true)
            }
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => {
                tracing::warn!(sandbox = %self.id, container = id, error = %e, "container not restored");
                Ok(false)
            }
        }
    }

    fn watch_container(self: &Arc<Self>, id: String) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let code = ctx.hyperstart.wait_process(&id, INIT_PROCESS_ID).await;
            tracing::info!(sandbox = %ctx.id, container = %id, code, "container finished");
            if let Some(container) = ctx.container(&id) {
                container.clear_io();
            }
            ctx.report(VmResponse::finished(
                &ctx.id,
                ResponseCode::ContainerFinished,
                ProcessFinished { id, code },
            ));
        });
    }

    /// Connects `tty` to the init process of a container. A container can be attached once
    /// per start.
    pub(crate) fn attach(&self, id: &str, tty: TtyIo) -> HyperboxResult<JoinHandle<()>> {
        let container = self
            .container(id)
            .ok_or_else(|| HyperboxError::NotFound(format!("container {id}")))?;
        let io = container.take_io().ok_or_else(|| {
            HyperboxError::Conflict(format!("container {id} is not running or already attached"))
        })?;

        tracing::debug!(sandbox = %self.id, container = id, session = io.stdio_seq, "attaching");
        Ok(tokio::spawn(stream_copy(tty, io)))
    }

    /// Starts an additional process and reports its exit as [`ResponseCode::ExecFinished`].
    pub(crate) async fn add_process(
        self: &Arc<Self>,
        container: &str,
        process: Process,
    ) -> HyperboxResult<ProcessIo> {
        self.ensure_running()?;
        if self.container(container).is_none() {
            return Err(HyperboxError::NotFound(format!("container {container}")));
        }

        let exec_id = process.id.clone();
        let io = self.hyperstart.add_process(container, process).await?;
        tracing::info!(sandbox = %self.id, container, process = %exec_id, "process started");

        let ctx = self.clone();
        let container = container.to_string();
        tokio::spawn(async move {
            let code = ctx.hyperstart.wait_process(&container, &exec_id).await;
            tracing::info!(sandbox = %ctx.id, container = %container, process = %exec_id, code, "process finished");
            ctx.report(VmResponse::finished(
                &ctx.id,
                ResponseCode::ExecFinished,
                ProcessFinished { id: exec_id, code },
            ));
        });

        Ok(io)
    }

    /// Grows the VM to `cpus` vCPUs. Shrinking is a no-op.
    pub(crate) async fn set_cpus(&self, cpus: u32) -> HyperboxResult<()> {
        self.ensure_running()?;
        let current = self.lock().cpus;
        if cpus <= current {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.dctx.set_cpus(&self.info, cpus, tx);
        await_backend(rx, "set cpus").await?;
        self.lock().cpus = cpus;
        tracing::info!(sandbox = %self.id, cpus, "vcpus added");
        Ok(())
    }

    /// Grows the VM memory to `memory_mib`. Shrinking is a no-op.
    pub(crate) async fn add_mem(&self, memory_mib: u32) -> HyperboxResult<()> {
        self.ensure_running()?;
        let (current, slot) = {
            let state = self.lock();
            (state.memory_mib, state.mem_slot)
        };
        if memory_mib <= current {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.dctx.add_mem(&self.info, slot, memory_mib - current, tx);
        await_backend(rx, "add memory").await?;

        let mut state = self.lock();
        state.memory_mib = memory_mib;
        state.mem_slot += 1;
        tracing::info!(sandbox = %self.id, memory_mib, "memory added");
        Ok(())
    }

    /// Pauses or resumes the VM. Agent commands are held back while paused.
    pub(crate) async fn pause(&self, pause: bool) -> HyperboxResult<()> {
        self.ensure_running()?;
        let mut paused = self.paused.lock().await;
        if *paused == pause {
            return Ok(());
        }

        if pause {
            self.hyperstart.pause(true);
        }

        let (tx, rx) = oneshot::channel();
        self.dctx.pause(&self.info, pause, tx);
        if let Err(e) = await_backend(rx, "pause").await {
            if pause {
                self.hyperstart.pause(false);
            }
            return Err(e);
        }

        if !pause {
            self.hyperstart.pause(false);
        }
        *paused = pause;
        tracing::info!(sandbox = %self.id, paused = pause, "pause state changed");
        Ok(())
    }

    pub(crate) async fn is_paused(&self) -> bool {
        *self.paused.lock().await
    }

    /// Saves the VM state. The VM must be paused.
    pub(crate) async fn save(&self, path: &Path) -> HyperboxResult<()> {
        let paused = self.paused.lock().await;
        if !*paused {
            return Err(HyperboxError::Conflict(format!(
                "sandbox {} must be paused before it is saved",
                self.id
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.dctx.save(&self.info, path, tx);
        await_backend(rx, "save").await?;
        drop(paused);

        tracing::info!(sandbox = %self.id, path = %path.display(), "sandbox saved");
        Ok(())
    }

    pub(crate) async fn stats(&self) -> HyperboxResult<SandboxStats> {
        self.ensure_running()?;
        let (tx, rx) = oneshot::channel();
        self.dctx.stats(&self.info, tx);
        await_backend(rx, "stats").await
    }

    /// Asks the guest to tear the sandbox down, then powers the VM off.
    ///
    /// The shutdown timer is armed first, so a guest that never answers still gets the VM
    /// powered off.
    pub(crate) fn shutdown_vm(self: &Arc<Self>) {
        self.arm_timer();
        let ctx = self.clone();
        tokio::spawn(async move {
            match ctx.hyperstart.destroy_sandbox().await {
                Ok(()) => {
                    tracing::info!(sandbox = %ctx.id, "guest sandbox destroyed, powering off");
                    ctx.poweroff();
                }
                Err(_) if ctx.is_closed() => {}
                Err(e) => {
                    tracing::error!(sandbox = %ctx.id, error = %e, "guest sandbox destroy failed");
                    ctx.poweroff();
                    ctx.close().await;
                }
            }
        });
    }

    /// Kills the VM through the backend.
    pub(crate) fn poweroff(&self) {
        tracing::info!(sandbox = %self.id, "powering off");
        self.dctx.kill(&self.info, self.hub.clone());
    }

    fn arm_timer(&self) {
        let hub = self.hub.clone();
        let timeout = self.config.shutdown_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = hub.send(VmEvent::VmTimeout).await;
        });

        if let Some(previous) = self.lock().timer.replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn report(&self, response: VmResponse) {
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        match client.as_ref() {
            Some(client) => {
                tracing::trace!(sandbox = %self.id, code = %response.code, "reporting");
                let _ = client.send(response);
            }
            None => {
                tracing::debug!(sandbox = %self.id, code = %response.code, "no client to report to")
            }
        }
    }

    pub(crate) fn report_vm_run(&self) {
        self.report(VmResponse::new(&self.id, ResponseCode::VmRunning, "VM is running"));
    }

    pub(crate) fn report_success(&self, cause: &str) {
        self.report(VmResponse::new(&self.id, ResponseCode::Ok, cause));
    }

    pub(crate) fn report_vm_fault(&self, cause: &str) {
        self.report(VmResponse::new(&self.id, ResponseCode::Failed, cause));
    }

    pub(crate) fn report_unexpected(&self, event: &VmEvent, state: VmState) {
        let error = HyperboxError::UnexpectedRequest {
            event: event.to_string(),
            state: state.to_string(),
        };
        tracing::warn!(sandbox = %self.id, %error, "rejecting request");
        self.report(VmResponse::new(&self.id, ResponseCode::Unexpected, error.to_string()));
    }

    /// Reports the shutdown once. Later calls are no-ops.
    pub(crate) fn report_vm_shutdown(&self) {
        {
            let mut state = self.lock();
            if state.shutdown_reported {
                return;
            }
            state.shutdown_reported = true;
        }
        self.report(VmResponse::new(&self.id, ResponseCode::VmShutdown, "VM shut down"));
    }

    /// Stops managing the VM without stopping it. The backend keeps the VM running.
    pub(crate) fn release(&self) {
        let timer = {
            let mut state = self.lock();
            state.current = VmState::Closed;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.closed.cancel();
        self.hyperstart.close();
        self.report_success("VM released");
        self.drop_client();
        tracing::info!(sandbox = %self.id, "sandbox released");
    }

    /// Releases every resource of the sandbox. Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }

        let (timer, removing) = {
            let mut state = self.lock();
            state.current = VmState::Closed;
            (state.timer.take(), std::mem::take(&mut state.removing))
        };
        self.closed.cancel();
        if let Some(timer) = timer {
            timer.abort();
        }

        self.hyperstart.close();
        self.networks.close();
        self.dctx.close();

        for waiter in removing.into_values().flatten() {
            let _ = waiter.send(Err(HyperboxError::NotReady(self.id.clone())));
        }

        self.report_vm_shutdown();
        self.drop_client();

        if let Err(e) = tokio::fs::remove_dir_all(self.info.get_share_dir()).await {
            tracing::debug!(sandbox = %self.id, error = %e, "share dir not removed");
        }

        let cid = *self.info.get_guest_cid();
        if cid != 0 {
            self.cids.release(cid);
        }

        tracing::info!(sandbox = %self.id, "sandbox closed");
    }

    fn drop_client(&self) {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn spawn_completion<F>(&self, fut: F) -> Completion
    where
        F: std::future::Future<Output = HyperboxResult<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a completion that has already resolved.
pub(crate) fn completed<T>(result: HyperboxResult<T>) -> Completion<T> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

/// Waits for a completion. A completion whose task went away means the sandbox closed.
pub(crate) async fn resolve<T>(id: &str, completion: Completion<T>) -> HyperboxResult<T> {
    completion
        .await
        .unwrap_or_else(|_| Err(HyperboxError::NotReady(id.to_string())))
}

async fn await_backend<T>(rx: oneshot::Receiver<HyperboxResult<T>>, what: &str) -> HyperboxResult<T> {
    rx.await
        .map_err(|_| HyperboxError::Device(format!("{what} session broken")))?
}

fn clone_result(result: &HyperboxResult<()>) -> HyperboxResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(HyperboxError::Device(e.to_string())),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => write!(f, "RUNNING"),
            VmState::Terminating => write!(f, "TERMINATING"),
            VmState::Closed => write!(f, "CLOSED"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
