//! The public handle of a sandbox.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use futures::future;
use hyperutils::SocketAddress;
use nix::sys::signal::Signal;
use tokio::{io::AsyncReadExt, sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    config::{
        BootConfig, SandboxConfig, CONSOLE_LOG_NAME, SHARE_DIR_NAME, STREAM_SEQ_FROM,
        VSOCK_CTL_PORT, VSOCK_STREAM_PORT,
    },
    hyperstart::{
        codes::HYPERSTART_EXEC_CONTAINER, EnvironmentVar, Hyperstart, Process, ProcessIo,
        INIT_PROCESS_ID,
    },
    HyperboxError, HyperboxResult,
};

use super::{
    console::watch_console,
    context::{resolve, ContextInit, VmContext},
    run_loop,
    watch::{interrupt_on_close, keepalive},
    ContainerDescription, DriverContext, Fanout, Hypervisor, InterfaceDescription, PersistInfo,
    ProcessExit, ResponseCode, SandboxInfo, SandboxStats, Subscriber, TtyIo, VmEvent, VmResponse,
    VmState, VolumeDescription,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running sandbox.
///
/// Requests are forwarded to the sandbox controller; lifecycle commands go through its event
/// loop and are answered on the response fan-out.
#[derive(Debug)]
pub struct Vm {
    id: String,
    ctx: Arc<VmContext>,
    clients: Fanout,
}

/// An additional process to start in a container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// The process id, unique within the container.
    pub id: String,

    /// The command line.
    pub args: Vec<String>,

    /// The environment as `KEY=VALUE` strings. Entries without `=` are skipped.
    pub envs: Vec<String>,

    /// The working directory.
    pub workdir: String,

    /// Whether the process gets a terminal.
    pub terminal: bool,

    /// The user to run as.
    pub user: String,

    /// The group to run as.
    pub group: String,

    /// Supplementary groups.
    pub additional_groups: Vec<String>,
}

/// The captured output of a command run by the agent itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout.
    pub stdout: Vec<u8>,

    /// Everything the command wrote to stderr.
    pub stderr: Vec<u8>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Vm {
    /// Boots a new sandbox.
    ///
    /// Without an `id` one of the form `vm-xxxxxxxxxx` is generated. The call returns once the
    /// VM has been launched; use [`wait_init`](Self::wait_init) to wait for the guest agent.
    pub async fn launch(
        hypervisor: &Hypervisor,
        id: Option<String>,
        boot: BootConfig,
    ) -> HyperboxResult<Self> {
        boot.validate()?;
        let id = id.unwrap_or_else(generate_id);
        let home = hypervisor.get_config().sandbox_home(&id);
        let share_dir = home.join(SHARE_DIR_NAME);
        tokio::fs::create_dir_all(&share_dir).await?;

        let guest_cid = if *boot.get_enable_vsock() {
            if !hypervisor.get_driver().supports_vsock() {
                return Err(HyperboxError::Spec(format!(
                    "driver {} does not support vsock",
                    hypervisor.get_driver().name()
                )));
            }
            hypervisor.get_cids().allocate()?
        } else {
            0
        };

        let dctx = match hypervisor.get_driver().init_context(&home) {
            Ok(dctx) => dctx,
            Err(e) => {
                if guest_cid != 0 {
                    hypervisor.get_cids().release(guest_cid);
                }
                return Err(e);
            }
        };

        let info = SandboxInfo::new(&id, home, share_dir, guest_cid, boot);
        let (vm, events) = Self::assemble(hypervisor, info, dctx, STREAM_SEQ_FROM, true);
        tracing::info!(sandbox = %vm.id, driver = %hypervisor.get_driver().name(), guest_cid, "launching sandbox");
        vm.ctx.dctx().launch(vm.ctx.info(), vm.ctx.hub().clone());
        vm.spawn_tasks(events);

        Ok(vm)
    }

    /// Takes over a sandbox whose VM kept running while no controller managed it.
    ///
    /// `persisted` is the output of [`dump`](Self::dump). Containers must be reattached with
    /// [`associate_container`](Self::associate_container).
    pub async fn associate(hypervisor: &Hypervisor, persisted: &[u8]) -> HyperboxResult<Self> {
        let pinfo = PersistInfo::from_slice(persisted)?;
        let dctx = hypervisor.get_driver().load_context(&pinfo.driver_info)?;

        let guest_cid = pinfo.hw_stat.guest_cid;
        if guest_cid != 0 {
            hypervisor.get_cids().mark_used(guest_cid)?;
        }

        let home = hypervisor.get_config().sandbox_home(&pinfo.id);
        let share_dir = home.join(SHARE_DIR_NAME);
        let info = SandboxInfo::new(&pinfo.id, home, share_dir, guest_cid, pinfo.boot.clone());
        let (vm, events) = Self::assemble(hypervisor, info, dctx, pinfo.hw_stat.attach_id, false);

        if let Err(e) = vm.ctx.restore(&pinfo) {
            vm.ctx.hyperstart().close();
            if guest_cid != 0 {
                hypervisor.get_cids().release(guest_cid);
            }
            return Err(e);
        }

        tracing::info!(sandbox = %vm.id, "associating sandbox");
        vm.ctx.dctx().associate(vm.ctx.info(), vm.ctx.hub().clone());
        vm.spawn_tasks(events);

        Ok(vm)
    }

    fn assemble(
        hypervisor: &Hypervisor,
        info: SandboxInfo,
        dctx: Arc<dyn DriverContext>,
        last_stream_seq: u64,
        wait_ready: bool,
    ) -> (Self, mpsc::Receiver<VmEvent>) {
        let config = hypervisor.get_config().clone();
        let (ctl, stream) = agent_addresses(&info);
        let hyperstart = Hyperstart::connect(
            ctl,
            stream,
            last_stream_seq,
            wait_ready,
            config.response_timeout(),
        );

        let capacity = *config.get_channel_capacity();
        let (hub, events) = mpsc::channel(capacity);
        let (client, upstream) = mpsc::unbounded_channel();
        let clients = Fanout::new(upstream, capacity, true);

        let id = info.get_id().clone();
        let ctx = VmContext::new(ContextInit {
            id: id.clone(),
            config,
            info,
            dctx,
            hyperstart,
            hub,
            client,
            cids: hypervisor.get_cids().clone(),
        });

        (Self { id, ctx, clients }, events)
    }

    fn spawn_tasks(&self, events: mpsc::Receiver<VmEvent>) {
        let ctx = &self.ctx;
        let config = ctx.config();
        let cancel = ctx.closed_token().clone();

        tokio::spawn(keepalive(
            self.id.clone(),
            ctx.hyperstart().clone(),
            ctx.hub().clone(),
            config.ping_interval(),
            config.response_timeout(),
            cancel.clone(),
        ));
        tokio::spawn(interrupt_on_close(
            self.id.clone(),
            ctx.hyperstart().clone(),
            ctx.hub().clone(),
            cancel.clone(),
        ));
        tokio::spawn(watch_console(
            self.id.clone(),
            SocketAddress::Unix(ctx.info().get_console_sock().clone()),
            ctx.info().get_home_dir().join(CONSOLE_LOG_NAME),
            config.response_timeout(),
            cancel,
        ));
        tokio::spawn(run_loop(ctx.clone(), events));
    }

    /// Returns the sandbox id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> VmState {
        self.ctx.current()
    }

    /// Returns what the backend knows about the sandbox.
    pub fn info(&self) -> &SandboxInfo {
        self.ctx.info()
    }

    /// Subscribes to the responses of the sandbox.
    pub fn subscribe(&self) -> Subscriber {
        self.clients.acquire()
    }

    /// Waits for the first response accepted by `matcher`.
    pub async fn wait_response<F>(
        &self,
        matcher: F,
        timeout: Option<Duration>,
    ) -> HyperboxResult<VmResponse>
    where
        F: Fn(&VmResponse) -> bool,
    {
        let mut sub = self.clients.acquire();
        self.next_matching(&mut sub, matcher, timeout).await
    }

    /// Waits until the guest agent is up.
    pub async fn wait_init(&self, timeout: Option<Duration>) -> HyperboxResult<()> {
        let mut sub = self.clients.acquire();
        if self.ctx.is_connected() {
            return Ok(());
        }

        let response = self
            .next_matching(
                &mut sub,
                |r| {
                    matches!(
                        r.code,
                        ResponseCode::VmRunning | ResponseCode::Failed | ResponseCode::VmShutdown
                    )
                },
                timeout,
            )
            .await?;

        match response.code {
            ResponseCode::VmRunning => Ok(()),
            _ => Err(HyperboxError::NotReady(format!(
                "{}: {}",
                self.id, response.cause
            ))),
        }
    }

    /// Waits until the sandbox is gone.
    pub async fn wait_vm(&self, timeout: Option<Duration>) -> HyperboxResult<()> {
        let mut sub = self.clients.acquire();
        match self
            .next_matching(&mut sub, |r| r.code == ResponseCode::VmShutdown, timeout)
            .await
        {
            Ok(_) | Err(HyperboxError::NotReady(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Streams the exits of the given container init processes, or of the given additional
    /// processes when `is_container` is false.
    ///
    /// The channel closes once every process has exited, when the sandbox shuts down, or
    /// when `timeout` elapses.
    pub fn wait_process(
        &self,
        is_container: bool,
        ids: Vec<String>,
        timeout: Option<Duration>,
    ) -> mpsc::Receiver<ProcessExit> {
        let code = if is_container {
            ResponseCode::ContainerFinished
        } else {
            ResponseCode::ExecFinished
        };
        let (tx, rx) = mpsc::channel(ids.len().max(1));
        let mut sub = self.clients.acquire();
        let mut pending: HashSet<String> = ids.into_iter().collect();
        let id = self.id.clone();

        tokio::spawn(async move {
            let watch = async {
                while !pending.is_empty() {
                    let Some(response) = sub.recv().await else {
                        break;
                    };
                    if response.code == ResponseCode::VmShutdown {
                        break;
                    }
                    if response.code != code {
                        continue;
                    }

                    let Some(process) = response.process else {
                        continue;
                    };
                    if pending.remove(&process.id) {
                        let exit = ProcessExit {
                            id: process.id,
                            code: process.code,
                            finished_at: Utc::now(),
                        };
                        if tx.send(exit).await.is_err() {
                            break;
                        }
                    }
                }
            };

            match timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, watch).await.is_err() {
                        tracing::debug!(sandbox = %id, "process wait timed out");
                    }
                }
                None => watch.await,
            }
        });

        rx
    }

    /// Shuts the sandbox down and waits until it is gone.
    pub async fn shutdown(&self) -> HyperboxResult<()> {
        let mut sub = self.clients.acquire();
        if self.ctx.is_closed() {
            return Ok(());
        }
        if self.ctx.hub().send(VmEvent::Shutdown).await.is_err() {
            return Ok(());
        }

        loop {
            match sub.recv().await {
                None => return Ok(()),
                Some(r) if r.code == ResponseCode::VmShutdown => return Ok(()),
                Some(r) if r.code == ResponseCode::Unexpected => {
                    return Err(HyperboxError::Conflict(r.cause))
                }
                Some(_) => {}
            }
        }
    }

    /// Stops managing the VM and leaves it running.
    pub async fn release_vm(&self) -> HyperboxResult<()> {
        let mut sub = self.clients.acquire();
        self.ctx
            .hub()
            .send(VmEvent::Release)
            .await
            .map_err(|_| HyperboxError::NotReady(self.id.clone()))?;

        loop {
            match sub.recv().await {
                None => return Err(HyperboxError::NotReady(self.id.clone())),
                Some(r) if r.code == ResponseCode::Ok => return Ok(()),
                Some(r) if r.code == ResponseCode::Unexpected => {
                    return Err(HyperboxError::Conflict(r.cause))
                }
                Some(_) => {}
            }
        }
    }

    /// Kills the VM without asking the guest first and waits until the sandbox is gone.
    ///
    /// If the backend does not confirm within the shutdown timeout, the sandbox is closed
    /// anyway.
    pub async fn kill(&self) -> HyperboxResult<()> {
        let mut sub = self.clients.acquire();
        if self.ctx.is_closed() {
            return Ok(());
        }

        self.ctx.poweroff();
        let timeout = self.ctx.config().shutdown_timeout();
        let done = self
            .next_matching(&mut sub, |r| r.code == ResponseCode::VmShutdown, Some(timeout))
            .await;
        if let Err(HyperboxError::Timeout(_)) = done {
            tracing::warn!(sandbox = %self.id, "kill not confirmed, closing");
            self.ctx.close().await;
        }
        Ok(())
    }

    /// Sends the network environment to the guest and starts the guest sandbox.
    pub async fn init_sandbox(&self, config: &SandboxConfig) -> HyperboxResult<()> {
        self.ctx.init_sandbox(config.clone()).await
    }

    /// Adds a container and waits until every volume it needs is attached.
    pub async fn add_container(&self, desc: ContainerDescription) -> HyperboxResult<()> {
        resolve(&self.id, self.ctx.add_container(desc)?).await
    }

    /// Removes a container. Removing an unknown container succeeds.
    pub async fn remove_container(&self, id: &str) -> HyperboxResult<()> {
        resolve(&self.id, self.ctx.remove_container(id)?).await
    }

    /// Removes several containers concurrently and returns the first failure.
    pub async fn remove_containers(&self, ids: &[String]) -> HyperboxResult<()> {
        let results =
            future::join_all(ids.iter().map(|id| self.remove_container(id))).await;
        first_failure(&self.id, "container", ids, results)
    }

    /// Attaches a volume. Directory and NAS volumes are ready right away.
    pub async fn add_volume(&self, desc: VolumeDescription) -> HyperboxResult<()> {
        resolve(&self.id, self.ctx.add_volume(desc)?).await
    }

    /// Detaches a volume once no container uses it. Removing an unknown volume succeeds.
    pub async fn remove_volume(&self, name: &str) -> HyperboxResult<()> {
        resolve(&self.id, self.ctx.remove_volume(name)?).await
    }

    /// Removes several volumes concurrently and returns the first failure.
    pub async fn remove_volumes(&self, names: &[String]) -> HyperboxResult<()> {
        let results =
            future::join_all(names.iter().map(|name| self.remove_volume(name))).await;
        first_failure(&self.id, "volume", names, results)
    }

    /// Creates a ready container in the guest and starts its init process.
    pub async fn start_container(&self, id: &str) -> HyperboxResult<()> {
        self.ctx.start_container(id).await
    }

    /// Reattaches to a container of an associated sandbox. Returns `false` if the guest no
    /// longer runs it.
    pub async fn associate_container(&self, id: &str) -> HyperboxResult<bool> {
        self.ctx.restore_container(id).await
    }

    /// Connects `tty` to the init process of a started container.
    pub fn attach(&self, container: &str, tty: TtyIo) -> HyperboxResult<JoinHandle<()>> {
        self.ctx.attach(container, tty)
    }

    /// Starts an additional process in a container.
    ///
    /// Its exit is reported as [`ResponseCode::ExecFinished`].
    pub async fn add_process(
        &self,
        container: &str,
        request: ExecRequest,
    ) -> HyperboxResult<ProcessIo> {
        if request.id.is_empty() {
            return Err(HyperboxError::Spec("process id is empty".to_string()));
        }
        self.ctx.add_process(container, request.into_process()).await
    }

    /// Runs a command in the agent's own namespace and collects its output.
    ///
    /// A non-zero exit status is an error carrying the status and stderr.
    pub async fn hyperstart_exec_sync(
        &self,
        args: Vec<String>,
        stdin: Option<Bytes>,
    ) -> HyperboxResult<ExecOutput> {
        self.ctx.ensure_running()?;
        let hyperstart = self.ctx.hyperstart();
        let process = Process {
            id: format!("exec-{}", Uuid::new_v4().simple()),
            args,
            ..Default::default()
        };
        let process_id = process.id.clone();

        let ProcessIo {
            stdin: mut input,
            mut stdout,
            stderr,
            ..
        } = hyperstart
            .add_process(HYPERSTART_EXEC_CONTAINER, process)
            .await?;

        if let Some(data) = stdin {
            input.write(&data).await?;
        }
        input.close().await?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (read_out, read_err) = tokio::join!(stdout.read_to_end(&mut out), async {
            match stderr {
                Some(mut stderr) => stderr.read_to_end(&mut err).await.map(drop),
                None => Ok(()),
            }
        });
        read_out?;
        read_err?;

        let code = hyperstart
            .wait_process(HYPERSTART_EXEC_CONTAINER, &process_id)
            .await;
        if code != 0 {
            return Err(HyperboxError::Agent(format!(
                "exec exited with {code}: {}",
                String::from_utf8_lossy(&err).trim_end()
            )));
        }

        Ok(ExecOutput {
            stdout: out,
            stderr: err,
        })
    }

    /// Sends a signal to a process.
    pub async fn signal_process(
        &self,
        container: &str,
        process: &str,
        signal: Signal,
    ) -> HyperboxResult<()> {
        self.ctx.ensure_running()?;
        self.ctx
            .hyperstart()
            .signal_process(container, process, signal)
            .await
    }

    /// Sends a signal to the init process of a container.
    pub async fn kill_container(&self, container: &str, signal: Signal) -> HyperboxResult<()> {
        self.signal_process(container, INIT_PROCESS_ID, signal).await
    }

    /// Resizes the terminal of a process, the container init process by default.
    pub async fn tty(
        &self,
        container: &str,
        process: Option<&str>,
        row: u16,
        column: u16,
    ) -> HyperboxResult<()> {
        self.ctx.ensure_running()?;
        let process = process.unwrap_or(INIT_PROCESS_ID);
        self.ctx
            .hyperstart()
            .tty_win_resize(container, process, row, column)
            .await
    }

    /// Writes a file inside a container.
    pub async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> HyperboxResult<()> {
        self.ctx.ensure_running()?;
        self.ctx.hyperstart().write_file(container, path, data).await
    }

    /// Reads a file from inside a container.
    pub async fn read_file(&self, container: &str, path: &str) -> HyperboxResult<Bytes> {
        self.ctx.ensure_running()?;
        self.ctx.hyperstart().read_file(container, path).await
    }

    /// Hotplugs an interface and configures it inside the guest.
    pub async fn add_nic(&self, inf: InterfaceDescription) -> HyperboxResult<()> {
        let id = inf.id.clone();
        let lo = inf.lo;
        resolve(&self.id, self.ctx.add_interface(inf)?).await?;
        if !lo {
            self.ctx.update_interface(&id).await?;
        }
        Ok(())
    }

    /// Unplugs an interface. Removing an unknown interface succeeds.
    pub async fn delete_nic(&self, id: &str) -> HyperboxResult<()> {
        resolve(&self.id, self.ctx.remove_interface(id)?).await
    }

    /// Installs the complete route table of the sandbox in the guest.
    pub async fn add_route(&self) -> HyperboxResult<()> {
        self.ctx.ensure_running()?;
        let routes = self.ctx.networks().get_routes();
        if routes.is_empty() {
            return Ok(());
        }
        self.ctx.hyperstart().add_route(&routes).await
    }

    /// Returns the addresses of the eth interfaces.
    pub fn get_ip_addrs(&self) -> Vec<String> {
        self.ctx.networks().get_ip_addrs()
    }

    /// Grows the VM to `cpus` vCPUs. Asking for fewer is a no-op.
    pub async fn set_cpus(&self, cpus: u32) -> HyperboxResult<()> {
        self.ctx.set_cpus(cpus).await
    }

    /// Grows the VM memory to `memory_mib`. Asking for less is a no-op.
    pub async fn add_mem(&self, memory_mib: u32) -> HyperboxResult<()> {
        self.ctx.add_mem(memory_mib).await
    }

    /// Brings hotplugged vCPUs and memory online in the guest.
    pub async fn online_cpu_mem(&self) -> HyperboxResult<()> {
        self.ctx.ensure_running()?;
        self.ctx.hyperstart().online_cpu_mem().await
    }

    /// Pauses or resumes the VM.
    pub async fn pause(&self, pause: bool) -> HyperboxResult<()> {
        self.ctx.pause(pause).await
    }

    /// Saves the state of the paused VM to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> HyperboxResult<()> {
        self.ctx.save(path.as_ref()).await
    }

    /// Collects resource usage.
    pub async fn stats(&self) -> HyperboxResult<SandboxStats> {
        self.ctx.stats().await
    }

    /// Serializes the sandbox so another controller can [`associate`](Self::associate) it.
    pub fn dump(&self) -> HyperboxResult<Vec<u8>> {
        self.ctx.persist()?.to_vec()
    }

    /// Returns the path of the guest console log.
    pub fn console_log(&self) -> PathBuf {
        self.ctx.info().get_home_dir().join(CONSOLE_LOG_NAME)
    }

    async fn next_matching<F>(
        &self,
        sub: &mut Subscriber,
        matcher: F,
        timeout: Option<Duration>,
    ) -> HyperboxResult<VmResponse>
    where
        F: Fn(&VmResponse) -> bool,
    {
        let wait = async {
            while let Some(response) = sub.recv().await {
                if matcher(&response) {
                    return Ok(response);
                }
            }
            Err(HyperboxError::NotReady(self.id.clone()))
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                HyperboxError::Timeout(format!("no matching response from sandbox {}", self.id))
            })?,
            None => wait.await,
        }
    }
}

impl ExecRequest {
    fn into_process(self) -> Process {
        Process {
            id: self.id,
            user: self.user,
            group: self.group,
            additional_groups: self.additional_groups,
            terminal: self.terminal,
            args: self.args,
            envs: parse_envs(&self.envs),
            workdir: self.workdir,
            ..Default::default()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn generate_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("vm-{}", &uuid[..10])
}

fn agent_addresses(info: &SandboxInfo) -> (SocketAddress, SocketAddress) {
    let cid = *info.get_guest_cid();
    if cid != 0 {
        (
            SocketAddress::Vsock {
                cid,
                port: VSOCK_CTL_PORT,
            },
            SocketAddress::Vsock {
                cid,
                port: VSOCK_STREAM_PORT,
            },
        )
    } else {
        (
            SocketAddress::Unix(info.get_hyper_sock().clone()),
            SocketAddress::Unix(info.get_tty_sock().clone()),
        )
    }
}

/// Parses `KEY=VALUE` strings. Entries without `=` are skipped.
fn parse_envs(envs: &[String]) -> Vec<EnvironmentVar> {
    envs.iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((env, value)) if !env.is_empty() => Some(EnvironmentVar {
                env: env.to_string(),
                value: value.to_string(),
            }),
            _ => {
                tracing::warn!(entry = %entry, "skipping malformed environment entry");
                None
            }
        })
        .collect()
}

fn first_failure(
    sandbox: &str,
    what: &str,
    names: &[String],
    results: Vec<HyperboxResult<()>>,
) -> HyperboxResult<()> {
    let mut first = None;
    for (name, result) in names.iter().zip(results) {
        if let Err(e) = result {
            tracing::error!(sandbox, name = %name, error = %e, "{what} removal failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
