use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use hyperutils::SocketAddress;
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::sync::CancellationToken;

use crate::{config::DEFAULT_CHANNEL_CAPACITY, HyperboxError, HyperboxResult};

use super::{
    codes, Container, CtlMessage, ExecCommand, FileCommand, NetworkInf, Pod, Process,
    ProcessAsyncEvent, ProcessIo, ProcessKey, Route, SessionTable, SignalCommand, StreamMessage,
    WindowSizeMessage, LOST_PROCESS_STATUS, PROCESS_EVENT_FINISHED,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The largest number of command bytes written before waiting for a `NEXT` acknowledgment.
pub const MAX_WRITE_CHUNK: usize = 512;

/// The process id of the init process of every container.
pub const INIT_PROCESS_ID: &str = "init";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A connection to the `hyperstart` agent of one sandbox.
///
/// Cloning yields another handle to the same connection. Every method may be called from any
/// task; commands are written in the order they are issued and each resolves when the agent
/// acknowledges it, fails it, or the connection closes.
#[derive(Debug, Clone)]
pub struct Hyperstart {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<EngineState>,
    ctl_tx: mpsc::Sender<CtlInput>,
    stream_tx: mpsc::Sender<StreamMessage>,
    paused: watch::Sender<bool>,
    outstanding: watch::Sender<usize>,
    closed: CancellationToken,
}

/// Counts a command as outstanding until dropped.
struct OutstandingGuard<'a>(&'a watch::Sender<usize>);

#[derive(Debug)]
struct EngineState {
    closed: bool,
    api_version: u32,
    sessions: SessionTable,
}

/// The receiving ends handed to the connection tasks.
#[derive(Debug)]
struct Channels {
    ctl_rx: mpsc::Receiver<CtlInput>,
    stream_rx: mpsc::Receiver<StreamMessage>,
}

#[derive(Debug)]
enum CtlInput {
    Command(PendingCommand),
    Reply(CtlMessage),
}

#[derive(Debug)]
struct PendingCommand {
    code: u32,
    payload: Bytes,
    result: oneshot::Sender<HyperboxResult<Bytes>>,
}

/// Commands accepted by the writer but not yet acknowledged by the agent.
#[derive(Debug, Default)]
struct CommandQueue {
    inflight: VecDeque<PendingCommand>,
    data: BytesMut,
    written: usize,
    acked: usize,
    destroying: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Serialize)]
struct Routes<'a> {
    routes: &'a [Route],
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Hyperstart {
    /// Connects to the agent sockets in the background.
    ///
    /// Commands issued before the connection is up are queued. If either socket cannot be
    /// reached within `timeout`, or `wait_ready` is set and the first control frame is not
    /// `READY`, the connection is closed and every queued command fails.
    pub fn connect(
        ctl: SocketAddress,
        stream: SocketAddress,
        last_stream_seq: u64,
        wait_ready: bool,
        timeout: Duration,
    ) -> Self {
        let (hyperstart, channels) = Self::new(last_stream_seq);
        let shared = hyperstart.shared.clone();

        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = shared.closed.cancelled() => return,
                connected = connect_sockets(&ctl, &stream, timeout) => connected,
            };

            match connected {
                Ok((ctl_conn, stream_conn)) => {
                    run(shared, ctl_conn, stream_conn, channels, wait_ready).await
                }
                Err(e) => {
                    tracing::error!(ctl = %ctl, stream = %stream, error = %e, "cannot connect to hyperstart");
                    shared.close();
                }
            }
        });

        hyperstart
    }

    /// Starts the protocol over already connected control and stream transports.
    pub fn with_transports<C, S>(ctl: C, stream: S, last_stream_seq: u64, wait_ready: bool) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (hyperstart, channels) = Self::new(last_stream_seq);
        tokio::spawn(run(
            hyperstart.shared.clone(),
            ctl,
            stream,
            channels,
            wait_ready,
        ));
        hyperstart
    }

    fn new(last_stream_seq: u64) -> (Self, Channels) {
        let (ctl_tx, ctl_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (paused, _) = watch::channel(false);
        let (outstanding, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                closed: false,
                api_version: 0,
                sessions: SessionTable::new(last_stream_seq.max(1)),
            }),
            ctl_tx,
            stream_tx,
            paused,
            outstanding,
            closed: CancellationToken::new(),
        });

        (Self { shared }, Channels { ctl_rx, stream_rx })
    }

    /// Asks the agent for its protocol version.
    pub async fn api_version(&self) -> HyperboxResult<u32> {
        let reply = self.command(codes::VERSION, Bytes::new()).await?;
        if reply.len() < 4 {
            return Err(HyperboxError::Protocol(format!(
                "version reply carries {} bytes",
                reply.len()
            )));
        }

        let version = (&reply[..]).get_u32();
        self.shared.lock().api_version = version;
        Ok(version)
    }

    /// Returns the version reported by the last successful [`api_version`](Self::api_version).
    pub fn cached_api_version(&self) -> u32 {
        self.shared.lock().api_version
    }

    /// Starts the sandbox inside the guest.
    pub async fn start_sandbox(&self, pod: &Pod) -> HyperboxResult<()> {
        self.json_command(codes::STARTPOD, pod).await.map(drop)
    }

    /// Tears the sandbox down. The agent accepts no command after this one.
    pub async fn destroy_sandbox(&self) -> HyperboxResult<()> {
        self.command(codes::DESTROYPOD, Bytes::new()).await.map(drop)
    }

    /// Creates a container and starts its init process.
    pub async fn new_container(&self, mut container: Container) -> HyperboxResult<ProcessIo> {
        if container.process.id.is_empty() {
            container.process.id = INIT_PROCESS_ID.to_string();
        }

        let key = ProcessKey::new(&container.id, &container.process.id);
        let io = self.register_process(key.clone(), container.process.terminal, 0, 0)?;
        container.process.stdio = io.stdio_seq;
        container.process.stderr = io.stderr_seq;

        if let Err(e) = self.json_command(codes::NEWCONTAINER, &container).await {
            self.shared.lock().sessions.remove(&key);
            return Err(e);
        }

        Ok(io)
    }

    /// Reattaches to a container that survived a controller restart.
    ///
    /// The container is probed with `SIGCONT`; if the agent does not know it, the result is
    /// [`HyperboxError::NotFound`]. The session ids recorded in `container` are reused.
    pub async fn restore_container(&self, container: &Container) -> HyperboxResult<ProcessIo> {
        let process_id = if container.process.id.is_empty() {
            INIT_PROCESS_ID
        } else {
            container.process.id.as_str()
        };
        let key = ProcessKey::new(&container.id, process_id);

        if self.shared.lock().sessions.contains(&key) {
            return Err(HyperboxError::Conflict(format!(
                "container {} is already restored",
                container.id
            )));
        }

        match self
            .signal_process(&container.id, process_id, Signal::SIGCONT)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_connection_error() => return Err(e),
            Err(e) => {
                return Err(HyperboxError::NotFound(format!(
                    "container {} does not exist or has stopped: {e}",
                    container.id
                )))
            }
        }

        self.register_process(
            key,
            container.process.terminal,
            container.process.stdio,
            container.process.stderr,
        )
    }

    /// Starts an additional process in a container.
    pub async fn add_process(&self, container: &str, process: Process) -> HyperboxResult<ProcessIo> {
        let key = ProcessKey::new(container, &process.id);
        let io = self.register_process(key.clone(), process.terminal, 0, 0)?;

        let command = ExecCommand {
            container: container.to_string(),
            process: Process {
                stdio: io.stdio_seq,
                stderr: io.stderr_seq,
                ..process
            },
        };

        if let Err(e) = self.json_command(codes::EXECCMD, &command).await {
            self.shared.lock().sessions.remove(&key);
            return Err(e);
        }

        Ok(io)
    }

    /// Sends a signal to a process.
    pub async fn signal_process(
        &self,
        container: &str,
        process: &str,
        signal: Signal,
    ) -> HyperboxResult<()> {
        let command = SignalCommand {
            container: container.to_string(),
            process: process.to_string(),
            signal: signal as i32,
        };
        self.json_command(codes::SIGNALPROCESS, &command).await.map(drop)
    }

    /// Resizes the terminal of a process.
    pub async fn tty_win_resize(
        &self,
        container: &str,
        process: &str,
        row: u16,
        column: u16,
    ) -> HyperboxResult<()> {
        let message = WindowSizeMessage {
            container: container.to_string(),
            process: process.to_string(),
            row,
            column,
        };
        self.json_command(codes::WINSIZE, &message).await.map(drop)
    }

    /// Writes a file inside a container.
    pub async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> HyperboxResult<()> {
        let header = serde_json::to_vec(&FileCommand {
            container: container.to_string(),
            file: path.to_string(),
        })?;

        let mut payload = BytesMut::with_capacity(header.len() + data.len());
        payload.extend_from_slice(&header);
        payload.extend_from_slice(data);

        self.command(codes::WRITEFILE, payload.freeze()).await.map(drop)
    }

    /// Reads a file from inside a container.
    pub async fn read_file(&self, container: &str, path: &str) -> HyperboxResult<Bytes> {
        let command = FileCommand {
            container: container.to_string(),
            file: path.to_string(),
        };
        self.json_command(codes::READFILE, &command).await
    }

    /// Adds routes to the guest route table.
    pub async fn add_route(&self, routes: &[Route]) -> HyperboxResult<()> {
        self.json_command(codes::SETUPROUTE, &Routes { routes })
            .await
            .map(drop)
    }

    /// Assigns an address to a guest interface.
    pub async fn update_interface(
        &self,
        device: &str,
        ip_address: &str,
        net_mask: &str,
    ) -> HyperboxResult<()> {
        let inf = NetworkInf {
            device: device.to_string(),
            ip_address: ip_address.to_string(),
            net_mask: net_mask.to_string(),
        };
        self.json_command(codes::SETUPINTERFACE, &inf).await.map(drop)
    }

    /// Brings hotplugged vCPUs and memory online.
    pub async fn online_cpu_mem(&self) -> HyperboxResult<()> {
        self.command(codes::ONLINECPUMEM, Bytes::new()).await.map(drop)
    }

    /// Waits for a process to exit and returns its status.
    ///
    /// Returns `-1` for a process that is unknown, and `255` for one that was lost with the
    /// connection.
    pub async fn wait_process(&self, container: &str, process: &str) -> i32 {
        let key = ProcessKey::new(container, process);
        let mut rx = match self.shared.lock().sessions.watch_exit(&key) {
            Some(Ok(status)) => return status,
            Some(Err(rx)) => rx,
            None => return -1,
        };

        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(LOST_PROCESS_STATUS),
            Err(_) => LOST_PROCESS_STATUS,
        };
        self.shared.lock().sessions.clear_exit(&key);
        status
    }

    /// Holds back command writes while the guest is paused.
    pub fn pause(&self, pause: bool) {
        self.shared.paused.send_replace(pause);
    }

    /// Returns `true` if command writes are held back.
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Waits until command writes are no longer held back.
    pub async fn wait_unpaused(&self) {
        let mut rx = self.shared.paused.subscribe();
        let _ = rx.wait_for(|paused| !paused).await;
    }

    /// Waits until command writes are held back.
    pub async fn wait_paused(&self) {
        let mut rx = self.shared.paused.subscribe();
        let _ = rx.wait_for(|paused| *paused).await;
    }

    /// Drops the stdio routing and unclaimed exit statuses of a container that is gone.
    pub fn forget_container(&self, container: &str) {
        self.shared.lock().sessions.forget_container(container);
    }

    /// Returns the number of commands issued and not yet answered.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Waits until no command is outstanding.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns `true` once the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the connection is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Returns the next stream session id that will be handed out.
    pub fn last_stream_seq(&self) -> u64 {
        self.shared.lock().sessions.next_seq()
    }

    fn register_process(
        &self,
        key: ProcessKey,
        terminal: bool,
        stdio_seq: u64,
        stderr_seq: u64,
    ) -> HyperboxResult<ProcessIo> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(HyperboxError::AgentClosed);
        }

        state.sessions.register(
            key,
            terminal,
            stdio_seq,
            stderr_seq,
            self.shared.stream_tx.clone(),
        )
    }

    async fn json_command<T: Serialize>(&self, code: u32, message: &T) -> HyperboxResult<Bytes> {
        let payload = serde_json::to_vec(message)?;
        self.command(code, Bytes::from(payload)).await
    }

    async fn command(&self, code: u32, payload: Bytes) -> HyperboxResult<Bytes> {
        if self.is_closed() {
            return Err(HyperboxError::AgentClosed);
        }

        let _outstanding = OutstandingGuard::new(&self.shared.outstanding);
        let (result, rx) = oneshot::channel();
        self.shared
            .ctl_tx
            .send(CtlInput::Command(PendingCommand {
                code,
                payload,
                result,
            }))
            .await
            .map_err(|_| HyperboxError::AgentClosed)?;

        rx.await.map_err(|_| HyperboxError::AgentClosed)?
    }
}

impl<'a> OutstandingGuard<'a> {
    fn new(count: &'a watch::Sender<usize>) -> Self {
        count.send_modify(|n| *n += 1);
        Self(count)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.sessions.close_all();
        }

        tracing::debug!("hyperstart connection closed");
        self.closed.cancel();
    }

    fn handle_process_event(&self, payload: &[u8]) {
        match serde_json::from_slice::<ProcessAsyncEvent>(payload) {
            Ok(event) if event.event == PROCESS_EVENT_FINISHED => {
                tracing::debug!(
                    container = %event.container,
                    process = %event.process,
                    status = event.status,
                    "process finished"
                );
                let key = ProcessKey::new(event.container, event.process);
                if !self.lock().sessions.finish(&key, event.status) {
                    tracing::debug!(container = %key.container, process = %key.process, "exit of untracked process");
                }
            }
            Ok(event) => tracing::debug!(event = %event.event, "ignoring process event"),
            Err(e) => tracing::warn!(error = %e, "malformed process event"),
        }
    }
}

impl CommandQueue {
    fn push(&mut self, cmd: PendingCommand) {
        if self.destroying {
            tracing::debug!(code = codes::code_name(cmd.code), "rejecting command after sandbox destroy");
            let _ = cmd.result.send(Err(HyperboxError::AgentClosed));
            return;
        }

        if cmd.code == codes::DESTROYPOD {
            self.destroying = true;
        }

        tracing::trace!(code = codes::code_name(cmd.code), len = cmd.payload.len(), "queueing command");
        CtlMessage::new(cmd.code, cmd.payload.clone()).encode_into(&mut self.data);
        self.inflight.push_back(cmd);
    }

    /// Returns the next chunk to write, if the previous one is fully acknowledged.
    fn next_chunk(&mut self) -> Option<Bytes> {
        if self.written != 0 || self.data.is_empty() {
            return None;
        }

        let len = self.data.len().min(MAX_WRITE_CHUNK);
        self.written = len;
        Some(Bytes::copy_from_slice(&self.data[..len]))
    }

    fn on_reply(&mut self, msg: CtlMessage) -> HyperboxResult<Flow> {
        match msg.code {
            codes::NEXT => {
                if msg.payload.len() < 4 {
                    return Err(HyperboxError::Protocol(format!(
                        "NEXT carries {} bytes",
                        msg.payload.len()
                    )));
                }

                self.acked += (&msg.payload[..]).get_u32() as usize;
                if self.acked > self.written {
                    return Err(HyperboxError::Protocol(format!(
                        "hyperstart acknowledged {} bytes of {}",
                        self.acked, self.written
                    )));
                }

                if self.acked == self.written {
                    self.data.advance(self.written);
                    self.written = 0;
                    self.acked = 0;
                }

                Ok(Flow::Continue)
            }
            codes::ACK | codes::ERROR => {
                let Some(cmd) = self.inflight.pop_front() else {
                    tracing::warn!(code = codes::code_name(msg.code), "reply without an outstanding command");
                    return Ok(Flow::Continue);
                };

                tracing::trace!(
                    command = codes::code_name(cmd.code),
                    reply = codes::code_name(msg.code),
                    "command answered"
                );

                let result = if msg.code == codes::ACK {
                    Ok(msg.payload)
                } else {
                    Err(HyperboxError::Agent(
                        String::from_utf8_lossy(&msg.payload).into_owned(),
                    ))
                };

                let last = cmd.code == codes::DESTROYPOD;
                let _ = cmd.result.send(result);
                Ok(if last { Flow::Stop } else { Flow::Continue })
            }
            code => {
                tracing::warn!(code = codes::code_name(code), "unexpected reply code");
                Ok(Flow::Continue)
            }
        }
    }

    fn fail_all(&mut self) {
        for cmd in self.inflight.drain(..) {
            let _ = cmd.result.send(Err(HyperboxError::AgentClosed));
        }
        self.data.clear();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn connect_sockets(
    ctl: &SocketAddress,
    stream: &SocketAddress,
    timeout: Duration,
) -> HyperboxResult<(hyperutils::BoxedTransport, hyperutils::BoxedTransport)> {
    let ctl_conn = ctl.connect_with_timeout(timeout).await?;
    let stream_conn = stream.connect_with_timeout(timeout).await?;
    Ok((ctl_conn, stream_conn))
}

async fn run<C, S>(shared: Arc<Shared>, ctl: C, stream: S, channels: Channels, wait_ready: bool)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (stream_reader, stream_writer) = tokio::io::split(stream);
    tokio::spawn(read_streams(shared.clone(), stream_reader));
    tokio::spawn(write_streams(
        shared.clone(),
        stream_writer,
        channels.stream_rx,
    ));

    let (mut ctl_reader, ctl_writer) = tokio::io::split(ctl);
    if wait_ready {
        let first = tokio::select! {
            _ = shared.closed.cancelled() => return,
            first = CtlMessage::read_from(&mut ctl_reader) => first,
        };

        match first {
            Ok(msg) if msg.code == codes::READY => tracing::debug!("hyperstart is ready"),
            Ok(msg) => {
                tracing::error!(code = codes::code_name(msg.code), "expected READY from hyperstart");
                shared.close();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "hyperstart went away before it was ready");
                shared.close();
                return;
            }
        }
    }

    tokio::spawn(read_ctl(shared.clone(), ctl_reader));
    write_ctl(shared, ctl_writer, channels.ctl_rx).await;
}

async fn write_ctl<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<CtlInput>)
where
    W: AsyncWrite + Unpin,
{
    let mut paused = shared.paused.subscribe();
    let mut queue = CommandQueue::default();

    let result: HyperboxResult<()> = loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break Ok(()),
            changed = paused.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            input = rx.recv() => match input {
                None => break Ok(()),
                Some(CtlInput::Command(cmd)) => queue.push(cmd),
                Some(CtlInput::Reply(msg)) => match queue.on_reply(msg) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => {
                        tracing::debug!("sandbox destroyed, no more commands");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            },
        }

        if *paused.borrow() {
            continue;
        }

        if let Some(chunk) = queue.next_chunk() {
            if let Err(e) = writer.write_all(&chunk).await {
                break Err(e.into());
            }
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "hyperstart control connection failed");
    }

    queue.fail_all();
    rx.close();
    while let Ok(input) = rx.try_recv() {
        if let CtlInput::Command(cmd) = input {
            let _ = cmd.result.send(Err(HyperboxError::AgentClosed));
        }
    }

    shared.close();
}

async fn read_ctl<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shared.closed.cancelled() => break,
            msg = CtlMessage::read_from(&mut reader) => msg,
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "hyperstart control socket closed");
                break;
            }
        };

        match msg.code {
            codes::ACK | codes::ERROR | codes::NEXT => {
                if shared.ctl_tx.send(CtlInput::Reply(msg)).await.is_err() {
                    break;
                }
            }
            codes::PROCESSASYNCEVENT => shared.handle_process_event(&msg.payload),
            code => tracing::trace!(code = codes::code_name(code), "ignoring control frame"),
        }
    }

    shared.close();
}

async fn read_streams<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shared.closed.cancelled() => break,
            msg = StreamMessage::read_from(&mut reader) => msg,
        };

        match msg {
            Ok(msg) => {
                let delivery = shared.lock().sessions.route(msg);
                let Some(delivery) = delivery else {
                    continue;
                };

                let session = delivery.session;
                let delivered = tokio::select! {
                    _ = shared.closed.cancelled() => break,
                    delivered = delivery.deliver() => delivered,
                };
                if !delivered {
                    tracing::debug!(session, "session reader gone, closing session");
                    shared.lock().sessions.close_out(session);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "hyperstart stream socket closed");
                break;
            }
        }
    }

    shared.close();
}

async fn write_streams<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<StreamMessage>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shared.closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Err(e) = writer.write_all(&msg.encode()).await {
            tracing::debug!(session = msg.session, error = %e, "cannot write to hyperstart stream socket");
            break;
        }
    }

    shared.close();
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
