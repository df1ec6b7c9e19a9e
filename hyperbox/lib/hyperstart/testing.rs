//! An in-process stand-in for the guest agent.

use std::{
    collections::HashSet,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UnixListener,
    sync::mpsc,
    task::JoinHandle,
};

use crate::config::{HYPER_SOCK_NAME, TTY_SOCK_NAME};

use super::{codes, CtlMessage, FileCommand, Hyperstart, ProcessAsyncEvent, StreamMessage};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Plays the agent side of both sockets.
///
/// Every read on the control socket is acknowledged with `NEXT`, every command is recorded and
/// answered with `ACK` unless its code was marked to fail or the agent is silent.
pub(crate) struct FakeAgent {
    state: Arc<AgentState>,
    ctl_out: mpsc::UnboundedSender<CtlMessage>,
    stream_out: mpsc::UnboundedSender<StreamMessage>,
    stdin: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct AgentState {
    commands: Mutex<Vec<CtlMessage>>,
    fail_codes: Mutex<HashSet<u32>>,
    silent: AtomicBool,
    max_read: AtomicUsize,
}

struct Outboxes {
    ctl_rx: mpsc::UnboundedReceiver<CtlMessage>,
    stream_rx: mpsc::UnboundedReceiver<StreamMessage>,
    stdin_tx: mpsc::UnboundedSender<StreamMessage>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeAgent {
    fn new() -> (Self, Outboxes) {
        let (ctl_out, ctl_rx) = mpsc::unbounded_channel();
        let (stream_out, stream_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let agent = Self {
            state: Arc::new(AgentState::default()),
            ctl_out,
            stream_out,
            stdin: tokio::sync::Mutex::new(stdin_rx),
            tasks: Vec::new(),
        };
        (
            agent,
            Outboxes {
                ctl_rx,
                stream_rx,
                stdin_tx,
            },
        )
    }

    /// Creates an agent connected to a fresh engine over in-memory pipes.
    pub(crate) fn connected(send_ready: bool) -> (Self, Hyperstart) {
        let (mut agent, outboxes) = Self::new();
        let (ctl, ctl_peer) = tokio::io::duplex(64 * 1024);
        let (stream, stream_peer) = tokio::io::duplex(64 * 1024);

        agent.tasks.push(tokio::spawn(serve_ctl(
            agent.state.clone(),
            ctl_peer,
            send_ready,
            agent.ctl_out.clone(),
            outboxes.ctl_rx,
        )));
        agent.tasks.push(tokio::spawn(serve_stream(
            stream_peer,
            outboxes.stream_rx,
            outboxes.stdin_tx,
        )));

        let hyperstart = Hyperstart::with_transports(ctl, stream, 1, send_ready);
        (agent, hyperstart)
    }

    /// Creates an agent listening on the control and stream sockets inside `dir`.
    pub(crate) fn listen(dir: &Path, send_ready: bool) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let ctl_listener = UnixListener::bind(dir.join(HYPER_SOCK_NAME))?;
        let stream_listener = UnixListener::bind(dir.join(TTY_SOCK_NAME))?;

        let (mut agent, outboxes) = Self::new();
        let state = agent.state.clone();
        let replies = agent.ctl_out.clone();

        agent.tasks.push(tokio::spawn(async move {
            if let Ok((conn, _)) = ctl_listener.accept().await {
                serve_ctl(state, conn, send_ready, replies, outboxes.ctl_rx).await;
            }
        }));
        agent.tasks.push(tokio::spawn(async move {
            if let Ok((conn, _)) = stream_listener.accept().await {
                serve_stream(conn, outboxes.stream_rx, outboxes.stdin_tx).await;
            }
        }));

        Ok(agent)
    }

    /// Returns every command received so far.
    pub(crate) fn commands(&self) -> Vec<CtlMessage> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Returns the codes of every command received so far.
    pub(crate) fn command_codes(&self) -> Vec<u32> {
        self.commands().iter().map(|c| c.code).collect()
    }

    /// Returns the largest single read observed on the control socket.
    pub(crate) fn max_read(&self) -> usize {
        self.state.max_read.load(Ordering::SeqCst)
    }

    /// Answers every later command with `code` with `ERROR`.
    pub(crate) fn fail(&self, code: u32) {
        self.state.fail_codes.lock().unwrap().insert(code);
    }

    /// Stops or resumes answering commands.
    pub(crate) fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Sends a control frame to the engine.
    pub(crate) fn reply(&self, code: u32, payload: Bytes) {
        let _ = self.ctl_out.send(CtlMessage::new(code, payload));
    }

    /// Waits until a command with `code` has been received.
    pub(crate) async fn wait_for_command(&self, code: u32) -> anyhow::Result<CtlMessage> {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(cmd) = self.commands().into_iter().find(|c| c.code == code) {
                    return cmd;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(found)
    }

    /// Receives the next stream frame written by the engine.
    pub(crate) async fn recv_stdin(&self) -> anyhow::Result<StreamMessage> {
        let mut stdin = self.stdin.lock().await;
        let msg = tokio::time::timeout(Duration::from_secs(5), stdin.recv()).await?;
        msg.ok_or_else(|| anyhow::anyhow!("stream socket closed"))
    }

    /// Sends output on a session.
    pub(crate) fn send_stream(&self, session: u64, data: &[u8]) {
        let _ = self
            .stream_out
            .send(StreamMessage::new(session, Bytes::copy_from_slice(data)));
    }

    /// Reports that a process exited.
    pub(crate) fn finish_process(&self, container: &str, process: &str, status: i32) {
        let event = ProcessAsyncEvent {
            container: container.to_string(),
            process: process.to_string(),
            event: super::PROCESS_EVENT_FINISHED.to_string(),
            info: String::new(),
            status,
        };
        let payload = serde_json::to_vec(&event).unwrap();
        self.reply(codes::PROCESSASYNCEVENT, Bytes::from(payload));
    }

    /// Drops both connections.
    pub(crate) fn disconnect(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl AgentState {
    fn answer(&self, msg: CtlMessage) -> Option<CtlMessage> {
        let payload = match msg.code {
            codes::VERSION => Bytes::copy_from_slice(&codes::HYPERSTART_API_VERSION.to_be_bytes()),
            codes::READFILE => serde_json::from_slice::<FileCommand>(&msg.payload)
                .map(|cmd| Bytes::from(cmd.file))
                .unwrap_or_default(),
            _ => Bytes::new(),
        };
        let code = msg.code;
        self.commands.lock().unwrap().push(msg);

        if self.silent.load(Ordering::SeqCst) {
            return None;
        }

        if self.fail_codes.lock().unwrap().contains(&code) {
            return Some(CtlMessage::new(codes::ERROR, &b"injected failure"[..]));
        }

        Some(CtlMessage::new(codes::ACK, payload))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.disconnect();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn serve_ctl<T>(
    state: Arc<AgentState>,
    conn: T,
    send_ready: bool,
    replies: mpsc::UnboundedSender<CtlMessage>,
    mut outbox: mpsc::UnboundedReceiver<CtlMessage>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(conn);

    let write = async move {
        if send_ready {
            writer
                .write_all(&CtlMessage::new(codes::READY, Bytes::new()).encode())
                .await?;
        }
        while let Some(msg) = outbox.recv().await {
            writer.write_all(&msg.encode()).await?;
        }
        std::io::Result::Ok(())
    };

    let read = async move {
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; 4096];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return std::io::Result::Ok(());
            }

            state.max_read.fetch_max(n, Ordering::SeqCst);
            let _ = replies.send(CtlMessage::new(
                codes::NEXT,
                Bytes::copy_from_slice(&(n as u32).to_be_bytes()),
            ));

            buf.extend_from_slice(&chunk[..n]);
            while let Some(msg) = take_frame(&mut buf) {
                if let Some(reply) = state.answer(msg) {
                    let _ = replies.send(reply);
                }
            }
        }
    };

    tokio::select! {
        _ = write => {}
        _ = read => {}
    }
}

async fn serve_stream<T>(
    conn: T,
    mut outbox: mpsc::UnboundedReceiver<StreamMessage>,
    stdin: mpsc::UnboundedSender<StreamMessage>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(conn);

    let write = async move {
        while let Some(msg) = outbox.recv().await {
            writer.write_all(&msg.encode()).await?;
        }
        std::io::Result::Ok(())
    };

    let read = async move {
        while let Ok(msg) = StreamMessage::read_from(&mut reader).await {
            if stdin.send(msg).is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = write => {}
        _ = read => {}
    }
}

fn take_frame(buf: &mut BytesMut) -> Option<CtlMessage> {
    if buf.len() < 8 {
        return None;
    }

    let mut header = &buf[..8];
    let code = header.get_u32();
    let len = (header.get_u32() as usize).max(8);
    if buf.len() < len {
        return None;
    }

    let frame = buf.split_to(len);
    Some(CtlMessage::new(code, Bytes::copy_from_slice(&frame[8..])))
}
