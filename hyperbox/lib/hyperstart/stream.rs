//! Session bookkeeping for process stdio carried over the stream socket.

use std::{collections::HashMap, io};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, watch},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::{HyperboxError, HyperboxResult};

use super::StreamMessage;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The largest stdin payload sent in one stream frame.
pub const STDIN_CHUNK_SIZE: usize = 16;

/// The exit status reported for processes that were lost with the agent connection.
pub const LOST_PROCESS_STATUS: i32 = 255;

/// The number of output frames buffered per session before the stream socket stalls.
pub const SESSION_OUTPUT_CAPACITY: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The output side of a session. Reads return EOF once the guest ends the session.
pub type StreamOutput = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Identifies a process by container and process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    /// The container.
    pub container: String,

    /// The process id within the container.
    pub process: String,
}

/// The input side of a session.
#[derive(Debug)]
pub struct StreamInput {
    session: u64,
    tx: Option<mpsc::Sender<StreamMessage>>,
}

/// The stdio of a process in the guest.
#[derive(Debug)]
pub struct ProcessIo {
    /// The process stdin.
    pub stdin: StreamInput,

    /// The process stdout, or the terminal output.
    pub stdout: StreamOutput,

    /// The process stderr, absent when the process runs with a terminal.
    pub stderr: Option<StreamOutput>,

    /// The session carrying stdin and stdout.
    pub stdio_seq: u64,

    /// The session carrying stderr, or 0.
    pub stderr_seq: u64,
}

/// Routing state for all sessions of one agent connection.
#[derive(Debug)]
pub(crate) struct SessionTable {
    next_seq: u64,
    procs: HashMap<ProcessKey, ProcessEntry>,
    outs: HashMap<u64, SessionOut>,
    exited: HashMap<ProcessKey, i32>,
}

#[derive(Debug)]
struct ProcessEntry {
    stdio_seq: u64,
    stderr_seq: u64,
    exit: watch::Sender<Option<i32>>,
}

/// A frame on its way to a session reader, sent outside the table lock.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) session: u64,
    tx: mpsc::Sender<io::Result<Bytes>>,
    payload: Bytes,
}

#[derive(Debug)]
struct SessionOut {
    tx: mpsc::Sender<io::Result<Bytes>>,
    stdio_seq: u64,
    stderr_seq: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessKey {
    /// Creates a process key.
    pub fn new(container: impl Into<String>, process: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            process: process.into(),
        }
    }
}

impl Delivery {
    /// Hands the frame to the session reader, waiting while its buffer is full. Returns
    /// `false` if the reader is gone.
    pub(crate) async fn deliver(self) -> bool {
        self.tx.send(Ok(self.payload)).await.is_ok()
    }
}

impl StreamInput {
    pub(crate) fn new(session: u64, tx: mpsc::Sender<StreamMessage>) -> Self {
        Self {
            session,
            tx: Some(tx),
        }
    }

    /// Returns the session id.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Sends `data` to the process, split into small frames.
    pub async fn write(&mut self, data: &[u8]) -> HyperboxResult<()> {
        let tx = self.tx.as_ref().ok_or(HyperboxError::AgentClosed)?;
        for chunk in data.chunks(STDIN_CHUNK_SIZE) {
            tx.send(StreamMessage::new(self.session, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| HyperboxError::AgentClosed)?;
        }
        Ok(())
    }

    /// Signals EOF to the process. Later writes fail.
    pub async fn close(&mut self) -> HyperboxResult<()> {
        if let Some(tx) = self.tx.take() {
            tracing::trace!(session = self.session, "sending eof to hyperstart");
            tx.send(StreamMessage::new(self.session, Bytes::new()))
                .await
                .map_err(|_| HyperboxError::AgentClosed)?;
        }
        Ok(())
    }

    /// Copies `reader` into the session until EOF, then closes the session.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> HyperboxResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
        self.close().await?;
        Ok(total)
    }
}

impl SessionTable {
    pub(crate) fn new(next_seq: u64) -> Self {
        Self {
            next_seq,
            procs: HashMap::new(),
            outs: HashMap::new(),
            exited: HashMap::new(),
        }
    }

    /// Returns the next session id that will be allocated.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Registers a process and opens its sessions.
    ///
    /// Zero session ids are freshly allocated; non-zero ids are reused, which is how the
    /// routing of a process that survived a controller restart is rebuilt.
    pub(crate) fn register(
        &mut self,
        key: ProcessKey,
        terminal: bool,
        stdio_seq: u64,
        stderr_seq: u64,
        input: mpsc::Sender<StreamMessage>,
    ) -> HyperboxResult<ProcessIo> {
        if self.procs.contains_key(&key) {
            return Err(HyperboxError::Conflict(format!(
                "process {} already exists in container {}",
                key.process, key.container
            )));
        }

        let stdio_seq = if stdio_seq == 0 {
            self.alloc_seq()
        } else {
            stdio_seq
        };
        let stderr_seq = match (terminal, stderr_seq) {
            (true, _) => 0,
            (false, 0) => self.alloc_seq(),
            (false, seq) => seq,
        };

        let stdout = self.open_out(stdio_seq, stdio_seq, stderr_seq);
        let stderr = (stderr_seq > 0).then(|| self.open_out(stderr_seq, stdio_seq, stderr_seq));

        let (exit, _) = watch::channel(None);
        self.exited.remove(&key);
        self.procs.insert(
            key,
            ProcessEntry {
                stdio_seq,
                stderr_seq,
                exit,
            },
        );

        Ok(ProcessIo {
            stdin: StreamInput::new(stdio_seq, input),
            stdout,
            stderr,
            stdio_seq,
            stderr_seq,
        })
    }

    fn open_out(&mut self, seq: u64, stdio_seq: u64, stderr_seq: u64) -> StreamOutput {
        let (tx, rx) = mpsc::channel(SESSION_OUTPUT_CAPACITY);
        self.outs.insert(
            seq,
            SessionOut {
                tx,
                stdio_seq,
                stderr_seq,
            },
        );
        StreamReader::new(ReceiverStream::new(rx))
    }

    /// Forgets a process whose start was rejected.
    pub(crate) fn remove(&mut self, key: &ProcessKey) {
        if let Some(entry) = self.procs.remove(key) {
            self.outs.remove(&entry.stdio_seq);
            if entry.stderr_seq > 0 {
                self.outs.remove(&entry.stderr_seq);
            }
        }
    }

    /// Returns `true` if the process is registered and has not exited.
    pub(crate) fn contains(&self, key: &ProcessKey) -> bool {
        self.procs.contains_key(key)
    }

    /// Resolves an inbound frame to the session it belongs to.
    ///
    /// An EOF frame ends the session here; a data frame comes back as a [`Delivery`].
    pub(crate) fn route(&mut self, msg: StreamMessage) -> Option<Delivery> {
        let Some(out) = self.outs.get(&msg.session) else {
            tracing::trace!(session = msg.session, "dropping frame for unknown session");
            return None;
        };

        if msg.is_eof() {
            tracing::trace!(session = msg.session, "session closed by hyperstart");
            self.close_out(msg.session);
            return None;
        }

        Some(Delivery {
            session: msg.session,
            tx: out.tx.clone(),
            payload: msg.payload,
        })
    }

    /// Ends a session and, for a stdio session, its stderr session too.
    pub(crate) fn close_out(&mut self, seq: u64) {
        // The agent does not always end the stderr session, so it goes with stdout.
        if let Some(out) = self.outs.remove(&seq) {
            if seq == out.stdio_seq && out.stderr_seq > 0 {
                self.outs.remove(&out.stderr_seq);
            }
        }
    }

    /// Records the exit of a process and wakes its waiters.
    pub(crate) fn finish(&mut self, key: &ProcessKey, status: i32) -> bool {
        match self.procs.remove(key) {
            Some(entry) => {
                entry.exit.send_replace(Some(status));
                self.exited.insert(key.clone(), status);
                true
            }
            None => false,
        }
    }

    /// Returns the exit status of a finished process, or a receiver to wait on.
    pub(crate) fn watch_exit(
        &mut self,
        key: &ProcessKey,
    ) -> Option<Result<i32, watch::Receiver<Option<i32>>>> {
        if let Some(status) = self.exited.remove(key) {
            return Some(Ok(status));
        }
        self.procs.get(key).map(|entry| Err(entry.exit.subscribe()))
    }

    /// Forgets a consumed exit status.
    pub(crate) fn clear_exit(&mut self, key: &ProcessKey) {
        self.exited.remove(key);
    }

    /// Forgets every process of a removed container, along with the exits nobody waited for.
    pub(crate) fn forget_container(&mut self, container: &str) {
        let keys: Vec<_> = self
            .procs
            .keys()
            .filter(|key| key.container == container)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = self.procs.get(&key) {
                let (stdio_seq, stderr_seq) = (entry.stdio_seq, entry.stderr_seq);
                self.outs.remove(&stdio_seq);
                self.outs.remove(&stderr_seq);
            }
            self.finish(&key, LOST_PROCESS_STATUS);
        }
        self.exited.retain(|key, _| key.container != container);
    }

    /// Fails every process and ends every session.
    pub(crate) fn close_all(&mut self) {
        let keys: Vec<_> = self.procs.keys().cloned().collect();
        for key in keys {
            self.finish(&key, LOST_PROCESS_STATUS);
        }
        self.outs.clear();
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
