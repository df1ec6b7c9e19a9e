use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use bytes::{Buf, Bytes, BytesMut};
use hyperbox::{
    config::{HYPER_SOCK_NAME, TTY_SOCK_NAME},
    hyperstart::{codes, CtlMessage, ProcessAsyncEvent, StreamMessage, PROCESS_EVENT_FINISHED},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixListener,
    sync::mpsc,
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A guest agent that acknowledges every command on the sockets of a sandbox home directory.
pub struct Agent {
    received: Arc<Mutex<Vec<u32>>>,
    replies: mpsc::UnboundedSender<CtlMessage>,
    tasks: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Agent {
    pub fn listen(home: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(home)?;
        let ctl = UnixListener::bind(home.join(HYPER_SOCK_NAME))?;
        let stream = UnixListener::bind(home.join(TTY_SOCK_NAME))?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let (replies, outbox) = mpsc::unbounded_channel();

        let serve = tokio::spawn(serve_ctl(ctl, received.clone(), replies.clone(), outbox));
        let drain = tokio::spawn(async move {
            if let Ok((mut conn, _)) = stream.accept().await {
                while StreamMessage::read_from(&mut conn).await.is_ok() {}
            }
        });

        Ok(Self {
            received,
            replies,
            tasks: vec![serve, drain],
        })
    }

    /// Returns the codes of every command received so far.
    pub fn received(&self) -> Vec<u32> {
        self.received.lock().unwrap().clone()
    }

    /// Reports that a process exited.
    pub fn finish(&self, container: &str, process: &str, status: i32) -> anyhow::Result<()> {
        let event = ProcessAsyncEvent {
            container: container.to_string(),
            process: process.to_string(),
            event: PROCESS_EVENT_FINISHED.to_string(),
            info: String::new(),
            status,
        };
        let payload = serde_json::to_vec(&event)?;
        self.replies
            .send(CtlMessage::new(codes::PROCESSASYNCEVENT, payload))?;
        Ok(())
    }

    /// Drops both connections, as a crashed guest would.
    pub fn crash(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.crash();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn serve_ctl(
    listener: UnixListener,
    received: Arc<Mutex<Vec<u32>>>,
    replies: mpsc::UnboundedSender<CtlMessage>,
    mut outbox: mpsc::UnboundedReceiver<CtlMessage>,
) {
    let Ok((conn, _)) = listener.accept().await else {
        return;
    };
    let (mut reader, mut writer) = conn.into_split();

    let write = async move {
        writer
            .write_all(&CtlMessage::new(codes::READY, Bytes::new()).encode())
            .await?;
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
            let _ = replies.send(CtlMessage::new(codes::NEXT, (n as u32).to_be_bytes().to_vec()));

            buf.extend_from_slice(&chunk[..n]);
            while buf.len() >= 8 {
                let total = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                if buf.len() < total {
                    break;
                }
                let mut frame = buf.split_to(total);
                let code = frame.get_u32();
                frame.advance(4);

                received.lock().unwrap().push(code);
                let payload = match code {
                    codes::VERSION => codes::HYPERSTART_API_VERSION.to_be_bytes().to_vec(),
                    _ => Vec::new(),
                };
                let _ = replies.send(CtlMessage::new(codes::ACK, payload));
            }
        }
    };

    tokio::select! {
        _ = write => {}
        _ = read => {}
    }
}
