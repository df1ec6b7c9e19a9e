//! Copies between caller-supplied terminals and process sessions in the guest.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::hyperstart::{ProcessIo, StreamOutput};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The host side of a process's stdio.
#[derive(Default)]
pub struct TtyIo {
    /// Copied to the process stdin. EOF is forwarded to the process.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,

    /// Receives the process stdout, or the terminal output.
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,

    /// Receives the process stderr when the process has no terminal.
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Pumps `tty` and `io` into each other until the process closes its output.
///
/// Stdin is copied by a task of its own, so a caller that keeps stdin open does not hold the
/// copy back once the output ends.
pub async fn stream_copy(tty: TtyIo, io: ProcessIo) {
    let ProcessIo {
        mut stdin,
        stdout,
        stderr,
        stdio_seq,
        ..
    } = io;

    if let Some(mut input) = tty.stdin {
        tokio::spawn(async move {
            match stdin.copy_from(&mut input).await {
                Ok(n) => tracing::trace!(session = stdio_seq, bytes = n, "stdin copy finished"),
                Err(e) => tracing::debug!(session = stdio_seq, error = %e, "stdin copy failed"),
            }
        });
    }

    tokio::join!(
        copy_output(stdout, tty.stdout, stdio_seq),
        async {
            if let Some(stderr) = stderr {
                copy_output(stderr, tty.stderr, stdio_seq).await;
            }
        }
    );
}

async fn copy_output(
    mut from: StreamOutput,
    to: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    session: u64,
) {
    let Some(mut to) = to else {
        // Drain so the session does not buffer output nobody reads.
        let _ = tokio::io::copy(&mut from, &mut tokio::io::sink()).await;
        return;
    };

    if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
        tracing::debug!(session, error = %e, "output copy failed");
    }
    let _ = to.shutdown().await;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for TtyIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtyIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
