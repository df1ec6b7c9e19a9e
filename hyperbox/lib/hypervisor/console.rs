//! Guest serial console reader.

use std::{path::PathBuf, time::Duration};

use hyperutils::{RotatingLog, SocketAddress};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::CONSOLE_VERBOSE_LINES;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the console line by line until it closes or `cancel` fires.
///
/// The first [`CONSOLE_VERBOSE_LINES`] lines are logged at `info`, the rest at `debug`. Every
/// line is appended to the rotating log at `log_path`.
pub(crate) async fn watch_console(
    id: String,
    address: SocketAddress,
    log_path: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let conn = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        conn = address.connect_with_timeout(timeout) => conn,
    };
    let conn = match conn {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(sandbox = %id, address = %address, error = %e, "cannot connect to console");
            return;
        }
    };

    let mut log = match RotatingLog::new(&log_path).await {
        Ok(log) => Some(log),
        Err(e) => {
            tracing::warn!(sandbox = %id, path = %log_path.display(), error = %e, "cannot open console log");
            None
        }
    };

    let mut lines = BufReader::new(conn).lines();
    let mut count = 0usize;
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                count += 1;
                if count <= CONSOLE_VERBOSE_LINES {
                    tracing::info!(sandbox = %id, "[console] {line}");
                } else {
                    tracing::debug!(sandbox = %id, "[console] {line}");
                }

                if let Some(file) = log.as_mut() {
                    if let Err(e) = file.write_line(&line).await {
                        tracing::warn!(sandbox = %id, error = %e, "console log write failed");
                        log = None;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(sandbox = %id, error = %e, "console read failed");
                break;
            }
        }
    }

    tracing::debug!(sandbox = %id, lines = count, "console closed");
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
