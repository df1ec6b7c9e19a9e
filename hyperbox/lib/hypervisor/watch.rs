//! Background watchers that turn the agent connection's health into controller events.

use std::time::Duration;

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{hyperstart::Hyperstart, HyperboxError, HyperboxResult};

use super::VmEvent;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Probes the agent with a version request right away, and later whenever it has been idle
/// for `interval` with no command outstanding.
///
/// The first successful probe posts [`VmEvent::InitConnected`]. A probe that fails, or that
/// does not complete within `timeout` of unpaused time, closes the connection and posts
/// [`VmEvent::InitFailed`].
pub(crate) async fn keepalive(
    id: String,
    hyperstart: Hyperstart,
    hub: mpsc::Sender<VmEvent>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut connected = false;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = probe(&hyperstart, timeout) => result,
        };

        match result {
            Ok(version) => {
                if !connected {
                    connected = true;
                    tracing::info!(sandbox = %id, version, "hyperstart connected");
                    if hub.send(VmEvent::InitConnected).await.is_err() {
                        return;
                    }
                } else {
                    tracing::trace!(sandbox = %id, "hyperstart alive");
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::error!(sandbox = %id, error = %e, "hyperstart keep-alive failed");
                hyperstart.close();
                let _ = hub
                    .send(VmEvent::InitFailed {
                        reason: format!("hyperstart failed: {e}"),
                    })
                    .await;
                return;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = hyperstart.closed() => return,
            _ = idle_for(&hyperstart, interval) => {}
        }
    }
}

/// Sleeps `interval` once the agent has no outstanding command, starting over while it has.
async fn idle_for(hyperstart: &Hyperstart, interval: Duration) {
    loop {
        hyperstart.wait_idle().await;
        tokio::time::sleep(interval).await;
        if hyperstart.outstanding() == 0 {
            return;
        }
    }
}

/// Posts [`VmEvent::Interrupted`] once the agent connection ends.
pub(crate) async fn interrupt_on_close(
    id: String,
    hyperstart: Hyperstart,
    hub: mpsc::Sender<VmEvent>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = hyperstart.closed() => {
            tracing::info!(sandbox = %id, "hyperstart connection ended");
            let _ = hub
                .send(VmEvent::Interrupted {
                    reason: "hyperstart stopped".to_string(),
                })
                .await;
        }
    }
}

/// Runs one version probe, charging `timeout` only for time spent unpaused.
async fn probe(hyperstart: &Hyperstart, timeout: Duration) -> HyperboxResult<u32> {
    let version = hyperstart.api_version();
    tokio::pin!(version);

    let mut remaining = timeout;
    loop {
        if hyperstart.is_paused() {
            tokio::select! {
                result = &mut version => return result,
                _ = hyperstart.wait_unpaused() => continue,
            }
        }

        let started = Instant::now();
        tokio::select! {
            result = &mut version => return result,
            _ = tokio::time::sleep(remaining) => {
                return Err(HyperboxError::Timeout(format!(
                    "no version reply within {}ms",
                    timeout.as_millis()
                )));
            }
            _ = hyperstart.wait_paused() => {
                remaining = remaining.saturating_sub(started.elapsed());
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::hyperstart::{codes, testing::FakeAgent};

    #[test_log::test(tokio::test)]
    async fn test_keepalive_reports_connected_once() -> anyhow::Result<()> {
        let (_agent, hyperstart) = FakeAgent::connected(false);
        let (hub, mut events) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(keepalive(
            "vm-1".to_string(),
            hyperstart,
            hub,
            Duration::from_millis(10),
            Duration::from_secs(1),
            cancel.clone(),
        ));

        assert!(matches!(events.recv().await, Some(VmEvent::InitConnected)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        cancel.cancel();
        task.await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_keepalive_timeout_closes_connection() -> anyhow::Result<()> {
        let (agent, hyperstart) = FakeAgent::connected(false);
        agent.set_silent(true);
        let (hub, mut events) = mpsc::channel(8);

        tokio::spawn(keepalive(
            "vm-1".to_string(),
            hyperstart.clone(),
            hub,
            Duration::from_millis(10),
            Duration::from_millis(50),
            CancellationToken::new(),
        ));

        match events.recv().await {
            Some(VmEvent::InitFailed { reason }) => assert!(reason.starts_with("hyperstart failed")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(hyperstart.is_closed());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_busy_agent_is_not_probed() -> anyhow::Result<()> {
        let (agent, hyperstart) = FakeAgent::connected(false);
        let (hub, mut events) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tokio::spawn(keepalive(
            "vm-1".to_string(),
            hyperstart.clone(),
            hub,
            Duration::from_millis(100),
            Duration::from_millis(50),
            cancel.clone(),
        ));
        assert!(matches!(events.recv().await, Some(VmEvent::InitConnected)));

        agent.set_silent(true);
        let slow = tokio::spawn({
            let hyperstart = hyperstart.clone();
            async move { hyperstart.online_cpu_mem().await }
        });
        agent.wait_for_command(codes::ONLINECPUMEM).await?;
        let probes = agent.command_codes().iter().filter(|c| **c == codes::VERSION).count();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err());
        assert!(!hyperstart.is_closed());
        assert_eq!(hyperstart.outstanding(), 1);
        let later = agent.command_codes().iter().filter(|c| **c == codes::VERSION).count();
        assert_eq!(later, probes);

        agent.set_silent(false);
        agent.reply(codes::ACK, Bytes::new());
        tokio::time::timeout(Duration::from_secs(1), slow).await???;
        assert_eq!(hyperstart.outstanding(), 0);

        cancel.cancel();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_paused_time_is_not_charged() -> anyhow::Result<()> {
        let (agent, hyperstart) = FakeAgent::connected(false);
        agent.set_silent(true);
        hyperstart.pause(true);

        let probing = tokio::spawn({
            let hyperstart = hyperstart.clone();
            async move { probe(&hyperstart, Duration::from_millis(50)).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!probing.is_finished());

        hyperstart.pause(false);
        let result = tokio::time::timeout(Duration::from_secs(1), probing).await??;
        assert!(matches!(result, Err(HyperboxError::Timeout(_))));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_interrupt_on_close() -> anyhow::Result<()> {
        let (_agent, hyperstart) = FakeAgent::connected(false);
        let (hub, mut events) = mpsc::channel(8);

        tokio::spawn(interrupt_on_close(
            "vm-1".to_string(),
            hyperstart.clone(),
            hub,
            CancellationToken::new(),
        ));
        hyperstart.close();

        match events.recv().await {
            Some(VmEvent::Interrupted { reason }) => assert_eq!(reason, "hyperstart stopped"),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }
}
