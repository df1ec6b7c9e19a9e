//! The lifecycle state machine of a sandbox.
//!
//! One loop per sandbox consumes the events posted to its hub. The loop itself never waits on
//! the guest or the backend; anything slow is spawned and reports back with another event.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{context::VmContext, VmEvent, VmState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs the state machine until the sandbox is closed or released.
pub(crate) async fn run_loop(ctx: Arc<VmContext>, mut events: mpsc::Receiver<VmEvent>) {
    tracing::debug!(sandbox = %ctx.id(), "event loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.closed_token().cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let state = ctx.current();
        tracing::debug!(sandbox = %ctx.id(), %state, %event, "handling event");
        match state {
            VmState::Running => running(&ctx, event).await,
            VmState::Terminating => terminating(&ctx, event).await,
            VmState::Closed => break,
        }
    }
    tracing::debug!(sandbox = %ctx.id(), "event loop exited");
}

async fn running(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::Shutdown => {
            tracing::info!(sandbox = %ctx.id(), "shutting down");
            ctx.set_current(VmState::Terminating);
            ctx.shutdown_vm();
        }
        VmEvent::Release => ctx.release(),
        VmEvent::InitConnected => {
            ctx.mark_connected();
            ctx.report_vm_run();
        }
        VmEvent::VmExit | VmEvent::VmKilled { .. } => {
            tracing::info!(sandbox = %ctx.id(), "VM exited");
            ctx.close().await;
        }
        VmEvent::VmStartFailed { message } => {
            tracing::error!(sandbox = %ctx.id(), %message, "VM start failed");
            ctx.report_vm_fault(&message);
            ctx.close().await;
        }
        VmEvent::VmTimeout => {
            tracing::error!(sandbox = %ctx.id(), "controller timer fired while running");
        }
        VmEvent::InitFailed { reason } | VmEvent::Interrupted { reason } => {
            tracing::error!(sandbox = %ctx.id(), %reason, "lost the guest agent");
            ctx.poweroff();
            ctx.close().await;
        }
        other if other.is_command() => ctx.report_unexpected(&other, VmState::Running),
        other => tracing::warn!(sandbox = %ctx.id(), event = %other, "ignoring event while running"),
    }
}

async fn terminating(ctx: &Arc<VmContext>, event: VmEvent) {
    match event {
        VmEvent::VmExit | VmEvent::VmKilled { .. } => {
            tracing::info!(sandbox = %ctx.id(), "VM stopped");
            ctx.close().await;
        }
        VmEvent::VmTimeout => {
            tracing::warn!(sandbox = %ctx.id(), "shutdown timed out, forcing power off");
            ctx.poweroff();
            ctx.close().await;
        }
        VmEvent::InitFailed { reason } | VmEvent::Interrupted { reason } => {
            tracing::debug!(sandbox = %ctx.id(), %reason, "guest agent gone during shutdown");
        }
        other if other.is_command() => ctx.report_unexpected(&other, VmState::Terminating),
        other => {
            tracing::warn!(sandbox = %ctx.id(), event = %other, "ignoring event while terminating")
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::HyperboxConfig,
        hyperstart::{codes, testing::FakeAgent},
        hypervisor::{
            context::ContextInit, driver::testing::ScriptedDriver, ResponseCode, VmResponse,
            VsockCidAllocator,
        },
    };

    struct Harness {
        ctx: Arc<VmContext>,
        driver: ScriptedDriver,
        agent: FakeAgent,
        responses: mpsc::UnboundedReceiver<VmResponse>,
    }

    fn start(config: HyperboxConfig) -> Harness {
        let driver = ScriptedDriver::new();
        let (agent, hyperstart) = FakeAgent::connected(false);
        let (hub, events) = mpsc::channel(16);
        let (client, responses) = mpsc::unbounded_channel();
        let info = driver.sandbox_info("vm-test");

        let ctx = VmContext::new(ContextInit {
            id: "vm-test".to_string(),
            config,
            info: info.clone(),
            dctx: Arc::new(driver.clone()),
            hyperstart,
            hub: hub.clone(),
            client,
            cids: Arc::new(VsockCidAllocator::new()),
        });
        ctx.dctx().launch(&info, hub);
        tokio::spawn(run_loop(ctx.clone(), events));

        Harness {
            ctx,
            driver,
            agent,
            responses,
        }
    }

    async fn next_code(h: &mut Harness) -> Option<ResponseCode> {
        tokio::time::timeout(Duration::from_secs(1), h.responses.recv())
            .await
            .ok()
            .flatten()
            .map(|r| r.code)
    }

    #[test_log::test(tokio::test)]
    async fn test_agent_connected_reports_running() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::default());
        h.driver.post(VmEvent::InitConnected).await?;
        assert_eq!(next_code(&mut h).await, Some(ResponseCode::VmRunning));
        assert_eq!(h.ctx.current(), VmState::Running);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_graceful_shutdown() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::default());
        h.driver.post(VmEvent::Shutdown).await?;

        h.agent.wait_for_command(codes::DESTROYPOD).await?;
        assert_eq!(next_code(&mut h).await, Some(ResponseCode::VmShutdown));
        assert_eq!(next_code(&mut h).await, None);

        h.ctx.closed_token().cancelled().await;
        assert_eq!(h.ctx.current(), VmState::Closed);
        assert_eq!(h.driver.calls_with("kill").len(), 1);
        assert_eq!(h.driver.calls_with("close").len(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_timer_forces_power_off() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::builder().shutdown_timeout_ms(50).build());
        h.agent.set_silent(true);
        h.driver.ignore_shutdown(true);

        h.driver.post(VmEvent::Shutdown).await?;
        assert_eq!(next_code(&mut h).await, Some(ResponseCode::VmShutdown));
        assert_eq!(h.ctx.current(), VmState::Closed);
        assert_eq!(h.driver.calls_with("kill").len(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unexpected_command_is_reported() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::default());
        h.agent.set_silent(true);
        h.driver.ignore_shutdown(true);

        h.driver.post(VmEvent::Shutdown).await?;
        h.agent.wait_for_command(codes::DESTROYPOD).await?;
        h.driver.post(VmEvent::Release).await?;

        assert_eq!(next_code(&mut h).await, Some(ResponseCode::Unexpected));
        assert_eq!(h.ctx.current(), VmState::Terminating);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_release_leaves_vm_running() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::default());
        h.driver.post(VmEvent::Release).await?;

        assert_eq!(next_code(&mut h).await, Some(ResponseCode::Ok));
        assert_eq!(next_code(&mut h).await, None);
        assert_eq!(h.ctx.current(), VmState::Closed);
        assert!(h.driver.calls_with("kill").is_empty());
        assert!(h.driver.calls_with("close").is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_lost_agent_closes_sandbox() -> anyhow::Result<()> {
        let mut h = start(HyperboxConfig::default());
        h.driver
            .post(VmEvent::Interrupted {
                reason: "hyperstart stopped".to_string(),
            })
            .await?;

        assert_eq!(next_code(&mut h).await, Some(ResponseCode::VmShutdown));
        assert_eq!(h.ctx.current(), VmState::Closed);
        assert_eq!(h.driver.calls_with("kill").len(), 1);
        Ok(())
    }
}
