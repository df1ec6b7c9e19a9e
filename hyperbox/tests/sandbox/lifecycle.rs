use std::{sync::Arc, time::Duration};

use hyperbox::{
    config::{BootConfig, HyperboxConfig, SandboxConfig},
    hyperstart::{codes, INIT_PROCESS_ID},
    hypervisor::{ContainerDescription, Hypervisor, Vm, VmState, VolumeDescription},
};

use super::{agent::Agent, driver::NullDriver};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

//--------------------------------------------------------------------------------------------------
// Function: Helper
//--------------------------------------------------------------------------------------------------

async fn launch(id: &str) -> anyhow::Result<(tempfile::TempDir, NullDriver, Agent, Vm)> {
    let base = tempfile::tempdir()?;
    let driver = NullDriver::default();
    let config = HyperboxConfig::builder()
        .base_dir(base.path())
        .response_timeout_ms(2_000)
        .build();
    let agent = Agent::listen(&config.sandbox_home(id))?;

    let hypervisor = Hypervisor::new(Arc::new(driver.clone()), config);
    let boot = BootConfig::builder()
        .kernel("/var/lib/hyper/kernel")
        .initrd("/var/lib/hyper/hyper-initrd.img")
        .build();
    let vm = Vm::launch(&hypervisor, Some(id.to_string()), boot).await?;
    vm.wait_init(WAIT).await?;

    Ok((base, driver, agent, vm))
}

fn dir_volume(name: &str, source: &str) -> VolumeDescription {
    VolumeDescription {
        name: name.to_string(),
        source: source.to_string(),
        format: "vfs".to_string(),
        ..Default::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn integration_test_sandbox_runs_a_container() -> anyhow::Result<()> {
    let (_base, driver, agent, vm) = launch("vm-integration").await?;
    vm.init_sandbox(&SandboxConfig::default()).await?;

    vm.add_volume(dir_volume("logs", "/srv/logs")).await?;
    let mut desc = ContainerDescription {
        id: "web".to_string(),
        image: "/images/web".to_string(),
        rootfs: "rootfs".to_string(),
        root_volume: dir_volume("web-root", "/images/web"),
        path: "/usr/sbin/nginx".to_string(),
        workdir: "/".to_string(),
        ..Default::default()
    };
    desc.volumes.insert(
        "logs".to_string(),
        hyperbox::hypervisor::VolumeReference {
            name: "logs".to_string(),
            mount_points: vec![hyperbox::hypervisor::VolumeMount {
                path: "/var/log/nginx/".to_string(),
                read_only: false,
            }],
        },
    );
    vm.add_container(desc).await?;
    vm.start_container("web").await?;

    let mut exits = vm.wait_process(true, vec!["web".to_string()], WAIT);
    agent.finish("web", INIT_PROCESS_ID, 0)?;
    let exit = exits
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("container exit not reported"))?;
    assert_eq!(exit.code, 0);

    vm.remove_container("web").await?;
    vm.remove_volume("logs").await?;

    vm.shutdown().await?;
    assert_eq!(vm.state(), VmState::Closed);

    let received = agent.received();
    for code in [codes::STARTPOD, codes::NEWCONTAINER, codes::DESTROYPOD] {
        assert!(received.contains(&code), "agent never received {}", codes::code_name(code));
    }
    assert_eq!(driver.calls().iter().filter(|c| *c == "close").count(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn integration_test_crashed_agent_closes_sandbox() -> anyhow::Result<()> {
    let (_base, driver, agent, vm) = launch("vm-crash").await?;

    agent.crash();
    vm.wait_vm(WAIT).await?;

    assert_eq!(vm.state(), VmState::Closed);
    assert!(driver.calls().contains(&"kill".to_string()));

    let err = vm.add_volume(dir_volume("late", "/srv/late")).await.unwrap_err();
    assert_eq!(err.kind(), "VM_NOT_READY");
    Ok(())
}
