//! JSON payloads exchanged with the guest agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A block device mounted into a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDescriptor {
    /// The guest device name.
    pub device: String,

    /// The SCSI address of the device.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub addr: String,

    /// Where the device is mounted inside the container.
    pub mount: String,

    /// The filesystem on the device.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub fstype: String,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// Whether the volume is a docker volume that must be populated from the image.
    pub docker_volume: bool,
}

/// A directory of the shared filesystem mapped into a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FsmapDescriptor {
    /// The path relative to the shared directory.
    pub source: String,

    /// Where the directory is mounted inside the container.
    pub path: String,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// Whether the volume is a docker volume that must be populated from the image.
    pub docker_volume: bool,
}

/// An environment variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentVar {
    /// The variable name.
    pub env: String,

    /// The variable value.
    pub value: String,
}

/// A resource limit applied to a process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rlimit {
    /// The limit type, e.g. `RLIMIT_NOFILE`.
    #[serde(rename = "type")]
    pub kind: String,

    /// The hard limit.
    pub hard: u64,

    /// The soft limit.
    pub soft: u64,
}

/// A process started by the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// The process id within its container. The init process of a container is `init`.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub id: String,

    /// The user to run as.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub user: String,

    /// The group to run as.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub group: String,

    /// Supplementary groups.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub additional_groups: Vec<String>,

    /// Whether the process gets a terminal.
    pub terminal: bool,

    /// The stream session carrying stdin and stdout.
    #[serde(skip_serializing_if = "is_zero", default)]
    pub stdio: u64,

    /// The stream session carrying stderr, when not merged into the terminal.
    #[serde(skip_serializing_if = "is_zero", default)]
    pub stderr: u64,

    /// The command line.
    pub args: Vec<String>,

    /// The environment.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub envs: Vec<EnvironmentVar>,

    /// The working directory, relative to the container root.
    pub workdir: String,

    /// Resource limits.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rlimits: Vec<Rlimit>,
}

/// A container as the agent sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// The container id.
    pub id: String,

    /// The rootfs directory inside the image.
    pub rootfs: String,

    /// The filesystem of a block-device image.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub fstype: String,

    /// The image: a guest device name, or a path in the shared directory.
    pub image: String,

    /// The SCSI address of a block-device image.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub addr: String,

    /// Block devices to mount.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub volumes: Vec<VolumeDescriptor>,

    /// Shared directories to mount.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fsmap: Vec<FsmapDescriptor>,

    /// Sysctl settings.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub sysctl: BTreeMap<String, String>,

    /// The init process.
    pub process: Process,

    /// The restart policy. The agent never restarts containers by itself.
    pub restart_policy: String,

    /// Whether the agent initializes the rootfs.
    pub initialize: bool,
}

/// A network interface configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInf {
    /// The guest device name.
    pub device: String,

    /// The IPv4 address.
    pub ip_address: String,

    /// The dotted network mask.
    pub net_mask: String,
}

/// A route.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// The destination network in CIDR form.
    pub dest: String,

    /// The gateway.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub gateway: String,

    /// The outgoing device.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub device: String,
}

/// Networks allowed to use port mappings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortmappingWhiteList {
    /// Networks inside the sandbox network.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub internal_networks: Vec<String>,

    /// Networks outside the sandbox network.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub external_networks: Vec<String>,
}

/// The sandbox description sent with `STARTPOD`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// The guest hostname.
    pub hostname: String,

    /// Name servers.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns: Vec<String>,

    /// Resolver search domains.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns_search: Vec<String>,

    /// Resolver options.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns_options: Vec<String>,

    /// The complete route table.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub routes: Vec<Route>,

    /// The mount tag of the shared directory.
    pub share_dir: String,

    /// Networks allowed to use port mappings.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub portmapping_white_lists: Option<PortmappingWhiteList>,
}

/// Starts a process in an existing container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecCommand {
    /// The container.
    pub container: String,

    /// The process.
    pub process: Process,
}

/// Signals a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalCommand {
    /// The container.
    pub container: String,

    /// The process id within the container.
    pub process: String,

    /// The signal number.
    pub signal: i32,
}

/// Names a file inside a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCommand {
    /// The container.
    pub container: String,

    /// The path inside the container.
    pub file: String,
}

/// Resizes the terminal of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSizeMessage {
    /// The container.
    pub container: String,

    /// The process id within the container.
    pub process: String,

    /// Terminal rows.
    pub row: u16,

    /// Terminal columns.
    pub column: u16,
}

/// An asynchronous notification about a process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessAsyncEvent {
    /// The container.
    pub container: String,

    /// The process id within the container.
    pub process: String,

    /// The event name. Only `finished` is defined.
    pub event: String,

    /// Free-form information.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub info: String,

    /// The exit status for `finished`.
    #[serde(default)]
    pub status: i32,
}

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The only process event the agent sends.
pub const PROCESS_EVENT_FINISHED: &str = "finished";

/// The restart policy sent for every container.
pub const RESTART_POLICY_NEVER: &str = "never";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_zero(v: &u64) -> bool {
    *v == 0
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_wire_names() -> anyhow::Result<()> {
        let process = Process {
            id: "init".to_string(),
            additional_groups: vec!["wheel".to_string()],
            stdio: 3,
            args: vec!["/bin/sh".to_string()],
            rlimits: vec![Rlimit {
                kind: "RLIMIT_NOFILE".to_string(),
                hard: 1024,
                soft: 512,
            }],
            workdir: "/".to_string(),
            ..Default::default()
        };

        let value = serde_json::to_value(&process)?;
        assert_eq!(value["additionalGroups"][0], "wheel");
        assert_eq!(value["stdio"], 3);
        assert!(value.get("stderr").is_none());
        assert_eq!(value["rlimits"][0]["type"], "RLIMIT_NOFILE");
        assert_eq!(value["terminal"], false);

        Ok(())
    }

    #[test]
    fn test_volume_and_pod_wire_names() -> anyhow::Result<()> {
        let volume = VolumeDescriptor {
            device: "sda".to_string(),
            mount: "/data".to_string(),
            read_only: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&volume)?;
        assert_eq!(value["readOnly"], true);
        assert_eq!(value["dockerVolume"], false);
        assert!(value.get("addr").is_none());

        let pod = Pod {
            hostname: "box".to_string(),
            share_dir: "share_dir".to_string(),
            portmapping_white_lists: Some(PortmappingWhiteList {
                internal_networks: vec!["10.0.0.0/8".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&pod)?;
        assert_eq!(value["shareDir"], "share_dir");
        assert_eq!(
            value["portmappingWhiteLists"]["internalNetworks"][0],
            "10.0.0.0/8"
        );

        Ok(())
    }

    #[test]
    fn test_process_async_event_parses_without_info() -> anyhow::Result<()> {
        let event: ProcessAsyncEvent = serde_json::from_str(
            r#"{"container":"c1","process":"init","event":"finished","status":3}"#,
        )?;
        assert_eq!(event.event, PROCESS_EVENT_FINISHED);
        assert_eq!(event.status, 3);
        assert!(event.info.is_empty());

        Ok(())
    }
}
