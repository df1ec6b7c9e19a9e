use std::{path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under which every sandbox gets its own home directory.
pub const DEFAULT_BASE_DIR: &str = "/var/run/hyper";

/// The environment variable that overrides [`DEFAULT_BASE_DIR`].
pub const HYPERBOX_HOME_ENV_VAR: &str = "HYPERBOX_HOME";

/// The control socket of the guest agent inside a sandbox home directory.
pub const HYPER_SOCK_NAME: &str = "hyper.sock";

/// The stream socket of the guest agent inside a sandbox home directory.
pub const TTY_SOCK_NAME: &str = "tty.sock";

/// The serial console socket inside a sandbox home directory.
pub const CONSOLE_SOCK_NAME: &str = "console.sock";

/// The file the serial console is copied to.
pub const CONSOLE_LOG_NAME: &str = "console.log";

/// The directory shared with the guest inside a sandbox home directory.
pub const SHARE_DIR_NAME: &str = "share_dir";

/// The mount tag of the shared directory.
pub const SHARE_DIR_TAG: &str = "share_dir";

/// The default number of vCPUs of a sandbox.
pub const DEFAULT_NUM_VCPUS: u32 = 1;

/// The default amount of RAM in MiB of a sandbox.
pub const DEFAULT_RAM_MIB: u32 = 128;

/// The maximum number of vCPUs a sandbox can be grown to.
pub const DEFAULT_MAX_CPUS: u32 = 8;

/// The maximum amount of RAM in MiB a sandbox can be grown to.
pub const DEFAULT_MAX_MEM_MIB: u32 = 32768;

/// The default interval between keep-alive probes, in milliseconds.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// The default time to wait for a connection or a probe reply, in milliseconds.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 60_000;

/// The default time a shutting-down sandbox gets before it is powered off, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// The default capacity of event and response channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// The default number of network interface slots per sandbox.
pub const DEFAULT_MAX_NICS: usize = 256;

/// The first PCI address handed out for hotplugged devices.
pub const PCI_ADDR_FROM: u32 = 0x05;

/// The first SCSI id handed out for hotplugged disks.
pub const SCSI_ID_FROM: u32 = 0;

/// The first stream session id of a freshly booted sandbox.
pub const STREAM_SEQ_FROM: u64 = 1;

/// The vsock port the guest agent accepts control connections on.
pub const VSOCK_CTL_PORT: u32 = 2718;

/// The vsock port the guest agent accepts stream connections on.
pub const VSOCK_STREAM_PORT: u32 = 2719;

/// The lowest context id that can be given to a guest.
pub const VSOCK_GUEST_CID_MIN: u32 = 3;

/// The number of console lines logged at `info` before dropping to `debug`.
pub const CONSOLE_VERBOSE_LINES: usize = 128;

/// The path where sandbox home directories are created.
pub static DEFAULT_HYPERBOX_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    std::env::var_os(HYPERBOX_HOME_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
});
