//! Events consumed by the sandbox event loop and by device completions.

use std::fmt::{self, Display};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The VM process exited.
pub const EVENT_VM_EXIT: u32 = 0;

/// The VM process was killed.
pub const EVENT_VM_KILL: u32 = 1;

/// A controller timer fired.
pub const EVENT_VM_TIMEOUT: u32 = 2;

/// A block device was hotplugged.
pub const EVENT_BLOCK_INSERTED: u32 = 3;

/// A block device was unplugged.
pub const EVENT_BLOCK_EJECTED: u32 = 4;

/// The guest agent answered its first probe.
pub const EVENT_INIT_CONNECTED: u32 = 5;

/// A network device was hotplugged.
pub const EVENT_INTERFACE_INSERTED: u32 = 6;

/// A network device was unplugged.
pub const EVENT_INTERFACE_EJECTED: u32 = 7;

/// A request to shut the sandbox down.
pub const COMMAND_SHUTDOWN: u32 = 8;

/// A request to stop managing the VM without killing it.
pub const COMMAND_RELEASE: u32 = 9;

/// The VM process could not be started.
pub const ERROR_VM_START_FAILED: u32 = 10;

/// The guest agent connection failed.
pub const ERROR_INIT_FAIL: u32 = 11;

/// The hypervisor backend failed a device operation.
pub const ERROR_DEVICE_FAIL: u32 = 12;

/// The guest agent connection ended.
pub const ERROR_INTERRUPTED: u32 = 13;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Something that happened to a sandbox.
///
/// Lifecycle events and commands are posted to the event loop of the sandbox. Device events are
/// delivered by the hypervisor backend on the completion channel of the operation that caused
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    /// The VM process exited.
    VmExit,

    /// The VM process was killed.
    VmKilled {
        /// Whether the kill succeeded.
        success: bool,
    },

    /// A controller timer fired.
    VmTimeout,

    /// The VM process could not be started.
    VmStartFailed {
        /// Why the start failed.
        message: String,
    },

    /// The guest agent answered its first probe.
    InitConnected,

    /// The guest agent connection failed.
    InitFailed {
        /// Why the connection failed.
        reason: String,
    },

    /// The guest agent connection ended.
    Interrupted {
        /// Why the connection ended.
        reason: String,
    },

    /// Shut the sandbox down.
    Shutdown,

    /// Stop managing the VM and leave it running.
    Release,

    /// A block device was hotplugged.
    BlockdevInserted {
        /// The volume name.
        name: String,

        /// `image` for a container root volume, `volume` otherwise.
        source_type: String,

        /// The device name inside the guest.
        device_name: String,

        /// The SCSI address of the device.
        scsi_addr: String,
    },

    /// A block device was unplugged.
    VolumeUnmounted {
        /// The volume name.
        name: String,

        /// Whether the unplug succeeded.
        success: bool,
    },

    /// A network device was hotplugged.
    NetDevInserted {
        /// The eth slot.
        index: usize,

        /// The device name inside the guest.
        device_name: String,

        /// The PCI address of the device.
        address: u32,
    },

    /// A network device was unplugged.
    NetDevRemoved {
        /// The eth slot.
        index: usize,
    },

    /// The hypervisor backend failed a device operation.
    DeviceFailed {
        /// What the backend reported.
        reason: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmEvent {
    /// Returns the numeric code of the event, as used in logs.
    pub fn code(&self) -> u32 {
        match self {
            VmEvent::VmExit => EVENT_VM_EXIT,
            VmEvent::VmKilled { .. } => EVENT_VM_KILL,
            VmEvent::VmTimeout => EVENT_VM_TIMEOUT,
            VmEvent::VmStartFailed { .. } => ERROR_VM_START_FAILED,
            VmEvent::InitConnected => EVENT_INIT_CONNECTED,
            VmEvent::InitFailed { .. } => ERROR_INIT_FAIL,
            VmEvent::Interrupted { .. } => ERROR_INTERRUPTED,
            VmEvent::Shutdown => COMMAND_SHUTDOWN,
            VmEvent::Release => COMMAND_RELEASE,
            VmEvent::BlockdevInserted { .. } => EVENT_BLOCK_INSERTED,
            VmEvent::VolumeUnmounted { .. } => EVENT_BLOCK_EJECTED,
            VmEvent::NetDevInserted { .. } => EVENT_INTERFACE_INSERTED,
            VmEvent::NetDevRemoved { .. } => EVENT_INTERFACE_EJECTED,
            VmEvent::DeviceFailed { .. } => ERROR_DEVICE_FAIL,
        }
    }

    /// Returns the name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            VmEvent::VmExit => "EVENT_VM_EXIT",
            VmEvent::VmKilled { .. } => "EVENT_VM_KILL",
            VmEvent::VmTimeout => "EVENT_VM_TIMEOUT",
            VmEvent::VmStartFailed { .. } => "ERROR_VM_START_FAILED",
            VmEvent::InitConnected => "EVENT_INIT_CONNECTED",
            VmEvent::InitFailed { .. } => "ERROR_INIT_FAIL",
            VmEvent::Interrupted { .. } => "ERROR_INTERRUPTED",
            VmEvent::Shutdown => "COMMAND_SHUTDOWN",
            VmEvent::Release => "COMMAND_RELEASE",
            VmEvent::BlockdevInserted { .. } => "EVENT_BLOCK_INSERTED",
            VmEvent::VolumeUnmounted { .. } => "EVENT_BLOCK_EJECTED",
            VmEvent::NetDevInserted { .. } => "EVENT_INTERFACE_INSERTED",
            VmEvent::NetDevRemoved { .. } => "EVENT_INTERFACE_EJECTED",
            VmEvent::DeviceFailed { .. } => "ERROR_DEVICE_FAIL",
        }
    }

    /// Returns `true` for requests that expect an answer from the sandbox.
    pub fn is_command(&self) -> bool {
        matches!(self, VmEvent::Shutdown | VmEvent::Release)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
