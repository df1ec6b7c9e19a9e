//! Responses a sandbox reports to its observers.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome class of a [`VmResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    /// A request succeeded.
    Ok,

    /// The guest agent is up and accepts commands.
    VmRunning,

    /// The sandbox is gone.
    VmShutdown,

    /// The guest sandbox is running.
    PodRunning,

    /// A request was malformed.
    BadRequest,

    /// A request or the sandbox failed.
    Failed,

    /// An additional process exited.
    ExecFinished,

    /// The init process of a container exited.
    ContainerFinished,

    /// The sandbox is busy.
    Busy,

    /// A terminal was requested for a process that has none.
    NoTty,

    /// A payload could not be parsed.
    JsonParseFail,

    /// A command was not valid in the current state.
    Unexpected,
}

/// A response broadcast to every observer of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmResponse {
    /// The sandbox that reported.
    pub vm_id: String,

    /// The outcome class.
    pub code: ResponseCode,

    /// A human readable explanation.
    pub cause: String,

    /// The process that finished, for [`ResponseCode::ExecFinished`] and
    /// [`ResponseCode::ContainerFinished`].
    pub process: Option<ProcessFinished>,
}

/// A process exit carried by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFinished {
    /// The container id, or the exec id of an additional process.
    pub id: String,

    /// The exit status.
    pub code: i32,
}

/// A process exit delivered by [`Vm::wait_process`](super::Vm::wait_process).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// The container id, or the exec id of an additional process.
    pub id: String,

    /// The exit status.
    pub code: i32,

    /// When the exit was observed.
    pub finished_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResponseCode {
    /// Returns the numeric value of the code.
    pub fn value(&self) -> i32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::VmRunning => 1,
            ResponseCode::VmShutdown => 2,
            ResponseCode::PodRunning => 3,
            ResponseCode::BadRequest => 4,
            ResponseCode::Failed => 5,
            ResponseCode::ExecFinished => 6,
            ResponseCode::ContainerFinished => 7,
            ResponseCode::Busy => 8,
            ResponseCode::NoTty => 9,
            ResponseCode::JsonParseFail => 10,
            ResponseCode::Unexpected => 11,
        }
    }
}

impl VmResponse {
    /// Creates a response without a process.
    pub fn new(vm_id: impl Into<String>, code: ResponseCode, cause: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            code,
            cause: cause.into(),
            process: None,
        }
    }

    /// Creates a response reporting a process exit.
    pub fn finished(vm_id: impl Into<String>, code: ResponseCode, process: ProcessFinished) -> Self {
        Self {
            vm_id: vm_id.into(),
            code,
            cause: "process finished".to_string(),
            process: Some(process),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::Ok => "E_OK",
            ResponseCode::VmRunning => "E_VM_RUNNING",
            ResponseCode::VmShutdown => "E_VM_SHUTDOWN",
            ResponseCode::PodRunning => "E_POD_RUNNING",
            ResponseCode::BadRequest => "E_BAD_REQUEST",
            ResponseCode::Failed => "E_FAILED",
            ResponseCode::ExecFinished => "E_EXEC_FINISHED",
            ResponseCode::ContainerFinished => "E_CONTAINER_FINISHED",
            ResponseCode::Busy => "E_BUSY",
            ResponseCode::NoTty => "E_NO_TTY",
            ResponseCode::JsonParseFail => "E_JSON_PARSE_FAIL",
            ResponseCode::Unexpected => "E_UNEXPECTED",
        };
        write!(f, "{name}")
    }
}
