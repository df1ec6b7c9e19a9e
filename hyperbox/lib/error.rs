use thiserror::Error;

use hyperutils::HyperutilsError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a hyperbox-related operation.
pub type HyperboxResult<T> = Result<T, HyperboxError>;

/// An error that occurred while managing a sandbox.
#[derive(Debug, Error)]
pub enum HyperboxError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// An error from the shared utilities.
    #[error("utils error: {0}")]
    Utils(#[from] HyperutilsError),

    /// Malformed or inconsistent request content.
    #[error("spec error: {0}")]
    Spec(String),

    /// No free slot or address for the requested resource.
    #[error("resource unavailable: {0}")]
    Busy(String),

    /// The hypervisor backend failed to attach or detach hardware.
    #[error("device operation error: {0}")]
    Device(String),

    /// The sandbox is not in a state that accepts requests.
    #[error("sandbox {0} is not ready to accept requests")]
    NotReady(String),

    /// A malformed frame or unexpected reply from the guest agent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The guest agent connection is closed.
    #[error("hyperstart closed")]
    AgentClosed,

    /// The guest agent explicitly rejected a command.
    #[error("hyperstart error: {0}")]
    Agent(String),

    /// An operation did not finish in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A command arrived that is not valid in the current state.
    #[error("unexpected {event} during {state}")]
    UnexpectedRequest {
        /// The event that was rejected.
        event: String,

        /// The state the sandbox was in.
        state: String,
    },

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A persisted snapshot could not be used.
    #[error("persist error: {0}")]
    Persist(String),

    /// A persisted snapshot has a version this build cannot load.
    #[error("unsupported persist version {found}, expected {supported}")]
    UnsupportedPersistVersion {
        /// The version found in the snapshot.
        found: u32,

        /// The version this build writes.
        supported: u32,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HyperboxError {
    /// Returns a stable identifier for the class of failure.
    pub fn kind(&self) -> &'static str {
        match self {
            HyperboxError::Spec(_) => "SPEC_ERROR",
            HyperboxError::Busy(_) => "RESOURCE_UNAVAILABLE",
            HyperboxError::Device(_) => "DEVICE_OPERATION_FAIL",
            HyperboxError::NotReady(_) => "VM_NOT_READY",
            HyperboxError::Protocol(_) | HyperboxError::AgentClosed => "CONNECTION_ERROR",
            HyperboxError::Agent(_) => "AGENT_ERROR",
            HyperboxError::Timeout(_) => "TIMEOUT",
            HyperboxError::UnexpectedRequest { .. } => "UNEXPECTED_REQUEST",
            HyperboxError::NotFound(_) => "NOT_FOUND",
            HyperboxError::Conflict(_) => "CONFLICT",
            HyperboxError::Persist(_) | HyperboxError::UnsupportedPersistVersion { .. } => {
                "PERSIST_ERROR"
            }
            HyperboxError::Io(_)
            | HyperboxError::Json(_)
            | HyperboxError::ConfigParse(_)
            | HyperboxError::Utils(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns `true` if the error means the guest agent connection is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HyperboxError::Protocol(_) | HyperboxError::AgentClosed
        )
    }
}
