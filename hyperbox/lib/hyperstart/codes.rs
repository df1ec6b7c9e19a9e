//! Command codes of the control protocol.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Queries the agent protocol version.
pub const VERSION: u32 = 0;

/// Starts the sandbox.
pub const STARTPOD: u32 = 1;

/// Queries the sandbox.
pub const GETPOD: u32 = 2;

/// Destroys the sandbox. No command is sent after this one is acknowledged.
pub const DESTROYPOD: u32 = 4;

/// Restarts a container.
pub const RESTARTCONTAINER: u32 = 5;

/// Starts a process in a container.
pub const EXECCMD: u32 = 6;

/// A process finished.
pub const FINISHCMD: u32 = 7;

/// The agent is ready to accept commands.
pub const READY: u32 = 8;

/// The oldest outstanding command succeeded.
pub const ACK: u32 = 9;

/// The oldest outstanding command failed.
pub const ERROR: u32 = 10;

/// Resizes a terminal.
pub const WINSIZE: u32 = 11;

/// Liveness probe.
pub const PING: u32 = 12;

/// The sandbox finished.
pub const FINISHPOD: u32 = 13;

/// Byte-count acknowledgment for flow control.
pub const NEXT: u32 = 14;

/// Writes a file inside a container.
pub const WRITEFILE: u32 = 15;

/// Reads a file inside a container.
pub const READFILE: u32 = 16;

/// Creates and starts a container.
pub const NEWCONTAINER: u32 = 17;

/// Signals the init process of a container.
pub const KILLCONTAINER: u32 = 18;

/// Brings hotplugged vCPUs and memory online.
pub const ONLINECPUMEM: u32 = 19;

/// Configures a network interface.
pub const SETUPINTERFACE: u32 = 20;

/// Installs routes.
pub const SETUPROUTE: u32 = 21;

/// Removes a container.
pub const REMOVECONTAINER: u32 = 22;

/// Asynchronous process notification.
pub const PROCESSASYNCEVENT: u32 = 23;

/// Signals a process.
pub const SIGNALPROCESS: u32 = 24;

/// Removes a network interface.
pub const DELETEINTERFACE: u32 = 25;

/// The agent protocol version this crate speaks.
pub const HYPERSTART_API_VERSION: u32 = 4244;

/// The pseudo container hosting processes executed directly in the agent's namespace.
pub const HYPERSTART_EXEC_CONTAINER: &str = "hyperstart";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a printable name for a command code.
pub fn code_name(code: u32) -> &'static str {
    match code {
        VERSION => "VERSION",
        STARTPOD => "STARTPOD",
        GETPOD => "GETPOD",
        DESTROYPOD => "DESTROYPOD",
        RESTARTCONTAINER => "RESTARTCONTAINER",
        EXECCMD => "EXECCMD",
        FINISHCMD => "FINISHCMD",
        READY => "READY",
        ACK => "ACK",
        ERROR => "ERROR",
        WINSIZE => "WINSIZE",
        PING => "PING",
        FINISHPOD => "FINISHPOD",
        NEXT => "NEXT",
        WRITEFILE => "WRITEFILE",
        READFILE => "READFILE",
        NEWCONTAINER => "NEWCONTAINER",
        KILLCONTAINER => "KILLCONTAINER",
        ONLINECPUMEM => "ONLINECPUMEM",
        SETUPINTERFACE => "SETUPINTERFACE",
        SETUPROUTE => "SETUPROUTE",
        REMOVECONTAINER => "REMOVECONTAINER",
        PROCESSASYNCEVENT => "PROCESSASYNCEVENT",
        SIGNALPROCESS => "SIGNALPROCESS",
        DELETEINTERFACE => "DELETEINTERFACE",
        _ => "UNKNOWN",
    }
}
