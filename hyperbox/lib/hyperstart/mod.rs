//! The conversation with `hyperstart`, the agent running inside every sandbox.
//!
//! The agent listens on two sockets. The control socket carries length-prefixed command
//! frames that the agent acknowledges one at a time, in order. The stream socket carries the
//! stdio of every process in the sandbox, multiplexed by session id.
//!
//! [`Hyperstart`] owns both connections. Commands are queued and written by a single writer
//! task that paces itself with the agent's `NEXT` byte-count acknowledgments, and each reply
//! is matched to the oldest outstanding command.

pub mod codes;
mod engine;
mod message;
mod stream;
mod types;

#[cfg(test)]
pub(crate) mod testing;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use engine::*;
pub use message::*;
pub use stream::*;
pub use types::*;
