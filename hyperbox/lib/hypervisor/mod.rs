//! Sandbox lifecycle, device hotplug and the hypervisor backend contract.
//!
//! A [`Vm`] is launched through a [`Hypervisor`], which carries the injected
//! [`HypervisorDriver`]. Each sandbox runs one event loop owning its lifecycle state; device
//! hotplug and guest commands run as tasks of their own and hand their outcome back to the
//! caller that started them. Lifecycle outcomes are broadcast as [`VmResponse`]s.

mod backend;
mod console;
mod container;
mod context;
mod disk;
mod driver;
mod events;
mod fanout;
mod network;
mod persist;
mod report;
mod states;
mod tty;
mod vm;
mod vsock;
mod watch;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use backend::*;
pub use container::*;
pub use context::VmState;
pub use disk::*;
pub use driver::*;
pub use events::*;
pub use fanout::*;
pub use network::*;
pub use persist::*;
pub use report::*;
pub use tty::*;
pub use vm::*;
pub use vsock::*;

pub(crate) use states::run_loop;
