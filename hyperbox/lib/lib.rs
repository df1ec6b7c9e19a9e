//! `hyperbox` is the host-side controller for VM-isolated container sandboxes.
//!
//! # Overview
//!
//! Each sandbox is a lightweight VM running the `hyperstart` agent. hyperbox boots the VM
//! through a pluggable hypervisor backend, talks to the agent over a framed control socket and
//! a multiplexed stream socket, and keeps track of everything it has attached to the VM:
//!
//! - containers and their init processes
//! - block and shared-directory volumes
//! - network interfaces and routes
//!
//! # Architecture
//!
//! - **Hyperstart**: the agent protocol engine. Commands are written in order, paced by the
//!   agent's byte-count acknowledgments, and answered one at a time. Process stdio is carried
//!   as numbered sessions on a second socket.
//! - **Hypervisor**: the per-sandbox controller. A single event loop owns the lifecycle state
//!   machine; device hotplug runs as background tasks whose completions come back as events.
//!   Callers receive responses through a fan-out that never blocks the controller.
//! - **Driver**: the hypervisor backend, injected when the controller is created.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hyperbox::{
//!     config::{BootConfig, HyperboxConfig, SandboxConfig},
//!     hypervisor::{Hypervisor, HypervisorDriver, Vm},
//! };
//!
//! async fn boot(driver: Arc<dyn HypervisorDriver>) -> anyhow::Result<()> {
//!     let hypervisor = Hypervisor::new(driver, HyperboxConfig::default());
//!     let boot = BootConfig::builder()
//!         .kernel("/var/lib/hyper/kernel")
//!         .initrd("/var/lib/hyper/hyper-initrd.img")
//!         .build();
//!
//!     let vm = Vm::launch(&hypervisor, None, boot).await?;
//!     vm.wait_init(None).await?;
//!     vm.init_sandbox(&SandboxConfig::default()).await?;
//!     vm.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`] - Controller, boot and sandbox configuration
//! - [`hyperstart`] - The guest agent protocol
//! - [`hypervisor`] - Sandbox lifecycle, devices and the driver contract

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod hyperstart;
pub mod hypervisor;

pub use error::*;
