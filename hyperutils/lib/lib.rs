//! `hyperutils` is a library containing general utilities for the hyperbox project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod log;
pub mod net;
pub mod path;
pub mod sync;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use log::*;
pub use net::*;
pub use path::*;
pub use sync::*;
