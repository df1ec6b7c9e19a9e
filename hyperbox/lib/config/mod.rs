//! Configuration types and helpers.

mod boot;
mod defaults;
mod hyperbox;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use boot::*;
pub use defaults::*;
pub use hyperbox::*;
pub use sandbox::*;
