//! The handle every sandbox is launched through.

use std::sync::Arc;

use getset::Getters;

use crate::config::HyperboxConfig;

use super::{HypervisorDriver, VsockCidAllocator};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Bundles the hypervisor backend, the controller configuration and the vsock context id
/// allocator shared by every sandbox launched through it.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Hypervisor {
    /// The backend that runs the VMs.
    driver: Arc<dyn HypervisorDriver>,

    /// The controller configuration.
    config: HyperboxConfig,

    /// Hands out guest context ids.
    cids: Arc<VsockCidAllocator>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Hypervisor {
    /// Creates a handle with its own context id allocator.
    pub fn new(driver: Arc<dyn HypervisorDriver>, config: HyperboxConfig) -> Self {
        Self {
            driver,
            config,
            cids: Arc::new(VsockCidAllocator::new()),
        }
    }

    /// Shares `cids` with other handles, so sandboxes of different backends never get the
    /// same guest context id.
    pub fn with_cid_allocator(mut self, cids: Arc<VsockCidAllocator>) -> Self {
        self.cids = cids;
        self
    }
}
