use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{config::VSOCK_GUEST_CID_MIN, HyperboxError, HyperboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands out vsock guest context ids, lowest free id first.
#[derive(Debug)]
pub struct VsockCidAllocator {
    used: Mutex<BTreeSet<u32>>,
    min: u32,
    max: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VsockCidAllocator {
    /// Creates an allocator over every id a guest may use.
    pub fn new() -> Self {
        Self::with_range(VSOCK_GUEST_CID_MIN, u32::MAX)
    }

    /// Creates an allocator over `min..=max`.
    pub fn with_range(min: u32, max: u32) -> Self {
        Self {
            used: Mutex::new(BTreeSet::new()),
            min,
            max,
        }
    }

    /// Allocates the lowest free id.
    pub fn allocate(&self) -> HyperboxResult<u32> {
        let mut used = self.lock();
        let mut candidate = self.min;
        for cid in used.range(self.min..) {
            if *cid != candidate {
                break;
            }
            if candidate == self.max {
                return Err(HyperboxError::Busy("no free vsock guest cid".to_string()));
            }
            candidate += 1;
        }

        if candidate > self.max {
            return Err(HyperboxError::Busy("no free vsock guest cid".to_string()));
        }

        used.insert(candidate);
        Ok(candidate)
    }

    /// Reserves a specific id, as recorded by a restored sandbox.
    pub fn mark_used(&self, cid: u32) -> HyperboxResult<()> {
        if cid < self.min || cid > self.max {
            return Err(HyperboxError::Spec(format!(
                "vsock guest cid {cid} is out of range"
            )));
        }

        if !self.lock().insert(cid) {
            return Err(HyperboxError::Conflict(format!(
                "vsock guest cid {cid} is already in use"
            )));
        }

        Ok(())
    }

    /// Returns an id to the pool.
    pub fn release(&self, cid: u32) {
        self.lock().remove(&cid);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for VsockCidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
