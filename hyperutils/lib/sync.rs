//! `hyperutils::sync` contains small synchronization primitives shared by the runtime.

use tokio::sync::watch;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A counter that tasks can wait on until it drops back to zero.
///
/// Cloning a `WaitGroup` yields another handle to the same counter. Each [`add`](Self::add)
/// must be balanced by a [`done`](Self::done); [`wait`](Self::wait) resolves as soon as the
/// outstanding count is zero, including immediately if nothing was ever added.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WaitGroup {
    /// Creates a wait group with nothing outstanding.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Registers `n` more outstanding units of work.
    pub fn add(&self, n: usize) {
        self.count.send_modify(|c| *c += n);
    }

    /// Marks one unit of work as finished.
    pub fn done(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    /// Returns the number of outstanding units of work.
    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until no work is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
