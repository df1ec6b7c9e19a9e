//! Broadcasts the responses of a sandbox to any number of subscribers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::VmResponse;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Copies every response from one upstream channel to each current subscriber.
///
/// Delivery never blocks: a subscriber whose buffer is full misses the response. When the
/// upstream closes, or [`close`](Self::close) is called, every subscriber channel is closed and
/// later subscribers get a channel that is already closed.
#[derive(Debug, Clone)]
pub struct Fanout {
    shared: Arc<FanoutShared>,
}

/// One subscription to a [`Fanout`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<VmResponse>,
    fanout: Fanout,
}

#[derive(Debug)]
struct FanoutShared {
    state: Mutex<FanoutState>,
    capacity: usize,
    close: CancellationToken,
}

#[derive(Debug)]
struct FanoutState {
    upstream: Option<mpsc::UnboundedReceiver<VmResponse>>,
    clients: HashMap<u64, mpsc::Sender<VmResponse>>,
    next_id: u64,
    running: bool,
    closed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Fanout {
    /// Creates a fan-out over `upstream`.
    ///
    /// Subscriber channels hold `capacity` responses. A blocking fan-out leaves responses in
    /// the upstream until the first subscriber arrives; otherwise pumping starts right away
    /// and responses with no subscriber are discarded.
    pub fn new(upstream: mpsc::UnboundedReceiver<VmResponse>, capacity: usize, blocking: bool) -> Self {
        let fanout = Self {
            shared: Arc::new(FanoutShared {
                state: Mutex::new(FanoutState {
                    upstream: Some(upstream),
                    clients: HashMap::new(),
                    next_id: 0,
                    running: false,
                    closed: false,
                }),
                capacity: capacity.max(1),
                close: CancellationToken::new(),
            }),
        };

        if !blocking {
            let mut state = fanout.shared.lock();
            fanout.start(&mut state);
        }

        fanout
    }

    /// Subscribes to the responses reported from now on.
    pub fn acquire(&self) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;

        if !state.closed {
            state.clients.insert(id, tx);
            if !state.running {
                self.start(&mut state);
            }
        }

        Subscriber {
            id,
            rx,
            fanout: self.clone(),
        }
    }

    /// Unsubscribes and closes the channel of a subscriber.
    pub fn release(&self, id: u64) {
        self.shared.lock().clients.remove(&id);
    }

    /// Closes the fan-out and every subscriber channel. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if !state.running && state.upstream.take().is_some() {
                state.close_all();
            }
        }
        self.shared.close.cancel();
    }

    /// Returns the number of current subscribers.
    pub fn subscribers(&self) -> usize {
        self.shared.lock().clients.len()
    }

    /// Returns `true` once every subscriber has been closed for good.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn start(&self, state: &mut FanoutState) {
        if let Some(upstream) = state.upstream.take() {
            state.running = true;
            tokio::spawn(pump(self.shared.clone(), upstream));
        }
    }
}

impl Subscriber {
    /// Returns the id of the subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next response, or `None` once the fan-out is closed.
    pub async fn recv(&mut self) -> Option<VmResponse> {
        self.rx.recv().await
    }

    /// Receives a response if one is buffered.
    pub fn try_recv(&mut self) -> Option<VmResponse> {
        self.rx.try_recv().ok()
    }
}

impl FanoutShared {
    fn lock(&self) -> MutexGuard<'_, FanoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, response: VmResponse) {
        let mut state = self.lock();
        state.clients.retain(|id, tx| match tx.try_send(response.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, code = %response.code, "subscriber is full, response dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

impl FanoutState {
    fn close_all(&mut self) {
        self.clients.clear();
        self.running = false;
        self.closed = true;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.fanout.release(self.id);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn pump(shared: Arc<FanoutShared>, mut upstream: mpsc::UnboundedReceiver<VmResponse>) {
    loop {
        tokio::select! {
            _ = shared.close.cancelled() => break,
            response = upstream.recv() => match response {
                Some(response) => shared.broadcast(response),
                None => break,
            },
        }
    }

    tracing::debug!("response fan-out closed");
    shared.lock().close_all();
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hypervisor::ResponseCode;

    fn response(cause: &str) -> VmResponse {
        VmResponse::new("vm-1", ResponseCode::Ok, cause)
    }

    #[tokio::test]
    async fn test_fanout_drops_responses_for_full_subscribers() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = Fanout::new(rx, 1, true);
        let mut slow = fanout.acquire();

        tx.send(response("first"))?;
        tx.send(response("second"))?;
        tx.send(response("third"))?;
        drop(tx);

        let first = tokio::time::timeout(Duration::from_secs(1), slow.recv()).await?;
        assert_eq!(first.map(|r| r.cause), Some("first".to_string()));
        let end = tokio::time::timeout(Duration::from_secs(1), slow.recv()).await?;
        assert!(end.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_fanout_broadcasts_to_every_subscriber() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = Fanout::new(rx, 8, false);
        let mut a = fanout.acquire();
        let mut b = fanout.acquire();
        assert_eq!(fanout.subscribers(), 2);

        tx.send(response("hello"))?;
        assert_eq!(a.recv().await.map(|r| r.cause), Some("hello".to_string()));
        assert_eq!(b.recv().await.map(|r| r.cause), Some("hello".to_string()));

        drop(b);
        assert_eq!(fanout.subscribers(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_blocking_fanout_waits_for_first_subscriber() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = Fanout::new(rx, 8, true);
        tx.send(response("early"))?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut sub = fanout.acquire();
        assert_eq!(sub.recv().await.map(|r| r.cause), Some("early".to_string()));

        Ok(())
    }

    #[tokio::test]
    async fn test_upstream_close_closes_all_subscribers() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel::<VmResponse>();
        let fanout = Fanout::new(rx, 8, false);
        let mut a = fanout.acquire();
        let mut b = fanout.acquire();

        drop(tx);
        assert!(tokio::time::timeout(Duration::from_secs(1), a.recv()).await?.is_none());
        assert!(tokio::time::timeout(Duration::from_secs(1), b.recv()).await?.is_none());
        assert!(fanout.is_closed());

        let mut late = fanout.acquire();
        assert!(late.recv().await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_close_without_subscribers() -> anyhow::Result<()> {
        let (_tx, rx) = mpsc::unbounded_channel::<VmResponse>();
        let fanout = Fanout::new(rx, 8, true);
        fanout.close();
        fanout.close();
        assert!(fanout.is_closed());

        let mut late = fanout.acquire();
        assert!(late.recv().await.is_none());

        let (_tx, rx) = mpsc::unbounded_channel::<VmResponse>();
        let running = Fanout::new(rx, 8, false);
        running.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !running.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        Ok(())
    }
}
