use crate::push::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type PeerId = Uuid;

pub const DEFAULT_PEER_QUEUE: usize = 64;

#[derive(Debug)]
struct Peer {
    tx: mpsc::Sender<Arc<str>>,
    interest: HashSet<String>,
}

#[derive(Debug)]
pub struct PushHub {
    peers: Mutex<HashMap<PeerId, Peer>>,
    queue_capacity: usize,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_QUEUE)
    }
}

impl PushHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Adds a peer. The receiver yields serialized frames until the peer is
    /// unregistered or evicted.
    pub fn register(&self) -> (PeerId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            Peer {
                tx,
                interest: HashSet::new(),
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: PeerId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Narrows the peer's `prediction_updated`/`data_updated` stream to the
    /// subscribed tickers. Returns false for unknown peers.
    pub fn subscribe(&self, id: PeerId, ticker: &str) -> bool {
        let ticker = ticker.trim().to_ascii_uppercase();
        if ticker.is_empty() {
            return false;
        }
        match self.lock().get_mut(&id) {
            Some(peer) => {
                peer.interest.insert(ticker);
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Sends to every interested peer with room in its queue; evicts the rest.
    /// Returns the number of peers the frame was queued for.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let frame = match serde_json::to_string(event) {
            Ok(s) => Arc::<str>::from(s),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize push event");
                return 0;
            }
        };
        let scope = event.ticker().map(str::to_ascii_uppercase);

        let mut delivered = 0;
        let mut peers = self.lock();
        peers.retain(|id, peer| {
            if let Some(ticker) = &scope {
                if !peer.interest.is_empty() && !peer.interest.contains(ticker) {
                    return true;
                }
            }
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(err) => {
                    tracing::info!(peer = %id, error = %err, "dropping push peer");
                    false
                }
            }
        });
        delivered
    }

    /// Queues a frame for one peer, evicting it on failure.
    pub fn send_to(&self, id: PeerId, event: &ServerEvent) -> bool {
        let Ok(frame) = serde_json::to_string(event) else {
            return false;
        };
        let mut peers = self.lock();
        let Some(peer) = peers.get(&id) else {
            return false;
        };
        if peer.tx.try_send(Arc::from(frame)).is_ok() {
            return true;
        }
        peers.remove(&id);
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
