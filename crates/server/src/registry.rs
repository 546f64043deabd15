//! Connected endpoint tracking

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use ticker_core::{EndpointError, EndpointId, ServerMessage};

/// One connected consumer: an id plus the sending half of its outbound queue.
///
/// Whatever transport serves the consumer drains the receiving half, and
/// tears the connection down once `evicted` is cancelled.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: EndpointId,
    tx: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

impl Endpoint {
    pub fn new(id: EndpointId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            tx,
            evicted: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Queue a message without waiting
    pub fn send(&self, msg: ServerMessage) -> Result<(), EndpointError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => EndpointError::Lagging(self.id),
            TrySendError::Closed(_) => EndpointError::Closed(self.id),
        })
    }

    /// Cancelled when the endpoint leaves the registry, for any reason
    pub fn evicted(&self) -> CancellationToken {
        self.evicted.clone()
    }
}

/// Set of live endpoints
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<EndpointId, Endpoint>,
    next_id: AtomicU64,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id; ids are never handed out twice
    pub fn allocate_id(&self) -> EndpointId {
        EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocate an id and the queue behind it
    pub fn open(&self, buffer: usize) -> (Endpoint, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Endpoint::new(self.allocate_id(), tx), rx)
    }

    /// Returns false if the id was already registered; the existing entry is kept
    pub fn add(&self, endpoint: Endpoint) -> bool {
        let mut inserted = false;
        self.endpoints.entry(endpoint.id).or_insert_with(|| {
            inserted = true;
            endpoint
        });
        inserted
    }

    /// Unknown ids are a no-op
    pub fn remove(&self, id: EndpointId) -> Option<Endpoint> {
        let (_, endpoint) = self.endpoints.remove(&id)?;
        endpoint.evicted.cancel();
        Some(endpoint)
    }

    pub fn get(&self, id: EndpointId) -> Option<Endpoint> {
        self.endpoints.get(&id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.contains_key(&id)
    }

    /// Copy of the current endpoints, safe to iterate while others are removed
    pub fn list(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
