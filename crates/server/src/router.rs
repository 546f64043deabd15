//! Fan-out router: one engine, many endpoints
//!
//! Broadcasts go to every registered endpoint; dataset replies go only to
//! the endpoint that asked. Sends never wait: an endpoint whose queue is
//! full or closed is dropped on the spot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ticker_core::{ClientMessage, EndpointError, EndpointId, ServerMessage, Tick};
use ticker_price_feed::AggregationEngine;

use crate::registry::{Endpoint, EndpointRegistry};

pub struct FanOutRouter {
    engine: Arc<AggregationEngine>,
    registry: Arc<EndpointRegistry>,
    /// Orders connects against tick batches so a new endpoint's snapshot
    /// never misses a batch it will not also receive as an update.
    gate: Mutex<()>,
    broadcasts: AtomicU64,
    dropped_endpoints: AtomicU64,
}

impl FanOutRouter {
    pub fn new(engine: Arc<AggregationEngine>, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            engine,
            registry,
            gate: Mutex::new(()),
            broadcasts: AtomicU64::new(0),
            dropped_endpoints: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Open an in-process endpoint and connect it
    pub fn connect(&self, buffer: usize) -> (EndpointId, mpsc::Receiver<ServerMessage>) {
        let (endpoint, rx) = self.registry.open(buffer);
        let id = endpoint.id();
        self.on_connect(endpoint);
        (id, rx)
    }

    /// Register the endpoint and send it the current snapshot.
    ///
    /// Returns false if the endpoint was already connected or could not take
    /// the snapshot.
    pub fn on_connect(&self, endpoint: Endpoint) -> bool {
        let _gate = self.gate.lock();
        let id = endpoint.id();

        if !self.registry.add(endpoint.clone()) {
            debug!("{} already connected", id);
            return false;
        }

        let snapshot = self.engine.snapshot();
        let instruments = snapshot.len();
        if let Err(e) = endpoint.send(ServerMessage::Init(snapshot)) {
            self.drop_endpoint(e);
            return false;
        }

        info!("{} connected ({} instruments in snapshot)", id, instruments);
        true
    }

    /// Unregister the endpoint; idempotent
    pub fn on_disconnect(&self, id: EndpointId) -> bool {
        let removed = self.registry.remove(id).is_some();
        if removed {
            info!("{} disconnected", id);
        }
        removed
    }

    /// Apply a batch and broadcast one update to every endpoint.
    ///
    /// Returns the number of endpoints the update was queued for.
    pub fn on_tick_batch(&self, batch: &[Tick]) -> usize {
        let _gate = self.gate.lock();

        let updates = self.engine.apply(batch);
        if updates.is_empty() {
            return 0;
        }

        let msg = ServerMessage::Update(updates);
        let mut delivered = 0;

        for endpoint in self.registry.list() {
            match endpoint.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => self.drop_endpoint(e),
            }
        }

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!("Broadcast update to {} endpoints", delivered);
        delivered
    }

    /// Reply with the instrument's history to the requesting endpoint only.
    ///
    /// Unknown instruments get an empty dataset.
    pub fn on_history_request(&self, id: EndpointId, name: &str) -> bool {
        let Some(endpoint) = self.registry.get(id) else {
            debug!("History request from unknown {}", id);
            return false;
        };

        let dataset = self.engine.history(name).unwrap_or_default();
        let reply = ServerMessage::Dataset {
            name: name.to_string(),
            dataset,
        };

        match endpoint.send(reply) {
            Ok(()) => true,
            Err(e) => {
                self.drop_endpoint(e);
                false
            }
        }
    }

    /// Dispatch a decoded consumer message
    pub fn handle_client_message(&self, id: EndpointId, msg: ClientMessage) {
        match msg {
            ClientMessage::GetDataSet(name) => {
                self.on_history_request(id, &name);
            }
            ClientMessage::Close => {
                self.on_disconnect(id);
            }
        }
    }

    fn drop_endpoint(&self, error: EndpointError) {
        let id = match error {
            EndpointError::Closed(id) | EndpointError::Lagging(id) => id,
        };
        if self.registry.remove(id).is_some() {
            self.dropped_endpoints.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping endpoint: {}", error);
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            endpoints: self.registry.len(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            dropped_endpoints: self.dropped_endpoints.load(Ordering::Relaxed),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone)]
pub struct RouterStats {
    pub endpoints: usize,
    pub broadcasts: u64,
    pub dropped_endpoints: u64,
}
