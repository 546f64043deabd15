//! Aggregation engine: raw ticks in, derived state and history out
//!
//! A single write lock is held for the whole of one batch, so readers
//! observe every instrument either before or after a batch, never halfway.
//! Reads hand out copies, never references into the maps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use ticker_core::{
    round2, HistorySample, InstrumentState, InstrumentUpdate, Snapshot, Tick, TickError,
    TickResult, DEFAULT_HISTORY_CAPACITY,
};

use crate::history::HistoryBuffer;

#[derive(Debug, Default)]
struct EngineInner {
    states: HashMap<String, InstrumentState>,
    histories: HashMap<String, HistoryBuffer>,
    tick_count: u64,
    rejected_count: u64,
    last_update: Option<DateTime<Utc>>,
}

/// Authoritative owner of instrument state and history
#[derive(Debug)]
pub struct AggregationEngine {
    inner: RwLock<EngineInner>,
    capacity: usize,
}

impl AggregationEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(EngineInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Apply a batch in order, returning one update per accepted tick.
    ///
    /// Malformed ticks are logged and skipped; the rest of the batch still applies.
    pub fn apply(&self, batch: &[Tick]) -> Vec<InstrumentUpdate> {
        let mut inner = self.inner.write();
        let mut updates = Vec::with_capacity(batch.len());

        for tick in batch {
            match Self::apply_tick(&mut inner, self.capacity, tick, Utc::now()) {
                Ok(update) => updates.push(update),
                Err(e) => {
                    inner.rejected_count += 1;
                    warn!("Rejected tick: {}", e);
                }
            }
        }

        debug!(
            "Applied batch: {} ticks, {} accepted",
            batch.len(),
            updates.len()
        );

        updates
    }

    fn apply_tick(
        inner: &mut EngineInner,
        capacity: usize,
        tick: &Tick,
        now: DateTime<Utc>,
    ) -> TickResult<InstrumentUpdate> {
        if tick.name.trim().is_empty() {
            return Err(TickError::EmptyName);
        }
        let price = round2(tick.price).ok_or_else(|| TickError::InvalidPrice {
            name: tick.name.clone(),
            price: tick.price,
        })?;

        let state = match inner.states.get(&tick.name) {
            Some(prev) => prev.next(price, now),
            None => InstrumentState::first(price, now),
        };
        inner.states.insert(tick.name.clone(), state.clone());

        inner
            .histories
            .entry(tick.name.clone())
            .or_insert_with(|| HistoryBuffer::new(capacity))
            .push(HistorySample { price, time: now });

        inner.tick_count += 1;
        inner.last_update = Some(now);

        Ok(InstrumentUpdate {
            name: tick.name.clone(),
            state,
        })
    }

    /// Full current state, for late-joining consumers
    pub fn snapshot(&self) -> Snapshot {
        self.inner
            .read()
            .states
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }

    /// Current state of one instrument
    pub fn state(&self, name: &str) -> Option<InstrumentState> {
        self.inner.read().states.get(name).cloned()
    }

    /// Recent samples oldest-first, or `None` if the name was never ticked
    pub fn history(&self, name: &str) -> Option<Vec<HistorySample>> {
        self.inner.read().histories.get(name).map(HistoryBuffer::to_vec)
    }

    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.read();

        EngineStats {
            instrument_count: inner.states.len(),
            tick_count: inner.tick_count,
            rejected_count: inner.rejected_count,
            last_update: inner.last_update,
        }
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Statistics about the engine
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub instrument_count: usize,
    pub tick_count: u64,
    pub rejected_count: u64,
    pub last_update: Option<DateTime<Utc>>,
}
