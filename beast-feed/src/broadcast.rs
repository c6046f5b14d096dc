//! Periodic eviction and fan-out of the aircraft table.
//!
//! Every tick the broadcaster sweeps stale aircraft out of the store, copies
//! what remains into an immutable [`Snapshot`], and sends one `Arc` of it to
//! every subscriber over a bounded `tokio::sync::broadcast` channel. Sending
//! never waits: a subscriber that falls behind loses the oldest snapshots
//! and picks up again at the newest.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beast_core::{now_secs, AircraftState, AircraftStore};

/// Snapshots buffered per subscriber before it starts lagging.
pub const DEFAULT_CAPACITY: usize = 16;

/// Immutable copy of the table at one tick, sorted by address.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: f64,
    pub aircraft: Vec<AircraftState>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    /// Aircraft with a resolved position.
    pub fn positioned(&self) -> impl Iterator<Item = &AircraftState> {
        self.aircraft.iter().filter(|ac| ac.has_position())
    }
}

pub struct Broadcaster {
    store: Arc<AircraftStore>,
    tx: broadcast::Sender<Arc<Snapshot>>,
    interval: Duration,
    max_age: f64,
}

impl Broadcaster {
    pub fn new(store: Arc<AircraftStore>, interval: Duration, max_age: f64) -> Self {
        Self::with_capacity(store, interval, max_age, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        store: Arc<AircraftStore>,
        interval: Duration,
        max_age: f64,
        capacity: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Broadcaster {
            store,
            tx,
            interval,
            max_age,
        }
    }

    /// Register a consumer. It sees snapshots sent after this call.
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Evict, snapshot, fan out.
    pub fn tick(&self, now: f64) -> Arc<Snapshot> {
        let evicted = self.store.evict_stale(now, self.max_age);
        let mut aircraft = self.store.snapshot();
        aircraft.sort_by_key(|ac| ac.icao);

        let snapshot = Arc::new(Snapshot {
            taken_at: now,
            aircraft,
        });

        metrics::gauge!("beast.aircraft.tracked").set(snapshot.len() as f64);
        metrics::counter!("beast.aircraft.evicted_total").increment(evicted as u64);

        // No receivers is not an error; consumers may not be started yet.
        let delivered = self.tx.send(Arc::clone(&snapshot)).unwrap_or(0);
        debug!(
            aircraft = snapshot.len(),
            evicted,
            subscribers = delivered,
            "broadcast tick"
        );
        snapshot
    }

    /// Tick every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, max_age = self.max_age, "broadcaster started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(now_secs());
                }
            }
        }
        info!("broadcaster stopped");
    }
}

/// Receiving end held by one consumer.
pub struct Subscriber {
    rx: broadcast::Receiver<Arc<Snapshot>>,
}

impl Subscriber {
    /// Next snapshot, skipping any this subscriber lagged behind on.
    /// `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "consumer lagging, dropped snapshots");
                    metrics::counter!("beast.broadcast.lagged_total").increment(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
