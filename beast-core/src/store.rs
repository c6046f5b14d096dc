//! Shared aircraft table.
//!
//! A single `RwLock` around the address map. Readers copy records out, so a
//! snapshot never holds the lock while a consumer iterates it. Writers that
//! merge decoded fields go through [`AircraftStore::upsert`], which runs the
//! whole read-merge-write under the write lock so two feeds reporting the
//! same aircraft cannot lose each other's fields.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::aircraft::AircraftState;
use crate::types::{icao_to_string, Icao};

/// Aircraft silent for longer than this are evicted (seconds).
pub const EVICTION_AGE_SECS: f64 = 59.0;

#[derive(Debug, Default)]
pub struct AircraftStore {
    inner: RwLock<HashMap<Icao, AircraftState>>,
}

impl AircraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Every write replaces a whole record or mutates one in place through a
    // closure that cannot observe a torn value, so a poisoned lock still
    // guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Icao, AircraftState>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Icao, AircraftState>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of one record.
    pub fn load(&self, icao: &Icao) -> Option<AircraftState> {
        self.read().get(icao).cloned()
    }

    pub fn contains(&self, icao: &Icao) -> bool {
        self.read().contains_key(icao)
    }

    /// Replace the record for `icao`.
    pub fn store(&self, icao: Icao, state: AircraftState) {
        self.write().insert(icao, state);
    }

    pub fn delete(&self, icao: &Icao) -> Option<AircraftState> {
        self.write().remove(icao)
    }

    /// Independent copies of every record.
    pub fn snapshot(&self) -> Vec<AircraftState> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Create the record if needed, then mutate it under the write lock.
    pub fn upsert<R>(
        &self,
        icao: Icao,
        now: f64,
        f: impl FnOnce(&mut AircraftState) -> R,
    ) -> R {
        let mut map = self.write();
        let state = map.entry(icao).or_insert_with(|| {
            debug!(icao = %icao_to_string(&icao), "new aircraft");
            AircraftState::new(icao, now)
        });
        f(state)
    }

    /// Mutate an existing record. `None` when the address is not tracked.
    pub fn update_existing<R>(
        &self,
        icao: &Icao,
        f: impl FnOnce(&mut AircraftState) -> R,
    ) -> Option<R> {
        self.write().get_mut(icao).map(f)
    }

    /// Full-table sweep removing every aircraft silent for more than
    /// `max_age` seconds. Returns the number removed.
    pub fn evict_stale(&self, now: f64, max_age: f64) -> usize {
        let mut map = self.write();
        let before = map.len();
        map.retain(|_, ac| !ac.is_stale(now, max_age));
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "evicted stale aircraft");
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
