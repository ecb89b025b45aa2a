//! Time-bounded memoization of forecast results.
//!
//! Each key owns an async slot. A caller holding the slot computes while later
//! callers for the same key wait on it and then read the fresh entry, so at
//! most one computation per key is in flight. Failed computations leave the
//! slot empty. Expired entries are only removed by `sweep`; besides expiry,
//! `invalidate_device` drops a device's entries when its model is replaced.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as SlotMutex;
use tracing::debug;

use crate::horizon::Horizon;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub device_id: String,
    pub horizons: BTreeSet<Horizon>,
}

impl CacheKey {
    pub fn new(device_id: impl Into<String>, horizons: impl IntoIterator<Item = Horizon>) -> Self {
        Self {
            device_id: device_id.into(),
            horizons: horizons.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: DateTime<Utc>,
}

type Slot<V> = Arc<SlotMutex<Option<CacheEntry<V>>>>;

pub struct ResultCache<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored value while `now < expires_at`; otherwise runs
    /// `compute` and stores its result until `now + ttl`.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        ttl: Duration,
        now: DateTime<Utc>,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .expect("cache slot map lock should not be poisoned");
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if now < cached.expires_at {
                debug!(
                    component = "cache",
                    event = "cache.hit",
                    device_id = %key.device_id
                );
                return Ok(cached.value.clone());
            }
        }

        debug!(
            component = "cache",
            event = "cache.miss",
            device_id = %key.device_id
        );
        let value = compute().await?;
        *entry = Some(CacheEntry {
            value: value.clone(),
            expires_at: now + ttl,
        });
        Ok(value)
    }

    /// Drops expired and empty slots; slots with a computation in flight stay.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self
            .slots
            .lock()
            .expect("cache slot map lock should not be poisoned");
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(entry) => entry.as_ref().is_some_and(|e| now < e.expires_at),
            Err(_) => true,
        });
        let removed = before - slots.len();
        debug!(component = "cache", event = "cache.sweep", removed);
        removed
    }

    /// Drops every slot for `device_id`, e.g. after a new model is installed.
    pub fn invalidate_device(&self, device_id: &str) {
        let mut slots = self
            .slots
            .lock()
            .expect("cache slot map lock should not be poisoned");
        slots.retain(|key, _| key.device_id != device_id);
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .expect("cache slot map lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
