// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt::Debug;
use core::future::Future;
use core::hash::Hash;
use core::time::Duration;
use std::collections::HashMap;
use std::time::Instant;

use b2link_error::{Code, Error, make_err};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::instant_wrapper::InstantWrapper;

/// Slack added on top of every lock wait, absorbing producer latency that is
/// already in flight when a caller starts waiting.
pub const DEFAULT_LOCK_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    // Relative to `anchor_time`.
    expires_at: Duration,
}

/// Keyed cache where at most one producer runs at any time and every entry
/// carries its own time to live.
///
/// Readers that find a live entry never touch the producer lock. Readers that
/// miss queue on the lock, re-check the map once they hold it and only then
/// invoke their producer, so a burst of concurrent misses on one key results
/// in exactly one producer call.
///
/// A producer failure is returned to the caller that ran it and nothing is
/// stored. Callers still queued on the lock will run their own producer.
///
/// Producers must not call back into the same cache: the lock is not
/// re-entrant and the nested call would wait until its own lock timeout.
#[derive(Debug)]
pub struct SingleFlightCache<K, V, I: InstantWrapper = Instant> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    producer_lock: Mutex<()>,
    anchor_time: I,
    lock_grace: Duration,
}

impl<K, V> SingleFlightCache<K, V, Instant>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_anchor(crate::instant_wrapper::default_instant_wrapper(), DEFAULT_LOCK_GRACE)
    }
}

impl<K, V> Default for SingleFlightCache<K, V, Instant>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, I> SingleFlightCache<K, V, I>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
    I: InstantWrapper,
{
    pub fn with_anchor(anchor_time: I, lock_grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            producer_lock: Mutex::new(()),
            anchor_time,
            lock_grace,
        }
    }

    /// Returns a copy of the entry for `key` if it has not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.anchor_time.elapsed();
        self.entries
            .read()
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the live entry for `key` or runs `producer` to create one.
    ///
    /// `max_wait` (plus the grace period) bounds only the wait for the
    /// producer lock. Callers wanting an overall deadline must cancel `cancel`
    /// themselves. Cancelling while waiting or while the producer runs leaves
    /// the cache untouched for every other caller.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: K,
        max_wait: Duration,
        ttl: Duration,
        cancel: &CancellationToken,
        producer: F,
    ) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Error>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let lock_wait = max_wait.saturating_add(self.lock_grace);
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(make_err!(
                    Code::Cancelled,
                    "Cancelled while waiting for the cache lock of {key:?}"
                ));
            }
            guard = tokio::time::timeout(lock_wait, self.producer_lock.lock()) => {
                guard.map_err(|_| {
                    make_err!(
                        Code::DeadlineExceeded,
                        "Could not acquire the cache lock of {key:?} within {lock_wait:?}"
                    )
                })?
            }
        };

        // Whoever held the lock before us may have just produced this entry.
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        event!(Level::DEBUG, ?key, ?ttl, "Refreshing cache entry");
        let value = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(make_err!(
                    Code::Cancelled,
                    "Cancelled while producing the cache entry of {key:?}"
                ));
            }
            result = producer() => result?,
        };

        let now = self.anchor_time.elapsed();
        let mut entries = self.entries.write();
        entries.retain(|_, entry| now < entry.expires_at);
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: now.saturating_add(ttl),
            },
        );
        Ok(value)
    }
}

impl<K, V, I> SingleFlightCache<K, V, I>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
    I: InstantWrapper,
{
    /// Drops the entry for `key` if it still holds `stale`. Used when the
    /// service rejected a cached value before it expired locally. An entry
    /// another caller already replaced is left alone.
    pub fn invalidate_if_eq(&self, key: &K, stale: &V) -> bool {
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| entry.value == *stale) {
            entries.remove(key);
            event!(Level::DEBUG, ?key, "Invalidated cache entry");
            return true;
        }
        false
    }
}
