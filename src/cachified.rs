//! Stale-while-revalidate wrapper around the cache.
//!
//! `cachified` returns the cached value for a key when it is still
//! usable and otherwise produces it with the supplied closure. A stale
//! hit answers immediately and refreshes in the background. Concurrent
//! refreshes of one key collapse into a single producer call.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use spdlog::{debug, warn};

use crate::cache::{now_ms, Cache, CacheEntry, EntryState};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CachifiedOptions {
    pub key: String,
    /// Freshness window in ms, `None` for never stale.
    pub ttl: Option<i64>,
    /// Extra window in ms in which a stale value is still served.
    pub swr: Option<i64>,
    /// Skip the cached value and produce a new one now.
    pub force_fresh: bool,
}

impl CachifiedOptions {
    pub fn new(key: String, ttl: Option<i64>, swr: Option<i64>) -> Self {
        CachifiedOptions {
            key,
            ttl,
            swr,
            force_fresh: false,
        }
    }

    pub fn force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }
}

pub async fn cachified<T, F, Fut>(
    cache: &Arc<Cache>,
    options: CachifiedOptions,
    get_fresh_value: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let CachifiedOptions {
        key,
        ttl,
        swr,
        force_fresh,
    } = options;

    if !force_fresh {
        if let Some(entry) = cache.get(&key)? {
            let state = entry.state(now_ms());
            if state != EntryState::Expired {
                // A value that no longer deserializes is treated as a
                // miss, the stored shape predates the current type.
                if let Ok(value) = serde_json::from_value::<T>(entry.value) {
                    if state == EntryState::Stale {
                        debug!("Serving stale value for {}, revalidating", key);
                        spawn_revalidate(cache.clone(), key, ttl, swr, get_fresh_value);
                    }
                    return Ok(value);
                }
            }
        }
    }

    let lock = cache.flight_lock(&key);
    let _guard = lock.lock().await;

    // Another task may have refreshed the key while we waited.
    if !force_fresh {
        if let Some(entry) = cache.get(&key)? {
            if entry.state(now_ms()) == EntryState::Fresh {
                if let Ok(value) = serde_json::from_value::<T>(entry.value) {
                    return Ok(value);
                }
            }
        }
    }

    match get_fresh_value().await {
        Ok(value) => {
            store(cache, &key, &value, ttl, swr)?;
            Ok(value)
        }
        Err(e) => {
            // A still usable stale value beats surfacing the failure.
            if let Some(entry) = cache.get(&key)? {
                if entry.state(now_ms()) != EntryState::Expired {
                    if let Ok(value) = serde_json::from_value::<T>(entry.value) {
                        warn!("Serving stale value for {} after refresh failed: {}", key, e);
                        return Ok(value);
                    }
                }
            }
            Err(e)
        }
    }
}

fn store<T: Serialize>(
    cache: &Arc<Cache>,
    key: &str,
    value: &T,
    ttl: Option<i64>,
    swr: Option<i64>,
) -> Result<()> {
    let entry = CacheEntry::new(serde_json::to_value(value)?, ttl, swr);
    cache.set(key, entry)
}

fn spawn_revalidate<T, F, Fut>(
    cache: Arc<Cache>,
    key: String,
    ttl: Option<i64>,
    swr: Option<i64>,
    get_fresh_value: F,
) where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(async move {
        let lock = cache.flight_lock(&key);
        // A held lock means a refresh is already underway.
        let Ok(_guard) = lock.try_lock() else { return };
        match cache.get(&key) {
            Ok(Some(entry)) if entry.state(now_ms()) == EntryState::Fresh => return,
            _ => {}
        }
        match get_fresh_value().await {
            Ok(value) => {
                if let Err(e) = store(&cache, &key, &value, ttl, swr) {
                    warn!("Storing revalidated value for {} failed: {}", key, e);
                }
            }
            Err(e) => warn!("Background revalidation for {} failed: {}", key, e),
        }
    });
}
