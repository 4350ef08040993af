//! Read-through path from the cache to the backend.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;

use crate::cache::{CacheEntry, CacheStore, Lookup};
use crate::logging;
use crate::metrics;
use crate::resolver::CacheKey;
use crate::store::{ObjectStore, StoreError};

pub mod singleflight;

use singleflight::Group;

type FetchOutcome = Result<Arc<CacheEntry>, StoreError>;

/// Largest buffer reserved up front from the advertised object size.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Fetched {
    /// Freshly loaded from the backend (possibly by another request).
    Loaded(Arc<CacheEntry>),
    /// The backend failed; this is the expired copy served in its place.
    Stale(Arc<CacheEntry>),
}

impl Fetched {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        match self {
            Fetched::Loaded(entry) | Fetched::Stale(entry) => entry,
        }
    }
}

/// Ensures at most one backend fetch per key is running, installs what it
/// loads into the cache, and falls back to stale copies on backend faults.
pub struct FetchCoordinator {
    cache: Arc<CacheStore>,
    store: Arc<dyn ObjectStore>,
    group: Group<CacheKey, FetchOutcome>,
    timeout: Duration,
    stale_fallback: bool,
}

impl FetchCoordinator {
    pub fn new(
        cache: Arc<CacheStore>,
        store: Arc<dyn ObjectStore>,
        timeout: Duration,
        stale_fallback: bool,
    ) -> Self {
        Self {
            cache,
            store,
            group: Group::new(),
            timeout,
            stale_fallback,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.group.in_flight()
    }

    pub async fn fetch(&self, key: &CacheKey) -> Result<Fetched, StoreError> {
        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        let owned_key = key.clone();
        // The leader runs on its own task; carry the caller's trace id over.
        let trace_id = logging::current_trace_id();
        let outcome = self
            .group
            .do_call(key, move || async move {
                let load = load_and_install(cache, store, owned_key, timeout);
                match trace_id {
                    Some(id) => logging::with_trace_id(id, load).await,
                    None => load.await,
                }
            })
            .await
            .unwrap_or_else(|abandoned| Err(StoreError::Backend(abandoned.to_string())));

        match outcome {
            Ok(entry) => Ok(Fetched::Loaded(entry)),
            Err(StoreError::Backend(reason)) if self.stale_fallback => match self.cache.get(key) {
                Lookup::Stale(entry) => {
                    log::warn!("backend failed for {key}, serving stale copy: {reason}");
                    Ok(Fetched::Stale(entry))
                }
                Lookup::Fresh(entry) => Ok(Fetched::Loaded(entry)),
                Lookup::Absent => Err(StoreError::Backend(reason)),
            },
            Err(err) => Err(err),
        }
    }
}

/// Leader body: runs once per burst of requests for `key`.
async fn load_and_install(
    cache: Arc<CacheStore>,
    store: Arc<dyn ObjectStore>,
    key: CacheKey,
    timeout: Duration,
) -> FetchOutcome {
    let loaded = match tokio::time::timeout(timeout, load(store.as_ref(), &key, cache.ttl())).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Backend(format!(
            "fetch timed out after {}ms",
            timeout.as_millis()
        ))),
    };

    match loaded {
        Ok(entry) => {
            metrics::record_backend_fetch("ok");
            let entry = Arc::new(entry);
            cache.put(key, Arc::clone(&entry));
            Ok(entry)
        }
        Err(StoreError::NotFound) => {
            metrics::record_backend_fetch("not_found");
            if cache.evict(&key) {
                log::info!("object {key} no longer exists, evicted cached copy");
            }
            Err(StoreError::NotFound)
        }
        Err(err) => {
            metrics::record_backend_fetch("error");
            log::error!("failed to get object {key}: {err}");
            Err(err)
        }
    }
}

/// Opens the object and drains it fully. The stream is released when this
/// future completes or is dropped by the timeout.
async fn load(store: &dyn ObjectStore, key: &CacheKey, ttl: Duration) -> Result<CacheEntry, StoreError> {
    let object = store.get(key.as_str()).await?;
    let mut stream = object.stream;
    let mut buf = BytesMut::with_capacity(object.size.min(MAX_PREALLOC) as usize);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() as u64 + chunk.len() as u64 > object.size {
            return Err(StoreError::Backend(format!(
                "object {key} is longer than its advertised {} bytes",
                object.size
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    if buf.len() as u64 != object.size {
        return Err(StoreError::Backend(format!(
            "object {key} truncated: read {} of {} bytes",
            buf.len(),
            object.size
        )));
    }
    Ok(CacheEntry::new(buf.freeze(), object.content_type, object.last_modified, ttl))
}
