use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::metrics;
use crate::resolver::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// One object as last fetched from the backend. The buffer is never mutated
/// after construction, so entries are shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content: Bytes,
    pub content_type: String,
    /// Backend timestamp, never recomputed locally.
    pub last_modified: SystemTime,
    pub size: u64,
    pub fetched_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(content: Bytes, content_type: String, last_modified: SystemTime, ttl: Duration) -> Self {
        let fetched_at = Instant::now();
        Self {
            size: content.len() as u64,
            content,
            content_type,
            last_modified,
            fetched_at,
            expires_at: fetched_at + ttl,
        }
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CacheEntry>),
    Stale(Arc<CacheEntry>),
    Absent,
}

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    last_used: AtomicU64,
    read_while_stale: AtomicBool,
}

impl Slot {
    fn new(entry: Arc<CacheEntry>, tick: u64) -> Self {
        Self {
            entry,
            last_used: AtomicU64::new(tick),
            read_while_stale: AtomicBool::new(false),
        }
    }
}

/// Bounded in-memory object cache.
///
/// Entries live in a sharded map so lookups for unrelated keys never contend
/// on one lock. Expiry is lazy: a read past `expires_at` reports the entry as
/// [`Lookup::Stale`] and leaves it in place as a fallback. Memory is bounded
/// by `capacity` bytes of content, reclaimed least-recently-used first.
#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<CacheKey, Slot>,
    ttl: Duration,
    capacity: u64,
    used: AtomicU64,
    clock: AtomicU64,
    evicting: Mutex<()>,
}

impl CacheStore {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
            used: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            evicting: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &CacheKey) -> Lookup {
        let Some(slot) = self.entries.get(key) else {
            return Lookup::Absent;
        };
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        let entry = Arc::clone(&slot.entry);
        if entry.is_fresh() {
            Lookup::Fresh(entry)
        } else {
            slot.read_while_stale.store(true, Ordering::Relaxed);
            Lookup::Stale(entry)
        }
    }

    /// Installs `entry` for `key`, replacing whatever was there. Returns false
    /// when the entry alone exceeds the capacity; the key is then left empty
    /// rather than holding an older version.
    pub fn put(&self, key: CacheKey, entry: Arc<CacheEntry>) -> bool {
        let size = entry.size;
        if size > self.capacity {
            log::debug!("object {key} ({size} bytes) exceeds cache capacity, not cached");
            self.evict(&key);
            return false;
        }
        let slot = Slot::new(entry, self.tick());
        self.used.fetch_add(size, Ordering::AcqRel);
        if let Some(old) = self.entries.insert(key, slot) {
            self.used.fetch_sub(old.entry.size, Ordering::AcqRel);
        }
        self.enforce_capacity();
        self.publish_usage();
        true
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        let removed = match self.entries.remove(key) {
            Some((_, slot)) => {
                self.used.fetch_sub(slot.entry.size, Ordering::AcqRel);
                true
            }
            None => false,
        };
        if removed {
            self.publish_usage();
        }
        removed
    }

    fn enforce_capacity(&self) {
        if self.used_bytes() <= self.capacity {
            return;
        }
        let _guard = self.evicting.lock().unwrap_or_else(|err| err.into_inner());
        if self.used_bytes() <= self.capacity {
            return;
        }

        let mut candidates: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().last_used.load(Ordering::Relaxed)))
            .collect();
        candidates.sort_unstable_by_key(|(_, tick)| *tick);

        for (key, tick) in candidates {
            if self.used_bytes() <= self.capacity {
                break;
            }
            let removed = self
                .entries
                .remove_if(&key, |_, slot| slot.last_used.load(Ordering::Relaxed) == tick);
            if let Some((key, slot)) = removed {
                self.used.fetch_sub(slot.entry.size, Ordering::AcqRel);
                log::debug!("evicted {key} ({} bytes) to stay under capacity", slot.entry.size);
            }
        }
    }

    /// Drops entries that expired and were not read since. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        let mut freed = 0u64;
        self.entries.retain(|_, slot| {
            let keep = slot.entry.is_fresh_at(now) || slot.read_while_stale.load(Ordering::Relaxed);
            if !keep {
                removed += 1;
                freed += slot.entry.size;
            }
            keep
        });
        if removed > 0 {
            self.used.fetch_sub(freed, Ordering::AcqRel);
            self.publish_usage();
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.used.store(0, Ordering::Release);
        self.publish_usage();
    }

    fn publish_usage(&self) {
        metrics::set_cache_usage(self.used_bytes(), self.entries.len());
    }
}

/// Periodically reclaims entries nobody has asked for since they expired.
pub fn spawn_sweeper(cache: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                log::debug!("cache sweep reclaimed {removed} stale entries");
            }
        }
    })
}
