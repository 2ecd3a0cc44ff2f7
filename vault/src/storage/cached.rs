//! Read-through LRU cache with write-behind usage counters.
//!
//! Each replica keeps two delta books per key. The `shadow` delta on a
//! cache entry records local increments that were already applied to the
//! cached cumulative stats; echoed update events cancel against it so a
//! replica never double-counts its own writes. The `pending` queue holds
//! increments awaiting push to the backing storage; a flush pass takes
//! entries out of the queue before pushing, so overlapping passes never
//! push the same delta twice, and requeues a taken delta when its push
//! fails. Increments that land mid-push start a fresh queue entry.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::config::{CacheConfig, CipherConfig, KdfConfig};
use crate::error::{Result, VaultError};
use crate::events::{EventBus, VaultEvent};
use crate::record::{KeyId, KeyRecord, UsageDelta};
use crate::storage::KeyStorage;

struct CacheEntry {
    record: KeyRecord,
    /// Local increments already folded into `record.stats`, awaiting
    /// cancellation by echoed update events
    shadow: UsageDelta,
    stamp: Instant,
}

struct CacheState {
    lru: LruCache<KeyId, CacheEntry>,
    ext_index: HashMap<String, KeyId>,
    /// Usage increments not yet pushed to the backing storage
    pending: HashMap<KeyId, UsageDelta>,
}

impl CacheState {
    fn evict(&mut self, id: &KeyId) {
        if let Some(entry) = self.lru.pop(id) {
            self.ext_index.remove(&entry.record.ext_id);
        }
    }

    fn insert(&mut self, record: KeyRecord, shadow: UsageDelta) {
        let id = record.id.clone();
        self.ext_index.insert(record.ext_id.clone(), id.clone());
        let entry = CacheEntry {
            record,
            shadow,
            stamp: Instant::now(),
        };
        if let Some((evicted_id, evicted)) = self.lru.push(id.clone(), entry) {
            if evicted_id != id {
                self.ext_index.remove(&evicted.record.ext_id);
            }
        }
    }

    /// Entry by id, honoring the TTL: expired entries are evicted and
    /// reported as a miss.
    fn fresh(&mut self, id: &KeyId, ttl: Duration) -> Option<&mut CacheEntry> {
        let expired = match self.lru.peek(id) {
            Some(entry) => entry.stamp.elapsed() > ttl,
            None => return None,
        };
        if expired {
            self.evict(id);
            return None;
        }
        self.lru.get_mut(id)
    }
}

/// One field of the echo cancellation. The incoming delta first cancels
/// against the local shadow (our own write coming back); only the
/// remainder is another replica's work and advances the cumulative.
/// Every shadow increment is canceled exactly once, so replicas converge
/// on the sum of all applied deltas.
fn cancel_field(cumulative: &mut u64, shadow: &mut u64, incoming: u64) {
    let canceled = incoming.min(*shadow);
    *shadow -= canceled;
    *cumulative = cumulative.saturating_add(incoming - canceled);
}

fn apply_remote_update(entry: &mut CacheEntry, delta: &UsageDelta) {
    cancel_field(
        &mut entry.record.stats.times,
        &mut entry.shadow.times,
        delta.times,
    );
    cancel_field(
        &mut entry.record.stats.bytes,
        &mut entry.shadow.bytes,
        delta.bytes,
    );
    cancel_field(
        &mut entry.record.stats.failures,
        &mut entry.shadow.failures,
        delta.failures,
    );
}

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Caching decorator over a [`KeyStorage`]. Spawns a flush worker and an
/// event subscriber; both stop when the wrapper is dropped or closed.
pub struct CachedStorage {
    inner: Arc<dyn KeyStorage>,
    state: Arc<Mutex<CacheState>>,
    config: CacheConfig,
    shutdown: watch::Sender<bool>,
    errors: broadcast::Sender<String>,
}

impl CachedStorage {
    /// Must be called from within a tokio runtime.
    pub fn new(inner: Arc<dyn KeyStorage>, bus: &EventBus, config: CacheConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let state = Arc::new(Mutex::new(CacheState {
            lru: LruCache::new(capacity),
            ext_index: HashMap::new(),
            pending: HashMap::new(),
        }));
        let (shutdown, _) = watch::channel(false);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        tokio::spawn(flush_worker(
            Arc::clone(&inner),
            Arc::clone(&state),
            config.clone(),
            shutdown.subscribe(),
            errors.clone(),
        ));
        tokio::spawn(event_subscriber(
            Arc::clone(&state),
            bus.subscribe(),
            shutdown.subscribe(),
            errors.clone(),
        ));

        Self {
            inner,
            state,
            config,
            shutdown,
            errors,
        }
    }

    /// Errors from the background workers; the workers themselves keep
    /// running after reporting.
    pub fn worker_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Push every queued usage delta now. Also the last act of `close`.
    pub async fn flush(&self) {
        let batch_size = self.state.lock().pending.len();
        if batch_size > 0 {
            flush_once(&*self.inner, &self.state, batch_size, &self.errors).await;
        }
    }

    /// Drain the queue and stop the background workers.
    pub async fn close(&self) {
        self.flush().await;
        let _ = self.shutdown.send(true);
    }

    async fn load_via(&self, id: &KeyId, decrypt: bool) -> Result<KeyRecord> {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.fresh(id, self.config.ttl()) {
                if !decrypt {
                    // the entry may hold plaintext from an earlier
                    // decrypted load; a sealed load must not return it
                    return Ok(entry.record.sealed());
                }
                if entry.record.raw.is_some() {
                    return Ok(entry.record.clone());
                }
            }
        }
        let record = self.inner.load(id, decrypt).await?;
        // only decrypted loads are worth caching; sealed probes stay cheap
        if decrypt {
            let mut state = self.state.lock();
            // keep the shadow across a raw-material upgrade of the same entry
            let shadow = state.lru.peek(id).map(|e| e.shadow).unwrap_or_default();
            state.insert(record.clone(), shadow);
        }
        Ok(record)
    }
}

impl Drop for CachedStorage {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl KeyStorage for CachedStorage {
    async fn load(&self, id: &KeyId, decrypt: bool) -> Result<KeyRecord> {
        self.load_via(id, decrypt).await
    }

    async fn load_ext(&self, ext_id: &str, decrypt: bool) -> Result<KeyRecord> {
        let cached_id = self.state.lock().ext_index.get(ext_id).cloned();
        if let Some(id) = cached_id {
            return self.load_via(&id, decrypt).await;
        }
        let record = self.inner.load_ext(ext_id, decrypt).await?;
        if decrypt {
            self.state
                .lock()
                .insert(record.clone(), UsageDelta::default());
        }
        Ok(record)
    }

    async fn save(&self, record: &KeyRecord) -> Result<()> {
        self.inner.save(record).await?;
        self.state
            .lock()
            .insert(record.clone(), UsageDelta::default());
        Ok(())
    }

    async fn remove(&self, id: &KeyId) -> Result<()> {
        self.inner.remove(id).await?;
        let mut state = self.state.lock();
        state.evict(id);
        state.pending.remove(id);
        Ok(())
    }

    /// Cached ids are updated in memory and queued for the flush worker;
    /// uncached ids go straight through.
    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(entry) = state.lru.get_mut(id) {
                entry.record.stats.apply(delta);
                entry.shadow.add(delta);
                state.pending.entry(id.clone()).or_default().add(delta);
                return Ok(());
            }
        }
        self.inner.update_usage(id, delta).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        self.inner.list(prefix).await
    }

    async fn set_secret(
        &self,
        secret: Option<&[u8]>,
        cipher: CipherConfig,
        kdf: Option<KdfConfig>,
    ) -> Result<()> {
        let locking = secret.is_none();
        self.inner.set_secret(secret, cipher, kdf).await?;
        if locking {
            // cached entries may hold decrypted material; pending usage
            // deltas carry none and stay queued
            let mut state = self.state.lock();
            state.lru.clear();
            state.ext_index.clear();
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// One flush pass: take up to `batch_size` queued deltas out of the
/// queue, push them in parallel, and requeue any delta whose push
/// failed. Taking before pushing keeps concurrent passes from pushing
/// the same delta twice.
async fn flush_once(
    inner: &dyn KeyStorage,
    state: &Mutex<CacheState>,
    batch_size: usize,
    errors: &broadcast::Sender<String>,
) {
    let batch: Vec<(KeyId, UsageDelta)> = {
        let mut state = state.lock();
        let ids: Vec<KeyId> = state.pending.keys().take(batch_size).cloned().collect();
        ids.into_iter()
            .filter_map(|id| {
                let delta = state.pending.remove(&id)?;
                // empty entries carry nothing worth pushing
                (!delta.is_empty()).then_some((id, delta))
            })
            .collect()
    };
    if batch.is_empty() {
        return;
    }

    let results = futures::future::join_all(
        batch
            .iter()
            .map(|(id, snapshot)| inner.update_usage(id, snapshot)),
    )
    .await;

    for ((id, snapshot), result) in batch.into_iter().zip(results) {
        match result {
            Ok(()) => {}
            // the key is gone; drop its cache entry and queued deltas
            Err(VaultError::UnknownKeyID(_)) => {
                let mut state = state.lock();
                state.pending.remove(&id);
                state.evict(&id);
            }
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "usage flush failed");
                let _ = errors.send(err.to_string());
                // requeue so the next pass retries the push
                state.lock().pending.entry(id).or_default().add(&snapshot);
            }
        }
    }
}

async fn flush_worker(
    inner: Arc<dyn KeyStorage>,
    state: Arc<Mutex<CacheState>>,
    config: CacheConfig,
    mut shutdown: watch::Receiver<bool>,
    errors: broadcast::Sender<String>,
) {
    let delay = config.sync_delay();
    loop {
        let started = Instant::now();
        flush_once(&*inner, &state, config.sync_threads, &errors).await;

        if *shutdown.borrow() {
            break;
        }
        // self-correcting cadence: sleep only the remainder of the period
        let elapsed = started.elapsed();
        if elapsed < delay {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay - elapsed) => {}
            }
        }
    }
    // drain whatever is still queued before exiting
    let remaining = state.lock().pending.len();
    if remaining > 0 {
        flush_once(&*inner, &state, remaining, &errors).await;
    }
    tracing::debug!("usage flush worker stopped");
}

async fn event_subscriber(
    state: Arc<Mutex<CacheState>>,
    mut events: broadcast::Receiver<VaultEvent>,
    mut shutdown: watch::Receiver<bool>,
    errors: broadcast::Sender<String>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(VaultEvent::Deleted { id }) => {
                    let mut state = state.lock();
                    state.evict(&id);
                    state.pending.remove(&id);
                }
                Ok(VaultEvent::Updated { id, delta }) => {
                    let mut state = state.lock();
                    // peek keeps remote traffic from pinning entries
                    if let Some(entry) = state.lru.peek_mut(&id) {
                        apply_remote_update(entry, &delta);
                    }
                }
                Ok(VaultEvent::Created { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged, cache may be stale");
                    let _ = errors.send(format!("Event stream lagged by {missed}"));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    tracing::debug!("cache event subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UsageStats;

    #[test]
    fn echo_of_own_write_cancels_fully() {
        let mut entry = CacheEntry {
            record: {
                let mut r = KeyRecord::new("e", Default::default(), "AES", Default::default());
                r.stats = UsageStats {
                    times: 5,
                    bytes: 500,
                    failures: 0,
                };
                r
            },
            shadow: UsageDelta::new(2, 200, 0),
            stamp: Instant::now(),
        };
        // our own 2/200 coming back: stats stay put, shadow is consumed
        apply_remote_update(&mut entry, &UsageDelta::new(2, 200, 0));
        assert_eq!(entry.record.stats.times, 5);
        assert_eq!(entry.record.stats.bytes, 500);
        assert_eq!(entry.shadow, UsageDelta::default());
    }

    #[test]
    fn remote_excess_advances_cumulative() {
        let mut entry = CacheEntry {
            record: {
                let mut r = KeyRecord::new("e", Default::default(), "AES", Default::default());
                r.stats = UsageStats {
                    times: 5,
                    bytes: 500,
                    failures: 0,
                };
                r
            },
            shadow: UsageDelta::new(2, 200, 0),
            stamp: Instant::now(),
        };
        // 3 remote times on top of our 2: cumulative gains the excess only
        apply_remote_update(&mut entry, &UsageDelta::new(5, 200, 1));
        assert_eq!(entry.record.stats.times, 8);
        assert_eq!(entry.shadow.times, 0);
        assert_eq!(entry.record.stats.bytes, 500);
        assert_eq!(entry.record.stats.failures, 1);
        assert_eq!(entry.shadow.failures, 0);
    }

    #[test]
    fn fields_cancel_independently() {
        let mut entry = CacheEntry {
            record: KeyRecord::new("e", Default::default(), "AES", Default::default()),
            shadow: UsageDelta::new(4, 400, 0),
            stamp: Instant::now(),
        };
        // partial echo: times untouched, bytes partially consumed
        apply_remote_update(&mut entry, &UsageDelta::new(0, 100, 0));
        assert_eq!(entry.shadow.times, 4);
        assert_eq!(entry.shadow.bytes, 300);
        assert_eq!(entry.record.stats.bytes, 0);
    }
}
