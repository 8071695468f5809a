//! Single-flight fetch engine with upstream racing.
//!
//! Concurrent fetches for one resource are coalesced onto a single leader:
//! the leader races HEAD probes across the candidate upstreams, the first
//! 200 claims the downloader role through a non-blocking compare-and-swap,
//! streams the body to a temp file and publishes it atomically.  Everyone
//! else waits on a completion signal and rechecks the cache on wake.
//!
//! Coordination state is split across a fixed power-of-two number of shards
//! keyed by a seeded hash of the resource path.  Shard locks guard only the
//! in-flight table and the recent-failure memo; they are never held across
//! network or disk I/O.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::metrics::Metrics;
use crate::upstream::StorageServer;

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shard {
    /// Resource path -> completion signal for the in-flight leader fetch.
    in_flight: HashMap<String, watch::Sender<bool>>,
    /// Resources that failed since the last forget tick.
    recent_failures: HashSet<String>,
}

/// A poisoned shard is recovered rather than propagated: a panicking leader
/// must still be able to wake its waiters from the drop guard.
fn lock_shard(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of the admission check performed under the shard lock.
enum Admission {
    /// The resource failed recently; do not touch the network.
    Memoized,
    /// Another task is already fetching; wait for its signal.
    Wait(watch::Receiver<bool>),
    /// The caller is now the leader for this resource.
    Lead,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The concurrent read-through fetch engine.
///
/// One instance is shared by the front door and the registry convergence
/// loop; it owns every piece of fetch-coordination state.
pub struct FetchEngine {
    store: CacheStore,
    servers: Vec<Arc<dyn StorageServer>>,
    shards: Vec<Mutex<Shard>>,
    shard_mask: u64,
    seed: RandomState,
    metrics: Arc<Metrics>,
}

impl FetchEngine {
    /// `shard_count` must be a power of two (validated at config load).
    pub fn new(
        store: CacheStore,
        servers: Vec<Arc<dyn StorageServer>>,
        shard_count: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        Self {
            store,
            servers,
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            shard_mask: shard_count as u64 - 1,
            // Seeded per process: shard selection is stable for the process
            // lifetime but not across restarts.
            seed: RandomState::new(),
            metrics,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Fetch `resource`, racing `servers` if given (all configured upstreams
    /// otherwise).  Returns the cache path of a complete local copy, or
    /// `None` when the resource is unavailable.
    pub async fn fetch(
        &self,
        resource: &str,
        servers: Option<&[Arc<dyn StorageServer>]>,
    ) -> Option<PathBuf> {
        if self.store.exists(resource) {
            self.metrics.cache_hits.inc();
            return Some(self.store.cache_path(resource));
        }

        let shard = self.shard_for(resource);
        match self.admit(shard, resource) {
            Admission::Memoized => {
                self.metrics.memoized_rejections.inc();
                debug!(resource, "fetch rejected by recent-failure memo");
                None
            }
            Admission::Wait(mut done) => {
                self.metrics.coalesced_waits.inc();
                debug!(resource, "coalescing onto in-flight fetch");
                // An Err here means the leader already signalled and dropped
                // the channel; the cache recheck decides either way.
                let _ = done.wait_for(|signalled| *signalled).await;
                self.store
                    .exists(resource)
                    .then(|| self.store.cache_path(resource))
            }
            Admission::Lead => {
                // The guard records the outcome, removes the in-flight entry
                // and fires the completion signal on every exit path,
                // including unwinding.
                let _guard = FlightGuard {
                    engine: self,
                    shard,
                    resource: resource.to_string(),
                };
                // Recheck before racing: a previous leader may have published
                // between the cache probe above and admission.
                if !self.store.exists(resource) {
                    self.race(resource, servers.unwrap_or(&self.servers)).await;
                }
                self.store
                    .exists(resource)
                    .then(|| self.store.cache_path(resource))
            }
        }
    }

    /// Clear every shard's recent-failure memo.  Invoked by the convergence
    /// loop once per tick so that transient upstream misses are retried.
    pub fn forget_failures(&self) {
        for shard in &self.shards {
            lock_shard(shard).recent_failures.clear();
        }
    }

    fn shard_for(&self, resource: &str) -> usize {
        (self.seed.hash_one(resource) & self.shard_mask) as usize
    }

    fn admit(&self, shard: usize, resource: &str) -> Admission {
        let mut shard = lock_shard(&self.shards[shard]);
        if shard.recent_failures.contains(resource) {
            return Admission::Memoized;
        }
        if let Some(leader) = shard.in_flight.get(resource) {
            return Admission::Wait(leader.subscribe());
        }
        let (sender, _) = watch::channel(false);
        shard.in_flight.insert(resource.to_string(), sender);
        self.metrics.in_flight_fetches.inc();
        Admission::Lead
    }

    /// Leader path: race HEAD probes across `servers` and let the first 200
    /// download.  A single-server field skips the probe round and issues a
    /// plain GET.
    async fn race(&self, resource: &str, servers: &[Arc<dyn StorageServer>]) {
        if let [only] = servers {
            Self::download_and_publish(
                Arc::clone(only),
                resource.to_string(),
                self.store.clone(),
                Arc::clone(&self.metrics),
            )
            .await;
            return;
        }

        let winner = Arc::new(AtomicBool::new(false));
        let mut probes = JoinSet::new();
        for server in servers {
            let server = Arc::clone(server);
            let winner = Arc::clone(&winner);
            let resource = resource.to_string();
            let store = self.store.clone();
            let metrics = Arc::clone(&self.metrics);
            probes.spawn(async move {
                match server.probe(&resource).await {
                    Ok(200) => {
                        // First 200 takes the downloader role; 200s arriving
                        // after the winner drop their result.
                        if winner
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            Self::download_and_publish(server, resource, store, metrics).await;
                        }
                    }
                    Ok(status) => {
                        debug!(server = %server.name(), resource, status, "probe miss");
                    }
                    Err(error) => {
                        debug!(server = %server.name(), resource, error = %error, "probe failed");
                    }
                }
            });
        }
        while probes.join_next().await.is_some() {}
    }

    async fn download_and_publish(
        server: Arc<dyn StorageServer>,
        resource: String,
        store: CacheStore,
        metrics: Arc<Metrics>,
    ) {
        info!(server = %server.name(), resource, "downloading from upstream");

        let tmp = match store.temp_file() {
            Ok(tmp) => tmp,
            Err(error) => {
                warn!(resource, error = %error, "could not open temp file");
                return;
            }
        };

        match server.download(&resource, tmp.path()).await {
            Ok(200) => match store.publish(tmp, &resource) {
                Ok(_) => {
                    metrics.upstream_downloads.inc();
                }
                Err(error) => {
                    warn!(resource, error = %error, "publish failed");
                }
            },
            Ok(status) => {
                warn!(server = %server.name(), resource, status, "upstream GET returned non-200");
            }
            Err(error) => {
                warn!(server = %server.name(), resource, error = %error, "upstream GET failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Leader completion guard
// ---------------------------------------------------------------------------

/// Completes a leader fetch when dropped: records a failure if no cache
/// entry materialized, removes the in-flight entry and wakes all waiters.
struct FlightGuard<'a> {
    engine: &'a FetchEngine,
    shard: usize,
    resource: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let engine = self.engine;
        let completed = engine.store.exists(&self.resource);
        let sender = {
            let mut shard = lock_shard(&engine.shards[self.shard]);
            if !completed {
                shard.recent_failures.insert(self.resource.clone());
                engine.metrics.fetch_failures.inc();
            }
            shard.in_flight.remove(&self.resource)
        };
        engine.metrics.in_flight_fetches.dec();
        if let Some(sender) = sender {
            // Waiters recheck the cache on wake, so signalling after the
            // shard lock is released keeps the critical section bounded.
            let _ = sender.send(true);
        }
    }
}
