//! Registry convergence loop.
//!
//! Once per tick the converger harvests every upstream's `/registries`
//! listing, cross-checks which upstreams actually hold each advertised hash,
//! promotes one hash per known registry (fewest known sources first, the
//! heuristic for "newest"), and republishes the consolidated listing file
//! whenever a promotion changed.  Its own snapshot fetches go through the
//! fetch engine, constrained to the upstreams confirmed to hold the hash.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::LISTING_RESOURCE;
use crate::fetch::FetchEngine;
use crate::metrics::Metrics;
use crate::resource::{HASH_PATTERN, UUID_PATTERN};
use crate::upstream::StorageServer;

/// Upper bound on concurrent cross-check HEAD probes per tick.
const CROSS_CHECK_PROBE_LIMIT: usize = 8;

static LISTING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^/registry/({UUID_PATTERN})/({HASH_PATTERN})$"))
        .expect("listing-line regex is valid")
});

/// Parse one `/registry/{uuid}/{hash}` record into its identifiers.
fn parse_listing_line(line: &str) -> Option<(String, String)> {
    let captures = LISTING_LINE.captures(line)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

// ---------------------------------------------------------------------------
// Converger
// ---------------------------------------------------------------------------

/// The hash currently promoted for a registry, together with the upstreams
/// confirmed to hold it.
struct Promotion {
    hash: String,
    servers: Vec<Arc<dyn StorageServer>>,
}

/// Drives registry convergence and owns the per-registry promotion state.
pub struct Converger {
    engine: Arc<FetchEngine>,
    servers: Vec<Arc<dyn StorageServer>>,
    /// Configured registry UUIDs, sorted and deduplicated at startup.
    known: Vec<String>,
    state: Mutex<BTreeMap<String, Promotion>>,
    metrics: Arc<Metrics>,
    probe_limit: Arc<Semaphore>,
}

impl Converger {
    pub fn new(
        engine: Arc<FetchEngine>,
        servers: Vec<Arc<dyn StorageServer>>,
        mut known: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        known.sort();
        known.dedup();
        Self {
            engine,
            servers,
            known,
            state: Mutex::new(BTreeMap::new()),
            metrics,
            probe_limit: Arc::new(Semaphore::new(CROSS_CHECK_PROBE_LIMIT)),
        }
    }

    /// Run convergence forever at `tick_interval`.  Each round ends by
    /// clearing the fetch engine's failure memo so misses are retried.
    pub async fn run(&self, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
            self.engine.forget_failures();
        }
    }

    /// Constrain a fetch for the currently promoted snapshot of a registry
    /// to the upstreams confirmed to hold it.  Returns `None` for any other
    /// resource, leaving the full upstream field in play.
    pub fn servers_for(&self, resource: &str) -> Option<Vec<Arc<dyn StorageServer>>> {
        // A registry snapshot path has the same shape as a listing record.
        let (uuid, hash) = parse_listing_line(resource)?;
        let state = self.lock_state();
        let promotion = state.get(&uuid)?;
        (promotion.hash == hash).then(|| promotion.servers.clone())
    }

    /// Run a single convergence round.
    pub async fn tick(&self) {
        // 1. Harvest each upstream's own registries listing.
        let mut advertised = self.harvest().await;

        // 2. Cross-check: upstreams may hold a hash without advertising it
        //    in their own listing, so HEAD-probe every non-advertiser.
        self.cross_check(&mut advertised).await;

        // 3. Promote one hash per known registry.
        let mut changed = false;
        for uuid in &self.known {
            // No upstream advertised anything for this registry: keep the
            // existing promotion and serve stale.
            let Some(hashes) = advertised.get(uuid) else {
                continue;
            };

            let mut candidates: Vec<(&String, &BTreeSet<usize>)> = hashes.iter().collect();
            // Fewest known sources first; stable sort keeps ties in hash
            // order since BTreeMap iteration is already sorted.
            candidates.sort_by_key(|(_, holders)| holders.len());

            for (hash, holders) in candidates {
                let field: Vec<Arc<dyn StorageServer>> = holders
                    .iter()
                    .map(|&index| Arc::clone(&self.servers[index]))
                    .collect();
                let resource = format!("/registry/{uuid}/{hash}");
                if self.engine.fetch(&resource, Some(&field)).await.is_none() {
                    continue;
                }

                let sources = field.len();
                let replaced = self.lock_state().insert(
                    uuid.clone(),
                    Promotion {
                        hash: hash.clone(),
                        servers: field,
                    },
                );
                if replaced.map_or(true, |previous| previous.hash != *hash) {
                    info!(registry = %uuid, hash = %hash, sources, "promoted registry snapshot");
                    self.metrics.registry_promotions.inc();
                    changed = true;
                }
                break;
            }
        }

        // 4. Republish the consolidated listing whenever a promotion moved.
        if changed {
            if let Err(error) = self.publish_listing() {
                warn!(error = %error, "failed to publish registry listing");
            }
        }
    }

    /// Per registry UUID, the advertised hashes and which upstream indices
    /// advertised each.
    async fn harvest(&self) -> BTreeMap<String, BTreeMap<String, BTreeSet<usize>>> {
        let mut advertised: BTreeMap<String, BTreeMap<String, BTreeSet<usize>>> = BTreeMap::new();

        for (index, server) in self.servers.iter().enumerate() {
            let body = match server.registries_listing().await {
                Ok((200, body)) => body,
                Ok((status, _)) => {
                    debug!(server = %server.name(), status, "registries listing returned non-200");
                    continue;
                }
                Err(error) => {
                    debug!(server = %server.name(), error = %error, "registries listing fetch failed");
                    continue;
                }
            };

            for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
                match parse_listing_line(line) {
                    Some((uuid, hash)) => {
                        if self.known.binary_search(&uuid).is_err() {
                            continue;
                        }
                        advertised
                            .entry(uuid)
                            .or_default()
                            .entry(hash)
                            .or_default()
                            .insert(index);
                    }
                    None => {
                        error!(server = %server.name(), line, "malformed registries line");
                    }
                }
            }
        }

        advertised
    }

    async fn cross_check(
        &self,
        advertised: &mut BTreeMap<String, BTreeMap<String, BTreeSet<usize>>>,
    ) {
        let mut probes = JoinSet::new();
        for (uuid, hashes) in advertised.iter() {
            for (hash, holders) in hashes {
                for (index, server) in self.servers.iter().enumerate() {
                    if holders.contains(&index) {
                        continue;
                    }
                    let server = Arc::clone(server);
                    let limit = Arc::clone(&self.probe_limit);
                    let resource = format!("/registry/{uuid}/{hash}");
                    let uuid = uuid.clone();
                    let hash = hash.clone();
                    probes.spawn(async move {
                        let Ok(_permit) = limit.acquire_owned().await else {
                            return None;
                        };
                        match server.probe(&resource).await {
                            Ok(200) => Some((uuid, hash, index)),
                            Ok(_) | Err(_) => None,
                        }
                    });
                }
            }
        }

        while let Some(joined) = probes.join_next().await {
            if let Ok(Some((uuid, hash, index))) = joined {
                if let Some(holders) = advertised.get_mut(&uuid).and_then(|hashes| hashes.get_mut(&hash)) {
                    holders.insert(index);
                }
            }
        }
    }

    /// Write one `/registry/{uuid}/{hash}` line per promoted registry, in
    /// sorted UUID order, and rename the file into place.
    fn publish_listing(&self) -> Result<()> {
        let listing = {
            let state = self.lock_state();
            let mut listing = String::new();
            for (uuid, promotion) in state.iter() {
                listing.push_str(&format!("/registry/{}/{}\n", uuid, promotion.hash));
            }
            listing
        };

        self.engine
            .store()
            .publish_bytes(listing.as_bytes(), LISTING_RESOURCE)?;
        info!(lines = listing.lines().count(), "published registry listing");
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, BTreeMap<String, Promotion>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
