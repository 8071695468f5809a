//! Prometheus series emitted by the proxy.
//!
//! One [`Metrics`] value is built at startup and shared through
//! [`crate::AppState`]; it owns the registry it registers into, so rendering
//! for `GET /metrics` is a method rather than a separate handle.

use std::fmt;

use prometheus_client::encoding::text;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Counters and gauges for the fetch engine, the upstream field and the
/// convergence loop, plus the registry that renders them.
pub struct Metrics {
    registry: Registry,

    // -- fetch engine --
    pub cache_hits: Counter,
    pub coalesced_waits: Counter,
    pub memoized_rejections: Counter,
    pub fetch_failures: Counter,
    pub in_flight_fetches: Gauge,

    // -- upstreams --
    pub upstream_downloads: Counter,

    // -- convergence --
    pub registry_promotions: Counter,
}

fn counter(registry: &mut Registry, name: &str, help: &str) -> Counter {
    let series = Counter::default();
    registry.register(name, help, series.clone());
    series
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let cache_hits = counter(
            &mut registry,
            "depotcache_cache_hits_total",
            "Fetches satisfied directly from the local cache",
        );
        let coalesced_waits = counter(
            &mut registry,
            "depotcache_coalesced_waits_total",
            "Fetches that waited on another in-flight fetch for the same resource",
        );
        let memoized_rejections = counter(
            &mut registry,
            "depotcache_memoized_rejections_total",
            "Fetches rejected by the recent-failure memo without network activity",
        );
        let fetch_failures = counter(
            &mut registry,
            "depotcache_fetch_failures_total",
            "Leader fetches that ended without a cache entry",
        );
        let upstream_downloads = counter(
            &mut registry,
            "depotcache_upstream_downloads_total",
            "Completed upstream GETs published into the cache",
        );
        let registry_promotions = counter(
            &mut registry,
            "depotcache_registry_promotions_total",
            "Registry current-hash promotions",
        );

        let in_flight_fetches = Gauge::default();
        registry.register(
            "depotcache_in_flight_fetches",
            "Leader fetches currently racing upstreams",
            in_flight_fetches.clone(),
        );

        Self {
            registry,
            cache_hits,
            coalesced_waits,
            memoized_rejections,
            fetch_failures,
            in_flight_fetches,
            upstream_downloads,
            registry_promotions,
        }
    }

    /// Render every series in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut out = String::new();
        text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
