//! Shared fixtures for the end-to-end tests: a proxy wired against
//! caller-supplied upstream base URLs, with its cache rooted in a temp dir.

use std::sync::Arc;
use std::time::Duration;

use depotcache::cache::CacheStore;
use depotcache::fetch::FetchEngine;
use depotcache::metrics::Metrics;
use depotcache::registry::Converger;
use depotcache::upstream::{HttpStorageServer, StorageServer};
use depotcache::AppState;

pub const UUID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
pub const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

pub struct Proxy {
    pub store: CacheStore,
    pub engine: Arc<FetchEngine>,
    pub servers: Vec<Arc<dyn StorageServer>>,
    pub metrics: Arc<Metrics>,
    _workdir: tempfile::TempDir,
}

pub fn proxy(upstreams: &[&str]) -> Proxy {
    let workdir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(workdir.path().join("cache"), workdir.path().join("temp"));
    store.bootstrap().unwrap();

    let client = reqwest::Client::builder().build().unwrap();
    let servers: Vec<Arc<dyn StorageServer>> = upstreams
        .iter()
        .map(|base_url| {
            Arc::new(HttpStorageServer::new(
                base_url.to_string(),
                client.clone(),
                Duration::from_secs(5),
            )) as Arc<dyn StorageServer>
        })
        .collect();

    let metrics = Arc::new(Metrics::new());
    let engine = Arc::new(FetchEngine::new(
        store.clone(),
        servers.clone(),
        64,
        Arc::clone(&metrics),
    ));

    Proxy {
        store,
        engine,
        servers,
        metrics,
        _workdir: workdir,
    }
}

pub fn converger(proxy: &Proxy, registries: &[&str]) -> Arc<Converger> {
    Arc::new(Converger::new(
        Arc::clone(&proxy.engine),
        proxy.servers.clone(),
        registries.iter().map(|uuid| uuid.to_string()).collect(),
        Arc::clone(&proxy.metrics),
    ))
}

pub fn router(proxy: &Proxy, converger: Arc<Converger>) -> axum::Router {
    let state = AppState {
        engine: Arc::clone(&proxy.engine),
        converger,
        metrics: Arc::clone(&proxy.metrics),
        servers: proxy.servers.clone(),
    };
    depotcache::http::create_router(Arc::new(state))
}
