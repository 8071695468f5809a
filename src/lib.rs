//! depotcache — read-through caching proxy for an immutable,
//! content-addressed package ecosystem.
//!
//! Clients fetch registry snapshots, package tarballs and binary artifacts
//! over HTTP.  The proxy serves them from a local on-disk cache when
//! present, and otherwise races a fleet of upstream storage servers to pull
//! the resource, persist it atomically, and stream it to the client.  A
//! background convergence loop discovers the current snapshot of each
//! configured registry and publishes a consolidated listing file.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod health;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod resource;
pub mod upstream;

use std::sync::Arc;

use crate::fetch::FetchEngine;
use crate::metrics::Metrics;
use crate::registry::Converger;
use crate::upstream::StorageServer;

/// Shared handles handed to every request handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FetchEngine>,
    pub converger: Arc<Converger>,
    pub metrics: Arc<Metrics>,
    pub servers: Vec<Arc<dyn StorageServer>>,
}
