//! HTTP layer for the caching proxy.
//!
//! This module provides the axum-based front door: it classifies incoming
//! request targets, reads resources through the fetch engine, and streams
//! cached files back to clients, alongside the health and metrics endpoints.

pub mod handler;

pub use handler::create_router;
