//! Offline-first resource resolution for offgrid.
//!
//! This module provides:
//! - Request classification (pass through, ingest, cache-first, network-first)
//! - The cache-first and network-first strategies over a resource store
//! - The network fetch capability and its HTTP and scripted implementations

pub mod fetcher;
pub mod request;
pub mod routing;
pub mod strategy;

pub use fetcher::{Fetcher, HttpFetcher, ScriptedFetcher};
pub use request::Request;
pub use routing::{Route, RoutePolicy};
pub use strategy::{CacheStrategy, Resolution};
