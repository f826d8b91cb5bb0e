//! Offgrid worker
//!
//! Ties the store, the cache strategies and the delivery pipeline into one
//! request-interception worker:
//! - Install and activate lifecycle over versioned cache generations
//! - Request routing and the two ingestion endpoints
//! - Control-message protocol for connected clients
//! - HTTP front end built on axum

pub mod config;
pub mod endpoints;
pub mod messages;
pub mod worker;

pub use config::WorkerConfig;
pub use endpoints::router;
pub use messages::{control_channel, ControlClient, ControlMessage, ControlReply, ControlServer};
pub use worker::{FetchOutcome, OfflineWorker};
