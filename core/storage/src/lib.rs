//! Resource store abstraction for offgrid.
//!
//! This module provides a trait-based key-value interface over which the
//! cache strategies, the delivery queue and the background record log all
//! persist, plus the versioned cache generations that partition it.
//!
//! # Design Principles
//! - Whole-value writes: every put replaces the complete value atomically
//! - Async operations: all I/O operations are async
//! - Unified error semantics: consistent error types across backends

pub mod generation;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use generation::{sweep_generations, CacheGeneration};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use provider::{CachedResponse, ResourceStore, StoreExt, StoreKey};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
