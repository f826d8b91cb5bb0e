//! Common utilities and types shared across the offgrid crates.
//!
//! This module provides the error taxonomy and the canonical request
//! identity used by every layer, from the resource store up to the worker.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::RequestKey;
