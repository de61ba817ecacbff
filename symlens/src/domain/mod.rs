//! Domain model for symlens
//!
//! This module contains core domain types and errors that provide:
//! - A single error taxonomy that drives the tier-fallback policy
//! - Self-documenting request types for the store and engine

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use errors::{SymbolError, Tier, TierFailure};
pub use types::{AddressResults, LibSymbolicationRequest};
