//! Structured error types for symlens
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! The taxonomy doubles as the tier-fallback policy: "expected" failures
//! (not found, malformed response, transport, storage) carry a request
//! forward to the next tier, while invalid requests fail immediately and
//! programming errors are panics that propagate untouched.

use symlens_common::{LibraryIdentity, SymbolTableError};
use thiserror::Error;

/// One of the ordered fallback sources tried per library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Cache,
    Server,
    HostApi,
    HostTable,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cache => "cache",
            Self::Server => "server",
            Self::HostApi => "host API",
            Self::HostTable => "host symbol table",
        })
    }
}

/// A tier's failure, recorded while the request is carried forward.
#[derive(Error, Debug)]
#[error("{tier}: {error}")]
pub struct TierFailure {
    pub tier: Tier,
    pub error: SymbolError,
}

fn render_causes(causes: &[TierFailure]) -> String {
    causes.iter().map(TierFailure::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Error, Debug)]
pub enum SymbolError {
    /// Empty identity fields; rejected before any tier is tried.
    #[error("Invalid symbolication request: {0}")]
    InvalidRequest(String),

    /// A tier has no data for this library. Expected; triggers fallback.
    #[error("No symbols found for {0}")]
    NotFound(LibraryIdentity),

    /// Structural validation of a response failed. Distinct from not-found;
    /// triggers fallback but is logged more loudly.
    #[error("Malformed symbolication response: {0}")]
    MalformedResponse(String),

    /// Network failure talking to the symbolication server.
    #[error("Symbolication transport failure: {0}")]
    Transport(String),

    /// The symbol cache was closed and can no longer serve requests.
    #[error("Symbol cache is closed")]
    CacheClosed,

    /// Every tier was attempted; `causes` chains each tier's failure in the
    /// order the tiers were tried.
    #[error("No symbolication tier succeeded for {lib}: {}", render_causes(.causes))]
    AllTiersFailed { lib: LibraryIdentity, causes: Vec<TierFailure> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Table(#[from] SymbolTableError),
}

impl SymbolError {
    /// Whether the store may catch this failure and carry the request to the
    /// next tier. Invalid requests and exhausted-tier errors are final;
    /// anything outside this taxonomy is a programming error and panics
    /// through instead of being absorbed.
    #[must_use]
    pub fn is_fallback_trigger(&self) -> bool {
        match self {
            Self::NotFound(_)
            | Self::MalformedResponse(_)
            | Self::Transport(_)
            | Self::CacheClosed
            | Self::Io(_)
            | Self::Json(_)
            | Self::Table(_) => true,
            Self::InvalidRequest(_) | Self::AllTiersFailed { .. } => false,
        }
    }
}
