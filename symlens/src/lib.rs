//! # symlens - Profile Symbolication Pipeline
//!
//! symlens turns raw sampled addresses in a profile into function names,
//! files and line numbers. Symbol lookups are expensive and flaky, so the
//! pipeline is built around two ideas: a tiered fallback chain that tries
//! progressively slower sources, and a persistent on-disk cache of compact
//! symbol tables so repeat runs stay fast.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Profile (JSON)                          │
//! │        libs + per-thread frame/function tables              │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Engine (symbolication pass)                 │
//! │   gather per-library address sets ─▶ apply per-thread steps │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ one request per library
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                SymbolStore (tier fallback)                  │
//! │   1. disk cache    2. symbolication server                  │
//! │   3. host API      4. host full table (cached back)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`engine`]: The symbolication pass over a profile's columnar tables,
//!   including the consensus rules for merging and splitting functions
//! - [`store`]: Tiered per-library symbol resolution with request chunking
//! - [`protocol`]: Wire format of the batch symbolication API
//! - [`cache`]: LRU cache of serialized symbol tables on disk
//! - [`demangle`]: Pluggable demangling for locally resolved names
//! - [`cli`]: Command-line argument parsing and configuration
//! - [`domain`]: Request types and the error taxonomy driving tier fallback

pub mod cache;
pub mod cli;
pub mod demangle;
pub mod domain;
pub mod engine;
pub mod protocol;
pub mod store;
