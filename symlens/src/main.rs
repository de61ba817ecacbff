//! # symlens - Main Entry Point
//!
//! Reads a profile JSON file, symbolicates every library it references
//! through the tiered symbol store, and writes the rewritten profile back
//! out. Per-library failures are reported but never fail the run; the
//! affected frames keep their address-derived placeholder names.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use symlens::cache::{CacheConfig, SymbolCache};
use symlens::cli::Args;
use symlens::engine::{symbolicate, Profile};
use symlens::store::{HttpSymbolSupplier, SymbolStore};

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

/// Default cache location: `$XDG_CACHE_HOME/symlens` or `~/.cache/symlens`,
/// falling back to the system temp dir for HOME-less environments.
fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("symlens");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache").join("symlens");
    }
    std::env::temp_dir().join("symlens-cache")
}

async fn open_cache(args: &Args) -> Option<Arc<SymbolCache>> {
    if args.no_cache {
        return None;
    }
    let dir = args.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let config = CacheConfig {
        max_count: args.cache_size,
        max_age: Duration::from_secs(args.cache_max_age_days * 24 * 60 * 60),
    };
    match SymbolCache::open(&dir, config).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(e) => {
            // A broken cache directory should not stop symbolication
            warn!("Could not open symbol cache at {}: {e}", dir.display());
            None
        }
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    let input = File::open(&args.input)
        .with_context(|| format!("Failed to open profile: {}", args.input.display()))?;
    let mut profile: Profile = serde_json::from_reader(std::io::BufReader::new(input))
        .with_context(|| format!("Failed to parse profile: {}", args.input.display()))?;

    let cache = open_cache(&args).await;
    let supplier = HttpSymbolSupplier::new(args.server_url.clone())
        .context("Failed to build symbolication client")?;
    let store = SymbolStore::new(Arc::new(supplier), cache.clone());

    let errors = symbolicate(&mut profile, &store, args.ignore_cache).await;
    if !args.quiet {
        for (lib, error) in &errors {
            eprintln!("warning: could not symbolicate {lib}: {error}");
        }
    }
    info!("Symbolication finished with {} unresolved libraries", errors.len());

    // Atomic replace: the input is the default output, so a mid-write
    // failure must not destroy it
    let output_path = args.output.as_ref().unwrap_or(&args.input);
    profile
        .save(output_path)
        .with_context(|| format!("Failed to write profile to {}", output_path.display()))?;

    if let Some(cache) = cache {
        cache.close().await;
    }
    Ok(())
}
