//! End-to-end tier fallback behavior of the symbol store, exercised through
//! scripted suppliers that count how often each tier is consulted.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use symlens::cache::{CacheConfig, SymbolCache};
use symlens::demangle::Demangler;
use symlens::domain::{LibSymbolicationRequest, SymbolError, Tier};
use symlens::store::{SupplierResponse, SymbolStore, SymbolSupplier, SymbolicationOutcome};
use symlens_common::{AddressResult, LibraryIdentity, SymbolTable};

/// Which answer a scripted tier gives for every request.
#[derive(Clone, Copy)]
enum TierScript {
    /// Resolve every address to a symbol named after the library.
    Resolve,
    NotFound,
    Transport,
}

struct ScriptedSupplier {
    server: TierScript,
    host: TierScript,
    /// `Some` serves this table from the host-full-table tier.
    table: Option<SymbolTable>,
    server_calls: AtomicUsize,
    host_calls: AtomicUsize,
    table_calls: AtomicUsize,
    server_batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedSupplier {
    fn new(server: TierScript, host: TierScript, table: Option<SymbolTable>) -> Arc<Self> {
        Arc::new(Self {
            server,
            host,
            table,
            server_calls: AtomicUsize::new(0),
            host_calls: AtomicUsize::new(0),
            table_calls: AtomicUsize::new(0),
            server_batch_sizes: Mutex::new(Vec::new()),
        })
    }

    fn respond(script: TierScript, requests: &[LibSymbolicationRequest]) -> Vec<SupplierResponse> {
        requests
            .iter()
            .map(|req| match script {
                TierScript::Resolve => SupplierResponse::Success {
                    lib: req.lib.clone(),
                    results: req
                        .addresses
                        .iter()
                        .map(|&addr| {
                            (
                                addr,
                                AddressResult {
                                    name: format!("{}_fn", req.lib.debug_name),
                                    symbol_address: addr,
                                    file: None,
                                    line: None,
                                    inlines: None,
                                    function_size: None,
                                },
                            )
                        })
                        .collect(),
                },
                TierScript::NotFound => SupplierResponse::Failure {
                    request: req.clone(),
                    error: SymbolError::NotFound(req.lib.clone()),
                },
                TierScript::Transport => SupplierResponse::Failure {
                    request: req.clone(),
                    error: SymbolError::Transport("connection refused".to_string()),
                },
            })
            .collect()
    }
}

#[async_trait]
impl SymbolSupplier for ScriptedSupplier {
    async fn request_symbols_from_server(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        self.server_calls.fetch_add(1, Ordering::SeqCst);
        self.server_batch_sizes.lock().unwrap().push(requests.len());
        Self::respond(self.server, requests)
    }

    async fn request_symbols_from_host(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        self.host_calls.fetch_add(1, Ordering::SeqCst);
        Self::respond(self.host, requests)
    }

    async fn request_full_symbol_table_from_host(
        &self,
        lib: &LibraryIdentity,
    ) -> Result<SymbolTable, SymbolError> {
        self.table_calls.fetch_add(1, Ordering::SeqCst);
        self.table.clone().ok_or_else(|| SymbolError::NotFound(lib.clone()))
    }
}

fn lib(debug_name: &str) -> LibraryIdentity {
    LibraryIdentity::new(debug_name.to_string(), format!("{debug_name}ID1"))
}

fn request(debug_name: &str) -> LibSymbolicationRequest {
    LibSymbolicationRequest::new(lib(debug_name), [0x10, 0x20])
}

async fn collect(
    store: &SymbolStore,
    requests: Vec<LibSymbolicationRequest>,
    ignore_cache: bool,
) -> Vec<SymbolicationOutcome> {
    store.get_symbols(requests, ignore_cache).collect().await
}

#[tokio::test]
async fn test_invalid_request_short_circuits_all_tiers() {
    let supplier = ScriptedSupplier::new(TierScript::Resolve, TierScript::Resolve, None);
    let store = SymbolStore::new(supplier.clone(), None);

    let bad = LibSymbolicationRequest::new(
        LibraryIdentity::new(String::new(), "ABC1".to_string()),
        [0x10],
    );
    let outcomes = collect(&store, vec![bad], false).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        SymbolicationOutcome::Failed { error: SymbolError::InvalidRequest(_), .. } => {}
        other => panic!("expected InvalidRequest, got {other:?}"),
    }
    assert_eq!(supplier.server_calls.load(Ordering::SeqCst), 0);
    assert_eq!(supplier.host_calls.load(Ordering::SeqCst), 0);
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_miss_falls_back_to_host_api() {
    let supplier = ScriptedSupplier::new(TierScript::NotFound, TierScript::Resolve, None);
    let store = SymbolStore::new(supplier.clone(), None);

    let outcomes = collect(&store, vec![request("libfoo")], false).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        SymbolicationOutcome::Resolved { results, .. } => {
            assert_eq!(results[&0x10].name, "libfoo_fn");
        }
        other => panic!("expected resolution from host API, got {other:?}"),
    }
    assert_eq!(supplier.server_calls.load(Ordering::SeqCst), 1);
    assert_eq!(supplier.host_calls.load(Ordering::SeqCst), 1);
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_host_table_result_is_written_back_to_cache() {
    let dir = tempfile::tempdir().unwrap();
    let table = SymbolTable::from_pairs(vec![(0x0, "cold_path".to_string())]);
    let supplier =
        ScriptedSupplier::new(TierScript::NotFound, TierScript::NotFound, Some(table));
    let cache = Arc::new(SymbolCache::open(dir.path(), CacheConfig::default()).await.unwrap());
    let store =
        SymbolStore::with_demangler(supplier.clone(), Some(cache.clone()), Demangler::identity());

    // First run walks all the way down to the host table
    let outcomes = collect(&store, vec![request("libbar")], false).await;
    assert!(matches!(outcomes[0], SymbolicationOutcome::Resolved { .. }));
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 1);

    // Second run is served from the cache without touching any supplier tier
    let outcomes = collect(&store, vec![request("libbar")], false).await;
    match &outcomes[0] {
        SymbolicationOutcome::Resolved { results, .. } => {
            assert_eq!(results[&0x10].name, "cold_path");
            assert_eq!(results[&0x10].symbol_address, 0x0);
        }
        other => panic!("expected cache hit, got {other:?}"),
    }
    assert_eq!(supplier.server_calls.load(Ordering::SeqCst), 1);
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ignore_cache_skips_reads_but_still_writes_back() {
    let dir = tempfile::tempdir().unwrap();
    let table = SymbolTable::from_pairs(vec![(0x0, "fresh".to_string())]);
    let supplier =
        ScriptedSupplier::new(TierScript::NotFound, TierScript::NotFound, Some(table));
    let cache = Arc::new(SymbolCache::open(dir.path(), CacheConfig::default()).await.unwrap());
    let store =
        SymbolStore::with_demangler(supplier.clone(), Some(cache.clone()), Demangler::identity());

    let outcomes = collect(&store, vec![request("libbaz")], true).await;
    assert!(matches!(outcomes[0], SymbolicationOutcome::Resolved { .. }));
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 1);

    // The write-back happened even though reads were skipped
    let cached = cache.get(&lib("libbaz")).await.unwrap();
    assert_eq!(cached.lookup(0x10).unwrap().name, "fresh");
}

#[tokio::test]
async fn test_all_tiers_failed_chains_causes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let supplier = ScriptedSupplier::new(TierScript::Transport, TierScript::NotFound, None);
    let cache = Arc::new(SymbolCache::open(dir.path(), CacheConfig::default()).await.unwrap());
    let store = SymbolStore::new(supplier.clone(), Some(cache));

    let outcomes = collect(&store, vec![request("libqux")], false).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        SymbolicationOutcome::Failed {
            error: SymbolError::AllTiersFailed { lib, causes },
            ..
        } => {
            assert_eq!(lib.debug_name, "libqux");
            let tiers: Vec<Tier> = causes.iter().map(|c| c.tier).collect();
            assert_eq!(tiers, vec![Tier::Cache, Tier::Server, Tier::HostApi, Tier::HostTable]);
            assert!(matches!(causes[1].error, SymbolError::Transport(_)));
        }
        other => panic!("expected AllTiersFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_requests_are_chunked_by_library_ceiling() {
    let supplier = ScriptedSupplier::new(TierScript::Resolve, TierScript::NotFound, None);
    let store = SymbolStore::new(supplier.clone(), None);

    let requests: Vec<LibSymbolicationRequest> =
        (0..23).map(|i| request(&format!("lib{i:02}"))).collect();
    let outcomes = collect(&store, requests, false).await;

    assert_eq!(outcomes.len(), 23);
    assert!(outcomes.iter().all(|o| matches!(o, SymbolicationOutcome::Resolved { .. })));

    let mut sizes = supplier.server_batch_sizes.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![3, 10, 10]);
}

#[tokio::test]
async fn test_oversized_address_set_gets_its_own_chunk() {
    let supplier = ScriptedSupplier::new(TierScript::Resolve, TierScript::NotFound, None);
    let store = SymbolStore::new(supplier.clone(), None);

    let big = LibSymbolicationRequest::new(lib("libbig"), 0..12_000_u32);
    let outcomes = collect(&store, vec![big, request("libsmall")], false).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(supplier.server_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_each_request_gets_exactly_one_outcome() {
    let supplier = ScriptedSupplier::new(TierScript::NotFound, TierScript::Resolve, None);
    let store = SymbolStore::new(supplier, None);

    let requests = vec![request("liba"), request("libb"), request("libc")];
    let outcomes = collect(&store, requests, false).await;

    let mut names: Vec<String> = outcomes
        .iter()
        .map(|o| match o {
            SymbolicationOutcome::Resolved { request, .. }
            | SymbolicationOutcome::Failed { request, .. } => request.lib.debug_name.clone(),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["liba", "libb", "libc"]);
}

/// A supplier that drops every request on the floor: batched tiers answer
/// with an empty response list.
struct SilentSupplier;

#[async_trait]
impl SymbolSupplier for SilentSupplier {
    async fn request_symbols_from_server(
        &self,
        _requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        Vec::new()
    }

    async fn request_symbols_from_host(
        &self,
        _requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        Vec::new()
    }

    async fn request_full_symbol_table_from_host(
        &self,
        lib: &LibraryIdentity,
    ) -> Result<SymbolTable, SymbolError> {
        Err(SymbolError::NotFound(lib.clone()))
    }
}

#[tokio::test]
async fn test_missing_response_entry_is_malformed_and_carried_forward() {
    let store = SymbolStore::new(Arc::new(SilentSupplier), None);

    let outcomes = collect(&store, vec![request("libmute")], false).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        SymbolicationOutcome::Failed {
            error: SymbolError::AllTiersFailed { causes, .. },
            ..
        } => {
            let tiers: Vec<Tier> = causes.iter().map(|c| c.tier).collect();
            assert_eq!(tiers, vec![Tier::Server, Tier::HostApi, Tier::HostTable]);
            assert!(matches!(causes[0].error, SymbolError::MalformedResponse(_)));
            assert!(causes[0].error.to_string().contains("no response entry"));
        }
        other => panic!("expected AllTiersFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_cache_write_back_does_not_fail_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let table = SymbolTable::from_pairs(vec![(0x0, "resilient".to_string())]);
    let supplier =
        ScriptedSupplier::new(TierScript::NotFound, TierScript::NotFound, Some(table));
    let cache = Arc::new(SymbolCache::open(dir.path(), CacheConfig::default()).await.unwrap());
    // A closed cache rejects the tier-4 write-back (and the tier-1 read)
    cache.close().await;
    let store =
        SymbolStore::with_demangler(supplier.clone(), Some(cache), Demangler::identity());

    let outcomes = collect(&store, vec![request("libwb")], false).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        SymbolicationOutcome::Resolved { results, .. } => {
            assert_eq!(results[&0x10].name, "resilient");
        }
        other => panic!("expected resolution despite failed write-back, got {other:?}"),
    }
    assert_eq!(supplier.table_calls.load(Ordering::SeqCst), 1);
}

/// A panicking supplier simulates a programming error; the panic must reach
/// the stream consumer instead of dying with the driver task.
struct PanickingSupplier;

#[async_trait]
impl SymbolSupplier for PanickingSupplier {
    async fn request_symbols_from_server(
        &self,
        _requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        panic!("supplier bug");
    }

    async fn request_symbols_from_host(
        &self,
        _requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        panic!("supplier bug");
    }

    async fn request_full_symbol_table_from_host(
        &self,
        _lib: &LibraryIdentity,
    ) -> Result<SymbolTable, SymbolError> {
        panic!("supplier bug");
    }
}

#[tokio::test]
async fn test_supplier_panic_propagates_to_stream_consumer() {
    let store = SymbolStore::new(Arc::new(PanickingSupplier), None);
    let outcomes = store.get_symbols(vec![request("liba")], false);

    let drained =
        tokio::spawn(async move { outcomes.collect::<Vec<SymbolicationOutcome>>().await }).await;
    match drained {
        Err(e) => assert!(e.is_panic()),
        Ok(outcomes) => panic!("expected a propagated panic, got {} outcomes", outcomes.len()),
    }
}
