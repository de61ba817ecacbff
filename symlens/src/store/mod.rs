//! Per-library symbol resolution with tiered fallback.
//!
//! The store owns no persistent state, only in-flight bookkeeping. For every
//! batch of requests it consults, in order: the persistent cache, the remote
//! symbolication server, the host-provided API, and finally the host's full
//! symbol table (which is also written back into the cache). A library moves
//! to the next tier whenever the current one fails with an expected error;
//! only after every tier is exhausted does the caller see a failure, with
//! the causes from all attempted tiers chained in order.
//!
//! Results are delivered on a stream of per-library outcomes so a caller
//! never waits for the slowest library before acting on faster ones. There
//! is no cancellation: dropping the stream discards outcomes but the batch
//! runs to completion.

pub mod chunk;
pub mod http;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::join_all;
use futures::Stream;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

use crate::cache::SymbolCache;
use crate::demangle::Demangler;
use crate::domain::{AddressResults, LibSymbolicationRequest, SymbolError, Tier, TierFailure};
use symlens_common::{AddressResult, LibraryIdentity, SymbolTable};

pub use http::HttpSymbolSupplier;

/// One entry of a supplier's batched answer, tagged per library.
#[derive(Debug)]
pub enum SupplierResponse {
    Success { lib: LibraryIdentity, results: AddressResults },
    Failure { request: LibSymbolicationRequest, error: SymbolError },
}

/// Provider contract implemented by callers: an HTTP client, a host-API
/// bridge, or an in-process test double.
#[async_trait]
pub trait SymbolSupplier: Send + Sync {
    /// Batched lookup against the remote symbolication server.
    async fn request_symbols_from_server(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse>;

    /// Batched lookup against the host-provided API (same shape).
    async fn request_symbols_from_host(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse>;

    /// Fetch a library's entire symbol table from the host.
    async fn request_full_symbol_table_from_host(
        &self,
        lib: &LibraryIdentity,
    ) -> Result<SymbolTable, SymbolError>;
}

/// Per-library result delivered on the [`SymbolStore::get_symbols`] stream.
#[derive(Debug)]
pub enum SymbolicationOutcome {
    Resolved { request: LibSymbolicationRequest, results: AddressResults },
    Failed { request: LibSymbolicationRequest, error: SymbolError },
}

struct StoreInner {
    cache: Option<Arc<SymbolCache>>,
    supplier: Arc<dyn SymbolSupplier>,
    demangler: Demangler,
}

/// The tiered symbol resolution orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct SymbolStore {
    inner: Arc<StoreInner>,
}

struct Pending {
    request: LibSymbolicationRequest,
    causes: Vec<TierFailure>,
}

impl SymbolStore {
    pub fn new(supplier: Arc<dyn SymbolSupplier>, cache: Option<Arc<SymbolCache>>) -> Self {
        Self::with_demangler(supplier, cache, Demangler::default())
    }

    pub fn with_demangler(
        supplier: Arc<dyn SymbolSupplier>,
        cache: Option<Arc<SymbolCache>>,
        demangler: Demangler,
    ) -> Self {
        Self { inner: Arc::new(StoreInner { cache, supplier, demangler }) }
    }

    /// Resolve a batch of per-library requests through the tier chain.
    ///
    /// Returns a stream with exactly one outcome per request, in completion
    /// order. `ignore_cache` skips the cache tier (tables fetched from the
    /// host are still written back).
    ///
    /// # Panics
    /// A panic inside a supplier is a programming error and is re-raised in
    /// the consumer once the stream drains, never absorbed into an outcome.
    pub fn get_symbols(
        &self,
        requests: Vec<LibSymbolicationRequest>,
        ignore_cache: bool,
    ) -> OutcomeStream {
        let (tx, rx) = unbounded();
        let inner = Arc::clone(&self.inner);
        let driver = tokio::spawn(async move {
            inner.run_tiers(requests, ignore_cache, &tx).await;
        });
        OutcomeStream { rx, driver: Some(driver) }
    }
}

/// Stream of per-library outcomes backed by a detached driver task.
///
/// Dropping the stream discards outcomes but lets the batch run to
/// completion. When the channel closes, the driver task is joined so that a
/// panicked supplier resumes unwinding in the consumer instead of dying
/// silently with the task.
pub struct OutcomeStream {
    rx: UnboundedReceiver<SymbolicationOutcome>,
    driver: Option<JoinHandle<()>>,
}

impl Stream for OutcomeStream {
    type Item = SymbolicationOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll_next(cx) {
            Poll::Ready(None) => {
                let Some(driver) = this.driver.as_mut() else {
                    return Poll::Ready(None);
                };
                match Pin::new(driver).poll(cx) {
                    Poll::Ready(result) => {
                        this.driver = None;
                        if let Err(e) = result {
                            if e.is_panic() {
                                std::panic::resume_unwind(e.into_panic());
                            }
                        }
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            other => other,
        }
    }
}

impl StoreInner {
    async fn run_tiers(
        &self,
        requests: Vec<LibSymbolicationRequest>,
        ignore_cache: bool,
        tx: &UnboundedSender<SymbolicationOutcome>,
    ) {
        // Validation: an empty identity field can never resolve; fail it
        // before any tier is attempted.
        let mut pending: Vec<Pending> = Vec::new();
        for request in requests {
            if request.lib.is_valid() {
                pending.push(Pending { request, causes: Vec::new() });
            } else {
                let error = SymbolError::InvalidRequest(format!(
                    "library identity has an empty field: debug_name={:?} breakpad_id={:?}",
                    request.lib.debug_name, request.lib.breakpad_id
                ));
                send(tx, SymbolicationOutcome::Failed { request, error });
            }
        }

        // Tier 1: persistent cache, resolved locally
        if !ignore_cache {
            if let Some(cache) = &self.cache {
                let mut missed = Vec::new();
                for mut p in pending {
                    match cache.get(&p.request.lib).await {
                        Ok(table) => {
                            let results = self.resolve_with_table(&table, &p.request.addresses);
                            send(tx, SymbolicationOutcome::Resolved { request: p.request, results });
                        }
                        Err(error) => {
                            if matches!(error, SymbolError::NotFound(_)) {
                                debug!("Cache miss for {}", p.request.lib);
                            } else {
                                warn!("Symbol cache error for {}: {error}", p.request.lib);
                            }
                            p.causes.push(TierFailure { tier: Tier::Cache, error });
                            missed.push(p);
                        }
                    }
                }
                pending = missed;
            }
        }

        // Tiers 2 and 3: batched remote lookups
        pending = self.run_batched_tier(Tier::Server, pending, tx).await;
        pending = self.run_batched_tier(Tier::HostApi, pending, tx).await;

        // Tier 4: full symbol table from the host, resolved locally and
        // written back into the cache for future runs
        for mut p in pending {
            match self.supplier.request_full_symbol_table_from_host(&p.request.lib).await {
                Ok(table) => {
                    let results = self.resolve_with_table(&table, &p.request.addresses);
                    if let Some(cache) = &self.cache {
                        // The results are already on their way; a failed
                        // cache write must not fail the resolution
                        if let Err(e) = cache.put(&p.request.lib, &table).await {
                            warn!("Failed to cache symbol table for {}: {e}", p.request.lib);
                        }
                    }
                    send(tx, SymbolicationOutcome::Resolved { request: p.request, results });
                }
                Err(error) => {
                    p.causes.push(TierFailure { tier: Tier::HostTable, error });
                    let error = SymbolError::AllTiersFailed {
                        lib: p.request.lib.clone(),
                        causes: p.causes,
                    };
                    warn!("{error}");
                    send(tx, SymbolicationOutcome::Failed { request: p.request, error });
                }
            }
        }
    }

    /// Run one batched remote tier over everything still pending, returning
    /// the requests that must be carried to the next tier.
    async fn run_batched_tier(
        &self,
        tier: Tier,
        mut pending: Vec<Pending>,
        tx: &UnboundedSender<SymbolicationOutcome>,
    ) -> Vec<Pending> {
        if pending.is_empty() {
            return pending;
        }

        let requests: Vec<LibSymbolicationRequest> =
            pending.iter().map(|p| p.request.clone()).collect();
        let chunks = chunk::chunk_requests(&requests);
        debug!("{tier} tier: {} libraries in {} chunk(s)", requests.len(), chunks.len());

        let calls = chunks.into_iter().map(|indices| {
            let chunk_requests: Vec<LibSymbolicationRequest> =
                indices.iter().map(|&i| requests[i].clone()).collect();
            async move {
                let responses = match tier {
                    Tier::Server => {
                        self.supplier.request_symbols_from_server(&chunk_requests).await
                    }
                    _ => self.supplier.request_symbols_from_host(&chunk_requests).await,
                };
                (indices, responses)
            }
        });

        let index_by_key: HashMap<String, usize> = requests
            .iter()
            .enumerate()
            .map(|(i, req)| (req.lib.key(), i))
            .collect();
        let mut done = vec![false; pending.len()];
        let mut answered = vec![false; pending.len()];

        for (indices, responses) in join_all(calls).await {
            for response in responses {
                let (idx, outcome) = match response {
                    SupplierResponse::Success { lib, results } => {
                        let Some(&idx) = index_by_key.get(&lib.key()) else { continue };
                        (idx, Some(results))
                    }
                    SupplierResponse::Failure { request, error } => {
                        let Some(&idx) = index_by_key.get(&request.lib.key()) else { continue };
                        if error.is_fallback_trigger() {
                            if matches!(error, SymbolError::MalformedResponse(_)) {
                                warn!("{tier} tier: {error}");
                            }
                            pending[idx].causes.push(TierFailure { tier, error });
                            answered[idx] = true;
                            continue;
                        }
                        // Final, non-fallback failure
                        send(
                            tx,
                            SymbolicationOutcome::Failed {
                                request: pending[idx].request.clone(),
                                error,
                            },
                        );
                        (idx, None)
                    }
                };
                answered[idx] = true;
                done[idx] = true;
                if let Some(results) = outcome {
                    send(
                        tx,
                        SymbolicationOutcome::Resolved {
                            request: pending[idx].request.clone(),
                            results,
                        },
                    );
                }
            }

            // A supplier that drops a request on the floor is a protocol bug
            for idx in indices {
                if !answered[idx] {
                    answered[idx] = true;
                    let error = SymbolError::MalformedResponse(format!(
                        "no response entry for {}",
                        pending[idx].request.lib
                    ));
                    pending[idx].causes.push(TierFailure { tier, error });
                }
            }
        }

        pending
            .into_iter()
            .zip(done)
            .filter_map(|(p, is_done)| (!is_done).then_some(p))
            .collect()
    }

    /// Resolve each requested address against a full table, applying the
    /// demangling capability to every name.
    fn resolve_with_table(&self, table: &SymbolTable, addresses: &BTreeSet<u32>) -> AddressResults {
        let mut results = AddressResults::with_capacity(addresses.len());
        for &addr in addresses {
            let result = match table.lookup(addr) {
                Some(hit) => AddressResult {
                    name: self.demangler.apply(&hit.name),
                    symbol_address: hit.symbol_address,
                    file: None,
                    line: None,
                    inlines: None,
                    function_size: hit.function_size,
                },
                None => AddressResult {
                    name: "<before first symbol>".to_string(),
                    symbol_address: addr,
                    file: None,
                    line: None,
                    inlines: None,
                    function_size: None,
                },
            };
            results.insert(addr, result);
        }
        results
    }
}

fn send(tx: &UnboundedSender<SymbolicationOutcome>, outcome: SymbolicationOutcome) {
    // The receiver side may have been dropped by a caller that abandoned
    // stale results; the batch still runs to completion.
    let _ = tx.unbounded_send(outcome);
}
