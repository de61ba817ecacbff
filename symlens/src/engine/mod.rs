//! # Symbolication Engine
//!
//! Consumes per-library address→symbol results and rewrites a profile's
//! frame and function tables, producing an auditable old-function →
//! new-function mapping per step.
//!
//! ## How a pass works
//!
//! 1. [`SymbolicationPass::new`] walks every thread once and collects, per
//!    (thread, library): the functions currently assigned to the library,
//!    the frames referencing them, and the library-relative addresses those
//!    frames carry. Address sets are unioned into one request per library
//!    across the whole profile, so threads sharing a library never cause
//!    redundant lookups.
//! 2. The store resolves libraries in any order; each resolved library
//!    yields one [`SymbolicationStep`] per affected thread. The caller
//!    decides how to batch or coalesce applying them.
//! 3. [`apply_symbolication_step`] rewrites one thread: frames that share a
//!    function start address (`AddressResult::symbol_address`) end up on the
//!    same canonical function, reusing a frame's current function index when
//!    it has not been claimed by a different start address in this pass, and
//!    allocating new function entries otherwise.
//!
//! Re-symbolication runs the identical algorithm. When refined symbols
//! split a previously-merged function, the consensus rule drops that
//! function from the old→new map instead of guessing; callers must treat
//! split functions as losing continuity.

pub mod consensus;
pub mod profile;

use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::{AddressResults, LibSymbolicationRequest, SymbolError};
use crate::store::{SymbolStore, SymbolicationOutcome};
use symlens_common::LibraryIdentity;

pub use consensus::ConsensusMap;
pub use profile::{
    lib_index_for_address, FrameTable, FuncTable, LibraryInfo, Profile, StringTable,
    SymbolicationStatus, Thread,
};

/// The frames of one thread that belong to one library, captured when the
/// pass began. `addresses` is parallel to `frames`.
#[derive(Debug, Clone)]
struct ThreadLibInfo {
    thread_index: usize,
    frames: Vec<usize>,
    addresses: Vec<u32>,
}

struct LibPassInfo {
    lib_index: usize,
    threads: Vec<ThreadLibInfo>,
}

/// Everything one symbolication pass needs: the per-library requests and
/// the per-(thread, library) bookkeeping to apply results later. Built once
/// per pass; stays valid while steps are applied because function entries
/// are only appended or rewritten, never removed.
pub struct SymbolicationPass {
    requests: Vec<LibSymbolicationRequest>,
    per_lib: HashMap<String, LibPassInfo>,
}

/// One per-(thread, library) unit of work: enough information to rewrite
/// that thread's tables for that library.
#[derive(Debug, Clone)]
pub struct SymbolicationStep {
    pub thread_index: usize,
    pub lib_index: usize,
    frames: Vec<usize>,
    addresses: Vec<u32>,
    results: Arc<AddressResults>,
}

impl SymbolicationPass {
    #[must_use]
    pub fn new(profile: &Profile) -> Self {
        let mut per_lib: HashMap<String, LibPassInfo> = HashMap::new();
        let mut union_addresses: HashMap<String, BTreeSet<u32>> = HashMap::new();

        for (thread_index, thread) in profile.threads.iter().enumerate() {
            // Functions currently assigned to each library in this thread
            let mut funcs_by_lib: HashMap<usize, HashSet<usize>> = HashMap::new();
            for (func, lib) in thread.funcs.lib.iter().enumerate() {
                if let Some(lib_index) = lib {
                    funcs_by_lib.entry(*lib_index).or_default().insert(func);
                }
            }

            for (lib_index, funcs) in funcs_by_lib {
                let mut frames = Vec::new();
                let mut addresses = Vec::new();
                for (frame, func) in thread.frames.func.iter().enumerate() {
                    if funcs.contains(func) {
                        if let Some(addr) = thread.frames.address[frame] {
                            frames.push(frame);
                            addresses.push(addr);
                        }
                    }
                }
                if frames.is_empty() {
                    continue;
                }

                let key = profile.libs[lib_index].identity().key();
                union_addresses
                    .entry(key.clone())
                    .or_default()
                    .extend(addresses.iter().copied());
                per_lib
                    .entry(key)
                    .or_insert_with(|| LibPassInfo { lib_index, threads: Vec::new() })
                    .threads
                    .push(ThreadLibInfo { thread_index, frames, addresses });
            }
        }

        // Deterministic request order regardless of map iteration
        let mut keys: Vec<&String> = per_lib.keys().collect();
        keys.sort();
        let requests = keys
            .into_iter()
            .map(|key| LibSymbolicationRequest {
                lib: profile.libs[per_lib[key].lib_index].identity(),
                addresses: union_addresses[key].clone(),
            })
            .collect();

        Self { requests, per_lib }
    }

    /// One request per library referenced anywhere in the profile.
    #[must_use]
    pub fn requests(&self) -> &[LibSymbolicationRequest] {
        &self.requests
    }

    /// Fan one library's resolved addresses out into per-thread steps.
    #[must_use]
    pub fn steps_for(&self, lib: &LibraryIdentity, results: AddressResults) -> Vec<SymbolicationStep> {
        let Some(info) = self.per_lib.get(&lib.key()) else {
            return Vec::new();
        };
        let results = Arc::new(results);
        info.threads
            .iter()
            .map(|t| SymbolicationStep {
                thread_index: t.thread_index,
                lib_index: info.lib_index,
                frames: t.frames.clone(),
                addresses: t.addresses.clone(),
                results: Arc::clone(&results),
            })
            .collect()
    }
}

/// Rewrite one thread's tables from one library's results.
///
/// Returns the old-function → new-function map built under the consensus
/// rule: an entry survives only if every frame that used to reference the
/// old function agreed on the same new function. Callers migrating UI state
/// must drop state for functions missing from the map.
pub fn apply_symbolication_step(
    profile: &mut Profile,
    step: &SymbolicationStep,
) -> HashMap<usize, usize> {
    let thread = &mut profile.threads[step.thread_index];

    // funcAddress → canonical function index for this pass
    let mut canonical: HashMap<u32, usize> = HashMap::new();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut old_to_new: ConsensusMap<usize, usize> = ConsensusMap::new();

    for (&frame, &addr) in step.frames.iter().zip(&step.addresses) {
        let Some(result) = step.results.get(&addr) else {
            continue;
        };
        let func_address = result.symbol_address;
        let old_func = thread.frames.func[frame];

        let new_func = match canonical.get(&func_address) {
            Some(&func) => func,
            None => {
                // Prefer reusing the frame's current function; first-time
                // symbolication starts from one function per frame, so this
                // merges without reassigning everything
                let func = if claimed.contains(&old_func) {
                    let name = thread.strings.intern(&result.name);
                    thread.funcs.push(name, Some(step.lib_index))
                } else {
                    old_func
                };
                claimed.insert(func);
                canonical.insert(func_address, func);
                func
            }
        };

        thread.funcs.name[new_func] = thread.strings.intern(&result.name);
        thread.funcs.address[new_func] = Some(func_address);
        thread.funcs.lib[new_func] = Some(step.lib_index);
        thread.funcs.file[new_func] =
            result.file.as_deref().map(|file| thread.strings.intern(file));
        thread.funcs.line[new_func] = result.line;

        thread.frames.func[frame] = new_func;
        old_to_new.insert(old_func, new_func);
    }

    old_to_new.into_map()
}

/// Drive one full symbolication pass to completion, applying every step as
/// it arrives.
///
/// The profile's status is `Symbolicating` for the duration and `Done` once
/// every requested library has produced either a success or an
/// exhausted-tiers error. Returns the per-library failures; unresolved
/// libraries keep their address-derived placeholder names.
pub async fn symbolicate(
    profile: &mut Profile,
    store: &SymbolStore,
    ignore_cache: bool,
) -> Vec<(LibraryIdentity, SymbolError)> {
    profile.symbolication_status = SymbolicationStatus::Symbolicating;
    let pass = SymbolicationPass::new(profile);
    info!("Symbolicating {} libraries", pass.requests().len());

    let mut outcomes = store.get_symbols(pass.requests().to_vec(), ignore_cache);
    let mut errors = Vec::new();
    while let Some(outcome) = outcomes.next().await {
        match outcome {
            SymbolicationOutcome::Resolved { request, results } => {
                debug!("Applying symbols for {}", request.lib);
                for step in pass.steps_for(&request.lib, results) {
                    apply_symbolication_step(profile, &step);
                }
            }
            SymbolicationOutcome::Failed { request, error } => {
                warn!("Could not symbolicate {}: {error}", request.lib);
                errors.push((request.lib, error));
            }
        }
    }

    profile.symbolication_status = SymbolicationStatus::Done;
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use symlens_common::AddressResult;

    fn lib(start: u64, end: u64) -> LibraryInfo {
        LibraryInfo {
            name: "libxul.so".to_string(),
            debug_name: "libxul.so".to_string(),
            breakpad_id: "XUL1".to_string(),
            start,
            end,
        }
    }

    fn result(name: &str, symbol_address: u32) -> AddressResult {
        AddressResult {
            name: name.to_string(),
            symbol_address,
            file: None,
            line: None,
            inlines: None,
            function_size: None,
        }
    }

    fn profile_with_frames(addresses: &[u64]) -> Profile {
        let libs = vec![lib(0x1000, 0x20000)];
        let mut thread = Thread::new("main");
        for &addr in addresses {
            thread.add_stack_frame(&libs, addr);
        }
        Profile { libs, threads: vec![thread], symbolication_status: SymbolicationStatus::Done }
    }

    fn apply_all(
        profile: &mut Profile,
        pass: &SymbolicationPass,
        results: AddressResults,
    ) -> HashMap<usize, usize> {
        let lib = profile.libs[0].identity();
        let mut map = HashMap::new();
        for step in pass.steps_for(&lib, results) {
            map = apply_symbolication_step(profile, &step);
        }
        map
    }

    #[test]
    fn test_requests_are_unioned_across_threads() {
        let libs = vec![lib(0x1000, 0x20000)];
        let mut t1 = Thread::new("a");
        t1.add_stack_frame(&libs, 0x1010);
        t1.add_stack_frame(&libs, 0x1020);
        let mut t2 = Thread::new("b");
        t2.add_stack_frame(&libs, 0x1020);
        t2.add_stack_frame(&libs, 0x1030);
        let profile =
            Profile { libs, threads: vec![t1, t2], symbolication_status: SymbolicationStatus::Done };

        let pass = SymbolicationPass::new(&profile);
        assert_eq!(pass.requests().len(), 1);
        assert_eq!(
            pass.requests()[0].addresses,
            BTreeSet::from([0x10, 0x20, 0x30])
        );
        // Both threads get their own step
        let steps = pass.steps_for(&profile.libs[0].identity(), AddressResults::new());
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_frames_outside_libraries_are_not_requested() {
        let profile = profile_with_frames(&[0x1010, 0xffff_0000]);
        let pass = SymbolicationPass::new(&profile);
        assert_eq!(pass.requests().len(), 1);
        assert_eq!(pass.requests()[0].addresses, BTreeSet::from([0x10]));
    }

    #[test]
    fn test_merge_two_funcs_into_one() {
        // Two frames, two placeholder funcs; both addresses resolve into the
        // same function
        let mut profile = profile_with_frames(&[0x1000, 0x100a]);
        let pass = SymbolicationPass::new(&profile);

        let mut results = AddressResults::new();
        results.insert(0x0, result("merged_fn", 0x0));
        results.insert(0xa, result("merged_fn", 0x0));
        let map = apply_all(&mut profile, &pass, results);

        let thread = &profile.threads[0];
        assert_eq!(thread.frames.func[0], thread.frames.func[1]);
        assert_eq!(thread.frame_func_name(0), "merged_fn");
        assert_eq!(thread.funcs.address[thread.frames.func[0]], Some(0x0));

        // Consensus: both old funcs map to the single canonical func
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], map[&1]);
    }

    #[test]
    fn test_split_drops_consensus_entry_and_allocates() {
        // One merged func whose frames resolve to two different functions
        let mut profile = profile_with_frames(&[0x1010, 0x1f10]);
        {
            // Simulate an earlier coarse pass: both frames on one func
            let thread = &mut profile.threads[0];
            thread.frames.func[1] = thread.frames.func[0];
        }
        let funcs_before = profile.threads[0].funcs.len();

        let pass = SymbolicationPass::new(&profile);
        let mut results = AddressResults::new();
        results.insert(0x10, result("first_fn", 0x0));
        results.insert(0xf10, result("second_fn", 0xf00));
        let map = apply_all(&mut profile, &pass, results);

        let thread = &profile.threads[0];
        assert_ne!(thread.frames.func[0], thread.frames.func[1]);
        assert_eq!(thread.frame_func_name(0), "first_fn");
        assert_eq!(thread.frame_func_name(1), "second_fn");
        // One new function allocated; no more than one per distinct address
        assert_eq!(thread.funcs.len(), funcs_before + 1);
        // The split function has no agreed-on successor
        assert!(map.is_empty());
    }

    #[test]
    fn test_func_fields_updated_from_results() {
        let mut profile = profile_with_frames(&[0x1010]);
        let pass = SymbolicationPass::new(&profile);

        let mut results = AddressResults::new();
        results.insert(
            0x10,
            AddressResult {
                name: "with_location".to_string(),
                symbol_address: 0x8,
                file: Some("src/hot.rs".to_string()),
                line: Some(42),
                inlines: None,
                function_size: Some(0x40),
            },
        );
        apply_all(&mut profile, &pass, results);

        let thread = &profile.threads[0];
        let func = thread.frames.func[0];
        assert_eq!(thread.strings.get(thread.funcs.name[func]), "with_location");
        assert_eq!(thread.funcs.address[func], Some(0x8));
        assert_eq!(thread.funcs.file[func].map(|i| thread.strings.get(i)), Some("src/hot.rs"));
        assert_eq!(thread.funcs.line[func], Some(42));
    }

    #[test]
    fn test_address_without_result_is_left_alone() {
        let mut profile = profile_with_frames(&[0x1010, 0x1020]);
        let pass = SymbolicationPass::new(&profile);

        let mut results = AddressResults::new();
        results.insert(0x10, result("only_one", 0x10));
        apply_all(&mut profile, &pass, results);

        let thread = &profile.threads[0];
        assert_eq!(thread.frame_func_name(0), "only_one");
        assert_eq!(thread.frame_func_name(1), "0x20"); // untouched placeholder
    }
}
