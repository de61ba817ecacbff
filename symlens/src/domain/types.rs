//! Request types shared by the store and the engine.

use std::collections::{BTreeSet, HashMap};
use symlens_common::{AddressResult, LibraryIdentity};

/// Resolved symbol information per requested library-relative address.
pub type AddressResults = HashMap<u32, AddressResult>;

/// Everything one library needs symbolicated: its identity plus the
/// de-duplicated, ordered set of library-relative offsets used by any frame
/// in the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibSymbolicationRequest {
    pub lib: LibraryIdentity,
    pub addresses: BTreeSet<u32>,
}

impl LibSymbolicationRequest {
    pub fn new(lib: LibraryIdentity, addresses: impl IntoIterator<Item = u32>) -> Self {
        Self { lib, addresses: addresses.into_iter().collect() }
    }

    /// Number of addresses in this request; the unit the chunking ceiling
    /// is measured in.
    #[must_use]
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }
}
