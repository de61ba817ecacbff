//! Request chunking for the remote tiers.
//!
//! Remote calls are batched, but a huge profile must not produce an
//! unbounded request body: chunks are packed greedily (first fit) so that no
//! chunk exceeds [`MAX_CHUNK_ADDRESSES`] total addresses or
//! [`MAX_CHUNK_LIBS`] libraries. This is the only backpressure mechanism in
//! the pipeline.

use crate::domain::LibSymbolicationRequest;

/// Ceiling on the total requested-address count per remote call.
pub const MAX_CHUNK_ADDRESSES: usize = 10_000;
/// Ceiling on the number of libraries per remote call.
pub const MAX_CHUNK_LIBS: usize = 10;

#[derive(Default)]
struct Bin {
    indices: Vec<usize>,
    address_count: usize,
}

/// Pack requests into chunks via greedy first-fit bin packing.
///
/// Returns indices into `requests`. A single request larger than the address
/// ceiling cannot be split (one library is one job) and gets a chunk of its
/// own.
#[must_use]
pub fn chunk_requests(requests: &[LibSymbolicationRequest]) -> Vec<Vec<usize>> {
    let mut bins: Vec<Bin> = Vec::new();

    for (i, request) in requests.iter().enumerate() {
        let n = request.address_count();
        let slot = bins.iter_mut().find(|bin| {
            bin.indices.len() < MAX_CHUNK_LIBS && bin.address_count + n <= MAX_CHUNK_ADDRESSES
        });
        match slot {
            Some(bin) => {
                bin.indices.push(i);
                bin.address_count += n;
            }
            None => bins.push(Bin { indices: vec![i], address_count: n }),
        }
    }

    bins.into_iter().map(|bin| bin.indices).collect()
}
