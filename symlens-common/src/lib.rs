//! # Shared Data Structures (Pipeline ↔ Host/Server)
//!
//! Defines the data model shared between the symbolication pipeline and
//! whatever supplies it with symbols: the remote symbolication server, a
//! host-provided API, or in-process test doubles.
//!
//! ## Key Types
//!
//! - [`LibraryIdentity`] - the `(debugName, breakpadId)` pair identifying one
//!   binary's debug symbols
//! - [`SymbolTable`] - the compact `(addrs, index, buffer)` form of a
//!   library's complete symbol set, with a bit-exact byte format that must
//!   round-trip unchanged across the cache and host boundary
//! - [`AddressResult`] - what one resolved address looks like: function name,
//!   function start address, optional source location and inline chain

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of one binary's debug symbols.
///
/// Both fields must be non-empty for the identity to be usable; an identity
/// with an empty field can never be resolved and is rejected before any
/// lookup tier is tried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryIdentity {
    /// Debug name of the binary (e.g. `libxul.so`, `firefox.pdb`)
    pub debug_name: String,
    /// Breakpad-style debug ID (e.g. `A14CAFD390A3E1884C4C44205044422E1`)
    pub breakpad_id: String,
}

impl LibraryIdentity {
    pub fn new(debug_name: impl Into<String>, breakpad_id: impl Into<String>) -> Self {
        Self { debug_name: debug_name.into(), breakpad_id: breakpad_id.into() }
    }

    /// An identity with an empty field cannot identify any debug symbols.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.debug_name.is_empty() && !self.breakpad_id.is_empty()
    }

    /// Key used for cache entries and wire-protocol module status lookups.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.debug_name, self.breakpad_id)
    }
}

impl std::fmt::Display for LibraryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.debug_name, self.breakpad_id)
    }
}

/// Violation of the symbol table format invariants.
#[derive(Error, Debug)]
pub enum SymbolTableError {
    #[error("Symbol table blob too short ({0} bytes)")]
    Truncated(usize),

    #[error("Bad symbol table magic")]
    BadMagic,

    #[error("Symbol addresses are not strictly ascending at entry {0}")]
    AddrsNotAscending(usize),

    #[error("Index array has length {got}, expected {expected}")]
    IndexLength { got: usize, expected: usize },

    #[error("Index array is not monotonic at entry {0}")]
    IndexNotMonotonic(usize),

    #[error("Index end {index_end} does not match buffer length {buffer_len}")]
    BufferMismatch { index_end: u32, buffer_len: usize },
}

/// One successful lookup against a [`SymbolTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLookup {
    /// Function name, exactly as stored (possibly still mangled)
    pub name: String,
    /// Start address of the containing function, library-relative
    pub symbol_address: u32,
    /// Distance to the next symbol; unknown for the last symbol in the table
    pub function_size: Option<u32>,
}

/// A library's complete symbol set in compact columnar form.
///
/// `addrs` holds the strictly ascending library-relative start address of
/// every function; `index` has one more entry than `addrs` and gives byte
/// offsets into `buffer`; `buffer` is the UTF-8 function names concatenated
/// in address order. Invariant: `index[addrs.len()] == buffer.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    pub addrs: Vec<u32>,
    pub index: Vec<u32>,
    pub buffer: Vec<u8>,
}

/// File/wire magic for the serialized symbol table format.
const SYMTAB_MAGIC: &[u8; 4] = b"SLT1";

impl SymbolTable {
    /// Build a table from `(address, name)` pairs.
    ///
    /// Pairs are sorted by address; duplicate addresses keep the first name.
    #[must_use]
    pub fn from_pairs(mut pairs: Vec<(u32, String)>) -> Self {
        pairs.sort_by_key(|&(addr, _)| addr);
        pairs.dedup_by_key(|&mut (addr, _)| addr);

        let mut addrs = Vec::with_capacity(pairs.len());
        let mut index = Vec::with_capacity(pairs.len() + 1);
        let mut buffer = Vec::new();

        index.push(0);
        for (addr, name) in pairs {
            addrs.push(addr);
            buffer.extend_from_slice(name.as_bytes());
            index.push(u32::try_from(buffer.len()).unwrap_or(u32::MAX));
        }

        Self { addrs, index, buffer }
    }

    /// Number of symbols in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Check all structural invariants of the `(addrs, index, buffer)` triple.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), SymbolTableError> {
        if self.index.len() != self.addrs.len() + 1 {
            return Err(SymbolTableError::IndexLength {
                got: self.index.len(),
                expected: self.addrs.len() + 1,
            });
        }
        for (i, pair) in self.addrs.windows(2).enumerate() {
            if pair[0] >= pair[1] {
                return Err(SymbolTableError::AddrsNotAscending(i + 1));
            }
        }
        for (i, pair) in self.index.windows(2).enumerate() {
            if pair[0] > pair[1] {
                return Err(SymbolTableError::IndexNotMonotonic(i + 1));
            }
        }
        let index_end = *self.index.last().unwrap_or(&0);
        if index_end as usize != self.buffer.len() {
            return Err(SymbolTableError::BufferMismatch {
                index_end,
                buffer_len: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Find the symbol covering `addr`: the entry with the largest start
    /// address that is `<= addr`.
    ///
    /// Returns `None` when `addr` precedes the first symbol (or the table is
    /// empty); callers synthesize a placeholder in that case.
    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<TableLookup> {
        let i = match self.addrs.binary_search(&addr) {
            Ok(i) => i,
            Err(0) => return None,
            Err(insertion) => insertion - 1,
        };

        let start = self.index[i] as usize;
        let end = self.index[i + 1] as usize;
        let name = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();

        Some(TableLookup {
            name,
            symbol_address: self.addrs[i],
            function_size: self.addrs.get(i + 1).map(|next| next - self.addrs[i]),
        })
    }

    /// Serialize to the bit-exact byte format used across the cache and host
    /// boundary: magic, symbol count, then the `addrs`, `index`, and `buffer`
    /// arrays (all integers little-endian).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.addrs.len() * 4 + self.index.len() * 4 + self.buffer.len(),
        );
        out.extend_from_slice(SYMTAB_MAGIC);
        out.extend_from_slice(&u32::try_from(self.addrs.len()).unwrap_or(u32::MAX).to_le_bytes());
        for addr in &self.addrs {
            out.extend_from_slice(&addr.to_le_bytes());
        }
        for offset in &self.index {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&self.buffer);
        out
    }

    /// Deserialize from the byte format written by [`Self::to_bytes`],
    /// validating every table invariant.
    ///
    /// # Errors
    /// Returns a [`SymbolTableError`] if the blob is truncated, has the wrong
    /// magic, or violates a structural invariant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SymbolTableError> {
        if bytes.len() < 8 {
            return Err(SymbolTableError::Truncated(bytes.len()));
        }
        if &bytes[0..4] != SYMTAB_MAGIC {
            return Err(SymbolTableError::BadMagic);
        }
        let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        let addrs_end = 8 + count * 4;
        let index_end = addrs_end + (count + 1) * 4;
        if bytes.len() < index_end {
            return Err(SymbolTableError::Truncated(bytes.len()));
        }

        let read_u32s = |range: std::ops::Range<usize>| {
            bytes[range]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<u32>>()
        };

        let table = Self {
            addrs: read_u32s(8..addrs_end),
            index: read_u32s(addrs_end..index_end),
            buffer: bytes[index_end..].to_vec(),
        };
        table.validate()?;
        Ok(table)
    }
}

/// One frame of an inlined call chain, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineFrame {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Symbol information for one requested address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResult {
    /// Function name (a synthesized placeholder when nothing better is known)
    pub name: String,
    /// Start address of the containing function, library-relative
    pub symbol_address: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Inlined calls at this address, ordered innermost → outermost
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inlines: Option<Vec<InlineFrame>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_size: Option<u32>,
}

impl AddressResult {
    /// Result for an address with no symbol information at all.
    #[must_use]
    pub fn unknown(addr: u32) -> Self {
        Self {
            name: format!("<unknown at {addr:#x}>"),
            symbol_address: addr,
            file: None,
            line: None,
            inlines: None,
            function_size: None,
        }
    }
}
