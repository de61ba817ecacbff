//! Columnar profile model.
//!
//! Frames and functions live in flat, indexable tables that reference each
//! other by integer index; indices stay stable across symbolication steps
//! (functions are only appended or rewritten in place, never removed).
//! Strings are interned per thread so columns stay plain integers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::SymbolError;
use symlens_common::LibraryIdentity;

/// One loaded binary: its debug identity plus where it sat in the sampled
/// process's address space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryInfo {
    pub name: String,
    pub debug_name: String,
    pub breakpad_id: String,
    /// Absolute `[start, end)` mapping range
    pub start: u64,
    pub end: u64,
}

impl LibraryInfo {
    #[must_use]
    pub fn identity(&self) -> LibraryIdentity {
        LibraryIdentity::new(self.debug_name.clone(), self.breakpad_id.clone())
    }
}

/// Find the library containing an absolute address.
///
/// `libs` must be sorted by `start` with non-overlapping `[start, end)`
/// ranges. Returns `None` for addresses outside every range.
#[must_use]
pub fn lib_index_for_address(libs: &[LibraryInfo], address: u64) -> Option<usize> {
    let candidate = libs.partition_point(|lib| lib.start <= address).checked_sub(1)?;
    (address < libs[candidate].end).then_some(candidate)
}

/// Per-thread interned strings. The deduplication index is rebuilt when a
/// profile is loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len();
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    #[must_use]
    pub fn get(&self, i: usize) -> &str {
        &self.strings[i]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl From<Vec<String>> for StringTable {
    fn from(strings: Vec<String>) -> Self {
        let index = strings.iter().enumerate().map(|(i, s)| (s.clone(), i)).collect();
        Self { strings, index }
    }
}

impl From<StringTable> for Vec<String> {
    fn from(table: StringTable) -> Self {
        table.strings
    }
}

/// One stack entry per row: the library-relative address it was sampled at
/// (`None` for non-native frames) and the function it currently references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameTable {
    pub address: Vec<Option<u32>>,
    pub func: Vec<usize>,
}

impl FrameTable {
    pub fn push(&mut self, address: Option<u32>, func: usize) -> usize {
        self.address.push(address);
        self.func.push(func);
        self.func.len() - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.func.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.func.is_empty()
    }
}

/// One de-duplicated logical function per row. `name` and `file` are string
/// table indices; `address` is the function's library-relative start once
/// symbolication has established it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuncTable {
    pub name: Vec<usize>,
    pub lib: Vec<Option<usize>>,
    pub address: Vec<Option<u32>>,
    pub file: Vec<Option<usize>>,
    pub line: Vec<Option<u32>>,
}

impl FuncTable {
    pub fn push(&mut self, name: usize, lib: Option<usize>) -> usize {
        self.name.push(name);
        self.lib.push(lib);
        self.address.push(None);
        self.file.push(None);
        self.line.push(None);
        self.name.len() - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thread {
    pub name: String,
    pub frames: FrameTable,
    pub funcs: FuncTable,
    pub strings: StringTable,
}

impl Thread {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Add one sampled stack frame from an absolute address.
    ///
    /// Before any symbols are known, every frame gets a function of its own
    /// with an address-derived placeholder name; symbolication later merges
    /// these. Addresses outside every library keep a placeholder with no
    /// library assignment.
    pub fn add_stack_frame(&mut self, libs: &[LibraryInfo], absolute_address: u64) -> usize {
        match lib_index_for_address(libs, absolute_address) {
            Some(lib_index) => {
                let relative =
                    u32::try_from(absolute_address - libs[lib_index].start).unwrap_or(u32::MAX);
                let name = self.strings.intern(&format!("{relative:#x}"));
                let func = self.funcs.push(name, Some(lib_index));
                self.frames.push(Some(relative), func)
            }
            None => {
                let name = self.strings.intern(&format!("{absolute_address:#x}"));
                let func = self.funcs.push(name, None);
                self.frames.push(None, func)
            }
        }
    }

    /// Resolved display name of a frame's function.
    #[must_use]
    pub fn frame_func_name(&self, frame: usize) -> &str {
        self.strings.get(self.funcs.name[self.frames.func[frame]])
    }
}

/// Whether a symbolication pass is currently rewriting the profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SymbolicationStatus {
    #[default]
    Done,
    Symbolicating,
}

/// The profile being symbolicated: libraries sorted by start address plus
/// per-thread frame/function tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub libs: Vec<LibraryInfo>,
    pub threads: Vec<Thread>,
    #[serde(skip)]
    pub symbolication_status: SymbolicationStatus,
}

impl Profile {
    /// Write the profile as JSON to `path`, replacing any existing file only
    /// once the new content is fully on disk (temp file plus rename). A
    /// serialization or I/O failure leaves the existing file untouched.
    ///
    /// # Errors
    /// Returns the underlying I/O or serialization error.
    pub fn save(&self, path: &Path) -> Result<(), SymbolError> {
        let temp = path.with_extension("tmp");
        let mut writer = BufWriter::new(std::fs::File::create(&temp)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }
}
