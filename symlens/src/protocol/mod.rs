//! Wire protocol client for the batch "address → symbol" lookup API.
//!
//! One request carries one job per library; a job lists the library identity
//! in `memoryMap` and all requested addresses as a single synthetic "stack"
//! whose frames pair the constant module index 0 with each address. The
//! response mirrors the jobs: one result per job, one stack per result, one
//! frame per requested address.
//!
//! Parsing is strict about structure (required fields, array shapes) and
//! tolerant about versioned optional fields (`file`, `line`,
//! `function_size`, `inlines`): a structurally invalid response fails with
//! [`SymbolError::MalformedResponse`], which is a different failure from
//! "this server has never heard of that library".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{AddressResults, LibSymbolicationRequest, SymbolError};
use symlens_common::{AddressResult, InlineFrame};

/// Body of a symbolication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub jobs: Vec<RequestJob>,
}

/// One job: one library plus every address requested for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestJob {
    /// `[[debugName, breakpadId]]` — a single module per job
    pub memory_map: Vec<[String; 2]>,
    /// `[[[0, address], ...]]` — a single synthetic stack per job
    pub stacks: Vec<Vec<(u32, u32)>>,
}

/// Body of a symbolication response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseBody {
    pub results: Vec<ResponseResult>,
}

/// Per-job result.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseResult {
    /// `"debugName/breakpadId"` → whether symbols were found for that module
    pub found_modules: HashMap<String, bool>,
    pub stacks: Vec<Vec<ResponseFrame>>,
}

/// Per-address answer inside a response stack.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    pub module_offset: u32,
    pub module: String,
    pub frame: u32,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub function_offset: Option<u32>,
    #[serde(default)]
    pub function_size: Option<u32>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub inlines: Option<Vec<ResponseInline>>,
}

/// One entry of a reported inline-call chain; chains may nest.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInline {
    pub function: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub inlines: Option<Vec<ResponseInline>>,
}

/// Build the request body: one job per library, one synthetic stack per job
/// carrying every requested address against module index 0.
#[must_use]
pub fn build_request_body(requests: &[LibSymbolicationRequest]) -> RequestBody {
    let jobs = requests
        .iter()
        .map(|req| RequestJob {
            memory_map: vec![[req.lib.debug_name.clone(), req.lib.breakpad_id.clone()]],
            stacks: vec![req.addresses.iter().map(|&addr| (0, addr)).collect()],
        })
        .collect();
    RequestBody { jobs }
}

/// Deserialize and structurally validate a raw response body.
///
/// # Errors
/// [`SymbolError::MalformedResponse`] when required fields are missing or
/// have the wrong shape. No semantic interpretation happens here.
pub fn parse_response_body(raw: serde_json::Value) -> Result<ResponseBody, SymbolError> {
    serde_json::from_value(raw)
        .map_err(|e| SymbolError::MalformedResponse(format!("response body: {e}")))
}

/// Turn one job's response into per-address results.
///
/// If the module status says symbols were not found, every address in the
/// job fails with a [`SymbolError::NotFound`] naming the library. Addresses
/// the server had no function information for (before the first or past the
/// last known symbol) get a synthesized placeholder name.
///
/// # Errors
/// `MalformedResponse` when the result's shape does not match the request
/// (stack count, frame count, or frame addresses), `NotFound` when the
/// module status reports no symbols.
pub fn to_address_results(
    request: &LibSymbolicationRequest,
    result: &ResponseResult,
) -> Result<AddressResults, SymbolError> {
    // Structure first, semantics second
    if result.stacks.len() != 1 {
        return Err(SymbolError::MalformedResponse(format!(
            "expected 1 stack for {}, got {}",
            request.lib,
            result.stacks.len()
        )));
    }
    let stack = &result.stacks[0];
    if stack.len() != request.addresses.len() {
        return Err(SymbolError::MalformedResponse(format!(
            "expected {} frames for {}, got {}",
            request.addresses.len(),
            request.lib,
            stack.len()
        )));
    }

    if !result.found_modules.get(&request.lib.key()).copied().unwrap_or(false) {
        return Err(SymbolError::NotFound(request.lib.clone()));
    }

    let mut results = AddressResults::with_capacity(stack.len());
    for (&addr, frame) in request.addresses.iter().zip(stack) {
        if frame.module_offset != addr {
            return Err(SymbolError::MalformedResponse(format!(
                "frame address {:#x} does not match requested address {addr:#x}",
                frame.module_offset
            )));
        }
        results.insert(addr, address_result_from_frame(addr, frame));
    }
    Ok(results)
}

fn address_result_from_frame(addr: u32, frame: &ResponseFrame) -> AddressResult {
    let Some(name) = frame.function.clone() else {
        // No function information at this specific address
        return AddressResult::unknown(addr);
    };

    AddressResult {
        name,
        symbol_address: addr.saturating_sub(frame.function_offset.unwrap_or(0)),
        file: frame.file.clone(),
        line: frame.line,
        inlines: frame.inlines.as_deref().map(flatten_inlines),
        function_size: frame.function_size,
    }
}

/// Flatten a possibly nested inline-call chain into one ordered list,
/// innermost first.
fn flatten_inlines(entries: &[ResponseInline]) -> Vec<InlineFrame> {
    let mut out = Vec::new();
    for entry in entries {
        out.push(InlineFrame {
            name: entry.function.clone(),
            file: entry.file.clone(),
            line: entry.line,
        });
        if let Some(nested) = &entry.inlines {
            out.extend(flatten_inlines(nested));
        }
    }
    out
}
