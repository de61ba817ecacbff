//! HTTP-backed symbol supplier.
//!
//! Implements the server tier of the provider contract against a
//! symbolication endpoint speaking the batch wire protocol. The host tiers
//! report not-found: a host embedding this pipeline injects its own supplier
//! with real host bridges instead.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::domain::{LibSymbolicationRequest, SymbolError};
use crate::protocol;
use crate::store::{SupplierResponse, SymbolSupplier};
use symlens_common::{LibraryIdentity, SymbolTable};

pub struct HttpSymbolSupplier {
    client: reqwest::Client,
    server_url: String,
}

impl HttpSymbolSupplier {
    /// # Errors
    /// Returns a transport error if the HTTP client cannot be constructed.
    pub fn new(server_url: impl Into<String>) -> Result<Self, SymbolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SymbolError::Transport(e.to_string()))?;
        Ok(Self { client, server_url: server_url.into() })
    }

    async fn post_batch(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Result<serde_json::Value, SymbolError> {
        let body = protocol::build_request_body(requests);
        debug!(
            "Requesting symbols for {} libraries from {}",
            requests.len(),
            self.server_url
        );
        let response = self
            .client
            .post(&self.server_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SymbolError::Transport(e.to_string()))?;
        let response =
            response.error_for_status().map_err(|e| SymbolError::Transport(e.to_string()))?;
        response.json().await.map_err(|e| SymbolError::Transport(e.to_string()))
    }
}

/// Fail every request in the batch with an error built per request.
fn fail_all(
    requests: &[LibSymbolicationRequest],
    error: impl Fn(&LibSymbolicationRequest) -> SymbolError,
) -> Vec<SupplierResponse> {
    requests
        .iter()
        .map(|req| SupplierResponse::Failure { request: req.clone(), error: error(req) })
        .collect()
}

#[async_trait]
impl SymbolSupplier for HttpSymbolSupplier {
    async fn request_symbols_from_server(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        let raw = match self.post_batch(requests).await {
            Ok(raw) => raw,
            Err(e) => {
                let msg = e.to_string();
                return fail_all(requests, |_| SymbolError::Transport(msg.clone()));
            }
        };

        let body = match protocol::parse_response_body(raw) {
            Ok(body) => body,
            Err(e) => {
                let msg = e.to_string();
                return fail_all(requests, |_| SymbolError::MalformedResponse(msg.clone()));
            }
        };

        if body.results.len() != requests.len() {
            let got = body.results.len();
            return fail_all(requests, |_| {
                SymbolError::MalformedResponse(format!(
                    "expected {} results, got {got}",
                    requests.len()
                ))
            });
        }

        requests
            .iter()
            .zip(&body.results)
            .map(|(req, result)| match protocol::to_address_results(req, result) {
                Ok(results) => SupplierResponse::Success { lib: req.lib.clone(), results },
                Err(error) => SupplierResponse::Failure { request: req.clone(), error },
            })
            .collect()
    }

    async fn request_symbols_from_host(
        &self,
        requests: &[LibSymbolicationRequest],
    ) -> Vec<SupplierResponse> {
        // No host bridge over plain HTTP
        fail_all(requests, |req| SymbolError::NotFound(req.lib.clone()))
    }

    async fn request_full_symbol_table_from_host(
        &self,
        lib: &LibraryIdentity,
    ) -> Result<SymbolTable, SymbolError> {
        Err(SymbolError::NotFound(lib.clone()))
    }
}
