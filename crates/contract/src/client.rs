//! HTTP client interception
//!
//! Wraps a `reqwest::Client` so every exchange through it is checked
//! against the compiled contract: the request before it leaves, the
//! response body against the matched status schema. Every call records
//! a `ContractCheck` regardless of outcome.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use lingotest_common::{Error, Result};

use crate::schema::ValidationError;
use crate::validator::ContractValidator;

/// One validated exchange
#[derive(Debug, Clone, Serialize)]
pub struct ContractCheck {
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub passed: bool,
    pub error_count: usize,
    pub duration_ms: u64,
}

/// Response as seen by the caller after validation
#[derive(Debug)]
pub struct ValidatedResponse {
    pub status: u16,
    pub body: Option<Value>,
    pub errors: Vec<ValidationError>,
}

/// A reqwest wrapper with contract validation on both directions
pub struct ValidatingClient {
    inner: reqwest::Client,
    validator: Arc<ContractValidator>,
    base_url: String,
    checks: parking_lot::Mutex<Vec<ContractCheck>>,
}

impl ValidatingClient {
    pub fn new(validator: Arc<ContractValidator>, base_url: impl Into<String>) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            inner,
            validator,
            base_url: base_url.into(),
            checks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Perform one validated exchange
    ///
    /// `path` may carry a query string; `headers` are validated
    /// against any declared header parameter schemas and sent with
    /// the request. In strict mode a request-side violation fails
    /// before the call goes out; response-side violations fail after
    /// the check is recorded. In lenient mode outgoing bodies are
    /// sent with undeclared fields stripped.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Option<Value>,
    ) -> Result<ValidatedResponse> {
        let (bare_path, query) = split_query(path);
        let endpoint_key = self
            .validator
            .match_endpoint(method, bare_path)
            .map(|e| e.key.clone())
            .unwrap_or_else(|| format!("{method} {bare_path}"));

        // Header names are matched case-insensitively
        let header_map: HashMap<String, String> = headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.clone()))
            .collect();

        let request_errors = self.validator.validate_request(
            method,
            bare_path,
            body.as_ref(),
            &header_map,
            &query,
        );
        if !request_errors.is_empty() {
            if self.validator.strict() {
                return Err(Error::StrictViolation {
                    endpoint: endpoint_key,
                    count: request_errors.len(),
                });
            }
            warn!(endpoint = %endpoint_key, count = request_errors.len(), "request violates contract");
        }

        let body = body.map(|b| self.validator.sanitize_request(method, bare_path, b));

        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();
        let mut builder = self
            .inner
            .request(method.parse().unwrap_or(reqwest::Method::GET), &url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let parsed: Option<Value> = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };

        let errors = self
            .validator
            .validate_response(method, bare_path, status, parsed.as_ref());
        let duration_ms = started.elapsed().as_millis() as u64;

        self.checks.lock().push(ContractCheck {
            endpoint: endpoint_key.clone(),
            method: method.to_string(),
            status,
            passed: errors.is_empty(),
            error_count: errors.len(),
            duration_ms,
        });

        if !errors.is_empty() && self.validator.strict() {
            return Err(Error::StrictViolation {
                endpoint: endpoint_key,
                count: errors.len(),
            });
        }

        Ok(ValidatedResponse {
            status,
            body: parsed,
            errors,
        })
    }

    /// Drain the per-exchange check log
    pub fn take_checks(&self) -> Vec<ContractCheck> {
        std::mem::take(&mut self.checks.lock())
    }

    pub fn validator(&self) -> &ContractValidator {
        &self.validator
    }
}

fn split_query(path: &str) -> (&str, HashMap<String, String>) {
    match path.split_once('?') {
        None => (path, HashMap::new()),
        Some((bare, raw)) => {
            let query = raw
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect();
            (bare, query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ContractDocument;
    use crate::schema::ValidationMode;
    use serde_json::json;

    fn doc() -> ContractDocument {
        ContractDocument::from_value(json!({
            "paths": {
                "/secure": {
                    "get": {
                        "parameters": [
                            { "name": "X-Api-Key", "in": "header",
                              "schema": { "type": "string", "minLength": 10 } }
                        ],
                        "responses": {}
                    }
                }
            }
        }))
        .unwrap()
    }

    fn api_key_headers(value: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("X-Api-Key".to_string(), value.to_string());
        headers
    }

    #[tokio::test]
    async fn test_strict_header_violation_fails_before_send() {
        let validator =
            Arc::new(ContractValidator::from_document(&doc(), ValidationMode::Strict).unwrap());
        // Nothing listens here; a strict request-side failure must
        // surface before any connection attempt
        let client = ValidatingClient::new(validator, "http://127.0.0.1:9").unwrap();

        let err = client
            .request("GET", "/secure", &api_key_headers("short"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StrictViolation { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_lenient_header_violation_is_recorded_not_fatal() {
        let validator =
            Arc::new(ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap());
        let client = ValidatingClient::new(validator, "http://127.0.0.1:9").unwrap();

        let err = client
            .request("GET", "/secure", &api_key_headers("short"), None)
            .await
            .unwrap_err();
        // The violation is logged and the call proceeds to the
        // (refused) connection
        assert!(matches!(err, Error::Http(_)));
        assert_eq!(client.validator().violation_count(), 1);
    }

    #[test]
    fn test_split_query() {
        let (path, query) = split_query("/media?lang=es&limit=10");
        assert_eq!(path, "/media");
        assert_eq!(query.get("lang").unwrap(), "es");
        assert_eq!(query.get("limit").unwrap(), "10");

        let (path, query) = split_query("/media");
        assert_eq!(path, "/media");
        assert!(query.is_empty());
    }
}
