//! Endpoint compilation and live exchange validation

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use lingotest_common::{ContractViolation, Direction, Error, EventBus, Result, RunEvent};

use crate::document::ContractDocument;
use crate::schema::{CompiledSchema, ValidationError, ValidationMode};

const METHODS: &[&str] = &["get", "post", "put", "patch", "delete", "head", "options"];

/// Per-endpoint compiled validators, keyed by `METHOD + path-template`
pub struct EndpointContract {
    pub key: String,
    pub method: String,
    pub path_template: String,
    path_regex: Regex,
    request: Option<CompiledSchema>,
    responses: HashMap<u16, CompiledSchema>,
    query: HashMap<String, CompiledSchema>,
    headers: HashMap<String, CompiledSchema>,
    path_params: HashMap<String, CompiledSchema>,
}

impl EndpointContract {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.path_regex.is_match(path)
    }
}

/// Convert `{param}` segments to wildcard groups
fn template_to_regex(template: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for segment in template.split('/') {
        if segment.is_empty() {
            continue;
        }
        pattern.push('/');
        if segment.starts_with('{') && segment.ends_with('}') {
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| Error::ContractDocument(format!("bad path template {template}: {e}")))
}

fn json_schema_at<'a>(operation: &'a Value, pointer: &str) -> Option<&'a Value> {
    operation.pointer(pointer)
}

/// Validates HTTP exchanges against a compiled contract
///
/// Violations are appended to an internal log and mirrored onto the
/// run's event channel; in strict mode callers are expected to treat
/// a non-empty error list as fatal (the `ValidatingClient` does).
pub struct ContractValidator {
    endpoints: Vec<EndpointContract>,
    mode: ValidationMode,
    events: EventBus,
    violations: Mutex<Vec<ContractViolation>>,
}

impl ContractValidator {
    pub fn from_document(doc: &ContractDocument, mode: ValidationMode) -> Result<Self> {
        Self::with_events(doc, mode, EventBus::detached())
    }

    pub fn with_events(
        doc: &ContractDocument,
        mode: ValidationMode,
        events: EventBus,
    ) -> Result<Self> {
        let mut endpoints = Vec::new();

        for (template, item) in doc.paths() {
            for method in METHODS {
                let Some(operation) = item.get(method) else {
                    continue;
                };

                let request = json_schema_at(
                    operation,
                    "/requestBody/content/application~1json/schema",
                )
                .map(|s| doc.resolve(s).map(CompiledSchema::new))
                .transpose()?;

                let mut responses = HashMap::new();
                if let Some(declared) = operation.get("responses").and_then(Value::as_object) {
                    for (status, response) in declared {
                        let Ok(code) = status.parse::<u16>() else {
                            continue; // "default" and friends
                        };
                        if let Some(schema) =
                            json_schema_at(response, "/content/application~1json/schema")
                        {
                            responses.insert(code, CompiledSchema::new(doc.resolve(schema)?));
                        }
                    }
                }

                let mut query = HashMap::new();
                let mut headers = HashMap::new();
                let mut path_params = HashMap::new();
                if let Some(params) = operation.get("parameters").and_then(Value::as_array) {
                    for param in params {
                        let (Some(name), Some(location)) = (
                            param.get("name").and_then(Value::as_str),
                            param.get("in").and_then(Value::as_str),
                        ) else {
                            continue;
                        };
                        let Some(schema) = param.get("schema") else {
                            continue;
                        };
                        let compiled = CompiledSchema::new(doc.resolve(schema)?);
                        match location {
                            "query" => query.insert(name.to_string(), compiled),
                            "header" => headers.insert(name.to_lowercase(), compiled),
                            "path" => path_params.insert(name.to_string(), compiled),
                            _ => None,
                        };
                    }
                }

                let method_upper = method.to_uppercase();
                endpoints.push(EndpointContract {
                    key: format!("{method_upper} {template}"),
                    method: method_upper,
                    path_template: template.clone(),
                    path_regex: template_to_regex(template)?,
                    request,
                    responses,
                    query,
                    headers,
                    path_params,
                });
            }
        }

        debug!(endpoints = endpoints.len(), "compiled contract");
        Ok(Self {
            endpoints,
            mode,
            events,
            violations: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn strict(&self) -> bool {
        self.mode == ValidationMode::Strict
    }

    /// First matching template wins, in document order
    pub fn match_endpoint(&self, method: &str, path: &str) -> Option<&EndpointContract> {
        self.endpoints.iter().find(|e| e.matches(method, path))
    }

    /// Validate an outgoing request against its endpoint contract
    pub fn validate_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
    ) -> Vec<ValidationError> {
        let Some(endpoint) = self.match_endpoint(method, path) else {
            return self.unmatched(method, path, Direction::Request);
        };

        let mut errors = Vec::new();

        match (&endpoint.request, body) {
            (Some(schema), Some(body)) => errors.extend(schema.validate(body, self.mode)),
            (Some(_), None) => errors.push(ValidationError {
                path: "/".to_string(),
                message: "request body required but absent".to_string(),
                expected: "body".to_string(),
                actual: Value::Null,
            }),
            (None, Some(body)) if self.strict() => errors.push(ValidationError {
                path: "/".to_string(),
                message: "unexpected request body".to_string(),
                expected: "no body".to_string(),
                actual: body.clone(),
            }),
            _ => {}
        }

        for (name, schema) in &endpoint.query {
            if let Some(raw) = query.get(name) {
                errors.extend(schema.validate(&Value::String(raw.clone()), self.mode));
            }
        }
        for (name, schema) in &endpoint.headers {
            if let Some(raw) = headers.get(&name.to_lowercase()) {
                errors.extend(schema.validate(&Value::String(raw.clone()), self.mode));
            }
        }
        if !endpoint.path_params.is_empty() {
            if let Some(captures) = endpoint.path_regex.captures(path) {
                // Params appear in template order; captures follow suit
                let names: Vec<&str> = endpoint
                    .path_template
                    .split('/')
                    .filter(|s| s.starts_with('{') && s.ends_with('}'))
                    .map(|s| &s[1..s.len() - 1])
                    .collect();
                for (i, name) in names.iter().enumerate() {
                    if let (Some(schema), Some(value)) =
                        (endpoint.path_params.get(*name), captures.get(i + 1))
                    {
                        errors.extend(
                            schema.validate(&Value::String(value.as_str().to_string()), self.mode),
                        );
                    }
                }
            }
        }

        self.record(&endpoint.key, Direction::Request, body, &errors);
        errors
    }

    /// Validate a response against the matched status code's schema
    pub fn validate_response(
        &self,
        method: &str,
        path: &str,
        status: u16,
        body: Option<&Value>,
    ) -> Vec<ValidationError> {
        let Some(endpoint) = self.match_endpoint(method, path) else {
            return self.unmatched(method, path, Direction::Response);
        };

        let mut errors = Vec::new();

        match (endpoint.responses.get(&status), body) {
            (Some(schema), Some(body)) => errors.extend(schema.validate(body, self.mode)),
            (Some(_), None) => errors.push(ValidationError {
                path: "/".to_string(),
                message: format!("response body required for status {status} but absent"),
                expected: "body".to_string(),
                actual: Value::Null,
            }),
            (None, _) if self.strict() => errors.push(ValidationError {
                path: "/".to_string(),
                message: format!("undeclared response status {status}"),
                expected: "declared status".to_string(),
                actual: Value::from(status),
            }),
            _ => {}
        }

        self.record(&endpoint.key, Direction::Response, body, &errors);
        errors
    }

    /// Lenient mode sends bodies with undeclared fields removed;
    /// strict mode leaves the payload untouched (the violations are
    /// already recorded).
    pub fn sanitize_request(&self, method: &str, path: &str, body: Value) -> Value {
        if self.strict() {
            return body;
        }
        match self
            .match_endpoint(method, path)
            .and_then(|e| e.request.as_ref())
        {
            Some(schema) => schema.strip_undeclared(&body),
            None => body,
        }
    }

    fn unmatched(&self, method: &str, path: &str, direction: Direction) -> Vec<ValidationError> {
        if !self.strict() {
            debug!(%method, %path, "no contract entry for exchange");
            return Vec::new();
        }
        let errors = vec![ValidationError {
            path: "/".to_string(),
            message: format!("no contract entry matches {method} {path}"),
            expected: "declared endpoint".to_string(),
            actual: Value::String(path.to_string()),
        }];
        self.record(&format!("{method} {path}"), direction, None, &errors);
        errors
    }

    fn record(
        &self,
        endpoint: &str,
        direction: Direction,
        body: Option<&Value>,
        errors: &[ValidationError],
    ) {
        if errors.is_empty() {
            return;
        }
        let mut log = self.violations.lock();
        for error in errors {
            let violation = ContractViolation {
                endpoint: endpoint.to_string(),
                direction,
                expected: error.expected.clone(),
                actual: body.cloned().unwrap_or(error.actual.clone()),
                message: format!("{}: {}", error.path, error.message),
                timestamp: chrono::Utc::now(),
            };
            warn!(endpoint, ?direction, message = %violation.message, "contract violation");
            self.events
                .emit(RunEvent::ContractViolation(violation.clone()));
            log.push(violation);
        }
    }

    /// Drain the append-only violation log
    pub fn take_violations(&self) -> Vec<ContractViolation> {
        std::mem::take(&mut self.violations.lock())
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> ContractDocument {
        ContractDocument::from_value(json!({
            "paths": {
                "/x": {
                    "post": {
                        "requestBody": {
                            "content": { "application/json": { "schema": {
                                "type": "object",
                                "required": ["a"],
                                "properties": { "a": { "type": "string" } }
                            }}}
                        },
                        "responses": {
                            "200": { "content": { "application/json": { "schema": {
                                "type": "object",
                                "required": ["b"],
                                "properties": { "b": { "type": "number" } }
                            }}}}
                        }
                    }
                },
                "/media/{id}/subtitles": {
                    "get": {
                        "parameters": [
                            { "name": "id", "in": "path", "schema": { "type": "string", "format": "uuid" } },
                            { "name": "lang", "in": "query", "schema": { "type": "string", "minLength": 2 } }
                        ],
                        "responses": {
                            "200": { "content": { "application/json": { "schema": { "type": "array" } } } }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_contract_round_trip() {
        let validator = ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap();

        let no_headers = HashMap::new();
        let no_query = HashMap::new();

        let ok = validator.validate_request("POST", "/x", Some(&json!({"a": "v"})), &no_headers, &no_query);
        assert!(ok.is_empty());

        let bad = validator.validate_request("POST", "/x", Some(&json!({"a": 1})), &no_headers, &no_query);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].path, "/a");

        let resp = validator.validate_response("POST", "/x", 200, Some(&json!({"b": 5})));
        assert!(resp.is_empty());

        assert_eq!(validator.violation_count(), 1);
    }

    #[test]
    fn test_path_template_matching() {
        let validator = ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap();
        let id = "8c2f84b0-7f39-4b77-bd9e-5ba63f7c9e4d";
        assert!(validator
            .match_endpoint("GET", &format!("/media/{id}/subtitles"))
            .is_some());
        assert!(validator.match_endpoint("GET", "/media/abc").is_none());
    }

    #[test]
    fn test_path_param_and_query_validation() {
        let validator = ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap();
        let mut query = HashMap::new();
        query.insert("lang".to_string(), "e".to_string());

        let errors = validator.validate_request(
            "GET",
            "/media/not-a-uuid/subtitles",
            None,
            &HashMap::new(),
            &query,
        );
        // Bad uuid in path plus too-short query value
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_sanitize_request_strips_only_in_lenient_mode() {
        let body = json!({"a": "v", "extra": true});

        let lenient = ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap();
        assert_eq!(
            lenient.sanitize_request("POST", "/x", body.clone()),
            json!({"a": "v"})
        );

        let strict = ContractValidator::from_document(&doc(), ValidationMode::Strict).unwrap();
        assert_eq!(strict.sanitize_request("POST", "/x", body.clone()), body);
    }

    #[test]
    fn test_strict_flags_undeclared_status() {
        let validator = ContractValidator::from_document(&doc(), ValidationMode::Strict).unwrap();
        let errors = validator.validate_response("POST", "/x", 503, None);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("503"));
    }

    #[test]
    fn test_lenient_ignores_unmatched_endpoint() {
        let validator = ContractValidator::from_document(&doc(), ValidationMode::Lenient).unwrap();
        assert!(validator
            .validate_response("GET", "/unknown", 200, None)
            .is_empty());
        assert_eq!(validator.violation_count(), 0);
    }

    #[test]
    fn test_violations_reach_event_channel() {
        let (bus, mut rx) = EventBus::channel();
        let validator = ContractValidator::with_events(&doc(), ValidationMode::Lenient, bus).unwrap();
        validator.validate_request("POST", "/x", None, &HashMap::new(), &HashMap::new());
        assert!(matches!(
            rx.try_recv(),
            Ok(RunEvent::ContractViolation(_))
        ));
    }
}
