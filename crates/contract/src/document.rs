//! Contract document loading and `$ref` resolution
//!
//! The document is an OpenAPI-style tree: `paths` maps path-templates
//! to methods to operations. `$ref` values are document-relative
//! pointers (`#/a/b/c`) resolved against the root.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use lingotest_common::{Error, Result};

// Guards against `$ref` cycles in a malformed document
const MAX_REF_DEPTH: usize = 32;

/// An immutable, loaded contract document
#[derive(Debug)]
pub struct ContractDocument {
    root: Value,
    // Resolved schemas cached by pointer so repeated endpoint lookups
    // do not re-walk the tree
    cache: Mutex<HashMap<String, Value>>,
}

impl ContractDocument {
    pub fn from_value(root: Value) -> Result<Self> {
        if !root.get("paths").map(Value::is_object).unwrap_or(false) {
            return Err(Error::ContractDocument(
                "document has no 'paths' object".to_string(),
            ));
        }
        Ok(Self {
            root,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Path-template entries, in document order
    pub fn paths(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.root
            .get("paths")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|map| map.iter())
    }

    /// Look up a `#/a/b/c` pointer in the document root
    fn lookup(&self, pointer: &str) -> Result<&Value> {
        let trimmed = pointer.trim_start_matches('#');
        let mut node = &self.root;
        for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
            node = node.get(segment).ok_or_else(|| {
                Error::ContractDocument(format!("unresolvable $ref: {pointer}"))
            })?;
        }
        Ok(node)
    }

    /// Deep-resolve a schema fragment: every `$ref` is replaced by the
    /// referenced subtree, recursively
    pub fn resolve(&self, value: &Value) -> Result<Value> {
        self.resolve_depth(value, 0)
    }

    fn resolve_depth(&self, value: &Value, depth: usize) -> Result<Value> {
        if depth > MAX_REF_DEPTH {
            return Err(Error::ContractDocument(
                "ref resolution exceeded maximum depth (cycle?)".to_string(),
            ));
        }

        match value {
            Value::Object(map) => {
                if let Some(Value::String(pointer)) = map.get("$ref") {
                    if let Some(cached) = self.cache.lock().get(pointer) {
                        return Ok(cached.clone());
                    }
                    let target = self.lookup(pointer)?.clone();
                    let resolved = self.resolve_depth(&target, depth + 1)?;
                    self.cache.lock().insert(pointer.clone(), resolved.clone());
                    return Ok(resolved);
                }
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_depth(v, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let resolved: Result<Vec<Value>> = items
                    .iter()
                    .map(|v| self.resolve_depth(v, depth + 1))
                    .collect();
                Ok(Value::Array(resolved?))
            }
            other => Ok(other.clone()),
        }
    }
}
