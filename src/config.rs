//! Key/value configuration shared by every pipeline module
//!
//! The configuration document is a flat JSON object. Top-level scalar keys
//! apply to every module; an object keyed by a module's scope (`"sync"`,
//! `"encode"`, `"mux"`, ...) overrides them for that module only. Each module
//! deserializes its own typed settings once, at `init` time.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Structured key/value configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMap {
    values: Map<String, Value>,
}

impl ConfigMap {
    /// Create an empty configuration (every module falls back to its defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object document
    pub fn from_json_str(document: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(document)? {
            Value::Object(values) => Ok(Self { values }),
            other => Err(Error::InvalidParameter(format!(
                "configuration must be an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Wrap an already parsed object
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Set a top-level key, returning the updated configuration
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a top-level key
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Set a key inside a module scope (`scope.key`)
    pub fn set_scoped(&mut self, scope: &str, key: &str, value: impl Into<Value>) {
        let entry = self
            .values
            .entry(scope.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value.into());
        }
    }

    /// Raw value lookup (top-level only)
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The effective key/value view for one module scope
    ///
    /// Top-level scalars first, then the scope's own object on top.
    pub fn scoped(&self, scope: &str) -> Map<String, Value> {
        let mut view: Map<String, Value> = self
            .values
            .iter()
            .filter(|(_, v)| !v.is_object())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(Value::Object(overrides)) = self.values.get(scope) {
            for (k, v) in overrides {
                view.insert(k.clone(), v.clone());
            }
        }
        view
    }

    /// Deserialize a module's typed settings
    ///
    /// Unknown keys are ignored and missing keys take the type's defaults
    /// (settings types use `#[serde(default)]`).
    pub fn settings<T: DeserializeOwned>(&self, scope: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.scoped(scope))).map_err(|e| {
            Error::InvalidParameter(format!("invalid '{}' configuration: {}", scope, e))
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
