//! Hierarchical key-value state sink.
//!
//! Paths are dot separated (`gas.main.consumption.daily`). A node may carry
//! a value and a schema; children are implied by path prefixes, so deleting
//! a subtree removes the node and everything below it.

pub mod memory;
pub mod pg_state;

pub use memory::MemoryStateStore;
pub use pg_state::PgStateStore;

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied for '{path}': {message}")]
    PermissionDenied { path: String, message: String },
    #[error("transient state store error: {0}")]
    Transient(String),
    #[error("invalid value at '{path}': {message}")]
    InvalidValue { path: String, message: String },
}

impl StoreError {
    /// Availability and permission faults abort the current operation;
    /// everything else is skipped at the write site.
    pub fn is_severe(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::PermissionDenied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Folder,
    Number,
    Flag,
    Text,
    Timestamp,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Number => "number",
            Self::Flag => "flag",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }

    /// Value a freshly created node starts with.
    pub fn initial_value(self) -> Option<Value> {
        match self {
            Self::Folder | Self::Timestamp => None,
            Self::Number => Some(Value::from(0.0)),
            Self::Flag => Some(Value::Bool(false)),
            Self::Text => Some(Value::String(String::new())),
        }
    }
}

/// Shape of a node created through [`StateStore::ensure_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSchema {
    pub role: NodeRole,
    pub unit: Option<String>,
    pub writable: bool,
}

impl NodeSchema {
    pub fn folder() -> Self {
        Self {
            role: NodeRole::Folder,
            unit: None,
            writable: false,
        }
    }

    pub fn number(unit: &str) -> Self {
        Self {
            role: NodeRole::Number,
            unit: Some(unit.to_string()),
            writable: false,
        }
    }

    pub fn flag() -> Self {
        Self {
            role: NodeRole::Flag,
            unit: None,
            writable: false,
        }
    }

    pub fn text() -> Self {
        Self {
            role: NodeRole::Text,
            unit: None,
            writable: false,
        }
    }

    pub fn timestamp() -> Self {
        Self {
            role: NodeRole::Timestamp,
            unit: None,
            writable: false,
        }
    }

    /// Operator-settable node (command flags, manual inputs).
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get_value(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Upsert; creates the node when it does not exist yet.
    async fn set_value(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Create the node with `schema` unless it already exists. Existing
    /// values are kept.
    async fn ensure_node(&self, path: &str, schema: &NodeSchema) -> Result<(), StoreError>;

    async fn node_exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Remove `path` and every node below it.
    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError>;

    async fn get_f64(&self, path: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.get_value(path).await?.and_then(|v| value_as_f64(&v)))
    }

    async fn get_bool(&self, path: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.get_value(path).await?.and_then(|v| match v {
            Value::Bool(b) => Some(b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }))
    }

    async fn get_string(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_value(path).await?.and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }))
    }
}

/// Numbers may arrive as JSON numbers or as strings with either decimal
/// separator (values typed in by operators).
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

/// `true` when `path` equals `root` or lies below it.
pub(crate) fn in_subtree(path: &str, root: &str) -> bool {
    path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_match_respects_segment_boundaries() {
        assert!(in_subtree("gas.main", "gas.main"));
        assert!(in_subtree("gas.main.consumption.daily", "gas.main"));
        assert!(!in_subtree("gas.main_2.consumption.daily", "gas.main"));
        assert!(!in_subtree("gas", "gas.main"));
    }

    #[test]
    fn numeric_strings_accept_comma_decimals() {
        assert_eq!(value_as_f64(&Value::from("1092,5")), Some(1092.5));
        assert_eq!(value_as_f64(&Value::from(3)), Some(3.0));
        assert_eq!(value_as_f64(&Value::Bool(true)), None);
    }
}
