use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::RwLock;

use super::{in_subtree, NodeSchema, StateStore, StoreError};

#[derive(Debug, Clone)]
struct Node {
    schema: Option<NodeSchema>,
    value: Option<Value>,
}

/// Process-local state store. Used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All paths currently holding a node, in lexical order.
    pub async fn paths(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    pub async fn schema(&self, path: &str) -> Option<NodeSchema> {
        self.nodes.read().await.get(path).and_then(|n| n.schema.clone())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get_value(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.nodes.read().await.get(path).and_then(|n| n.value.clone()))
    }

    async fn set_value(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(path.to_string())
            .and_modify(|n| n.value = Some(value.clone()))
            .or_insert(Node {
                schema: None,
                value: Some(value),
            });
        Ok(())
    }

    async fn ensure_node(&self, path: &str, schema: &NodeSchema) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.entry(path.to_string()).or_insert(Node {
            schema: None,
            value: schema.role.initial_value(),
        });
        if node.schema.is_none() {
            node.schema = Some(schema.clone());
        }
        Ok(())
    }

    async fn node_exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.nodes.read().await.contains_key(path))
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError> {
        self.nodes.write().await.retain(|p, _| !in_subtree(p, path));
        Ok(())
    }
}
