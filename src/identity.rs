use std::sync::atomic::{AtomicU64, Ordering};

/// Node type used when the caller does not name one.
pub const DEFAULT_NODE_TYPE: &str = "MqttNode";

/// Sequence generator for node ids.
///
/// Every node created from the same allocator draws from one counter, so ids
/// are unique across node types for as long as the allocator lives.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `"{node_type}_{n}"` and advances the counter.
    pub fn next_id(&self, node_type: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", node_type, n)
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Who a node is. Fixed for the lifetime of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub name: Option<String>,
    pub node_type: String,
}

impl NodeIdentity {
    /// Resolve an identity, only drawing from `ids` when no explicit id is given.
    pub fn resolve(
        ids: &IdAllocator,
        node_id: Option<String>,
        name: Option<String>,
        node_type: Option<String>,
    ) -> Self {
        let node_type = node_type.unwrap_or_else(|| DEFAULT_NODE_TYPE.to_string());
        let node_id = match node_id {
            Some(id) if !id.is_empty() => id,
            _ => ids.next_id(&node_type),
        };

        Self {
            node_id,
            name,
            node_type,
        }
    }

    /// The name as it appears in metric labels.
    pub fn name_label(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}
