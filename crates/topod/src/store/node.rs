use std::collections::HashMap;

/// One node of a store tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNode {
    Leaf { key: String, value: String },
    Dir { key: String, nodes: Vec<StoreNode> },
}

impl StoreNode {
    pub fn key(&self) -> &str {
        match self {
            StoreNode::Leaf { key, .. } | StoreNode::Dir { key, .. } => key,
        }
    }

    /// Inserts every leaf beneath (or at) this node into `out`, keyed by its
    /// full path. Directory keys themselves are never inserted.
    pub fn flatten_into(&self, out: &mut HashMap<String, String>) {
        match self {
            StoreNode::Leaf { key, value } => {
                out.insert(key.clone(), value.clone());
            }
            StoreNode::Dir { nodes, .. } => {
                for node in nodes {
                    node.flatten_into(out);
                }
            }
        }
    }

    pub fn flatten(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        self.flatten_into(&mut out);
        out
    }
}
