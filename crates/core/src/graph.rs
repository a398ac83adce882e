use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Arena-style link graph. Sites link in cycles, so nodes are records in a
/// flat arena addressed by integer id and edges are id pairs; nothing owns
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub url: String,
    pub depth: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LinkGraph {
    nodes: Vec<NodeRecord>,
    #[serde(skip)]
    index: HashMap<String, NodeId>,
    edges: Vec<(NodeId, NodeId)>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, url: &str, depth: u32) -> NodeId {
        if let Some(id) = self.index.get(url) {
            return *id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeRecord {
            url: url.to_string(),
            depth,
        });
        self.index.insert(url.to_string(), id);
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.edges.push((from, to));
    }

    pub fn link(&mut self, from_url: &str, from_depth: u32, to_url: &str) {
        let from = self.intern(from_url, from_depth);
        let to = self.intern(to_url, from_depth + 1);
        self.add_edge(from, to);
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id.0 as usize)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[(NodeId, NodeId)] {
        &self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut graph = LinkGraph::new();
        let a = graph.intern("http://h/a", 0);
        let b = graph.intern("http://h/b", 1);
        assert_ne!(a, b);
        assert_eq!(graph.intern("http://h/a", 5), a);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_cycles_are_representable() {
        let mut graph = LinkGraph::new();
        graph.link("http://h/a", 0, "http://h/b");
        graph.link("http://h/b", 1, "http://h/a");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
    }
}
