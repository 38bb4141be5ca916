//! Site link graph.
//!
//! Pages reference each other freely, cycles included, so the graph is an
//! arena: nodes are interned URLs with integer ids, edges are id pairs.
//! No ownership between nodes.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct LinkGraph {
    urls: Vec<String>,
    ids: HashMap<String, u32>,
    edges: Vec<(u32, u32)>,
}

#[derive(Debug, Serialize)]
pub struct GraphExport<'a> {
    pub nodes: &'a [String],
    pub edges: &'a [(u32, u32)],
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, url: &str) -> u32 {
        if let Some(id) = self.ids.get(url) {
            return *id;
        }
        let id = self.urls.len() as u32;
        self.urls.push(url.to_string());
        self.ids.insert(url.to_string(), id);
        id
    }

    /// Record a link from `from` to `to`. Both endpoints are interned;
    /// self-links and repeated edges are kept as observed.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let from_id = self.intern(from);
        let to_id = self.intern(to);
        self.edges.push((from_id, to_id));
    }

    pub fn node_count(&self) -> usize {
        self.urls.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn id_of(&self, url: &str) -> Option<u32> {
        self.ids.get(url).copied()
    }

    pub fn out_degree(&self, url: &str) -> usize {
        match self.id_of(url) {
            Some(id) => self.edges.iter().filter(|(from, _)| *from == id).count(),
            None => 0,
        }
    }

    pub fn export(&self) -> GraphExport<'_> {
        GraphExport {
            nodes: &self.urls,
            edges: &self.edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let mut graph = LinkGraph::new();
        graph.add_edge("https://h/a", "https://h/b");
        graph.add_edge("https://h/a", "https://h/c");

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.id_of("https://h/a"), Some(0));
        assert_eq!(graph.out_degree("https://h/a"), 2);
    }

    #[test]
    fn test_cycles_are_representable() {
        let mut graph = LinkGraph::new();
        graph.add_edge("https://h/a", "https://h/b");
        graph.add_edge("https://h/b", "https://h/a");
        graph.add_edge("https://h/a", "https://h/a");

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_export_serializes() {
        let mut graph = LinkGraph::new();
        graph.add_edge("https://h/a", "https://h/b");
        let json = serde_json::to_string(&graph.export()).unwrap();
        assert!(json.contains("https://h/a"));
        assert!(json.contains("[0,1]"));
    }
}
