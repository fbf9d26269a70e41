use flowcast_core::error::{FlowError, Result};
use flowcast_core::types::*;

/// Single owner of the node/link graph.
///
/// Nodes keep insertion order; every traversal that has to break ties
/// enumerates them in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStore {
    nodes: Vec<WorkflowNode>,
    edges: Vec<DependencyLink>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot. Links that reference unknown nodes are dropped.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut store = Self {
            nodes: snapshot.nodes,
            edges: Vec::new(),
        };
        for edge in snapshot.edges {
            if store.contains(&edge.source)
                && store.contains(&edge.target)
                && !store.edges.contains(&edge)
            {
                store.edges.push(edge);
            }
        }
        store
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Replace the whole graph (undo/redo, reload).
    pub fn replace(&mut self, snapshot: GraphSnapshot) {
        *self = Self::from_snapshot(snapshot);
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyLink] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Look up a node or fail with `NodeNotFound`.
    pub fn require(&self, id: &str) -> Result<&WorkflowNode> {
        self.node(id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> Result<()> {
        if self.contains(&node.id) {
            return Err(FlowError::DuplicateNode(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<WorkflowNode> {
        let idx = self.nodes.iter().position(|n| n.id == id)?;
        self.edges.retain(|e| e.source != id && e.target != id);
        Some(self.nodes.remove(idx))
    }

    /// Add a link. Returns `false` if it already existed.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<bool> {
        self.require(source)?;
        self.require(target)?;
        let link = DependencyLink::new(source, target);
        if self.edges.contains(&link) {
            return Ok(false);
        }
        self.edges.push(link);
        Ok(true)
    }

    /// Remove a link. Returns `false` if it did not exist.
    pub fn disconnect(&mut self, source: &str, target: &str) -> bool {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(e.source == source && e.target == target));
        self.edges.len() != before
    }

    /// Sources of links pointing at `id`, in link order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.target == id)
            .map(|e| e.source.as_str())
    }

    /// Targets of links leaving `id`, in link order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.source == id)
            .map(|e| e.target.as_str())
    }

    /// Mutate a node's payload in place.
    pub fn update_data<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NodeData),
    {
        let node = self
            .node_mut(id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))?;
        f(&mut node.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GraphStore {
        let mut s = GraphStore::new();
        s.add_node(WorkflowNode::new("a", NodeType::TextInput)).unwrap();
        s.add_node(WorkflowNode::new("b", NodeType::TextGen)).unwrap();
        s.add_node(WorkflowNode::new("c", NodeType::ImageGen)).unwrap();
        s.connect("a", "b").unwrap();
        s.connect("b", "c").unwrap();
        s.connect("a", "c").unwrap();
        s
    }

    #[test]
    fn test_remove_prunes_incident_links() {
        let mut s = store();
        let removed = s.remove_node("b").unwrap();
        assert_eq!(removed.id, "b");
        assert_eq!(s.edges(), &[DependencyLink::new("a", "c")]);
        assert!(s.remove_node("b").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut s = store();
        let err = s
            .add_node(WorkflowNode::new("a", NodeType::ImageGen))
            .unwrap_err();
        assert!(matches!(err, FlowError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_connect_requires_both_ends_and_dedups() {
        let mut s = store();
        assert!(!s.connect("a", "b").unwrap());
        assert!(matches!(
            s.connect("a", "ghost"),
            Err(FlowError::NodeNotFound(_))
        ));
        assert!(s.disconnect("a", "b"));
        assert!(!s.disconnect("a", "b"));
    }

    #[test]
    fn test_incoming_in_link_order() {
        let s = store();
        assert_eq!(s.incoming("c").collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(s.outgoing("a").collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_from_snapshot_drops_dangling_links() {
        let snap = GraphSnapshot {
            nodes: vec![WorkflowNode::new("a", NodeType::TextInput)],
            edges: vec![DependencyLink::new("a", "missing")],
        };
        let s = GraphStore::from_snapshot(snap);
        assert!(s.edges().is_empty());
    }
}
