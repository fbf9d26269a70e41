use std::collections::VecDeque;

use flowcast_core::types::GraphSnapshot;

/// Undo/redo stacks of whole-graph snapshots.
///
/// `push` records the state *before* a mutation and clears the redo stack.
/// The undo stack is bounded; the oldest entries fall off first.
#[derive(Debug, Clone)]
pub struct HistoryStack {
    undo: VecDeque<GraphSnapshot>,
    redo: Vec<GraphSnapshot>,
    limit: usize,
}

impl HistoryStack {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, before: GraphSnapshot) {
        self.redo.clear();
        self.undo.push_back(before);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
    }

    /// Step back. `current` is saved for redo; returns the state to restore.
    pub fn undo(&mut self, current: GraphSnapshot) -> Option<GraphSnapshot> {
        let previous = self.undo.pop_back()?;
        self.redo.push(current);
        Some(previous)
    }

    /// Step forward again after an undo.
    pub fn redo(&mut self, current: GraphSnapshot) -> Option<GraphSnapshot> {
        let next = self.redo.pop()?;
        self.undo.push_back(current);
        Some(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_core::types::*;

    fn snap(ids: &[&str]) -> GraphSnapshot {
        GraphSnapshot {
            nodes: ids
                .iter()
                .map(|id| WorkflowNode::new(*id, NodeType::TextInput))
                .collect(),
            edges: vec![],
        }
    }

    #[test]
    fn test_undo_redo_round() {
        let mut h = HistoryStack::new(10);
        h.push(snap(&[]));
        h.push(snap(&["a"]));
        let current = snap(&["a", "b"]);

        let back = h.undo(current.clone()).unwrap();
        assert_eq!(back, snap(&["a"]));
        assert!(h.can_redo());

        let forward = h.redo(back).unwrap();
        assert_eq!(forward, current);
        assert!(!h.can_redo());
    }

    #[test]
    fn test_new_mutation_clears_redo() {
        let mut h = HistoryStack::new(10);
        h.push(snap(&[]));
        h.undo(snap(&["a"])).unwrap();
        assert!(h.can_redo());
        h.push(snap(&[]));
        assert!(!h.can_redo());
    }

    #[test]
    fn test_bounded_depth() {
        let mut h = HistoryStack::new(2);
        h.push(snap(&["1"]));
        h.push(snap(&["2"]));
        h.push(snap(&["3"]));
        assert_eq!(h.undo(snap(&["4"])).unwrap(), snap(&["3"]));
        assert_eq!(h.undo(snap(&["3"])).unwrap(), snap(&["2"]));
        assert!(h.undo(snap(&["2"])).is_none());
    }
}
