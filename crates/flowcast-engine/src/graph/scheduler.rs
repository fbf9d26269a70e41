use std::collections::HashSet;

use tracing::debug;

use flowcast_core::types::NodeId;

use super::store::GraphStore;

/// Execution order over the whole graph, or over the ancestors of `targets`
/// (targets included).
///
/// Depth-first from the roots along outgoing links, recording nodes in
/// post-order; the reversed post-order is root-first and respects every link
/// in the relevant set. A link back into a node still on the current path is
/// skipped, so cycles are broken silently and every reachable node still
/// appears exactly once. Ties resolve in graph insertion order.
pub fn order(store: &GraphStore, targets: Option<&[NodeId]>) -> Vec<NodeId> {
    let relevant: Vec<&str> = match targets {
        Some(targets) => {
            let ancestors = ancestors(store, targets);
            store
                .nodes()
                .iter()
                .map(|n| n.id.as_str())
                .filter(|id| ancestors.contains(id))
                .collect()
        }
        None => store.nodes().iter().map(|n| n.id.as_str()).collect(),
    };
    let in_set: HashSet<&str> = relevant.iter().copied().collect();

    let mut walk = Walk {
        store,
        in_set: &in_set,
        temporary: HashSet::new(),
        done: HashSet::new(),
        post: Vec::with_capacity(relevant.len()),
    };

    // Roots first; anything left unvisited sits on a rootless cycle.
    let is_root = |id: &str| !store.incoming(id).any(|src| in_set.contains(src));
    for id in relevant.iter().rev().copied().filter(|id| is_root(*id)) {
        walk.visit(id);
    }
    for id in relevant.iter().rev().copied() {
        walk.visit(id);
    }

    let mut ordered: Vec<NodeId> = walk.post.into_iter().map(str::to_string).collect();
    ordered.reverse();
    debug!(nodes = ordered.len(), "Computed execution order");
    ordered
}

/// Transitive ancestor set of `targets`, targets included.
pub fn ancestors<'a>(store: &'a GraphStore, targets: &[NodeId]) -> HashSet<&'a str> {
    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack: Vec<&'a str> = targets
        .iter()
        .filter_map(|t| store.node(t).map(|n| n.id.as_str()))
        .collect();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        for source in store.incoming(id) {
            if !visited.contains(source) {
                stack.push(source);
            }
        }
    }
    visited
}

struct Walk<'a> {
    store: &'a GraphStore,
    in_set: &'a HashSet<&'a str>,
    temporary: HashSet<&'a str>,
    done: HashSet<&'a str>,
    post: Vec<&'a str>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, id: &'a str) {
        if self.done.contains(id) || self.temporary.contains(id) {
            return;
        }
        self.temporary.insert(id);

        let next: Vec<&'a str> = self
            .store
            .outgoing(id)
            .filter(|t| self.in_set.contains(t))
            .collect();
        for target in next.into_iter().rev() {
            if self.temporary.contains(target) {
                debug!(from = id, to = target, "Skipping link that closes a cycle");
                continue;
            }
            self.visit(target);
        }

        self.temporary.remove(id);
        self.done.insert(id);
        self.post.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_core::types::*;

    fn graph(ids: &[&str], links: &[(&str, &str)]) -> GraphStore {
        GraphStore::from_snapshot(GraphSnapshot {
            nodes: ids
                .iter()
                .map(|id| WorkflowNode::new(*id, NodeType::TextGen))
                .collect(),
            edges: links
                .iter()
                .map(|(s, t)| DependencyLink::new(*s, *t))
                .collect(),
        })
    }

    fn position(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    fn assert_respects_links(store: &GraphStore, order: &[NodeId]) {
        for e in store.edges() {
            if order.contains(&e.source) && order.contains(&e.target) {
                assert!(
                    position(order, &e.source) < position(order, &e.target),
                    "{} must precede {} in {:?}",
                    e.source,
                    e.target,
                    order
                );
            }
        }
    }

    #[test]
    fn test_chain_is_root_first() {
        let s = graph(&["c", "b", "a"], &[("a", "b"), ("b", "c")]);
        assert_eq!(order(&s, None), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_respects_links_and_insertion_order() {
        let s = graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let o = order(&s, None);
        assert_eq!(o, vec!["a", "b", "c", "d"]);
        assert_respects_links(&s, &o);
    }

    #[test]
    fn test_independent_roots_keep_insertion_order() {
        let s = graph(&["x", "y", "z"], &[]);
        assert_eq!(order(&s, None), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_each_node_exactly_once_on_wide_dag() {
        let s = graph(
            &["a", "b", "c", "d", "e", "f"],
            &[
                ("a", "c"),
                ("b", "c"),
                ("c", "d"),
                ("a", "e"),
                ("e", "f"),
                ("d", "f"),
                ("b", "f"),
            ],
        );
        let o = order(&s, None);
        assert_eq!(o.len(), 6);
        let unique: HashSet<_> = o.iter().collect();
        assert_eq!(unique.len(), 6);
        assert_respects_links(&s, &o);
    }

    #[test]
    fn test_targets_restrict_to_ancestors() {
        let s = graph(
            &["a", "b", "c", "unrelated", "child"],
            &[("a", "b"), ("b", "c"), ("c", "child"), ("unrelated", "child")],
        );
        assert_eq!(order(&s, Some(&["c".to_string()])), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_terminates_with_each_node_once() {
        let s = graph(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("c", "b"), ("c", "d")]);
        let o = order(&s, None);
        assert_eq!(o.len(), 4);
        assert_eq!(o[0], "a");
        assert_eq!(o.iter().collect::<HashSet<_>>().len(), 4);
        assert!(position(&o, "c") < position(&o, "d"));
    }

    #[test]
    fn test_rootless_cycle_still_scheduled() {
        let s = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let o = order(&s, None);
        assert_eq!(o.len(), 3);
        assert_eq!(o.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn test_self_loop_is_ignored() {
        let s = graph(&["a", "b"], &[("a", "a"), ("a", "b")]);
        assert_eq!(order(&s, None), vec!["a", "b"]);
    }

    #[test]
    fn test_cyclic_ancestors_of_target() {
        let s = graph(&["a", "b", "t"], &[("a", "b"), ("b", "a"), ("b", "t")]);
        let o = order(&s, Some(&["t".to_string()]));
        assert_eq!(o.len(), 3);
        assert_eq!(o.last().map(String::as_str), Some("t"));
    }

    #[test]
    fn test_unknown_target_yields_empty_order() {
        let s = graph(&["a"], &[]);
        assert!(order(&s, Some(&["ghost".to_string()])).is_empty());
    }
}
