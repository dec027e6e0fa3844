use std::collections::{HashMap, HashSet};

use crate::models::{Edge, NodeId};

pub fn adjacency_map(edges: &[Edge]) -> HashMap<&NodeId, Vec<&NodeId>> {
    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in edges {
        adjacency.entry(&edge.source).or_default().push(&edge.target);
    }
    adjacency
}

/// Reports whether adding `source -> target` to `edges` closes a directed cycle,
/// i.e. whether `target` already reaches `source`. A self-loop always does.
pub fn would_create_cycle(edges: &[Edge], source: &NodeId, target: &NodeId) -> bool {
    if source == target {
        return true;
    }

    let mut adjacency = adjacency_map(edges);
    adjacency.entry(source).or_default().push(target);

    // Explicit DFS: `path` mirrors the recursion stack, `visited` keeps the
    // walk linear in V+E.
    let mut visited: HashSet<&NodeId> = HashSet::new();
    let mut path: Vec<(&NodeId, usize)> = vec![(target, 0)];
    visited.insert(target);

    while let Some((node, next_child)) = path.last_mut() {
        let children = adjacency.get(*node).map(Vec::as_slice).unwrap_or(&[]);
        let Some(child) = children.get(*next_child).copied() else {
            path.pop();
            continue;
        };
        *next_child += 1;

        if child == source {
            return true;
        }
        if visited.insert(child) {
            path.push((child, 0));
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use proptest::collection::vec;
    use proptest::prelude::{prop_assert_eq, proptest};

    use super::*;

    fn edge(source: &str, target: &str) -> Edge {
        Edge::new(format!("{source}-{target}"), source, target)
    }

    fn id(value: &str) -> NodeId {
        NodeId::from(value)
    }

    /// Fixed-point reachability; a node always reaches itself.
    fn reaches(edges: &[Edge], from: &NodeId, to: &NodeId) -> bool {
        let mut reached: HashSet<&NodeId> = HashSet::from([from]);
        loop {
            let before = reached.len();
            for edge in edges {
                if reached.contains(&edge.source) {
                    reached.insert(&edge.target);
                }
            }
            if reached.len() == before {
                return reached.contains(to);
            }
        }
    }

    proptest! {
        #[test]
        fn cycle_iff_target_reaches_source(
            pairs in vec((0..10usize, 0..10usize), 0..30),
            source in 0..10usize,
            target in 0..10usize,
        ) {
            let edges = pairs
                .iter()
                .map(|(from, to)| edge(&format!("n{from}"), &format!("n{to}")))
                .collect::<Vec<_>>();
            let source = NodeId(format!("n{source}"));
            let target = NodeId(format!("n{target}"));

            prop_assert_eq!(
                would_create_cycle(&edges, &source, &target),
                reaches(&edges, &target, &source)
            );
        }
    }

    #[test]
    fn closing_a_chain_is_a_cycle() {
        let edges = [edge("A", "B"), edge("B", "C")];
        assert!(would_create_cycle(&edges, &id("C"), &id("A")));
    }

    #[test]
    fn extending_a_chain_is_not_a_cycle() {
        let edges = [edge("A", "B"), edge("B", "C")];
        assert!(!would_create_cycle(&edges, &id("A"), &id("C")));
        assert!(!would_create_cycle(&edges, &id("C"), &id("D")));
    }

    #[test]
    fn self_loop_is_always_a_cycle() {
        assert!(would_create_cycle(&[], &id("A"), &id("A")));
    }

    #[test]
    fn diamond_merges_are_not_cycles() {
        let edges = [edge("A", "B"), edge("A", "C"), edge("B", "D")];
        assert!(!would_create_cycle(&edges, &id("C"), &id("D")));
        assert!(would_create_cycle(&edges, &id("D"), &id("A")));
    }

    #[test]
    fn unrelated_existing_cycle_does_not_count() {
        let edges = [edge("X", "Y"), edge("Y", "X"), edge("B", "X")];
        assert!(!would_create_cycle(&edges, &id("A"), &id("B")));
    }

    #[test]
    fn long_back_path_is_found() {
        let edges = (0..200)
            .map(|idx| edge(&format!("n{idx}"), &format!("n{}", idx + 1)))
            .collect::<Vec<_>>();
        assert!(would_create_cycle(&edges, &id("n200"), &id("n0")));
        assert!(!would_create_cycle(&edges, &id("n0"), &id("n200")));
    }

    #[test]
    fn adjacency_map_groups_targets_by_source() {
        let edges = [edge("A", "B"), edge("A", "C"), edge("B", "C")];
        let adjacency = adjacency_map(&edges);
        assert_eq!(adjacency[&id("A")].len(), 2);
        assert_eq!(adjacency[&id("B")], vec![&id("C")]);
        assert!(!adjacency.contains_key(&id("C")));
    }
}
