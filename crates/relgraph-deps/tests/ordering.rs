//! Property tests for dependency ordering.

use std::collections::HashMap;

use indexmap::IndexMap;
use proptest::prelude::*;

use relgraph_deps::{sort, DependencyError, DependencyRules};

/// Rules over node indices with a fixed adjacency list.
struct Graph {
    edges: IndexMap<usize, Vec<usize>>,
}

impl DependencyRules for Graph {
    type Item = usize;
    type Key = usize;
    type Error = DependencyError;

    fn key(&self, item: &usize) -> usize {
        *item
    }

    fn dependencies_of(&mut self, item: &usize) -> Result<Vec<usize>, DependencyError> {
        Ok(self.edges.get(item).cloned().unwrap_or_default())
    }
}

/// Random DAG: node `i` may only depend on nodes `< i`.
fn dag() -> impl Strategy<Value = IndexMap<usize, Vec<usize>>> {
    (1usize..30).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
            .prop_map(move |picks| {
                picks
                    .into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let deps = if i == 0 {
                            Vec::new()
                        } else {
                            deps.into_iter().map(|pick| pick.index(i)).collect()
                        };
                        (i, deps)
                    })
                    .collect()
            })
    })
}

proptest! {
    #[test]
    fn every_node_follows_its_dependencies(edges in dag()) {
        let nodes: Vec<usize> = edges.keys().copied().rev().collect();
        let order = sort(Graph { edges: edges.clone() }, nodes).unwrap();

        let position: HashMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(pos, node)| (*node, pos))
            .collect();
        prop_assert_eq!(position.len(), edges.len());

        for (node, deps) in &edges {
            for dep in deps {
                prop_assert!(position[dep] < position[node]);
            }
        }
    }

    #[test]
    fn ring_always_fails(size in 2usize..30) {
        let mut edges = IndexMap::new();
        edges.insert(0, vec![size - 1]);
        for i in 1..size {
            edges.insert(i, vec![i - 1]);
        }

        let err = sort(Graph { edges }, vec![0]).unwrap_err();
        match err {
            DependencyError::InfiniteLoop { unresolved, cycles } => {
                prop_assert_eq!(unresolved, size);
                prop_assert_eq!(cycles.len(), 1);
                prop_assert_eq!(cycles[0].len(), size);
            }
            other => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }
}
