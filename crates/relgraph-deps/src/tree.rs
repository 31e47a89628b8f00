//! Lazily built dependency tree with layered topological ordering.
//!
//! A [`DependencyTree`] wraps caller items in tree nodes stored in a petgraph
//! `StableDiGraph`. An edge `a -> b` means "`b` must come before `a`". Edges
//! are not known up front: [`DependencyTree::build`] asks the
//! [`DependencyRules`] for each node's dependencies, and any dependency not
//! yet in the tree joins the working set and is built on the next pass.
//!
//! Ordering then peels the graph into layers. Each layer holds every
//! not-yet-ordered node whose dependencies are all ordered, in insertion
//! order. A pass that orders nothing means the rest of the graph is stuck
//! behind a cycle, reported as [`DependencyError::InfiniteLoop`].

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

use crate::error::DependencyError;

/// Caller-supplied node abstraction for a [`DependencyTree`].
pub trait DependencyRules {
    /// The thing being ordered (an entity handle, an entity type, ...).
    type Item: Clone;
    /// Identity of an item. Two items with equal keys are one tree node.
    type Key: Clone + Eq + Hash + Debug;
    /// Error raised while discovering dependencies.
    type Error: From<DependencyError>;

    /// Returns the identity of `item`.
    fn key(&self, item: &Self::Item) -> Self::Key;

    /// Returns the items that must come before `item`.
    ///
    /// May return items the tree has never seen; they are added and have
    /// their own dependencies built on a later pass.
    fn dependencies_of(&mut self, item: &Self::Item) -> Result<Vec<Self::Item>, Self::Error>;
}

#[derive(Debug)]
struct TreeNode<T> {
    item: T,
    built: bool,
}

/// Topological sort over lazily discovered dependencies.
pub struct DependencyTree<R: DependencyRules> {
    rules: R,
    graph: StableDiGraph<TreeNode<R::Item>, ()>,
    index: HashMap<R::Key, NodeIndex>,
}

impl<R: DependencyRules> DependencyTree<R> {
    /// Creates an empty tree driven by `rules`.
    pub fn new(rules: R) -> Self {
        DependencyTree {
            rules,
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Returns the rules driving this tree.
    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Consumes the tree, returning its rules.
    pub fn into_rules(self) -> R {
        self.rules
    }

    /// Adds `item` to the working set. Adding an item whose key is already
    /// present is a no-op returning the existing node.
    pub fn add(&mut self, item: R::Item) -> NodeIndex {
        let key = self.rules.key(&item);
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(TreeNode { item, built: false });
        self.index.insert(key, idx);
        idx
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if an item with `key` is in the tree.
    pub fn contains(&self, key: &R::Key) -> bool {
        self.index.contains_key(key)
    }

    /// Builds dependencies for every unbuilt node until a full pass discovers
    /// no new nodes. Self-dependencies are dropped.
    pub fn build(&mut self) -> Result<(), R::Error> {
        let mut pass = 0usize;
        loop {
            let pending: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&idx| !self.graph[idx].built)
                .collect();
            if pending.is_empty() {
                break;
            }
            pass += 1;
            let before = self.graph.node_count();

            for idx in pending {
                let item = self.graph[idx].item.clone();
                let dependencies = self.rules.dependencies_of(&item)?;
                self.graph[idx].built = true;
                for dependency in dependencies {
                    let dep_idx = self.add(dependency);
                    if dep_idx != idx {
                        self.graph.update_edge(idx, dep_idx, ());
                    }
                }
            }

            tracing::trace!(
                pass,
                discovered = self.graph.node_count() - before,
                "dependency build pass"
            );
        }
        Ok(())
    }

    /// Orders the built tree into layers, dependencies first.
    pub fn order(&self) -> Result<DependencyOrder<R::Item>, DependencyError> {
        let pending = self
            .graph
            .node_indices()
            .filter(|&idx| !self.graph[idx].built)
            .count();
        if pending > 0 {
            return Err(DependencyError::Unbuilt { pending });
        }

        let total = self.graph.node_count();
        let mut ordered: HashSet<NodeIndex> = HashSet::with_capacity(total);
        let mut layers = Vec::new();

        while ordered.len() < total {
            let layer: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|idx| !ordered.contains(idx))
                .filter(|&idx| {
                    self.graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .all(|dep| ordered.contains(&dep))
                })
                .collect();

            if layer.is_empty() {
                return Err(self.stalled(total - ordered.len()));
            }

            ordered.extend(layer.iter().copied());
            layers.push(
                layer
                    .into_iter()
                    .map(|idx| self.graph[idx].item.clone())
                    .collect(),
            );
        }

        Ok(DependencyOrder { layers })
    }

    /// Builds and orders in one step.
    pub fn sort(mut self) -> Result<DependencyOrder<R::Item>, R::Error> {
        self.build()?;
        Ok(self.order()?)
    }

    fn stalled(&self, unresolved: usize) -> DependencyError {
        let cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .map(|idx| format!("{:?}", self.rules.key(&self.graph[idx].item)))
                    .collect()
            })
            .collect();
        tracing::debug!(unresolved, ?cycles, "dependency ordering stalled");
        DependencyError::InfiniteLoop { unresolved, cycles }
    }
}

/// Sorts `items` and everything reachable from them through `rules`.
pub fn sort<R, I>(rules: R, items: I) -> Result<DependencyOrder<R::Item>, R::Error>
where
    R: DependencyRules,
    I: IntoIterator<Item = R::Item>,
{
    let mut tree = DependencyTree::new(rules);
    for item in items {
        tree.add(item);
    }
    tree.sort()
}

/// Layered result of a dependency sort.
///
/// Every item appears strictly after all of its dependencies. Items within
/// one layer do not depend on each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyOrder<T> {
    layers: Vec<Vec<T>>,
}

impl<T> DependencyOrder<T> {
    /// The ordered layers.
    pub fn layers(&self) -> &[Vec<T>] {
        &self.layers
    }

    /// Total number of ordered items.
    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing was ordered.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Vec::is_empty)
    }

    /// Iterates items in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.layers.iter().flatten()
    }

    /// Flattens into a single ordered vector.
    pub fn into_vec(self) -> Vec<T> {
        self.layers.into_iter().flatten().collect()
    }

    /// Reverses the order: every item now comes before its dependencies.
    ///
    /// Used for deletes, where a row must go before the rows it references.
    pub fn reversed(mut self) -> Self {
        self.layers.reverse();
        for layer in &mut self.layers {
            layer.reverse();
        }
        self
    }

    /// Applies `f` to every layer, e.g. to sort items within a layer.
    /// Reordering within a layer never breaks the dependency order.
    pub fn map_layers<F>(mut self, mut f: F) -> Self
    where
        F: FnMut(&mut Vec<T>),
    {
        for layer in &mut self.layers {
            f(layer);
        }
        self
    }
}

impl<T> IntoIterator for DependencyOrder<T> {
    type Item = T;
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<Vec<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.into_iter().flatten()
    }
}
