//! Dependency graph over cache keys: edge `k -> d` means "k depends on d;
//! invalidating d invalidates k". Traversal for `invalidate_dependents` is
//! bounded by `max_transitive_depth` and drops self-edges so it can never
//! loop forever even if the graph (against its own invariant) has a cycle.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;

/// Directed k -> {d1, d2, ...} edges plus the reverse index (d -> {k1, k2,
/// ...}) needed to walk "what depends on d" efficiently.
pub struct DependencyGraph {
    /// key -> set of keys it depends on
    depends_on: DashMap<String, HashSet<String>>,
    /// key -> set of keys that depend on it
    dependents_of: DashMap<String, HashSet<String>>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            depends_on: DashMap::new(),
            dependents_of: DashMap::new(),
        }
    }

    /// Registers `key -> dep` for every `dep` in `dependencies`, dropping
    /// any self-edge.
    pub fn register(&self, key: &str, dependencies: &[String]) {
        for dep in dependencies {
            if dep == key {
                continue;
            }
            self.depends_on.entry(key.to_string()).or_default().insert(dep.clone());
            self.dependents_of.entry(dep.clone()).or_default().insert(key.to_string());
        }
    }

    /// Removes `key` from the graph entirely (both as a dependant and as a
    /// dependency of others).
    pub fn remove_key(&self, key: &str) {
        if let Some((_, deps)) = self.depends_on.remove(key) {
            for dep in deps {
                if let Some(mut dependents) = self.dependents_of.get_mut(&dep) {
                    dependents.remove(key);
                }
            }
        }
        self.dependents_of.remove(key);
    }

    /// Snapshot of every `key -> [deps]` edge, for persistence.
    pub fn all_edges(&self) -> Vec<(String, Vec<String>)> {
        self.depends_on
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Breadth-first walk of "everything that (transitively) depends on
    /// `key`", bounded by `max_depth` hops and deduplicated so a diamond
    /// dependency is only visited once.
    pub fn transitive_dependents(&self, key: &str, max_depth: u32) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((key.to_string(), 0));
        visited.insert(key.to_string());

        let mut out = Vec::new();
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(direct) = self.dependents_of.get(&current) else {
                continue;
            };
            for next in direct.iter() {
                if visited.insert(next.clone()) {
                    out.push(next.clone());
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitive_dependents_follow_chain() {
        let graph = DependencyGraph::new();
        graph.register("a", &["b".to_string()]);
        graph.register("c", &["a".to_string()]);
        let dependents = graph.transitive_dependents("b", 16);
        assert!(dependents.contains(&"a".to_string()));
        assert!(dependents.contains(&"c".to_string()));
    }

    #[test]
    fn self_edges_are_dropped() {
        let graph = DependencyGraph::new();
        graph.register("a", &["a".to_string()]);
        assert!(graph.transitive_dependents("a", 16).is_empty());
    }

    #[test]
    fn depth_bound_stops_traversal() {
        let graph = DependencyGraph::new();
        graph.register("b", &["a".to_string()]);
        graph.register("c", &["b".to_string()]);
        graph.register("d", &["c".to_string()]);
        let dependents = graph.transitive_dependents("a", 1);
        assert_eq!(dependents, vec!["b".to_string()]);
    }

    #[test]
    fn remove_key_clears_both_directions() {
        let graph = DependencyGraph::new();
        graph.register("a", &["b".to_string()]);
        graph.remove_key("a");
        assert!(graph.transitive_dependents("b", 16).is_empty());
    }
}
