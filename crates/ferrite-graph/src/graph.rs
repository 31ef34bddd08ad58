//! Graph construction and traversal

use crate::GraphError;
use ferrite_db::{dep_name, Depends, IndexEntry};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Directed dependency graph over package names.
///
/// All node and edge collections are B-tree ordered so that every
/// traversal is deterministic: ties break lexicographically on name.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    /// `a -> {b}` iff `a` depends on `b` (after provides resolution)
    deps: BTreeMap<String, BTreeSet<String>>,
    /// Reverse edges: `b -> {a}` iff `a` depends on `b`
    rdeps: BTreeMap<String, BTreeSet<String>>,
    /// Provide token -> providing node
    providers: BTreeMap<String, String>,
    /// Raw (unresolved) dependency tokens per node, kept for re-resolution
    raw: BTreeMap<String, Vec<String>>,
    /// Installed version per node, when known
    versions: BTreeMap<String, String>,
}

/// DFS visit state.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DepGraph {
    /// Build the graph of the installed set from the store index.
    pub fn from_index(entries: &[IndexEntry]) -> Self {
        let mut g = Self::default();
        for entry in entries {
            g.insert_node(
                &entry.name,
                &entry.depends,
                &entry.provides,
                Some(&entry.version),
            );
        }
        g.resolve_edges();
        g
    }

    /// Add one node (e.g. a recipe being resolved for install) and
    /// recompute edges. Existing nodes with the same name are replaced.
    pub fn add_package(&mut self, name: &str, depends: &Depends, provides: &[String]) {
        self.insert_node(name, depends, provides, None);
        self.resolve_edges();
    }

    fn insert_node(
        &mut self,
        name: &str,
        depends: &Depends,
        provides: &[String],
        version: Option<&str>,
    ) {
        self.raw
            .insert(name.to_string(), depends.all().map(String::from).collect());
        if let Some(v) = version {
            self.versions.insert(name.to_string(), v.to_string());
        }
        for p in provides {
            let token = dep_name(p).to_string();
            // first provider (lexicographically, given sorted input) wins
            self.providers.entry(token).or_insert_with(|| name.to_string());
        }
    }

    /// Recompute `deps`/`rdeps` from the raw token lists.
    fn resolve_edges(&mut self) {
        self.deps.clear();
        self.rdeps.clear();
        for name in self.raw.keys() {
            self.deps.entry(name.clone()).or_default();
            self.rdeps.entry(name.clone()).or_default();
        }

        let nodes: BTreeSet<String> = self.raw.keys().cloned().collect();
        let mut edges: Vec<(String, String)> = Vec::new();
        for (name, tokens) in &self.raw {
            for token in tokens {
                let target = self.resolve_token(token, &nodes);
                if target != *name {
                    edges.push((name.clone(), target));
                }
            }
        }
        for (from, to) in edges {
            self.deps.entry(from.clone()).or_default().insert(to.clone());
            self.rdeps.entry(to).or_default().insert(from);
        }
    }

    /// Resolve a dependency token to a node name: direct name match first,
    /// then `provides`, else the stripped token itself (an external leaf the
    /// caller may still try to satisfy from the ports tree).
    fn resolve_token(&self, token: &str, nodes: &BTreeSet<String>) -> String {
        let stripped = dep_name(token);
        if nodes.contains(stripped) {
            return stripped.to_string();
        }
        if let Some(provider) = self.providers.get(stripped) {
            return provider.clone();
        }
        stripped.to_string()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw.contains_key(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.raw.keys().map(String::as_str)
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }

    /// Direct dependencies of `name` after provides resolution.
    pub fn deps_of(&self, name: &str) -> Vec<String> {
        self.deps
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Topological order of the dependency closure of `targets`, leaves
    /// first, so that every dependency of `p` appears before `p`.
    ///
    /// With `skip_installed`, nodes in `installed` are omitted from the
    /// result (their position in the order is still honored for their
    /// dependents). Fails with [`GraphError::Cycle`] naming the members of
    /// any cycle reachable from the targets.
    pub fn order(
        &self,
        targets: &[String],
        skip_installed: Option<&HashSet<String>>,
    ) -> Result<Vec<String>, GraphError> {
        let mut marks: BTreeMap<String, Mark> = BTreeMap::new();
        let mut stack: Vec<String> = Vec::new();
        let mut out: Vec<String> = Vec::new();

        let mut sorted_targets: Vec<String> = targets.to_vec();
        sorted_targets.sort();
        sorted_targets.dedup();

        for target in &sorted_targets {
            self.visit(target, &mut marks, &mut stack, &mut out)?;
        }

        if let Some(installed) = skip_installed {
            out.retain(|n| !installed.contains(n) || sorted_targets.contains(n));
        }
        Ok(out)
    }

    fn visit(
        &self,
        node: &str,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
        out: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                // Reconstruct the cycle from the current DFS stack.
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(node.to_string());
                return Err(GraphError::Cycle(cycle));
            }
            Mark::Unvisited => {}
        }

        marks.insert(node.to_string(), Mark::InProgress);
        stack.push(node.to_string());

        // BTreeSet iteration gives the deterministic lexicographic tie-break.
        if let Some(children) = self.deps.get(node) {
            for child in children {
                self.visit(child, marks, stack, out)?;
            }
        }

        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
        out.push(node.to_string());
        Ok(())
    }

    /// Every ancestor of `name`: the packages that directly or transitively
    /// depend on it.
    pub fn revdeps(&self, name: &str) -> Vec<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            if let Some(parents) = self.rdeps.get(current) {
                for parent in parents {
                    if seen.insert(parent.clone()) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Nodes with no reverse-dependents. When an explicitly-installed set is
    /// given, its members are never reported as orphans.
    pub fn orphans(&self, explicit: Option<&HashSet<String>>) -> Vec<String> {
        self.rdeps
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(name, _)| name.clone())
            .filter(|name| explicit.is_none_or(|set| !set.contains(name)))
            .collect()
    }

    /// The revdep closure of `name`: everything that should be rebuilt when
    /// `name` changes ABI.
    pub fn rebuild(&self, name: &str) -> Vec<String> {
        self.revdeps(name)
    }
}
