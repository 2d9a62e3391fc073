//! Proxy topology: the node/group graph of one backend snapshot and the
//! queries answered over it.

mod delay;
mod graph;
mod resolve;
mod sort;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

pub use delay::Delay;
pub use graph::{
    is_builtin, DelaySample, GroupKind, ProxyGroup, ProxyNode, TopologyGraph, BUILTINS,
    MAX_HISTORY,
};
pub use resolve::Resolved;
pub use sort::{sort_entries, ListEntry, ListOptions, SortPolicy};

/// Owner of the current topology snapshot.
///
/// Snapshots are replaced wholesale; probe results are merged into whichever
/// snapshot is current when they arrive, and results for names no longer in
/// the graph are dropped.
#[derive(Debug, Default)]
pub struct TopologyStore {
    graph: TopologyGraph,
    last_tested: HashMap<String, DateTime<Utc>>,
    loaded_at: Option<DateTime<Utc>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_snapshot(&mut self, graph: TopologyGraph) {
        tracing::debug!(
            groups = graph.group_count(),
            nodes = graph.node_count(),
            "topology snapshot loaded"
        );
        self.graph = graph;
        self.loaded_at = Some(Utc::now());
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn resolve_effective_node(&self, name: &str) -> Resolved {
        self.graph.resolve_effective_node(name)
    }

    pub fn resolve_delay(&self, name: &str) -> Delay {
        self.graph.resolve_delay(name)
    }

    pub fn sorted_groups(&self, sort: SortPolicy) -> Vec<ListEntry> {
        self.graph.sorted_groups(sort)
    }

    pub fn sorted_members(&self, group: &str, options: ListOptions) -> Vec<ListEntry> {
        self.graph.sorted_members(group, options)
    }

    /// Record a probe result for `name`. Returns false when the name is unknown.
    pub fn apply_delay(&mut self, name: &str, delay: Delay, at: DateTime<Utc>) -> bool {
        match self.graph.node_mut(name) {
            Some(node) => {
                node.record(delay, at);
                true
            }
            None => false,
        }
    }

    /// Record a result for every node backed by `hash`; returns how many were updated.
    pub fn apply_policy_delay(&mut self, hash: &str, delay: Delay, at: DateTime<Utc>) -> usize {
        let mut updated = 0;
        for node in self.graph.nodes_mut() {
            if node.policy_hash.as_deref() == Some(hash) {
                node.record(delay, at);
                updated += 1;
            }
        }
        updated
    }

    /// Reflect a selection the backend already confirmed.
    pub fn set_selection_local(&mut self, group: &str, member: &str) -> bool {
        match self.graph.group_mut(group) {
            Some(group) => {
                group.now = Some(member.to_string());
                true
            }
            None => false,
        }
    }

    pub fn mark_group_tested(&mut self, group: &str, at: DateTime<Utc>) {
        self.last_tested.insert(group.to_string(), at);
    }

    pub fn last_tested(&self, group: &str) -> Option<DateTime<Utc>> {
        self.last_tested.get(group).copied()
    }

    /// Fastest non-built-in member of `group` by resolved delay.
    pub fn fastest_member(&self, group: &str) -> Option<(String, Delay)> {
        let group = self.graph.group(group)?;
        group
            .members
            .iter()
            .filter(|member| !is_builtin(member))
            .map(|member| (member, self.graph.resolve_delay(member)))
            .filter(|(_, delay)| delay.is_available())
            .min_by_key(|(_, delay)| delay.raw())
            .map(|(member, delay)| (member.clone(), delay))
    }

    /// Policy hashes of each group's proxy members, in group order.
    ///
    /// Nested groups and built-ins are skipped: benchmarks only cover proxies.
    pub fn group_policy_hashes(&self) -> Vec<(String, Vec<String>)> {
        self.graph
            .groups()
            .map(|group| {
                let hashes = group
                    .members
                    .iter()
                    .filter(|member| !self.graph.is_group(member) && !is_builtin(member))
                    .filter_map(|member| self.graph.node(member)?.policy_hash.clone())
                    .collect();
                (group.name.clone(), hashes)
            })
            .collect()
    }
}
