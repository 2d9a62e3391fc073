use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Delay;

/// Reserved routing targets that are never configured by the user
pub const BUILTINS: [&str; 5] = ["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"];

/// Maximum number of latency samples kept per node
pub const MAX_HISTORY: usize = 10;

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Selection policy of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    Selector,
    URLTest,
    Fallback,
    LoadBalance,
    Smart,
    Relay,
    Other(String),
}

impl GroupKind {
    /// Parse a controller type tag; returns `None` for non-group tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized: String = tag
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "selector" | "select" | "selectgroup" => Some(GroupKind::Selector),
            "urltest" | "urltestgroup" | "autotest" => Some(GroupKind::URLTest),
            "fallback" | "fallbackgroup" => Some(GroupKind::Fallback),
            "loadbalance" | "loadbalancegroup" => Some(GroupKind::LoadBalance),
            "smart" | "smartgroup" => Some(GroupKind::Smart),
            "relay" => Some(GroupKind::Relay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GroupKind::Selector => "Selector",
            GroupKind::URLTest => "URLTest",
            GroupKind::Fallback => "Fallback",
            GroupKind::LoadBalance => "LoadBalance",
            GroupKind::Smart => "Smart",
            GroupKind::Relay => "Relay",
            GroupKind::Other(tag) => tag.as_str(),
        }
    }
}

/// One latency measurement
#[derive(Debug, Clone, PartialEq)]
pub struct DelaySample {
    pub at: DateTime<Utc>,
    pub delay: Delay,
}

/// A routable node (or a group seen through the node namespace)
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    pub name: String,
    /// Controller type tag, e.g. "Shadowsocks" or "Direct"
    pub kind: String,
    pub alive: bool,
    pub delay: Delay,
    pub history: VecDeque<DelaySample>,
    /// Surge benchmark key backing this node
    pub policy_hash: Option<String>,
    pub provider: Option<String>,
}

impl ProxyNode {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            alive: true,
            delay: Delay::NO_DATA,
            history: VecDeque::new(),
            policy_hash: None,
            provider: None,
        }
    }

    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_policy_hash(mut self, hash: impl Into<String>) -> Self {
        self.policy_hash = Some(hash.into());
        self
    }

    /// Record a new sample as the latest delay.
    pub fn record(&mut self, delay: Delay, at: DateTime<Utc>) {
        self.delay = delay;
        self.alive = delay.is_available();
        self.history.push_back(DelaySample { at, delay });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

/// A named set of members with a selection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyGroup {
    pub name: String,
    pub kind: GroupKind,
    pub members: Vec<String>,
    pub now: Option<String>,
    pub alive: bool,
}

impl ProxyGroup {
    pub fn new(name: impl Into<String>, kind: GroupKind, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            members,
            now: None,
            alive: true,
        }
    }

    pub fn with_now(mut self, now: impl Into<String>) -> Self {
        self.now = Some(now.into());
        self
    }
}

/// Nodes and groups of one backend snapshot, keyed by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyGraph {
    nodes: HashMap<String, ProxyNode>,
    groups: HashMap<String, ProxyGroup>,
    group_order: Vec<String>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, node: ProxyNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Insert a group; insertion order is kept for display.
    pub fn insert_group(&mut self, group: ProxyGroup) {
        if !self.groups.contains_key(&group.name) {
            self.group_order.push(group.name.clone());
        }
        self.groups.insert(group.name.clone(), group);
    }

    pub fn node(&self, name: &str) -> Option<&ProxyNode> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut ProxyNode> {
        self.nodes.get_mut(name)
    }

    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ProxyGroup> {
        self.groups.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProxyNode> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ProxyNode> {
        self.nodes.values_mut()
    }

    /// Groups in insertion order
    pub fn groups(&self) -> impl Iterator<Item = &ProxyGroup> {
        self.group_order
            .iter()
            .filter_map(move |name| self.groups.get(name))
    }

    pub fn is_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name) || self.groups.contains_key(name)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_kind_tags() {
        assert_eq!(GroupKind::from_tag("URLTest"), Some(GroupKind::URLTest));
        assert_eq!(GroupKind::from_tag("Url Test"), Some(GroupKind::URLTest));
        assert_eq!(GroupKind::from_tag("Load Balance"), Some(GroupKind::LoadBalance));
        assert_eq!(GroupKind::from_tag("Shadowsocks"), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut node = ProxyNode::new("HK-01", "Shadowsocks");
        for i in 0..(MAX_HISTORY + 5) {
            node.record(Delay::ms(100 + i as u32), Utc::now());
        }
        assert_eq!(node.history.len(), MAX_HISTORY);
        assert_eq!(node.delay, Delay::ms(100 + (MAX_HISTORY + 4) as u32));
    }

    #[test]
    fn test_group_order_is_insertion_order() {
        let mut graph = TopologyGraph::new();
        graph.insert_group(ProxyGroup::new("b", GroupKind::Selector, vec![]));
        graph.insert_group(ProxyGroup::new("a", GroupKind::Selector, vec![]));
        graph.insert_group(ProxyGroup::new("b", GroupKind::URLTest, vec![]));
        let names: Vec<_> = graph.groups().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(graph.group("b").unwrap().kind, GroupKind::URLTest);
    }
}
