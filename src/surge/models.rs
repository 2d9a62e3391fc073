use std::collections::HashMap;

use crate::backend::{normalize_policy_hash, PolicyBenchmark};
use crate::topology::{is_builtin, Delay, GroupKind, ProxyGroup, ProxyNode, TopologyGraph};

use super::types::{PolicyGroups, PolicyList, PolicyMember};

/// Build a topology snapshot from Surge's policy listings.
///
/// Group kinds are only visible where a group appears as a member of another
/// group; groups never referenced that way default to `Selector`.
pub fn graph_from_policies(
    policies: &PolicyList,
    groups: &PolicyGroups,
    selections: &HashMap<String, String>,
    benchmarks: &HashMap<String, PolicyBenchmark>,
) -> TopologyGraph {
    let mut graph = TopologyGraph::new();

    let mut seen: HashMap<&str, &PolicyMember> = HashMap::new();
    for member in groups.values().flatten() {
        seen.entry(member.name.as_str()).or_insert(member);
    }

    let delay_of = |member: Option<&&PolicyMember>| -> (Option<String>, Delay) {
        let hash = member
            .and_then(|m| m.line_hash.as_deref())
            .map(|h| normalize_policy_hash(h).to_string());
        let delay = hash
            .as_deref()
            .and_then(|h| benchmarks.get(h))
            .map(PolicyBenchmark::delay)
            .unwrap_or(Delay::NO_DATA);
        (hash, delay)
    };

    let names = policies
        .proxies
        .iter()
        .chain(policies.policy_groups.iter());
    for name in names {
        let member = seen.get(name.as_str());
        let kind = member
            .map(|m| m.type_description.clone())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| (if is_builtin(name) { "Built-in" } else { "Proxy" }).to_string());
        let (hash, delay) = delay_of(member);
        let mut node = ProxyNode::new(name.clone(), kind).with_delay(delay);
        node.policy_hash = hash;
        node.alive = member.and_then(|m| m.enabled).unwrap_or(true);
        graph.insert_node(node);
    }

    // members only known through a group listing
    for (name, member) in &seen {
        if !graph.contains(name) {
            let (hash, delay) = delay_of(Some(member));
            let mut node = ProxyNode::new(*name, member.type_description.clone()).with_delay(delay);
            node.policy_hash = hash;
            graph.insert_node(node);
        }
    }

    for name in &policies.policy_groups {
        let members = groups
            .get(name)
            .map(|members| members.iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default();
        let kind = seen
            .get(name.as_str())
            .and_then(|m| GroupKind::from_tag(&m.type_description))
            .unwrap_or(GroupKind::Selector);
        let mut group = ProxyGroup::new(name.clone(), kind, members);
        group.now = selections.get(name).cloned().filter(|s| !s.is_empty());
        graph.insert_group(group);
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICIES: &str = r#"{"proxies": ["DIRECT", "HK", "JP"], "policy-groups": ["Proxy", "Auto"]}"#;
    const GROUPS: &str = r#"{
        "Proxy": [
            {"name": "Auto", "typeDescription": "Url Test", "isGroup": true, "lineHash": "g1"},
            {"name": "HK", "typeDescription": "Shadowsocks", "isGroup": false, "lineHash": "h1"},
            {"name": "DIRECT", "typeDescription": "Direct", "isGroup": false}
        ],
        "Auto": [
            {"name": "HK", "typeDescription": "Shadowsocks", "isGroup": false, "lineHash": "h1"},
            {"name": "JP", "typeDescription": "Trojan", "isGroup": false, "lineHash": "policy:h2"}
        ]
    }"#;
    const BENCH: &str = r#"{
        "h1": {"lastTestScoreInMS": 140.2, "lastTestDate": 1700000000},
        "h2": {"lastTestScoreInMS": 0, "lastTestErrorMessage": "timeout", "lastTestDate": 1700000000}
    }"#;

    fn graph() -> TopologyGraph {
        let policies: PolicyList = serde_json::from_str(POLICIES).unwrap();
        let groups: PolicyGroups = serde_json::from_str(GROUPS).unwrap();
        let benchmarks: HashMap<String, PolicyBenchmark> = serde_json::from_str(BENCH).unwrap();
        let selections = HashMap::from([
            ("Proxy".to_string(), "Auto".to_string()),
            ("Auto".to_string(), "HK".to_string()),
        ]);
        graph_from_policies(&policies, &groups, &selections, &benchmarks)
    }

    #[test]
    fn test_kinds_and_hashes() {
        let graph = graph();
        assert_eq!(graph.group("Auto").unwrap().kind, GroupKind::URLTest);
        assert_eq!(graph.group("Proxy").unwrap().kind, GroupKind::Selector);
        assert_eq!(graph.node("JP").unwrap().policy_hash.as_deref(), Some("h2"));
        assert_eq!(graph.node("JP").unwrap().delay, Delay::NO_DATA);
        assert_eq!(graph.node("HK").unwrap().delay, Delay::ms(140));
    }

    #[test]
    fn test_resolution_through_surge_groups() {
        let resolved = graph().resolve_effective_node("Proxy");
        assert_eq!(resolved.node, "HK");
        assert_eq!(resolved.delay, Delay::ms(140));
    }
}
