use std::collections::HashMap;

use crate::topology::{ProxyGroup, ProxyNode, TopologyGraph, MAX_HISTORY};

use super::Proxy;

/// Clash's implicit group listing every other group in config order
const GLOBAL: &str = "GLOBAL";

/// Build a topology snapshot from GET /proxies.
///
/// Every entry becomes a node so groups can carry their own delay; group types
/// also become groups. Groups are ordered as `GLOBAL` lists them, the rest by
/// name, with `GLOBAL` itself last.
pub fn graph_from_proxies(proxies: &HashMap<String, Proxy>) -> TopologyGraph {
    let mut graph = TopologyGraph::new();

    for (name, proxy) in proxies {
        let mut node = ProxyNode::new(name.clone(), proxy.proxy_type.as_str());
        node.delay = proxy.last_delay();
        node.alive = proxy.alive.unwrap_or(true);
        let samples = proxy.samples();
        let skip = samples.len().saturating_sub(MAX_HISTORY);
        node.history = samples.into_iter().skip(skip).collect();
        graph.insert_node(node);
    }

    for name in group_order(proxies) {
        let Some(proxy) = proxies.get(&name) else {
            continue;
        };
        let Some(kind) = proxy.proxy_type.group_kind() else {
            continue;
        };
        let mut group = ProxyGroup::new(name, kind, proxy.all.clone().unwrap_or_default());
        group.now = proxy.now.clone().filter(|now| !now.is_empty());
        group.alive = proxy.alive.unwrap_or(true);
        graph.insert_group(group);
    }

    graph
}

fn group_order(proxies: &HashMap<String, Proxy>) -> Vec<String> {
    let is_group = |name: &str| {
        proxies
            .get(name)
            .map(|p| p.proxy_type.group_kind().is_some())
            .unwrap_or(false)
    };

    let mut ordered: Vec<String> = proxies
        .get(GLOBAL)
        .and_then(|global| global.all.as_ref())
        .map(|all| {
            all.iter()
                .filter(|name| name.as_str() != GLOBAL && is_group(name))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let mut rest: Vec<String> = proxies
        .keys()
        .filter(|name| name.as_str() != GLOBAL && is_group(name) && !ordered.contains(name))
        .cloned()
        .collect();
    rest.sort();
    ordered.append(&mut rest);

    if is_group(GLOBAL) {
        ordered.push(GLOBAL.to_string());
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clash::ProxiesResponse;
    use crate::topology::{Delay, GroupKind};

    const PROXIES: &str = r#"{"proxies": {
        "GLOBAL": {"type": "Selector", "name": "GLOBAL", "now": "Proxy",
                   "all": ["DIRECT", "Proxy", "Auto", "HK-01"]},
        "Proxy": {"type": "Selector", "name": "Proxy", "now": "Auto", "all": ["Auto", "HK-01", "DIRECT"]},
        "Auto": {"type": "URLTest", "name": "Auto", "now": "HK-01", "all": ["HK-01"],
                 "history": [{"time": "2024-05-01T10:00:00Z", "delay": 95}]},
        "Streaming": {"type": "Fallback", "name": "Streaming", "now": "", "all": ["HK-01"]},
        "HK-01": {"type": "Shadowsocks", "name": "HK-01", "alive": true,
                  "history": [{"time": "2024-05-01T10:00:00Z", "delay": 95}]},
        "DIRECT": {"type": "Direct", "name": "DIRECT", "history": []}
    }}"#;

    fn graph() -> TopologyGraph {
        let response: ProxiesResponse = serde_json::from_str(PROXIES).unwrap();
        graph_from_proxies(&response.proxies)
    }

    #[test]
    fn test_group_order_follows_global() {
        let graph = graph();
        let names: Vec<_> = graph.groups().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Proxy", "Auto", "Streaming", "GLOBAL"]);
    }

    #[test]
    fn test_groups_and_nodes() {
        let graph = graph();
        assert_eq!(graph.group("Auto").unwrap().kind, GroupKind::URLTest);
        assert_eq!(graph.group("Streaming").unwrap().now, None);
        assert_eq!(graph.node("HK-01").unwrap().delay, Delay::ms(95));
        assert_eq!(graph.node("DIRECT").unwrap().delay, Delay::NO_DATA);
        assert!(graph.node("Auto").is_some());

        let resolved = graph.resolve_effective_node("GLOBAL");
        assert_eq!(resolved.node, "HK-01");
        assert_eq!(resolved.delay, Delay::ms(95));
    }
}
