use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{is_builtin, Delay, Resolved, TopologyGraph};

/// Ordering applied to group and member lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SortPolicy {
    #[default]
    Insertion,
    LatencyAsc,
    LatencyDesc,
    NameAsc,
    NameDesc,
}

/// Display options for member lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub sort: SortPolicy,
    /// Keep built-ins at the front in their original order
    #[serde(default)]
    pub pin_builtins: bool,
    /// Drop members without a positive resolved delay (built-ins exempt)
    #[serde(default)]
    pub hide_unavailable: bool,
}

/// One row of a group or member list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_group: bool,
    pub is_builtin: bool,
    pub resolved: Resolved,
}

impl ListEntry {
    pub fn delay(&self) -> Delay {
        self.resolved.delay
    }
}

fn compare(a: &ListEntry, b: &ListEntry, sort: SortPolicy) -> Ordering {
    match sort {
        SortPolicy::Insertion => Ordering::Equal,
        SortPolicy::LatencyAsc => a.delay().rank(b.delay(), false),
        SortPolicy::LatencyDesc => a.delay().rank(b.delay(), true),
        SortPolicy::NameAsc => a.name.cmp(&b.name),
        SortPolicy::NameDesc => b.name.cmp(&a.name),
    }
}

/// Sort entries in place; stable, so equal keys keep insertion order.
pub fn sort_entries(entries: &mut [ListEntry], sort: SortPolicy) {
    entries.sort_by(|a, b| compare(a, b, sort));
}

impl TopologyGraph {
    fn entry(&self, name: &str) -> ListEntry {
        ListEntry {
            name: name.to_string(),
            is_group: self.is_group(name),
            is_builtin: is_builtin(name),
            resolved: self.resolve_effective_node(name),
        }
    }

    /// All groups, each with its resolved effective node.
    pub fn sorted_groups(&self, sort: SortPolicy) -> Vec<ListEntry> {
        let mut entries: Vec<ListEntry> = self.groups().map(|g| self.entry(&g.name)).collect();
        sort_entries(&mut entries, sort);
        entries
    }

    /// Members of `group` under the given options; empty for unknown groups.
    pub fn sorted_members(&self, group: &str, options: ListOptions) -> Vec<ListEntry> {
        let Some(group) = self.group(group) else {
            return Vec::new();
        };

        let entries = group
            .members
            .iter()
            .map(|member| self.entry(member))
            .filter(|entry| {
                !options.hide_unavailable || entry.is_builtin || entry.delay().is_available()
            });

        if options.pin_builtins {
            let (mut pinned, mut rest): (Vec<_>, Vec<_>) = entries.partition(|e| e.is_builtin);
            sort_entries(&mut rest, options.sort);
            pinned.append(&mut rest);
            pinned
        } else {
            let mut all: Vec<_> = entries.collect();
            sort_entries(&mut all, options.sort);
            all
        }
    }
}
