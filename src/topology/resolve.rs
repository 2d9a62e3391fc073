use std::collections::HashSet;

use super::{is_builtin, Delay, GroupKind, TopologyGraph};

/// The node a name ultimately routes through, with its latency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub node: String,
    pub delay: Delay,
}

impl Resolved {
    fn new(node: &str, delay: Delay) -> Self {
        Self {
            node: node.to_string(),
            delay,
        }
    }
}

impl TopologyGraph {
    /// Follow `now` selections down from `name` to the effective node.
    ///
    /// Descent stops on the first repeated name, so misconfigured cycles resolve
    /// to `Delay::NO_DATA` instead of looping. Load-balance groups are terminal and
    /// report their own recorded delay.
    pub fn resolve_effective_node(&self, name: &str) -> Resolved {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = name;

        loop {
            if !visited.insert(current) {
                tracing::debug!(start = name, repeated = current, "selection cycle detected");
                return Resolved::new(current, Delay::NO_DATA);
            }

            if is_builtin(current) {
                return Resolved::new(current, self.recorded_delay(current));
            }

            if let Some(group) = self.group(current) {
                if group.kind == GroupKind::LoadBalance {
                    return Resolved::new(current, self.recorded_delay(current));
                }
                match group.now.as_deref() {
                    Some(next) if !next.is_empty() => {
                        current = next;
                        continue;
                    }
                    _ => return Resolved::new(current, Delay::NO_DATA),
                }
            }

            return match self.node(current) {
                Some(node) => Resolved::new(current, node.delay),
                None => Resolved::new(current, Delay::NO_DATA),
            };
        }
    }

    pub fn resolve_delay(&self, name: &str) -> Delay {
        self.resolve_effective_node(name).delay
    }

    fn recorded_delay(&self, name: &str) -> Delay {
        self.node(name)
            .map(|node| node.delay)
            .unwrap_or(Delay::NO_DATA)
    }
}
