use std::collections::BTreeSet;

/// Groups to retest and the policies no group could reach
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetestPlan {
    /// In the order they were picked
    pub groups: Vec<String>,
    /// Policy hashes each picked group is expected to refresh
    pub covered: BTreeSet<String>,
    /// Stale policies that appear in no group
    pub uncovered: BTreeSet<String>,
}

impl RetestPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Greedy set cover over group memberships.
///
/// Repeatedly picks the group covering the most still-stale policies (the
/// earliest group wins a tie) until nothing stale is left or no group helps.
/// Not guaranteed minimal.
pub fn plan_retest<S: AsRef<str>>(
    needs: &BTreeSet<String>,
    groups: &[(String, Vec<S>)],
) -> RetestPlan {
    let members: Vec<(&str, BTreeSet<&str>)> = groups
        .iter()
        .map(|(name, hashes)| (name.as_str(), hashes.iter().map(AsRef::as_ref).collect()))
        .collect();

    let mut remaining: BTreeSet<&str> = needs.iter().map(String::as_str).collect();
    let mut picked: Vec<bool> = vec![false; members.len()];
    let mut plan = RetestPlan::default();

    while !remaining.is_empty() {
        let best = members
            .iter()
            .enumerate()
            .filter(|(index, _)| !picked[*index])
            .map(|(index, (_, hashes))| (index, hashes.intersection(&remaining).count()))
            .filter(|(_, count)| *count > 0)
            // max_by_key keeps the last maximum, so compare on (count, reverse index)
            .max_by_key(|(index, count)| (*count, std::cmp::Reverse(*index)));

        let Some((index, _)) = best else {
            break;
        };
        picked[index] = true;
        let (name, hashes) = &members[index];
        for hash in hashes {
            if remaining.remove(hash) {
                plan.covered.insert(hash.to_string());
            }
        }
        plan.groups.push(name.to_string());
    }

    plan.uncovered = remaining.into_iter().map(str::to_string).collect();
    if !plan.uncovered.is_empty() {
        tracing::warn!(
            policies = ?plan.uncovered,
            "could not find a covering group for stale policies"
        );
    }
    tracing::debug!(groups = ?plan.groups, covered = plan.covered.len(), "retest plan");
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn group(name: &str, hashes: &[&'static str]) -> (String, Vec<&'static str>) {
        (name.to_string(), hashes.to_vec())
    }

    #[test]
    fn test_two_overlapping_groups() {
        let needs = set(&["p1", "p2", "p3"]);
        let groups = vec![group("A", &["p1", "p2"]), group("B", &["p2", "p3"])];
        let plan = plan_retest(&needs, &groups);
        assert_eq!(plan.groups, vec!["A", "B"]);
        assert_eq!(plan.covered, needs);
        assert!(plan.uncovered.is_empty());
    }

    #[test]
    fn test_picks_largest_first() {
        let needs = set(&["p1", "p2", "p3", "p4"]);
        let groups = vec![
            group("Small", &["p1"]),
            group("Big", &["p1", "p2", "p3"]),
            group("Rest", &["p4", "p9"]),
        ];
        let plan = plan_retest(&needs, &groups);
        assert_eq!(plan.groups, vec!["Big", "Rest"]);
    }

    #[test]
    fn test_ties_go_to_earlier_group() {
        let needs = set(&["p1"]);
        let groups = vec![group("First", &["p1"]), group("Second", &["p1"])];
        assert_eq!(plan_retest(&needs, &groups).groups, vec!["First"]);
    }

    #[test]
    fn test_reports_uncovered() {
        let needs = set(&["p1", "orphan"]);
        let groups = vec![group("A", &["p1", "p2"]), group("Fresh", &["p5"])];
        let plan = plan_retest(&needs, &groups);
        assert_eq!(plan.groups, vec!["A"]);
        assert_eq!(plan.uncovered, set(&["orphan"]));
    }

    #[test]
    fn test_nothing_stale() {
        let groups = vec![group("A", &["p1"])];
        let plan = plan_retest(&BTreeSet::new(), &groups);
        assert!(plan.is_empty());
        assert!(plan.uncovered.is_empty());
    }
}
