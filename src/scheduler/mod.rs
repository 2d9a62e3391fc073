//! Speed-test scheduler.
//!
//! Probes run on spawned tasks and report back over a channel; the owner calls
//! [`SpeedTestScheduler::process_results`] to merge them into its
//! [`TopologyStore`], so the store is only ever mutated by its owner.

mod cover;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendError, BackendResult, PolicyBenchmark, ProbeSettings};
use crate::topology::{Delay, GroupKind, TopologyStore};

pub use cover::{plan_retest, RetestPlan};

/// Raw result of a background probe
#[derive(Debug)]
enum ProbeOutcome {
    Node {
        name: String,
        result: BackendResult<Delay>,
    },
    Group {
        name: String,
        result: BackendResult<HashMap<String, Delay>>,
    },
    Provider {
        name: String,
        result: BackendResult<HashMap<String, Delay>>,
    },
    Retest {
        groups: Vec<String>,
        hashes: BTreeSet<String>,
        result: BackendResult<HashMap<String, PolicyBenchmark>>,
    },
    Selected {
        group: String,
        member: String,
        result: BackendResult<()>,
    },
}

/// What merging one outcome did to the topology
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeReport {
    Node { name: String, delay: Delay },
    Group { name: String, updated: usize },
    Provider { name: String, updated: usize },
    Retest { groups: Vec<String>, updated: usize },
    Promoted { group: String, member: String },
    Failed { target: String, error: BackendError },
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeReport::Node { name, delay } => write!(f, "{}: {}", name, delay),
            ProbeReport::Group { name, updated } => {
                write!(f, "group {}: {} nodes updated", name, updated)
            }
            ProbeReport::Provider { name, updated } => {
                write!(f, "provider {}: {} nodes updated", name, updated)
            }
            ProbeReport::Retest { groups, updated } => write!(
                f,
                "retested {} groups, {} nodes updated",
                groups.len(),
                updated
            ),
            ProbeReport::Promoted { group, member } => {
                write!(f, "{} switched to fastest member {}", group, member)
            }
            ProbeReport::Failed { target, error } => write!(f, "{} failed: {}", target, error),
        }
    }
}

/// Issues latency probes and merges their results
#[derive(Debug)]
pub struct SpeedTestScheduler {
    backend: Arc<dyn Backend>,
    probe: ProbeSettings,
    max_concurrent: usize,
    /// Names with a probe in flight
    testing: Vec<String>,
    results_tx: mpsc::UnboundedSender<ProbeOutcome>,
    results_rx: mpsc::UnboundedReceiver<ProbeOutcome>,
}

impl SpeedTestScheduler {
    pub fn new(backend: Arc<dyn Backend>, probe: ProbeSettings, max_concurrent: usize) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            probe,
            max_concurrent: max_concurrent.max(1),
            testing: Vec::new(),
            results_tx,
            results_rx,
        }
    }

    fn mark_testing(&mut self, name: &str) {
        if !self.testing.iter().any(|n| n == name) {
            self.testing.push(name.to_string());
        }
    }

    fn done_testing(&mut self, name: &str) {
        self.testing.retain(|n| n != name);
    }

    pub fn is_testing(&self, name: &str) -> bool {
        self.testing.iter().any(|n| n == name)
    }

    /// Whether any probe is still outstanding
    pub fn has_pending(&self) -> bool {
        !self.testing.is_empty()
    }

    /// Probe one node in the background.
    pub fn test_node(&mut self, name: &str) {
        self.mark_testing(name);
        let backend = self.backend.clone();
        let probe = self.probe.clone();
        let tx = self.results_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = backend.probe_node(&name, &probe).await;
            let _ = tx.send(ProbeOutcome::Node { name, result });
        });
    }

    /// Probe every member of a group in the background.
    pub fn test_group(&mut self, name: &str) {
        self.mark_testing(name);
        let backend = self.backend.clone();
        let probe = self.probe.clone();
        let tx = self.results_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = backend.probe_group(&name, &probe).await;
            let _ = tx.send(ProbeOutcome::Group { name, result });
        });
    }

    pub fn health_check_provider(&mut self, name: &str) {
        self.mark_testing(name);
        let backend = self.backend.clone();
        let probe = self.probe.clone();
        let tx = self.results_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = backend.health_check_provider(&name, &probe).await;
            let _ = tx.send(ProbeOutcome::Provider { name, result });
        });
    }

    /// Retest the fewest groups that refresh every stale policy.
    ///
    /// Returns the plan right away; the group tests and the single benchmark
    /// re-fetch that follows run in the background.
    pub async fn retest_stale(&mut self, store: &TopologyStore) -> BackendResult<RetestPlan> {
        let benchmarks = self.backend.fetch_policy_benchmarks().await?;
        let groups = store.group_policy_hashes();
        let needs = stale_policies(&benchmarks, &groups, Utc::now());
        let plan = plan_retest(&needs, &groups);
        tracing::info!(
            stale = needs.len(),
            groups = plan.groups.len(),
            uncovered = plan.uncovered.len(),
            "retest planned"
        );
        if plan.is_empty() {
            return Ok(plan);
        }

        for group in &plan.groups {
            self.mark_testing(group);
        }

        let backend = self.backend.clone();
        let probe = self.probe.clone();
        let tx = self.results_tx.clone();
        let max_concurrent = self.max_concurrent;
        let groups = plan.groups.clone();
        let hashes = plan.covered.clone();
        tokio::spawn(async move {
            let mut tests = stream::iter(groups.clone())
                .map(|group| {
                    let backend = backend.clone();
                    let probe = probe.clone();
                    async move {
                        let result = backend.trigger_group_test(&group, &probe).await;
                        (group, result)
                    }
                })
                .buffer_unordered(max_concurrent);
            while let Some((group, result)) = tests.next().await {
                if let Err(error) = result {
                    tracing::warn!(%group, %error, "group retest failed");
                }
            }

            let result = backend.fetch_policy_benchmarks().await;
            let _ = tx.send(ProbeOutcome::Retest {
                groups,
                hashes,
                result,
            });
        });

        Ok(plan)
    }

    /// Merge every outcome that has arrived so far.
    pub fn process_results(&mut self, store: &mut TopologyStore) -> Vec<ProbeReport> {
        let mut reports = Vec::new();
        while let Ok(outcome) = self.results_rx.try_recv() {
            self.apply(outcome, store, &mut reports);
        }
        reports
    }

    /// Wait for at least one outcome, then merge everything available.
    pub async fn next_results(&mut self, store: &mut TopologyStore) -> Vec<ProbeReport> {
        let mut reports = Vec::new();
        if let Some(outcome) = self.results_rx.recv().await {
            self.apply(outcome, store, &mut reports);
        }
        reports.extend(self.process_results(store));
        reports
    }

    fn apply(
        &mut self,
        outcome: ProbeOutcome,
        store: &mut TopologyStore,
        reports: &mut Vec<ProbeReport>,
    ) {
        let now = Utc::now();
        match outcome {
            ProbeOutcome::Node { name, result } => {
                self.done_testing(&name);
                match result {
                    Ok(delay) => {
                        merge_delay(store, &name, delay, now);
                        tracing::debug!(node = %name, %delay, "node probed");
                        reports.push(ProbeReport::Node { name, delay });
                    }
                    Err(error) => reports.push(failed(name, error)),
                }
            }
            ProbeOutcome::Group { name, result } => {
                self.done_testing(&name);
                match result {
                    Ok(delays) => {
                        let updated = merge_delays(store, &delays, now);
                        store.mark_group_tested(&name, now);
                        tracing::debug!(group = %name, updated, "group probed");
                        self.promote_fastest(store, &name);
                        reports.push(ProbeReport::Group { name, updated });
                    }
                    Err(error) => reports.push(failed(name, error)),
                }
            }
            ProbeOutcome::Provider { name, result } => {
                self.done_testing(&name);
                match result {
                    Ok(delays) => {
                        let updated = merge_delays(store, &delays, now);
                        store.mark_group_tested(&name, now);
                        reports.push(ProbeReport::Provider { name, updated });
                    }
                    Err(error) => reports.push(failed(name, error)),
                }
            }
            ProbeOutcome::Retest {
                groups,
                hashes,
                result,
            } => {
                for group in &groups {
                    self.done_testing(group);
                }
                match result {
                    Ok(benchmarks) => {
                        let updated = hashes
                            .iter()
                            .filter_map(|hash| Some((hash, benchmarks.get(hash)?)))
                            .map(|(hash, benchmark)| {
                                store.apply_policy_delay(hash, benchmark.delay(), now)
                            })
                            .sum::<usize>();
                        for group in &groups {
                            store.mark_group_tested(group, now);
                            self.promote_fastest(store, group);
                        }
                        tracing::info!(groups = groups.len(), updated, "stale policies refreshed");
                        reports.push(ProbeReport::Retest { groups, updated });
                    }
                    Err(error) => reports.push(failed(groups.join(", "), error)),
                }
            }
            ProbeOutcome::Selected {
                group,
                member,
                result,
            } => {
                self.done_testing(&group);
                match result {
                    Ok(()) => {
                        store.set_selection_local(&group, &member);
                        reports.push(ProbeReport::Promoted { group, member });
                    }
                    Err(error) => reports.push(failed(group, error)),
                }
            }
        }
    }

    /// Switch a URL-test group to its fastest member after a group test.
    fn promote_fastest(&mut self, store: &TopologyStore, group: &str) {
        let Some(current) = store.graph().group(group) else {
            return;
        };
        if current.kind != GroupKind::URLTest {
            return;
        }
        let Some((member, delay)) = store.fastest_member(group) else {
            return;
        };
        if current.now.as_deref() == Some(member.as_str()) {
            return;
        }

        tracing::info!(group, %member, %delay, "promoting fastest member");
        self.mark_testing(group);
        let backend = self.backend.clone();
        let tx = self.results_tx.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            let result = backend.set_selection(&group, &member).await;
            let _ = tx.send(ProbeOutcome::Selected {
                group,
                member,
                result,
            });
        });
    }
}

fn failed(target: String, error: BackendError) -> ProbeReport {
    tracing::warn!(%target, %error, "probe failed");
    ProbeReport::Failed { target, error }
}

/// Write a delay to `name` and to every node sharing its policy hash.
fn merge_delay(store: &mut TopologyStore, name: &str, delay: Delay, at: DateTime<Utc>) -> usize {
    let hash = store
        .graph()
        .node(name)
        .and_then(|node| node.policy_hash.clone());
    match hash {
        Some(hash) => store.apply_policy_delay(&hash, delay, at),
        None => usize::from(store.apply_delay(name, delay, at)),
    }
}

fn merge_delays(
    store: &mut TopologyStore,
    delays: &HashMap<String, Delay>,
    at: DateTime<Utc>,
) -> usize {
    delays
        .iter()
        .map(|(name, delay)| merge_delay(store, name, *delay, at))
        .sum()
}

/// Policies that need a retest: stale benchmarks plus graph policies never benchmarked.
fn stale_policies(
    benchmarks: &HashMap<String, PolicyBenchmark>,
    groups: &[(String, Vec<String>)],
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    let mut needs: BTreeSet<String> = benchmarks
        .iter()
        .filter(|(_, benchmark)| benchmark.needs_retest(now))
        .map(|(hash, _)| hash.clone())
        .collect();
    for (_, hashes) in groups {
        for hash in hashes {
            if !benchmarks.contains_key(hash) {
                needs.insert(hash.clone());
            }
        }
    }
    needs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::{BackendKind, ConnectionFeed};
    use crate::monitor::ConnectionSnapshot;
    use crate::topology::{ProxyGroup, ProxyNode, TopologyGraph};

    #[derive(Debug, Default)]
    struct MockBackend {
        group_delays: HashMap<String, Delay>,
        benchmarks: Mutex<HashMap<String, PolicyBenchmark>>,
        refreshed: HashMap<String, PolicyBenchmark>,
        triggered: Mutex<Vec<String>>,
        selections: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Surge
        }

        fn connection_feed(&self) -> ConnectionFeed {
            ConnectionFeed::Stream
        }

        async fn fetch_connections(&self) -> BackendResult<ConnectionSnapshot> {
            Ok(ConnectionSnapshot::default())
        }

        async fn close_connection(&self, _: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn close_all_connections(&self) -> BackendResult<()> {
            Ok(())
        }

        async fn fetch_topology(&self) -> BackendResult<TopologyGraph> {
            Ok(TopologyGraph::new())
        }

        async fn probe_node(&self, name: &str, _: &ProbeSettings) -> BackendResult<Delay> {
            match name {
                "missing" => Err(BackendError::Status {
                    status: 404,
                    body: "proxy not found".into(),
                }),
                _ => Ok(Delay::ms(80)),
            }
        }

        async fn probe_group(
            &self,
            _: &str,
            _: &ProbeSettings,
        ) -> BackendResult<HashMap<String, Delay>> {
            Ok(self.group_delays.clone())
        }

        async fn health_check_provider(
            &self,
            _: &str,
            _: &ProbeSettings,
        ) -> BackendResult<HashMap<String, Delay>> {
            Ok(self.group_delays.clone())
        }

        async fn set_selection(&self, group: &str, member: &str) -> BackendResult<()> {
            self.selections
                .lock()
                .unwrap()
                .push((group.to_string(), member.to_string()));
            Ok(())
        }

        fn reports_by_policy_hash(&self) -> bool {
            true
        }

        async fn trigger_group_test(&self, name: &str, _: &ProbeSettings) -> BackendResult<()> {
            self.triggered.lock().unwrap().push(name.to_string());
            *self.benchmarks.lock().unwrap() = self.refreshed.clone();
            Ok(())
        }

        async fn fetch_policy_benchmarks(
            &self,
        ) -> BackendResult<HashMap<String, PolicyBenchmark>> {
            Ok(self.benchmarks.lock().unwrap().clone())
        }
    }

    fn bench(score: f64, age_secs: i64) -> PolicyBenchmark {
        PolicyBenchmark {
            last_test_score_in_ms: score,
            last_test_error_message: None,
            last_test_date: (Utc::now().timestamp() - age_secs) as f64,
        }
    }

    fn url_test_store() -> TopologyStore {
        let mut graph = TopologyGraph::new();
        graph.insert_node(ProxyNode::new("HK", "Shadowsocks").with_delay(Delay::ms(300)));
        graph.insert_node(ProxyNode::new("JP", "Trojan").with_delay(Delay::ms(200)));
        graph.insert_node(ProxyNode::new("DIRECT", "Direct").with_delay(Delay::ms(1)));
        graph.insert_group(
            ProxyGroup::new(
                "Auto",
                GroupKind::URLTest,
                vec!["DIRECT".into(), "HK".into(), "JP".into()],
            )
            .with_now("JP"),
        );
        let mut store = TopologyStore::new();
        store.load_snapshot(graph);
        store
    }

    fn hashed_store() -> TopologyStore {
        let mut graph = TopologyGraph::new();
        for (name, hash) in [("HK", "p1"), ("JP", "p2"), ("JP copy", "p2"), ("US", "p3")] {
            graph.insert_node(ProxyNode::new(name, "Proxy").with_policy_hash(hash));
        }
        graph.insert_group(ProxyGroup::new(
            "A",
            GroupKind::Selector,
            vec!["HK".into(), "JP".into()],
        ));
        graph.insert_group(ProxyGroup::new(
            "B",
            GroupKind::Selector,
            vec!["JP copy".into(), "US".into()],
        ));
        let mut store = TopologyStore::new();
        store.load_snapshot(graph);
        store
    }

    #[tokio::test]
    async fn test_node_result_written_back() {
        let mut store = url_test_store();
        let mut scheduler =
            SpeedTestScheduler::new(Arc::new(MockBackend::default()), ProbeSettings::default(), 4);

        scheduler.test_node("HK");
        assert!(scheduler.is_testing("HK"));
        let reports = scheduler.next_results(&mut store).await;

        assert_eq!(
            reports,
            vec![ProbeReport::Node {
                name: "HK".into(),
                delay: Delay::ms(80)
            }]
        );
        assert_eq!(store.graph().node("HK").unwrap().delay, Delay::ms(80));
        assert!(!scheduler.is_testing("HK"));
    }

    #[tokio::test]
    async fn test_failed_probe_is_reported() {
        let mut store = url_test_store();
        let mut scheduler =
            SpeedTestScheduler::new(Arc::new(MockBackend::default()), ProbeSettings::default(), 4);

        scheduler.test_node("missing");
        let reports = scheduler.next_results(&mut store).await;
        assert!(matches!(&reports[0], ProbeReport::Failed { target, .. } if target == "missing"));
    }

    #[tokio::test]
    async fn test_url_test_group_promotes_fastest() {
        let backend = Arc::new(MockBackend {
            group_delays: HashMap::from([
                ("HK".to_string(), Delay::ms(45)),
                ("JP".to_string(), Delay::TIMED_OUT),
            ]),
            ..Default::default()
        });
        let mut store = url_test_store();
        let mut scheduler = SpeedTestScheduler::new(backend.clone(), ProbeSettings::default(), 4);

        scheduler.test_group("Auto");
        let mut reports = Vec::new();
        while !reports.iter().any(|r| matches!(r, ProbeReport::Promoted { .. })) {
            reports.extend(scheduler.next_results(&mut store).await);
        }

        assert!(reports.contains(&ProbeReport::Group {
            name: "Auto".into(),
            updated: 2
        }));
        assert_eq!(
            *backend.selections.lock().unwrap(),
            vec![("Auto".to_string(), "HK".to_string())]
        );
        assert_eq!(store.graph().group("Auto").unwrap().now.as_deref(), Some("HK"));
        assert!(store.last_tested("Auto").is_some());
    }

    #[tokio::test]
    async fn test_retest_stale_covers_and_fans_out() {
        let backend = Arc::new(MockBackend {
            benchmarks: Mutex::new(HashMap::from([
                ("p1".to_string(), bench(0.0, 10)),
                ("p2".to_string(), bench(120.0, 600)),
                ("p3".to_string(), bench(90.0, 10)),
            ])),
            refreshed: HashMap::from([
                ("p1".to_string(), bench(50.0, 0)),
                ("p2".to_string(), bench(70.0, 0)),
                ("p3".to_string(), bench(90.0, 10)),
            ]),
            ..Default::default()
        });
        let mut store = hashed_store();
        let mut scheduler = SpeedTestScheduler::new(backend.clone(), ProbeSettings::default(), 2);

        let plan = scheduler.retest_stale(&store).await.unwrap();
        assert_eq!(plan.groups, vec!["A"]);
        assert!(plan.uncovered.is_empty());

        let reports = scheduler.next_results(&mut store).await;
        assert_eq!(
            reports,
            vec![ProbeReport::Retest {
                groups: vec!["A".into()],
                updated: 3
            }]
        );
        assert_eq!(*backend.triggered.lock().unwrap(), vec!["A".to_string()]);
        assert_eq!(store.graph().node("HK").unwrap().delay, Delay::ms(50));
        assert_eq!(store.graph().node("JP").unwrap().delay, Delay::ms(70));
        assert_eq!(store.graph().node("JP copy").unwrap().delay, Delay::ms(70));
        assert_eq!(store.graph().node("US").unwrap().delay, Delay::NO_DATA);
    }

    #[test]
    fn test_stale_policies_include_unbenchmarked() {
        let benchmarks = HashMap::from([
            ("fresh".to_string(), bench(80.0, 5)),
            ("old".to_string(), bench(80.0, 300)),
        ]);
        let groups = vec![(
            "G".to_string(),
            vec!["fresh".to_string(), "old".to_string(), "never".to_string()],
        )];
        let needs = stale_policies(&benchmarks, &groups, Utc::now());
        let expected: BTreeSet<String> = ["never", "old"].iter().map(|s| s.to_string()).collect();
        assert_eq!(needs, expected);
    }

    #[test]
    fn test_nested_group_hashes_never_count_as_stale() {
        use crate::surge::{graph_from_policies, PolicyGroups, PolicyList};

        let policies: PolicyList = serde_json::from_str(
            r#"{"proxies": ["DIRECT", "HK", "JP"], "policy-groups": ["Proxy", "Auto"]}"#,
        )
        .unwrap();
        let groups: PolicyGroups = serde_json::from_str(
            r#"{
                "Proxy": [
                    {"name": "Auto", "typeDescription": "Url Test", "isGroup": true, "lineHash": "g1"},
                    {"name": "HK", "typeDescription": "Shadowsocks", "isGroup": false, "lineHash": "h1"},
                    {"name": "DIRECT", "typeDescription": "Direct", "isGroup": false, "lineHash": "d1"}
                ],
                "Auto": [
                    {"name": "HK", "typeDescription": "Shadowsocks", "isGroup": false, "lineHash": "h1"},
                    {"name": "JP", "typeDescription": "Trojan", "isGroup": false, "lineHash": "h2"}
                ]
            }"#,
        )
        .unwrap();
        let benchmarks = HashMap::from([
            ("h1".to_string(), bench(90.0, 5)),
            ("h2".to_string(), bench(120.0, 10)),
        ]);
        let mut store = TopologyStore::new();
        store.load_snapshot(graph_from_policies(
            &policies,
            &groups,
            &HashMap::new(),
            &benchmarks,
        ));

        let hashes = store.group_policy_hashes();
        assert!(hashes.iter().all(|(_, h)| !h.contains(&"g1".to_string())));
        assert!(stale_policies(&benchmarks, &hashes, Utc::now()).is_empty());

        let plan = plan_retest(&stale_policies(&benchmarks, &hashes, Utc::now()), &hashes);
        assert!(plan.is_empty());
    }
}
