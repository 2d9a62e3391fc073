use std::sync::Arc;

use anyhow::{Context, Result};
use crate::backend::{self, Backend, ProbeSettings};
use crate::config::{AppConfig, ServerConfig};
use crate::monitor::{ConnectionMonitor, MonitorView};
use crate::scheduler::{ProbeReport, RetestPlan, SpeedTestScheduler};
use crate::topology::{Delay, GroupKind, ListEntry, ListOptions, Resolved, TopologyStore};

/// Global application state: one backend and the components built on it
#[derive(Debug)]
pub struct AppState {
    pub server: ServerConfig,
    pub backend: Arc<dyn Backend>,
    pub topology: TopologyStore,
    pub scheduler: SpeedTestScheduler,
    pub monitor: ConnectionMonitor,
    pub list: ListOptions,
    pub status_message: Option<String>,
    pub error: Option<String>,
}

impl AppState {
    /// Connect to the selected server.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let server = config.current()?.clone();
        let backend = backend::connect(&server)
            .await
            .with_context(|| format!("Failed to connect to server '{}'", server.name))?;
        Ok(Self::new(server, backend, config))
    }

    pub fn new(server: ServerConfig, backend: Arc<dyn Backend>, config: &AppConfig) -> Self {
        let scheduler = SpeedTestScheduler::new(
            backend.clone(),
            ProbeSettings::from(&config.probe),
            config.probe.max_concurrent_group_tests,
        );
        Self {
            server,
            backend,
            topology: TopologyStore::new(),
            scheduler,
            monitor: ConnectionMonitor::spawn(),
            list: config.list,
            status_message: None,
            error: None,
        }
    }

    /// Refresh the topology snapshot from the backend
    pub async fn refresh(&mut self) -> Result<()> {
        self.error = None;
        match self.backend.fetch_topology().await {
            Ok(graph) => {
                self.topology.load_snapshot(graph);
                Ok(())
            }
            Err(e) => {
                self.error = Some(format!("Failed to get proxies: {}", e));
                Err(e.into())
            }
        }
    }

    /// Select a member of a group
    pub async fn select_proxy(&mut self, group: &str, member: &str) -> Result<()> {
        self.backend.set_selection(group, member).await?;
        self.topology.set_selection_local(group, member);
        self.status_message = Some(format!("Switched {} to {}", group, member));
        Ok(())
    }

    pub fn start_monitor(&self) {
        self.monitor.start(self.backend.clone());
    }

    pub fn connections(&self) -> MonitorView {
        self.monitor.view()
    }

    pub fn test_node(&mut self, name: &str) {
        self.scheduler.test_node(name);
    }

    pub fn test_group(&mut self, name: &str) {
        self.scheduler.test_group(name);
    }

    pub fn health_check_provider(&mut self, name: &str) {
        self.scheduler.health_check_provider(name);
    }

    pub async fn retest_stale(&mut self) -> Result<RetestPlan> {
        let plan = self.scheduler.retest_stale(&self.topology).await?;
        self.status_message = Some(if plan.is_empty() {
            "All latency results are fresh".to_string()
        } else {
            format!("Retesting {} groups", plan.groups.len())
        });
        Ok(plan)
    }

    /// Wait until every outstanding probe has reported
    pub async fn wait_for_probes(&mut self) -> Vec<ProbeReport> {
        let mut reports = Vec::new();
        while self.scheduler.has_pending() {
            reports.extend(self.scheduler.next_results(&mut self.topology).await);
        }
        self.note_reports(&reports);
        reports
    }

    fn note_reports(&mut self, reports: &[ProbeReport]) {
        if let Some(last) = reports.last() {
            self.status_message = Some(match last {
                ProbeReport::Node { name, delay } => {
                    format!("{}: {} ({})", name, delay, delay.label())
                }
                other => other.to_string(),
            });
        }
    }

    pub fn groups(&self) -> Vec<ListEntry> {
        self.topology.sorted_groups(self.list.sort)
    }

    pub fn members(&self, group: &str) -> Vec<ListEntry> {
        self.topology.sorted_members(group, self.list)
    }

    /// The group most traffic goes through: `GLOBAL`'s selection, else the first selector
    pub fn main_group(&self) -> Option<String> {
        let graph = self.topology.graph();
        if let Some(now) = graph.group("GLOBAL").and_then(|g| g.now.clone()) {
            if graph.is_group(&now) {
                return Some(now);
            }
        }
        graph
            .groups()
            .find(|g| g.kind == GroupKind::Selector && g.name != "GLOBAL")
            .map(|g| g.name.clone())
    }

    /// Node currently serving the main group
    pub fn current_node(&self) -> Option<Resolved> {
        self.main_group()
            .map(|group| self.topology.resolve_effective_node(&group))
    }

    /// Get health status based on the effective node's latency
    pub fn health_status(&self) -> HealthStatus {
        if self.error.is_some() || self.monitor.view().state.is_error() {
            return HealthStatus::Error;
        }
        match self.current_node() {
            Some(resolved) => HealthStatus::from_delay(resolved.delay),
            None => HealthStatus::Unknown,
        }
    }
}

/// Health status indicator
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    Good,
    Fair,
    Bad,
    Error,
    Unknown,
}

impl HealthStatus {
    pub fn from_delay(delay: Delay) -> Self {
        if delay.is_missing() {
            HealthStatus::Unknown
        } else if delay.is_timed_out() {
            HealthStatus::Bad
        } else if delay.raw() < 500 {
            HealthStatus::Good
        } else {
            HealthStatus::Fair
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HealthStatus::Good => "Good",
            HealthStatus::Fair => "Fair",
            HealthStatus::Bad => "Bad",
            HealthStatus::Error => "Error",
            HealthStatus::Unknown => "Unknown",
        }
    }
}
