//! Controller backends behind one trait, chosen once per server entry.

mod benchmark;
mod error;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::clash::ClashBackend;
use crate::config::{ProbeConfig, ServerConfig};
use crate::monitor::ConnectionSnapshot;
use crate::openwrt;
use crate::surge::SurgeBackend;
use crate::topology::{Delay, TopologyGraph};

pub use benchmark::{
    normalize_benchmarks, normalize_policy_hash, PolicyBenchmark, FRESHNESS_WINDOW_SECS,
};
pub use error::{BackendError, BackendResult};

/// Controller flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Clash,
    Surge,
    OpenwrtClash,
    OpenwrtSurge,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Clash => "clash",
            BackendKind::Surge => "surge",
            BackendKind::OpenwrtClash => "openwrt-clash",
            BackendKind::OpenwrtSurge => "openwrt-surge",
        }
    }

    pub fn is_openwrt(&self) -> bool {
        matches!(self, BackendKind::OpenwrtClash | BackendKind::OpenwrtSurge)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend delivers connection snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFeed {
    /// Persistent push stream of full snapshots
    Stream,
    /// Request the active list on a fixed interval
    Poll(Duration),
}

/// Snapshots pushed by a streaming backend. Decode errors are yielded and the
/// stream continues; any other error is the last item.
pub type SnapshotStream = BoxStream<'static, BackendResult<ConnectionSnapshot>>;

/// Target URL and timeouts for latency probes
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub test_url: String,
    pub node_timeout: Duration,
    pub group_timeout: Duration,
}

impl ProbeSettings {
    pub fn node_timeout_ms(&self) -> u64 {
        self.node_timeout.as_millis() as u64
    }
}

impl From<&ProbeConfig> for ProbeSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            test_url: config.test_url.clone(),
            node_timeout: Duration::from_millis(config.node_timeout_ms),
            group_timeout: Duration::from_millis(config.group_timeout_ms),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::from(&ProbeConfig::default())
    }
}

/// Operations every controller flavour provides
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn connection_feed(&self) -> ConnectionFeed;

    /// Open the push stream; only meaningful for `ConnectionFeed::Stream`.
    async fn open_connection_stream(&self) -> BackendResult<SnapshotStream> {
        Err(BackendError::Config(format!(
            "{} backend does not push connection snapshots",
            self.kind()
        )))
    }

    /// Fetch the active connections once, normalized.
    async fn fetch_connections(&self) -> BackendResult<ConnectionSnapshot>;

    async fn close_connection(&self, id: &str) -> BackendResult<()>;

    async fn close_all_connections(&self) -> BackendResult<()>;

    async fn fetch_topology(&self) -> BackendResult<TopologyGraph>;

    /// Probe a single node.
    async fn probe_node(&self, name: &str, probe: &ProbeSettings) -> BackendResult<Delay>;

    /// Probe every member of a group; results keyed by node name.
    async fn probe_group(
        &self,
        name: &str,
        probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>>;

    async fn health_check_provider(
        &self,
        name: &str,
        probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>>;

    async fn set_selection(&self, group: &str, member: &str) -> BackendResult<()>;

    /// Whether probe results are only available through policy-hash benchmarks.
    fn reports_by_policy_hash(&self) -> bool {
        false
    }

    /// Start a group test without waiting for per-member results.
    async fn trigger_group_test(&self, name: &str, probe: &ProbeSettings) -> BackendResult<()> {
        self.probe_group(name, probe).await.map(|_| ())
    }

    /// Benchmarks keyed by bare policy hash.
    async fn fetch_policy_benchmarks(&self) -> BackendResult<HashMap<String, PolicyBenchmark>> {
        Err(BackendError::Config(format!(
            "{} backend does not report policy benchmarks",
            self.kind()
        )))
    }
}

/// Build the backend for a server entry.
pub async fn connect(server: &ServerConfig) -> BackendResult<Arc<dyn Backend>> {
    server.validate()?;

    tracing::info!(server = %server.name, kind = %server.kind, url = %server.api_url, "connecting");

    let backend: Arc<dyn Backend> = match server.kind {
        BackendKind::Clash => Arc::new(ClashBackend::new(
            &server.api_url,
            server.secret.clone(),
            BackendKind::Clash,
        )?),
        BackendKind::Surge => Arc::new(SurgeBackend::new(
            &server.api_url,
            server.secret.clone(),
            server.poll_interval(),
            BackendKind::Surge,
        )?),
        BackendKind::OpenwrtClash | BackendKind::OpenwrtSurge => {
            let endpoint = openwrt::resolve_controller(server).await?;
            if server.kind == BackendKind::OpenwrtClash {
                Arc::new(ClashBackend::new(
                    &endpoint.api_url,
                    endpoint.secret,
                    server.kind,
                )?)
            } else {
                Arc::new(SurgeBackend::new(
                    &endpoint.api_url,
                    endpoint.secret,
                    server.poll_interval(),
                    server.kind,
                )?)
            }
        }
    };
    Ok(backend)
}
