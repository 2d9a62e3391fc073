use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use super::models::graph_from_policies;
use super::types::*;
use crate::backend::{
    normalize_benchmarks, normalize_policy_hash, Backend, BackendError, BackendKind,
    BackendResult, ConnectionFeed, PolicyBenchmark, ProbeSettings,
};
use crate::monitor::ConnectionSnapshot;
use crate::topology::{Delay, TopologyGraph};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Surge HTTP API client
#[derive(Debug, Clone)]
pub struct SurgeBackend {
    base_url: Url,
    key: Option<String>,
    client: HttpClient,
    poll_interval: Duration,
    kind: BackendKind,
}

impl SurgeBackend {
    pub fn new(
        base_url: &str,
        key: Option<String>,
        poll_interval: Duration,
        kind: BackendKind,
    ) -> BackendResult<Self> {
        let base_url = Url::parse(base_url.trim())?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Config(format!(
                "controller URL cannot be a base: {}",
                base_url
            )));
        }
        Ok(Self {
            base_url,
            key: key.filter(|k| !k.is_empty()),
            client: HttpClient::new(),
            poll_interval,
            kind,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Config(format!("invalid controller URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> RequestBuilder {
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(key) = &self.key {
            request = request.header("X-Key", key);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> BackendResult<Response> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> BackendResult<T> {
        let response = self
            .send(self.request(Method::GET, url, REQUEST_TIMEOUT))
            .await?;
        Ok(response.json().await?)
    }

    async fn post<B: serde::Serialize + Send>(
        &self,
        url: Url,
        body: B,
        timeout: Duration,
    ) -> BackendResult<Response> {
        self.send(self.request(Method::POST, url, timeout).json(&body))
            .await
    }

    async fn active_requests(&self) -> BackendResult<ActiveRequests> {
        self.get(self.endpoint(&["requests", "active"])?).await
    }

    async fn policy_groups(&self) -> BackendResult<PolicyGroups> {
        self.get(self.endpoint(&["policy_groups"])?).await
    }

    async fn selection(&self, group: &str) -> BackendResult<String> {
        let mut url = self.endpoint(&["policy_groups", "select"])?;
        url.query_pairs_mut().append_pair("group_name", group);
        let selection: GroupSelection = self.get(url).await?;
        Ok(selection.policy)
    }

    /// Ask Surge to test every member of a group; results land in the benchmarks.
    async fn request_group_test(&self, name: &str, probe: &ProbeSettings) -> BackendResult<()> {
        let url = self.endpoint(&["policy_groups", "test"])?;
        self.post(url, GroupTestRequest { group_name: name }, probe.group_timeout)
            .await?;
        Ok(())
    }

    /// Delays of the named members, looked up through their policy hashes.
    async fn member_delays(&self, group: Option<&str>) -> BackendResult<HashMap<String, Delay>> {
        let groups = self.policy_groups().await?;
        let benchmarks = self.fetch_policy_benchmarks().await?;
        let members = groups
            .iter()
            .filter(|(name, _)| group.map(|g| g == name.as_str()).unwrap_or(true))
            .flat_map(|(_, members)| members.iter());

        let mut delays = HashMap::new();
        for member in members {
            let Some(hash) = member.line_hash.as_deref() else {
                continue;
            };
            if let Some(benchmark) = benchmarks.get(normalize_policy_hash(hash)) {
                delays.insert(member.name.clone(), benchmark.delay());
            }
        }
        Ok(delays)
    }
}

#[async_trait]
impl Backend for SurgeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connection_feed(&self) -> ConnectionFeed {
        ConnectionFeed::Poll(self.poll_interval)
    }

    async fn fetch_connections(&self) -> BackendResult<ConnectionSnapshot> {
        Ok(self.active_requests().await?.into_snapshot())
    }

    async fn close_connection(&self, id: &str) -> BackendResult<()> {
        let id: u64 = id.parse().map_err(|_| {
            BackendError::Decode(format!("Surge request ids are numeric, got '{}'", id))
        })?;
        let url = self.endpoint(&["requests", "kill"])?;
        self.post(url, KillRequest { id }, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn close_all_connections(&self) -> BackendResult<()> {
        let active = self.active_requests().await?;
        let url = self.endpoint(&["requests", "kill"])?;
        let kills = active
            .requests
            .iter()
            .map(|request| self.post(url.clone(), KillRequest { id: request.id }, REQUEST_TIMEOUT));
        let failures: Vec<BackendError> = join_all(kills)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_topology(&self) -> BackendResult<TopologyGraph> {
        let policies: PolicyList = self.get(self.endpoint(&["policies"])?).await?;
        let groups = self.policy_groups().await?;
        let benchmarks = self.fetch_policy_benchmarks().await?;

        let lookups = policies
            .policy_groups
            .iter()
            .map(|group| async move { (group.clone(), self.selection(group).await) });
        let mut selections = HashMap::new();
        for (group, selection) in join_all(lookups).await {
            match selection {
                Ok(policy) => {
                    selections.insert(group, policy);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(%group, %err, "could not read group selection"),
            }
        }

        Ok(graph_from_policies(&policies, &groups, &selections, &benchmarks))
    }

    async fn probe_node(&self, name: &str, probe: &ProbeSettings) -> BackendResult<Delay> {
        let url = self.endpoint(&["policies", "test"])?;
        let body = PolicyTestRequest {
            policy_names: vec![name],
            url: &probe.test_url,
        };
        self.post(url, body, probe.node_timeout).await?;
        let delays = self.member_delays(None).await?;
        Ok(delays.get(name).copied().unwrap_or(Delay::NO_DATA))
    }

    async fn probe_group(
        &self,
        name: &str,
        probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>> {
        self.request_group_test(name, probe).await?;
        self.member_delays(Some(name)).await
    }

    async fn health_check_provider(
        &self,
        name: &str,
        _probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>> {
        Err(BackendError::Config(format!(
            "Surge has no proxy providers (requested '{}')",
            name
        )))
    }

    async fn set_selection(&self, group: &str, member: &str) -> BackendResult<()> {
        let url = self.endpoint(&["policy_groups", "select"])?;
        self.post(
            url,
            SelectRequest {
                group_name: group,
                policy: member,
            },
            REQUEST_TIMEOUT,
        )
        .await?;
        tracing::info!(group, member, "selection changed");
        Ok(())
    }

    fn reports_by_policy_hash(&self) -> bool {
        true
    }

    async fn trigger_group_test(&self, name: &str, probe: &ProbeSettings) -> BackendResult<()> {
        self.request_group_test(name, probe).await
    }

    async fn fetch_policy_benchmarks(&self) -> BackendResult<HashMap<String, PolicyBenchmark>> {
        let raw: HashMap<String, PolicyBenchmark> = self
            .get(self.endpoint(&["policies", "benchmark_results"])?)
            .await?;
        Ok(normalize_benchmarks(raw))
    }
}
