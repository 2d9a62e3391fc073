use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::models::graph_from_proxies;
use super::types::*;
use crate::backend::{
    Backend, BackendError, BackendKind, BackendResult, ConnectionFeed, ProbeSettings,
    SnapshotStream,
};
use crate::monitor::ConnectionSnapshot;
use crate::topology::{Delay, TopologyGraph};

/// Default timeout for plain REST calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Clash External Controller API client
#[derive(Debug, Clone)]
pub struct ClashBackend {
    base_url: Url,
    secret: Option<String>,
    client: HttpClient,
    kind: BackendKind,
}

impl ClashBackend {
    /// Create a new Clash client
    pub fn new(base_url: &str, secret: Option<String>, kind: BackendKind) -> BackendResult<Self> {
        let base_url = Url::parse(base_url.trim())?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Config(format!(
                "controller URL cannot be a base: {}",
                base_url
            )));
        }
        Ok(Self {
            base_url,
            secret: secret.filter(|s| !s.is_empty()),
            client: HttpClient::new(),
            kind,
        })
    }

    /// Build authorization header
    fn auth_header(&self) -> Option<String> {
        self.secret.as_ref().map(|s| format!("Bearer {}", s))
    }

    /// Endpoint URL with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Config(format!("invalid controller URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> RequestBuilder {
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(auth) = self.auth_header() {
            request = request.header("Authorization", auth);
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

    /// Make a GET request
    async fn get<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> BackendResult<T> {
        let response = self.send(self.request(Method::GET, url, timeout)).await?;
        Ok(response.json().await?)
    }

    /// Delay endpoints answer 408/503/504 when the target did not respond in time.
    fn is_probe_timeout(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        )
    }

    fn probe_url(
        &self,
        segments: &[&str],
        probe: &ProbeSettings,
        timeout_ms: u64,
    ) -> BackendResult<Url> {
        let mut url = self.endpoint(segments)?;
        url.query_pairs_mut()
            .append_pair("url", &probe.test_url)
            .append_pair("timeout", &timeout_ms.to_string());
        Ok(url)
    }

    /// Get all proxies
    pub async fn get_proxies(&self) -> BackendResult<ProxiesResponse> {
        self.get(self.endpoint(&["proxies"])?, REQUEST_TIMEOUT).await
    }

    /// Get one provider with its proxies
    pub async fn get_provider(&self, name: &str) -> BackendResult<Provider> {
        self.get(self.endpoint(&["providers", "proxies", name])?, REQUEST_TIMEOUT)
            .await
    }

    fn stream_url(&self) -> BackendResult<Url> {
        let mut url = self.endpoint(&["connections"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            BackendError::Config(format!("cannot derive websocket URL from {}", url))
        })?;
        Ok(url)
    }
}

fn decode_snapshot(bytes: &[u8]) -> BackendResult<ConnectionSnapshot> {
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl Backend for ClashBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connection_feed(&self) -> ConnectionFeed {
        ConnectionFeed::Stream
    }

    async fn open_connection_stream(&self) -> BackendResult<SnapshotStream> {
        let url = self.stream_url()?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(auth) = self.auth_header() {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| BackendError::Config(format!("invalid secret: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(%url, "connection stream opened");

        let stream = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(decode_snapshot(text.as_bytes())),
                Ok(Message::Binary(bytes)) => Some(decode_snapshot(&bytes)),
                Ok(Message::Close(frame)) => Some(Err(BackendError::Transport(format!(
                    "stream closed by controller: {}",
                    frame.map(|f| f.reason.to_string()).unwrap_or_default()
                )))),
                Ok(_) => None,
                Err(err) => Some(Err(BackendError::from(err))),
            }
        });
        Ok(stream.boxed())
    }

    async fn fetch_connections(&self) -> BackendResult<ConnectionSnapshot> {
        self.get(self.endpoint(&["connections"])?, REQUEST_TIMEOUT).await
    }

    async fn close_connection(&self, id: &str) -> BackendResult<()> {
        let url = self.endpoint(&["connections", id])?;
        self.send(self.request(Method::DELETE, url, REQUEST_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn close_all_connections(&self) -> BackendResult<()> {
        let url = self.endpoint(&["connections"])?;
        self.send(self.request(Method::DELETE, url, REQUEST_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn fetch_topology(&self) -> BackendResult<TopologyGraph> {
        let proxies = self.get_proxies().await?;
        Ok(graph_from_proxies(&proxies.proxies))
    }

    async fn probe_node(&self, name: &str, probe: &ProbeSettings) -> BackendResult<Delay> {
        let url = self.probe_url(&["proxies", name, "delay"], probe, probe.node_timeout_ms())?;
        // leave the controller room to report its own timeout
        let timeout = probe.node_timeout + Duration::from_secs(2);
        let response = self.request(Method::GET, url, timeout).send().await?;
        let status = response.status();
        if Self::is_probe_timeout(status) {
            return Ok(Delay::TIMED_OUT);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        let delay: DelayResponse = response.json().await?;
        Ok(Delay::ms(delay.delay))
    }

    async fn probe_group(
        &self,
        name: &str,
        probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>> {
        let url = self.probe_url(&["group", name, "delay"], probe, probe.node_timeout_ms())?;
        let response = self
            .request(Method::GET, url, probe.group_timeout)
            .send()
            .await?;
        let status = response.status();
        if Self::is_probe_timeout(status) {
            tracing::warn!(group = name, %status, "group probe timed out");
            return Ok(HashMap::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        let delays: HashMap<String, u32> = response.json().await?;
        Ok(delays
            .into_iter()
            .map(|(node, delay)| (node, Delay::ms(delay)))
            .collect())
    }

    async fn health_check_provider(
        &self,
        name: &str,
        probe: &ProbeSettings,
    ) -> BackendResult<HashMap<String, Delay>> {
        let url = self.endpoint(&["providers", "proxies", name, "healthcheck"])?;
        self.send(self.request(Method::GET, url, probe.group_timeout))
            .await?;

        let provider = self.get_provider(name).await?;
        tracing::debug!(
            provider = %provider.name,
            vehicle = %provider.vehicle_type,
            proxies = provider.proxies.len(),
            "provider health check finished"
        );
        Ok(provider
            .proxies
            .iter()
            .map(|proxy| (proxy.name.clone(), proxy.last_delay()))
            .collect())
    }

    async fn set_selection(&self, group: &str, member: &str) -> BackendResult<()> {
        let url = self.endpoint(&["proxies", group])?;
        let response = self
            .request(Method::PUT, url, REQUEST_TIMEOUT)
            .json(&SelectRequest { name: member })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        tracing::info!(group, member, "selection changed");
        Ok(())
    }
}
