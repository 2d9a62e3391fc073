//! Controller discovery on OpenWRT routers.
//!
//! The router's ubus JSON-RPC endpoint is asked for the UCI options that hold
//! the controller port and secret; the wrapped Clash or Surge backend is then
//! built against `http://<router host>:<port>`.

use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::backend::{BackendError, BackendKind, BackendResult};
use crate::config::{OpenWrtConfig, ServerConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Session id ubus accepts for `session.login`
const ANONYMOUS_SESSION: &str = "00000000000000000000000000000000";

const UBUS_STATUS_OK: i64 = 0;
const UBUS_STATUS_NOT_FOUND: i64 = 4;
const UBUS_STATUS_PERMISSION_DENIED: i64 = 6;
/// rpcd's JSON-RPC error code for a rejected session
const RPC_ACCESS_DENIED: i64 = -32002;

/// Where the wrapped controller can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEndpoint {
    pub api_url: String,
    pub secret: Option<String>,
}

/// UCI coordinates of the controller settings
#[derive(Debug, Clone, PartialEq, Eq)]
struct UciLocation {
    config: String,
    section: String,
    port_option: String,
    secret_option: String,
}

impl UciLocation {
    fn for_server(kind: BackendKind, openwrt: &OpenWrtConfig) -> Self {
        let (config, section, port, secret) = match kind {
            BackendKind::OpenwrtSurge => ("surge", "main", "api_port", "api_key"),
            _ => ("openclash", "config", "cn_port", "dashboard_password"),
        };
        let pick = |value: &Option<String>, fallback: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };
        Self {
            config: pick(&openwrt.uci_config, config),
            section: pick(&openwrt.uci_section, section),
            port_option: pick(&openwrt.port_option, port),
            secret_option: pick(&openwrt.secret_option, secret),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: (&'a str, &'a str, &'a str, Value),
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Unwrap a ubus reply; `Ok(None)` when the object or option does not exist.
fn parse_call_result(response: RpcResponse) -> BackendResult<Option<Value>> {
    if let Some(error) = response.error {
        return Err(if error.code == RPC_ACCESS_DENIED {
            BackendError::Auth(format!("ubus: {}", error.message))
        } else {
            BackendError::Transport(format!("ubus error {}: {}", error.code, error.message))
        });
    }

    let result = response
        .result
        .ok_or_else(|| BackendError::Decode("ubus reply has neither result nor error".into()))?;
    let mut parts = match result {
        Value::Array(parts) => parts.into_iter(),
        other => {
            return Err(BackendError::Decode(format!(
                "unexpected ubus result: {}",
                other
            )))
        }
    };
    let status = parts
        .next()
        .and_then(|status| status.as_i64())
        .ok_or_else(|| BackendError::Decode("ubus result without status code".into()))?;

    match status {
        UBUS_STATUS_OK => Ok(Some(parts.next().unwrap_or(Value::Null))),
        UBUS_STATUS_NOT_FOUND => Ok(None),
        UBUS_STATUS_PERMISSION_DENIED => {
            Err(BackendError::Auth("ubus permission denied".into()))
        }
        other => Err(BackendError::Transport(format!("ubus status {}", other))),
    }
}

/// Controller URL on the router's host
fn controller_url(router: &Url, port: u16) -> BackendResult<String> {
    let host = router
        .host_str()
        .ok_or_else(|| BackendError::Config(format!("router URL has no host: {}", router)))?;
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Ok(format!("http://{}:{}", host, port))
}

struct UbusClient {
    endpoint: Url,
    client: HttpClient,
    session: String,
}

impl UbusClient {
    fn new(router: &Url) -> BackendResult<Self> {
        let mut endpoint = router.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| BackendError::Config(format!("invalid router URL: {}", router)))?
            .pop_if_empty()
            .push("ubus");
        Ok(Self {
            endpoint,
            client: HttpClient::new(),
            session: ANONYMOUS_SESSION.to_string(),
        })
    }

    async fn call(&self, object: &str, method: &str, args: Value) -> BackendResult<Option<Value>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "call",
            params: (self.session.as_str(), object, method, args),
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }
        parse_call_result(response.json().await?)
    }

    async fn login(&mut self, username: &str, password: &str) -> BackendResult<()> {
        let reply = self
            .call(
                "session",
                "login",
                json!({ "username": username, "password": password }),
            )
            .await?
            .ok_or_else(|| BackendError::Auth("ubus session object not available".into()))?;
        self.session = reply
            .get("ubus_rpc_session")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Decode("login reply without session id".into()))?
            .to_string();
        tracing::debug!(router = %self.endpoint, "ubus session opened");
        Ok(())
    }

    async fn uci_get(
        &self,
        config: &str,
        section: &str,
        option: &str,
    ) -> BackendResult<Option<String>> {
        let reply = self
            .call(
                "uci",
                "get",
                json!({ "config": config, "section": section, "option": option }),
            )
            .await?;
        Ok(reply
            .as_ref()
            .and_then(|value| value.get("value"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }
}

/// Log in to the router and read where its controller listens.
pub async fn resolve_controller(server: &ServerConfig) -> BackendResult<ControllerEndpoint> {
    let openwrt = server.openwrt.as_ref().ok_or_else(|| {
        BackendError::Config(format!("server '{}' has no OpenWRT login", server.name))
    })?;
    let password = openwrt.password.as_deref().ok_or_else(|| {
        BackendError::Config(format!("server '{}' has no OpenWRT password", server.name))
    })?;
    let router = Url::parse(server.api_url.trim())?;
    let location = UciLocation::for_server(server.kind, openwrt);

    let mut ubus = UbusClient::new(&router)?;
    ubus.login(&openwrt.username, password).await?;

    let port = ubus
        .uci_get(&location.config, &location.section, &location.port_option)
        .await?
        .ok_or_else(|| {
            BackendError::Config(format!(
                "{}.{}.{} is not set on the router",
                location.config, location.section, location.port_option
            ))
        })?;
    let port: u16 = port
        .parse()
        .map_err(|_| BackendError::Decode(format!("invalid controller port '{}'", port)))?;
    let secret = ubus
        .uci_get(&location.config, &location.section, &location.secret_option)
        .await?;

    let api_url = controller_url(&router, port)?;
    tracing::info!(server = %server.name, %api_url, "controller found on router");
    Ok(ControllerEndpoint { api_url, secret })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(raw: Value) -> RpcResponse {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_parse_ok_result() {
        let value = parse_call_result(response(json!({
            "jsonrpc": "2.0", "id": 1, "result": [0, {"value": "9090"}]
        })))
        .unwrap();
        assert_eq!(value.unwrap()["value"], "9090");
    }

    #[test]
    fn test_parse_status_codes() {
        let missing = parse_call_result(response(json!({"result": [4]}))).unwrap();
        assert!(missing.is_none());

        let denied = parse_call_result(response(json!({"result": [6]})));
        assert!(matches!(denied, Err(BackendError::Auth(_))));

        let rejected = parse_call_result(response(json!({
            "error": {"code": -32002, "message": "Access denied"}
        })));
        assert!(matches!(rejected, Err(BackendError::Auth(_))));

        let garbage = parse_call_result(response(json!({"result": "nope"})));
        assert!(matches!(garbage, Err(BackendError::Decode(_))));
    }

    #[test]
    fn test_controller_url() {
        let router = Url::parse("https://192.168.1.1/cgi-bin/luci").unwrap();
        assert_eq!(controller_url(&router, 9090).unwrap(), "http://192.168.1.1:9090");

        let router = Url::parse("http://[fd00::1]").unwrap();
        assert_eq!(controller_url(&router, 6171).unwrap(), "http://[fd00::1]:6171");
    }

    #[test]
    fn test_uci_location_defaults_and_overrides() {
        let mut openwrt = OpenWrtConfig {
            username: "root".into(),
            password: Some("pw".into()),
            uci_config: None,
            uci_section: None,
            port_option: None,
            secret_option: None,
        };
        let clash = UciLocation::for_server(BackendKind::OpenwrtClash, &openwrt);
        assert_eq!(clash.config, "openclash");
        assert_eq!(clash.port_option, "cn_port");

        openwrt.uci_config = Some("nikki".into());
        openwrt.port_option = Some("api_port".into());
        let custom = UciLocation::for_server(BackendKind::OpenwrtClash, &openwrt);
        assert_eq!(custom.config, "nikki");
        assert_eq!(custom.section, "config");
        assert_eq!(custom.port_option, "api_port");
    }

    #[test]
    fn test_ubus_endpoint() {
        let router = Url::parse("http://192.168.1.1").unwrap();
        let ubus = UbusClient::new(&router).unwrap();
        assert_eq!(ubus.endpoint.as_str(), "http://192.168.1.1/ubus");
    }

    #[tokio::test]
    async fn test_missing_login_is_config_error() {
        let server = ServerConfig::new("router", BackendKind::OpenwrtClash, "http://192.168.1.1");
        let result = resolve_controller(&server).await;
        assert!(matches!(result, Err(BackendError::Config(_))));
    }
}
