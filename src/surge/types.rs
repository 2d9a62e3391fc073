use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::monitor::{ConnectionEntry, ConnectionMetadata, ConnectionSnapshot};

/// Response of GET /v1/requests/active
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveRequests {
    #[serde(default)]
    pub requests: Vec<SurgeRequest>,
}

/// One request as Surge reports it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SurgeRequest {
    pub id: u64,
    pub remote_host: Option<String>,
    pub remote_address: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    pub source_address: Option<String>,
    pub source_port: Option<u16>,
    pub method: String,
    pub policy_name: String,
    pub rule: String,
    pub in_bytes: u64,
    pub out_bytes: u64,
    /// Seconds since the Unix epoch
    pub start_date: f64,
    pub process_path: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Split `host:port`, `[v6]:port` or a bare host.
pub fn split_host_port(raw: &str) -> (&str, Option<u16>) {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match raw.rsplit_once(':') {
        // more than one colon without brackets is a bare IPv6 address
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (raw, None),
        },
        _ => (raw, None),
    }
}

/// Drop the trailing annotation Surge appends, e.g. `1.2.3.4:443 (Proxy)`.
pub fn clean_remote_address(raw: &str) -> &str {
    raw.split_once(" (")
        .map(|(address, _)| address)
        .unwrap_or(raw)
        .trim()
}

impl SurgeRequest {
    fn parsed_url(&self) -> Option<Url> {
        non_empty(&self.url).and_then(|raw| Url::parse(raw).ok())
    }

    /// Explicit remote host, then URL host, then cleaned remote address.
    pub fn destination_host(&self) -> String {
        if let Some(host) = non_empty(&self.remote_host) {
            return split_host_port(host).0.to_string();
        }
        if let Some(host) = self.parsed_url().and_then(|u| u.host_str().map(str::to_string)) {
            return host.trim_matches(|c| c == '[' || c == ']').to_string();
        }
        if let Some(address) = non_empty(&self.remote_address) {
            let (host, _) = split_host_port(clean_remote_address(address));
            if !host.is_empty() {
                return host.to_string();
            }
        }
        "unknown".to_string()
    }

    /// URL port, remote host port, remote address port, then scheme default.
    pub fn destination_port(&self) -> u16 {
        let url = self.parsed_url();
        if let Some(port) = url.as_ref().and_then(Url::port) {
            return port;
        }
        if let Some(port) = non_empty(&self.remote_host).and_then(|h| split_host_port(h).1) {
            return port;
        }
        if let Some(port) = non_empty(&self.remote_address)
            .and_then(|a| split_host_port(clean_remote_address(a)).1)
        {
            return port;
        }
        match url.as_ref().map(Url::scheme) {
            Some("https") | Some("wss") => 443,
            _ => 80,
        }
    }

    fn destination_ip(&self) -> String {
        non_empty(&self.remote_address)
            .map(|a| split_host_port(clean_remote_address(a)).0)
            .filter(|host| host.parse::<IpAddr>().is_ok())
            .unwrap_or_default()
            .to_string()
    }

    pub fn into_entry(self) -> ConnectionEntry {
        let network = if self.method.eq_ignore_ascii_case("udp") {
            "udp"
        } else {
            "tcp"
        };
        let start = DateTime::from_timestamp_millis((self.start_date * 1000.0) as i64)
            .unwrap_or_else(Utc::now);
        let (source_ip, embedded_port) = non_empty(&self.source_address)
            .map(|a| {
                let (host, port) = split_host_port(a);
                (host.to_string(), port)
            })
            .unwrap_or_default();

        let metadata = ConnectionMetadata {
            network: network.to_string(),
            conn_type: self.method.clone(),
            source_ip,
            destination_ip: self.destination_ip(),
            source_port: self.source_port.or(embedded_port).unwrap_or(0),
            destination_port: self.destination_port(),
            host: self.destination_host(),
            process_path: non_empty(&self.process_path).map(str::to_string),
        };

        ConnectionEntry {
            id: self.id.to_string(),
            metadata,
            upload: self.out_bytes,
            download: self.in_bytes,
            start,
            chains: if self.policy_name.is_empty() {
                Vec::new()
            } else {
                vec![self.policy_name]
            },
            rule: self.rule,
            rule_payload: String::new(),
        }
    }
}

impl ActiveRequests {
    /// Normalize into a snapshot; totals are summed over the active requests.
    pub fn into_snapshot(self) -> ConnectionSnapshot {
        let connections: Vec<ConnectionEntry> =
            self.requests.into_iter().map(SurgeRequest::into_entry).collect();
        ConnectionSnapshot {
            upload_total: connections.iter().map(|c| c.upload).sum(),
            download_total: connections.iter().map(|c| c.download).sum(),
            connections,
        }
    }
}

/// Response of GET /v1/policies
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyList {
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(rename = "policy-groups", default)]
    pub policy_groups: Vec<String>,
}

/// Member entry of GET /v1/policy_groups
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyMember {
    pub name: String,
    pub type_description: String,
    pub line_hash: Option<String>,
    pub enabled: Option<bool>,
    pub is_group: bool,
}

pub type PolicyGroups = HashMap<String, Vec<PolicyMember>>;

/// Response of GET /v1/policy_groups/select
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSelection {
    pub policy: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectRequest<'a> {
    pub group_name: &'a str,
    pub policy: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupTestRequest<'a> {
    pub group_name: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyTestRequest<'a> {
    pub policy_names: Vec<&'a str>,
    pub url: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillRequest {
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        remote_host: Option<&str>,
        url: Option<&str>,
        remote_address: Option<&str>,
    ) -> SurgeRequest {
        SurgeRequest {
            id: 7,
            remote_host: remote_host.map(str::to_string),
            url: url.map(str::to_string),
            remote_address: remote_address.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:8443"), ("example.com", Some(8443)));
        assert_eq!(split_host_port("[2001:db8::1]:443"), ("2001:db8::1", Some(443)));
        assert_eq!(split_host_port("2001:db8::1"), ("2001:db8::1", None));
        assert_eq!(split_host_port("example.com"), ("example.com", None));
    }

    #[test]
    fn test_host_priority() {
        let req = request(
            Some("api.example.com:8443"),
            Some("https://cdn.example.com/x"),
            Some("1.2.3.4:443"),
        );
        assert_eq!(req.destination_host(), "api.example.com");

        let req = request(None, Some("https://cdn.example.com/x"), Some("1.2.3.4:443"));
        assert_eq!(req.destination_host(), "cdn.example.com");

        let req = request(Some(""), None, Some("1.2.3.4:443 (Proxy)"));
        assert_eq!(req.destination_host(), "1.2.3.4");

        assert_eq!(request(None, None, None).destination_host(), "unknown");
    }

    #[test]
    fn test_port_priority() {
        let req = request(Some("a.com:8443"), Some("https://a.com:9443/"), Some("1.2.3.4:443"));
        assert_eq!(req.destination_port(), 9443);

        let req = request(Some("a.com:8443"), Some("https://a.com/"), Some("1.2.3.4:443"));
        assert_eq!(req.destination_port(), 8443);

        let req = request(Some("a.com"), None, Some("1.2.3.4:5222 (DIRECT)"));
        assert_eq!(req.destination_port(), 5222);

        assert_eq!(request(None, Some("https://a.com/"), None).destination_port(), 443);
        assert_eq!(request(None, Some("http://a.com/"), None).destination_port(), 80);
    }

    #[test]
    fn test_active_requests_into_snapshot() {
        let raw = r#"{"requests": [{
            "id": 42, "remoteHost": "example.com:443", "remoteAddress": "93.184.216.34:443 (Proxy)",
            "URL": "https://example.com/", "method": "TCP", "policyName": "HK-01",
            "rule": "DOMAIN-SUFFIX example.com", "inBytes": 2048, "outBytes": 512,
            "startDate": 1700000000.25, "sourceAddress": "192.168.1.5", "sourcePort": 50122
        }]}"#;
        let active: ActiveRequests = serde_json::from_str(raw).unwrap();
        let snapshot = active.into_snapshot();
        assert_eq!(snapshot.download_total, 2048);
        let entry = &snapshot.connections[0];
        assert_eq!(entry.id, "42");
        assert_eq!(entry.upload, 512);
        assert_eq!(entry.metadata.host, "example.com");
        assert_eq!(entry.metadata.destination_ip, "93.184.216.34");
        assert_eq!(entry.metadata.destination_port, 443);
        assert_eq!(entry.metadata.source_port, 50122);
        assert_eq!(entry.chains, vec!["HK-01"]);
    }
}
