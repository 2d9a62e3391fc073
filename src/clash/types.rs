use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::topology::{Delay, DelaySample, GroupKind};

/// Proxy type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub enum ProxyType {
    Direct,
    Reject,
    #[serde(rename = "RejectDrop")]
    RejectDrop,
    Pass,
    Compatible,
    Shadowsocks,
    ShadowsocksR,
    Snell,
    Socks5,
    Http,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    WireGuard,
    Tuic,
    Ssh,
    Selector,
    Fallback,
    #[serde(rename = "URLTest")]
    URLTest,
    LoadBalance,
    Relay,
    Smart,
    #[serde(other)]
    Unknown,
}

impl ProxyType {
    pub fn group_kind(&self) -> Option<GroupKind> {
        match self {
            ProxyType::Selector => Some(GroupKind::Selector),
            ProxyType::Fallback => Some(GroupKind::Fallback),
            ProxyType::URLTest => Some(GroupKind::URLTest),
            ProxyType::LoadBalance => Some(GroupKind::LoadBalance),
            ProxyType::Relay => Some(GroupKind::Relay),
            ProxyType::Smart => Some(GroupKind::Smart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Direct => "Direct",
            ProxyType::Reject => "Reject",
            ProxyType::RejectDrop => "RejectDrop",
            ProxyType::Pass => "Pass",
            ProxyType::Compatible => "Compatible",
            ProxyType::Shadowsocks => "Shadowsocks",
            ProxyType::ShadowsocksR => "ShadowsocksR",
            ProxyType::Snell => "Snell",
            ProxyType::Socks5 => "Socks5",
            ProxyType::Http => "Http",
            ProxyType::Vmess => "Vmess",
            ProxyType::Vless => "Vless",
            ProxyType::Trojan => "Trojan",
            ProxyType::Hysteria => "Hysteria",
            ProxyType::Hysteria2 => "Hysteria2",
            ProxyType::WireGuard => "WireGuard",
            ProxyType::Tuic => "Tuic",
            ProxyType::Ssh => "Ssh",
            ProxyType::Selector => "Selector",
            ProxyType::Fallback => "Fallback",
            ProxyType::URLTest => "URLTest",
            ProxyType::LoadBalance => "LoadBalance",
            ProxyType::Relay => "Relay",
            ProxyType::Smart => "Smart",
            ProxyType::Unknown => "Unknown",
        }
    }
}

/// Proxy node or group
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Proxy {
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub name: String,
    pub now: Option<String>,
    pub all: Option<Vec<String>>,
    pub history: Option<Vec<DelayHistory>>,
    pub alive: Option<bool>,
    pub udp: Option<bool>,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            proxy_type: ProxyType::Unknown,
            name: String::new(),
            now: None,
            all: None,
            history: None,
            alive: None,
            udp: None,
        }
    }
}

impl Proxy {
    /// Latest sample; Clash records a failed test as delay 0.
    pub fn last_delay(&self) -> Delay {
        self.history
            .as_ref()
            .and_then(|history| history.last())
            .map(|entry| Delay::from_raw(i64::from(entry.delay)))
            .unwrap_or(Delay::NO_DATA)
    }

    pub fn samples(&self) -> Vec<DelaySample> {
        self.history
            .iter()
            .flatten()
            .filter_map(|entry| {
                let at = DateTime::parse_from_rfc3339(&entry.time).ok()?;
                Some(DelaySample {
                    at: at.with_timezone(&Utc),
                    delay: Delay::from_raw(i64::from(entry.delay)),
                })
            })
            .collect()
    }
}

/// Delay history
#[derive(Debug, Clone, Deserialize)]
pub struct DelayHistory {
    pub time: String,
    pub delay: u32,
    #[serde(rename = "meanDelay")]
    pub mean_delay: Option<u32>,
}

/// Proxies response from GET /proxies
#[derive(Debug, Clone, Deserialize)]
pub struct ProxiesResponse {
    pub proxies: HashMap<String, Proxy>,
}

/// Provider info
#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(rename = "vehicleType", default)]
    pub vehicle_type: String,
    #[serde(default)]
    pub proxies: Vec<Proxy>,
}

/// Delay test response from GET /proxies/:name/delay
#[derive(Debug, Clone, Deserialize)]
pub struct DelayResponse {
    pub delay: u32,
}

/// Selection body for PUT /proxies/:name
#[derive(Debug, Clone, Serialize)]
pub struct SelectRequest<'a> {
    pub name: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_delay_from_history() {
        let raw = r#"{
            "type": "Trojan",
            "name": "JP-01",
            "alive": true,
            "history": [
                {"time": "2024-05-01T10:00:00Z", "delay": 210},
                {"time": "2024-05-01T10:05:00.5+08:00", "delay": 0}
            ]
        }"#;
        let proxy: Proxy = serde_json::from_str(raw).unwrap();
        assert_eq!(proxy.last_delay(), Delay::TIMED_OUT);
        assert_eq!(proxy.samples().len(), 2);
    }

    #[test]
    fn test_unknown_type_tag() {
        let proxy: Proxy = serde_json::from_str(r#"{"type": "Mieru", "name": "x"}"#).unwrap();
        assert_eq!(proxy.proxy_type, ProxyType::Unknown);
        assert_eq!(proxy.last_delay(), Delay::NO_DATA);
    }
}
