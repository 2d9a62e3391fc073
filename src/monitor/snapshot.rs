use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Metadata describing one proxied connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionMetadata {
    pub network: String,
    #[serde(rename = "type")]
    pub conn_type: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(rename = "sourcePort", deserialize_with = "port_from_any")]
    pub source_port: u16,
    #[serde(rename = "destinationPort", deserialize_with = "port_from_any")]
    pub destination_port: u16,
    pub host: String,
    #[serde(rename = "processPath")]
    pub process_path: Option<String>,
}

/// One connection as reported in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub id: String,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(rename = "rulePayload", default)]
    pub rule_payload: String,
}

/// Full connection snapshot, the shape Clash pushes on `/connections`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    #[serde(rename = "uploadTotal", default)]
    pub upload_total: u64,
    #[serde(rename = "downloadTotal", default)]
    pub download_total: u64,
    // Clash sends `null` when nothing is open
    #[serde(default, deserialize_with = "null_as_empty")]
    pub connections: Vec<ConnectionEntry>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ConnectionEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ConnectionEntry>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Ports arrive as strings from Clash and as numbers elsewhere.
fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => Ok(port),
        RawPort::Text(text) if text.trim().is_empty() => Ok(0),
        RawPort::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
