use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendError, BackendKind, BackendResult};
use crate::topology::ListOptions;

fn default_poll_interval_ms() -> u64 {
    2000
}

/// Router login used to discover a controller hosted on OpenWRT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWrtConfig {
    #[serde(default = "OpenWrtConfig::default_username")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// UCI package holding the controller settings (defaults per backend kind)
    #[serde(default)]
    pub uci_config: Option<String>,

    #[serde(default)]
    pub uci_section: Option<String>,

    #[serde(default)]
    pub port_option: Option<String>,

    #[serde(default)]
    pub secret_option: Option<String>,
}

impl OpenWrtConfig {
    fn default_username() -> String {
        "root".to_string()
    }
}

/// One managed controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,

    pub kind: BackendKind,

    /// Controller URL, or the router URL for OpenWRT kinds
    pub api_url: String,

    /// Clash secret or Surge API key
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default)]
    pub openwrt: Option<OpenWrtConfig>,

    /// Interval for backends without a push stream
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, kind: BackendKind, api_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            api_url: api_url.into(),
            secret: None,
            openwrt: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    /// Check the entry is usable before any network call is made.
    pub fn validate(&self) -> BackendResult<()> {
        let url = self.api_url.trim();
        if url.is_empty() {
            return Err(BackendError::Config(format!(
                "server '{}' has no controller URL",
                self.name
            )));
        }
        url::Url::parse(url).map_err(|e| {
            BackendError::Config(format!("server '{}' has an invalid URL: {}", self.name, e))
        })?;

        if self.kind.is_openwrt() {
            let has_login = self
                .openwrt
                .as_ref()
                .map(|o| !o.username.is_empty() && o.password.is_some())
                .unwrap_or(false);
            if !has_login {
                return Err(BackendError::Config(format!(
                    "server '{}' needs OpenWRT username and password",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Latency probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub test_url: String,
    pub node_timeout_ms: u64,
    pub group_timeout_ms: u64,
    /// Upper bound on concurrent group tests during a stale retest
    pub max_concurrent_group_tests: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            test_url: "http://www.gstatic.com/generate_204".to_string(),
            node_timeout_ms: 5000,
            group_timeout_ms: 30000,
            max_concurrent_group_tests: 4,
        }
    }
}

/// proxydash application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Name of the server used when none is given on the command line
    #[serde(default)]
    pub current_server: Option<String>,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Member list preferences
    #[serde(default)]
    pub list: ListOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerConfig::new(
                "local",
                BackendKind::Clash,
                "http://127.0.0.1:9090",
            )],
            current_server: Some("local".to_string()),
            probe: ProbeConfig::default(),
            list: ListOptions::default(),
        }
    }
}

impl AppConfig {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join("proxydash").join("config.yaml"))
    }

    /// Load configuration from the default path, or defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Merge command line arguments into config.
    ///
    /// `server` picks the entry; the remaining flags override that entry,
    /// creating it when no entry has that name yet.
    pub fn merge_cli(
        &mut self,
        server: Option<String>,
        kind: Option<BackendKind>,
        api_url: Option<String>,
        secret: Option<String>,
    ) {
        if let Some(name) = server {
            self.current_server = Some(name);
        }
        if kind.is_none() && api_url.is_none() && secret.is_none() {
            return;
        }

        let name = self
            .current_server
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let index = match self.servers.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.servers.push(ServerConfig::new(
                    name.clone(),
                    kind.unwrap_or(BackendKind::Clash),
                    String::new(),
                ));
                self.servers.len() - 1
            }
        };
        self.current_server = Some(name);

        let entry = &mut self.servers[index];
        if let Some(kind) = kind {
            entry.kind = kind;
        }
        if let Some(url) = api_url {
            entry.api_url = url;
        }
        if let Some(s) = secret {
            entry.secret = Some(s);
        }
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// The selected server, falling back to the first entry
    pub fn current(&self) -> Result<&ServerConfig> {
        match &self.current_server {
            Some(name) => self
                .server(name)
                .ok_or_else(|| anyhow::anyhow!("Server '{}' not found in configuration", name)),
            None => self
                .servers
                .first()
                .ok_or_else(|| anyhow::anyhow!("No servers configured")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        let server = config.current().unwrap();
        assert_eq!(server.api_url, "http://127.0.0.1:9090");
        assert_eq!(server.kind, BackendKind::Clash);
        assert_eq!(server.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.probe.node_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_yaml() {
        let raw = r#"
servers:
  - name: mac
    kind: surge
    api_url: http://192.168.1.20:6171
    secret: abc
  - name: router
    kind: openwrt-clash
    api_url: http://192.168.1.1
    openwrt:
      password: hunter2
current_server: router
list:
  sort: latency-asc
  hide_unavailable: true
"#;
        let config: AppConfig = serde_yaml::from_str(raw).unwrap();
        let router = config.current().unwrap();
        assert_eq!(router.kind, BackendKind::OpenwrtClash);
        assert_eq!(router.openwrt.as_ref().unwrap().username, "root");
        assert!(router.validate().is_ok());
        assert_eq!(config.server("mac").unwrap().poll_interval_ms, 2000);
        assert!(config.list.hide_unavailable);
        assert_eq!(config.probe, ProbeConfig::default());
    }

    #[test]
    fn test_merge_cli_overrides_selected() {
        let mut config = AppConfig::default();
        config.merge_cli(None, None, Some("http://10.0.0.2:9090".into()), Some("s".into()));
        let server = config.current().unwrap();
        assert_eq!(server.name, "local");
        assert_eq!(server.api_url, "http://10.0.0.2:9090");
        assert_eq!(server.secret.as_deref(), Some("s"));

        config.merge_cli(
            Some("mac".into()),
            Some(BackendKind::Surge),
            Some("http://10.0.0.3:6171".into()),
            None,
        );
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.current().unwrap().kind, BackendKind::Surge);
    }

    #[test]
    fn test_validate_rejects_missing_pieces() {
        let empty = ServerConfig::new("x", BackendKind::Clash, "  ");
        assert!(matches!(empty.validate(), Err(BackendError::Config(_))));

        let router = ServerConfig::new("r", BackendKind::OpenwrtSurge, "http://192.168.1.1");
        assert!(matches!(router.validate(), Err(BackendError::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let path = std::env::temp_dir()
            .join(format!("proxydash-test-{}", std::process::id()))
            .join("config.yaml");
        let mut config = AppConfig::default();
        config.probe.max_concurrent_group_tests = 2;
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
