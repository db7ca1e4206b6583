// Configuration management for the tandem CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/tandem/config.json
// - Linux: ~/.config/tandem/config.json
// - Windows: %APPDATA%\tandem\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::transport::TcpTransportConfig;
use tandem_core::SessionConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account used by `register` and `chat` when none is given
    pub username: Option<String>,

    /// Base URL of the identity service
    pub identity_url: String,

    /// WebSocket URL of the relay
    pub relay_url: String,

    /// Listen address for `tandem identity`
    pub identity_listen: SocketAddr,

    /// Listen address for `tandem relay`
    pub relay_listen: SocketAddr,

    /// Address put into our transport candidates
    pub advertise_ip: IpAddr,

    /// Sign outgoing envelopes and require signatures on incoming ones
    pub sign_envelopes: bool,

    /// Skip relay certificate verification (self-signed development relays)
    pub accept_invalid_certs: bool,

    /// Abandon a call with no answer after this many seconds
    pub answer_timeout_secs: Option<u64>,

    /// Cap on candidates buffered before the remote description arrives
    pub max_pending_candidates: Option<usize>,

    /// Storage path for private keys
    pub storage_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            identity_url: "http://127.0.0.1:3000".to_string(),
            relay_url: "wss://127.0.0.1:8080".to_string(),
            identity_listen: ([0, 0, 0, 0], 3000).into(),
            relay_listen: ([0, 0, 0, 0], 8080).into(),
            advertise_ip: [127, 0, 0, 1].into(),
            sign_envelopes: false,
            accept_invalid_certs: false,
            answer_timeout_secs: None,
            max_pending_candidates: None,
            storage_path: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("tandem");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("tandem");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where private keys live
    pub fn key_store_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("keys")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. Empty values clear optional settings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());
        match key {
            "username" => self.username = optional(value),
            "identity_url" => self.identity_url = value.trim_end_matches('/').to_string(),
            "relay_url" => {
                if !value.starts_with("ws://") && !value.starts_with("wss://") {
                    anyhow::bail!("Relay URL must start with ws:// or wss://");
                }
                self.relay_url = value.to_string();
            }
            "identity_listen" => {
                self.identity_listen = value.parse().context("Invalid socket address")?;
            }
            "relay_listen" => {
                self.relay_listen = value.parse().context("Invalid socket address")?;
            }
            "advertise_ip" => {
                self.advertise_ip = value.parse().context("Invalid IP address")?;
            }
            "sign_envelopes" => {
                self.sign_envelopes = value.parse().context("Invalid boolean value")?;
            }
            "accept_invalid_certs" => {
                self.accept_invalid_certs = value.parse().context("Invalid boolean value")?;
            }
            "answer_timeout_secs" => {
                self.answer_timeout_secs = optional(value)
                    .map(|v| v.parse())
                    .transpose()
                    .context("Invalid number")?;
            }
            "max_pending_candidates" => {
                self.max_pending_candidates = optional(value)
                    .map(|v| v.parse())
                    .transpose()
                    .context("Invalid number")?;
            }
            "storage_path" => self.storage_path = optional(value),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let unset = || "(unset)".to_string();
        vec![
            ("username".to_string(), self.username.clone().unwrap_or_else(unset)),
            ("identity_url".to_string(), self.identity_url.clone()),
            ("relay_url".to_string(), self.relay_url.clone()),
            ("identity_listen".to_string(), self.identity_listen.to_string()),
            ("relay_listen".to_string(), self.relay_listen.to_string()),
            ("advertise_ip".to_string(), self.advertise_ip.to_string()),
            ("sign_envelopes".to_string(), self.sign_envelopes.to_string()),
            ("accept_invalid_certs".to_string(), self.accept_invalid_certs.to_string()),
            (
                "answer_timeout_secs".to_string(),
                self.answer_timeout_secs.map(|s| s.to_string()).unwrap_or_else(unset),
            ),
            (
                "max_pending_candidates".to_string(),
                self.max_pending_candidates.map(|n| n.to_string()).unwrap_or_else(unset),
            ),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            answer_timeout: self.answer_timeout_secs.map(Duration::from_secs),
            max_pending_candidates: self.max_pending_candidates,
        }
    }

    pub fn transport_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            advertise_ip: self.advertise_ip,
            ..TcpTransportConfig::default()
        }
    }
}
