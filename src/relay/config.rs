// Server configuration: defaults, optional JSON file, environment, CLI flags

use crate::relay::engine::DeliveryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the token signing secret
pub const TOKEN_SECRET_ENV: &str = "DUOCHAT_TOKEN_SECRET";

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP address to listen on; `None` disables TCP
    pub listen_addr: Option<String>,
    /// Unix socket to listen on; `None` disables it
    pub socket_path: Option<PathBuf>,
    pub database_path: PathBuf,
    /// HMAC secret shared with the token issuer
    pub token_secret: Option<String>,
    pub delivery_timeout_ms: u64,
    pub outbox_capacity: usize,
    pub max_content_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            listen_addr: Some("127.0.0.1:5000".to_string()),
            socket_path: None,
            database_path: Self::state_dir().join("messages.db"),
            token_secret: None,
            delivery_timeout_ms: delivery.delivery_timeout.as_millis() as u64,
            outbox_capacity: 256,
            max_content_len: delivery.max_content_len,
        }
    }
}

impl RelayConfig {
    /// Get the state directory
    pub fn state_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".duochat")
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// File if given, otherwise defaults; then the secret from the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Ok(secret) = std::env::var(TOKEN_SECRET_ENV) {
            if !secret.is_empty() {
                config.token_secret = Some(secret);
            }
        }

        Ok(config)
    }

    /// Check the configuration can actually serve
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_none() && self.socket_path.is_none() {
            anyhow::bail!("Nothing to listen on: set a TCP address or a socket path");
        }
        match &self.token_secret {
            Some(secret) if !secret.is_empty() => {}
            _ => anyhow::bail!(
                "No token secret configured (set {} or pass --secret)",
                TOKEN_SECRET_ENV
            ),
        }
        if self.outbox_capacity == 0 {
            anyhow::bail!("outbox_capacity must be at least 1");
        }
        if self.max_content_len == 0 {
            anyhow::bail!("max_content_len must be at least 1");
        }
        Ok(())
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            max_content_len: self.max_content_len,
        }
    }
}
