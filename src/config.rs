//! Application configuration.
//!
//! Logging can only be switched off in development builds; release builds
//! never log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::types::{IceServerKind, ServerConfig};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence logging in a debug build.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Public STUN servers used when no custom ICE servers are configured.
/// No TURN relay is configured by default.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_SIGNAL_SEND_RETRIES: u32 = 2;
pub const DEFAULT_STORAGE_DIR: &str = "nabha-health-connect";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<ServerConfig>,

    /// How long a `disconnected` peer connection may take to recover before
    /// the call is failed
    pub disconnect_grace_secs: u64,

    /// Extra attempts for a signaling write before negotiation is aborted
    pub signal_send_retries: u32,

    /// Directory holding the local object stores and the pending-change queue
    pub storage_path: PathBuf,

    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            disconnect_grace_secs: DEFAULT_GRACE_PERIOD_SECS,
            signal_send_retries: DEFAULT_SIGNAL_SEND_RETRIES,
            storage_path: PathBuf::from(DEFAULT_STORAGE_DIR),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Read a JSON config file; missing fields fall back to defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    #[must_use]
    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, secs: u64) -> Self {
        self.disconnect_grace_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_signal_retries(mut self, retries: u32) -> Self {
        self.signal_send_retries = retries;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_ice_servers(&self.ice_servers)
    }
}

/// Rejects empty URLs and TURN servers without credentials
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(Error::config(format!(
                "ICE server `{}` has an empty URL",
                server.id
            )));
        }

        if server.kind == IceServerKind::Turn
            && (server.username.is_none() || server.credential.is_none())
        {
            return Err(Error::config(format!(
                "TURN server `{}` requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_public_stun() {
        let config = AppConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config
            .ice_servers
            .iter()
            .all(|s| s.kind == IceServerKind::Stun));
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let servers = vec![ServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("doc".into()),
            credential: None,
        }];
        assert!(matches!(
            validate_ice_servers(&servers),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "disconnect_grace_secs": 3 }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.disconnect_grace_secs, 3);
        assert_eq!(config.signal_send_retries, DEFAULT_SIGNAL_SEND_RETRIES);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn load_rejects_empty_server_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "ice_servers": [ { "id": "x", "type": "stun", "url": "" } ] }"#,
        )
        .unwrap();

        assert!(AppConfig::load(&path).is_err());
    }
}
