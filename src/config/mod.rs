//! Configuration and credential storage

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::Credential;

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST base URL of the chat server
    pub server_url: String,
    /// Event channel URL; derived from `server_url` when unset
    pub socket_url: Option<String>,
    /// Signed-in user's id (from last login)
    pub user_id: Option<String>,
    /// Signed-in user's display name (from last login)
    pub user_name: Option<String>,
    /// Stored session credential
    pub credential: Option<Credential>,
    /// Sync tunables
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            socket_url: None,
            user_id: None,
            user_name: None,
            credential: None,
            sync: SyncSettings::default(),
        }
    }
}

/// Timing and bounds for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub typing_expiry_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub backoff_cap_ms: u64,
    pub pending_buffer_limit: usize,
    pub pending_buffer_ttl_secs: u64,
    pub heartbeat_secs: u64,
    /// How often typing flags and the pending buffer are swept.
    pub tick_ms: u64,
    /// Conversation page size fetched with each snapshot.
    pub page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            typing_expiry_secs: 10,
            backoff_base_ms: 1000,
            backoff_factor: 2,
            backoff_cap_ms: 30_000,
            pending_buffer_limit: 50,
            pending_buffer_ttl_secs: 5,
            heartbeat_secs: 25,
            tick_ms: 500,
            page_size: 50,
        }
    }
}

impl SyncSettings {
    pub fn typing_expiry(&self) -> Duration {
        Duration::from_secs(self.typing_expiry_secs)
    }

    pub fn pending_buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_buffer_ttl_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "chat-sync", "chat-sync")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::from_toml(&content)
    }

    fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the session token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Absolute URL for a REST path such as `/api/contacts`.
    pub fn rest_url(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server_url: {}", self.server_url))?;
        base.join(path)
            .with_context(|| format!("Invalid API path: {}", path))
    }

    /// Event channel URL: the configured one, or `server_url` with a
    /// `ws`/`wss` scheme and a `/ws` path.
    pub fn socket_url(&self) -> Result<Url> {
        if let Some(ref url) = self.socket_url {
            return Url::parse(url).with_context(|| format!("Invalid socket_url: {}", url));
        }
        let mut url = self.rest_url("/ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot derive socket URL from {}", self.server_url))?;
        Ok(url)
    }

    pub fn set_session(&mut self, credential: Credential, user_id: String, user_name: Option<String>) {
        self.credential = Some(credential);
        self.user_id = Some(user_id);
        self.user_name = user_name;
    }

    pub fn clear_session(&mut self) {
        self.credential = None;
        self.user_id = None;
        self.user_name = None;
    }
}
