//! Configuration loading and persistence.
//!
//! Handles reading and writing the agent configuration file at
//! `~/.agent/config.json` (overridable with `--config`), with environment
//! variable overrides layered on top. A malformed file is logged and replaced
//! by built-in defaults rather than aborting startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::constants;

/// Configuration for the probe agent.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable agent identity, generated on first start and persisted.
    pub agent_id: Option<String>,
    /// Human-readable agent name. Defaults to the hostname.
    pub agent_name: String,
    /// Control-plane WebSocket URL (`ws://` or `wss://`).
    pub server_url: String,
    /// API key for the bearer header and the HMAC auth handshake.
    pub api_key: String,
    /// Client certificate for mutual TLS (PEM). Optional.
    pub cert_file: Option<PathBuf>,
    /// Client private key for mutual TLS (PEM). Optional.
    pub key_file: Option<PathBuf>,
    /// Seconds between heartbeats to the control plane.
    pub heartbeat_interval: u64,
    /// Seconds of heartbeat-send staleness that count as a miss.
    pub heartbeat_timeout: u64,
    /// Seconds between resource usage reports.
    pub resource_report_interval: u64,
    /// Maximum probe tasks in flight.
    pub max_concurrent_tasks: usize,
    /// Per-task deadline in seconds when the job carries none.
    pub default_task_timeout: u64,
    /// Results buffered before an immediate batch flush.
    pub result_batch_size: usize,
    /// Seconds between periodic batch flushes.
    pub result_batch_timeout: u64,
    /// Base URL of the update origin.
    pub update_server_url: String,
    /// Whether the update poller installs updates unattended.
    pub auto_update: bool,
    /// Seconds between automatic update checks.
    pub update_check_interval: u64,
    /// Root of the installed tree that updates replace.
    pub install_dir: PathBuf,
    /// RSA public key (PEM) for `rsa` package signatures.
    pub update_public_key_file: Option<PathBuf>,
    /// Shared secret for `hmac` package signatures.
    pub update_hmac_secret: Option<String>,

    /// Path this config was loaded from; used by [`AgentConfig::save`].
    #[serde(skip)]
    path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let agent_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "netprobe-agent".to_string());

        Self {
            agent_id: None,
            agent_name,
            server_url: "wss://localhost:8000/ws/agent".to_string(),
            api_key: String::new(),
            cert_file: None,
            key_file: None,
            heartbeat_interval: constants::HEARTBEAT_INTERVAL.as_secs(),
            heartbeat_timeout: constants::HEARTBEAT_TIMEOUT.as_secs(),
            resource_report_interval: constants::RESOURCE_REPORT_INTERVAL.as_secs(),
            max_concurrent_tasks: constants::MAX_CONCURRENT_TASKS,
            default_task_timeout: constants::DEFAULT_TASK_TIMEOUT.as_secs(),
            result_batch_size: constants::RESULT_BATCH_SIZE,
            result_batch_timeout: constants::RESULT_BATCH_TIMEOUT.as_secs(),
            update_server_url: "https://localhost:8000".to_string(),
            auto_update: false,
            update_check_interval: constants::UPDATE_CHECK_INTERVAL.as_secs(),
            install_dir: PathBuf::from("/opt/netprobe-agent"),
            update_public_key_file: None,
            update_hmac_secret: None,
            path: default_config_path(),
        }
    }
}

/// Default configuration file location: `~/.agent/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agent").join("config.json"))
        .unwrap_or_else(|| PathBuf::from(".agent/config.json"))
}

impl AgentConfig {
    /// Loads configuration from `path` (or the default location), then applies
    /// environment variable overrides.
    ///
    /// A missing or malformed file falls back to defaults; the agent must not
    /// refuse to start over a bad local config.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let mut config = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<AgentConfig>(&content) {
                Ok(config) => {
                    log::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    log::error!(
                        "Malformed config file {} ({}), using defaults",
                        path.display(),
                        e
                    );
                    AgentConfig::default()
                }
            },
            Err(_) => {
                log::info!("No config file at {}, using defaults", path.display());
                AgentConfig::default()
            }
        };

        config.path = path;
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("NETPROBE_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(key) = env::var("NETPROBE_API_KEY") {
            self.api_key = key;
        }
        if let Ok(url) = env::var("NETPROBE_UPDATE_SERVER_URL") {
            self.update_server_url = url;
        }
        if let Ok(dir) = env::var("NETPROBE_INSTALL_DIR") {
            self.install_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = env::var("NETPROBE_MAX_CONCURRENT_TASKS") {
            if let Ok(max) = raw.parse::<usize>() {
                self.max_concurrent_tasks = max;
            }
        }
        if let Ok(raw) = env::var("NETPROBE_HEARTBEAT_INTERVAL") {
            if let Ok(interval) = raw.parse::<u64>() {
                self.heartbeat_interval = interval;
            }
        }
    }

    /// Persists the configuration atomically: write to a sibling temp file,
    /// then rename over the target. Readers never observe a partial file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        // Restrictive permissions (owner read/write only) before the rename
        // makes the file visible.
        #[cfg(unix)]
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    /// Returns the persisted agent id, generating and saving one on first use.
    pub fn ensure_agent_id(&mut self) -> Result<String> {
        if let Some(ref id) = self.agent_id {
            return Ok(id.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.agent_id = Some(id.clone());
        self.save()?;
        log::info!("Generated new agent id: {}", id);
        Ok(id)
    }

    /// The path this configuration persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges a `config_update` payload into the live configuration.
    ///
    /// Only known keys are applied; unknown keys are logged and skipped.
    /// Returns the names of the keys that changed, so the caller can decide
    /// which hot-reconfigurable settings to re-apply.
    pub fn apply_update(&mut self, updates: &serde_json::Map<String, Value>) -> Vec<&'static str> {
        let mut applied = Vec::new();

        for (key, value) in updates {
            let changed = match key.as_str() {
                "agent_name" => assign_string(&mut self.agent_name, value, "agent_name"),
                "server_url" => assign_string(&mut self.server_url, value, "server_url"),
                "heartbeat_interval" => {
                    assign_u64(&mut self.heartbeat_interval, value, "heartbeat_interval")
                }
                "heartbeat_timeout" => {
                    assign_u64(&mut self.heartbeat_timeout, value, "heartbeat_timeout")
                }
                "resource_report_interval" => assign_u64(
                    &mut self.resource_report_interval,
                    value,
                    "resource_report_interval",
                ),
                "max_concurrent_tasks" => {
                    assign_usize(&mut self.max_concurrent_tasks, value, "max_concurrent_tasks")
                }
                "default_task_timeout" => {
                    assign_u64(&mut self.default_task_timeout, value, "default_task_timeout")
                }
                "result_batch_size" => {
                    assign_usize(&mut self.result_batch_size, value, "result_batch_size")
                }
                "result_batch_timeout" => {
                    assign_u64(&mut self.result_batch_timeout, value, "result_batch_timeout")
                }
                "update_server_url" => {
                    assign_string(&mut self.update_server_url, value, "update_server_url")
                }
                "auto_update" => assign_bool(&mut self.auto_update, value, "auto_update"),
                "update_check_interval" => {
                    assign_u64(&mut self.update_check_interval, value, "update_check_interval")
                }
                _ => {
                    log::warn!("Ignoring unknown config key in update: {}", key);
                    None
                }
            };

            if let Some(name) = changed {
                applied.push(name);
            }
        }

        applied
    }
}

fn assign_string(slot: &mut String, value: &Value, name: &'static str) -> Option<&'static str> {
    match value.as_str() {
        Some(s) => {
            *slot = s.to_string();
            Some(name)
        }
        None => {
            log::warn!("Config key {} expects a string, got {}", name, value);
            None
        }
    }
}

fn assign_u64(slot: &mut u64, value: &Value, name: &'static str) -> Option<&'static str> {
    match value.as_u64() {
        Some(n) if n > 0 => {
            *slot = n;
            Some(name)
        }
        _ => {
            log::warn!("Config key {} expects a positive integer, got {}", name, value);
            None
        }
    }
}

fn assign_usize(slot: &mut usize, value: &Value, name: &'static str) -> Option<&'static str> {
    match value.as_u64() {
        Some(n) if n > 0 => {
            *slot = n as usize;
            Some(name)
        }
        _ => {
            log::warn!("Config key {} expects a positive integer, got {}", name, value);
            None
        }
    }
}

fn assign_bool(slot: &mut bool, value: &Value, name: &'static str) -> Option<&'static str> {
    match value.as_bool() {
        Some(b) => {
            *slot = b;
            Some(name)
        }
        None => {
            log::warn!("Config key {} expects a boolean, got {}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval, 30);
        assert_eq!(config.heartbeat_timeout, 60);
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.result_batch_size, 10);
        assert!(!config.auto_update);
        assert!(config.agent_id.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AgentConfig::load(Some(&path));
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.path(), path);
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let config = AgentConfig::load(Some(&path));
        assert_eq!(config.heartbeat_interval, 30);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AgentConfig::load(Some(&path));
        config.server_url = "wss://control.example.com/ws/agent".to_string();
        config.max_concurrent_tasks = 4;
        config.save().unwrap();

        // The atomic rename leaves no temp file behind.
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = AgentConfig::load(Some(&path));
        assert_eq!(loaded.server_url, "wss://control.example.com/ws/agent");
        assert_eq!(loaded.max_concurrent_tasks, 4);
    }

    #[test]
    fn test_ensure_agent_id_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AgentConfig::load(Some(&path));
        let id = config.ensure_agent_id().unwrap();
        assert!(!id.is_empty());

        // Second call returns the same id, and a fresh load sees it too.
        assert_eq!(config.ensure_agent_id().unwrap(), id);
        let loaded = AgentConfig::load(Some(&path));
        assert_eq!(loaded.agent_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_apply_update_known_keys() {
        let mut config = AgentConfig::default();
        let updates = serde_json::json!({
            "heartbeat_interval": 15,
            "max_concurrent_tasks": 20,
            "auto_update": true,
        });

        let applied = config.apply_update(updates.as_object().unwrap());
        assert_eq!(config.heartbeat_interval, 15);
        assert_eq!(config.max_concurrent_tasks, 20);
        assert!(config.auto_update);
        assert_eq!(applied.len(), 3);
    }

    #[test]
    fn test_apply_update_rejects_bad_types_and_unknown_keys() {
        let mut config = AgentConfig::default();
        let updates = serde_json::json!({
            "heartbeat_interval": "soon",
            "max_concurrent_tasks": 0,
            "no_such_key": 1,
        });

        let applied = config.apply_update(updates.as_object().unwrap());
        assert!(applied.is_empty());
        assert_eq!(config.heartbeat_interval, 30);
        assert_eq!(config.max_concurrent_tasks, 10);
    }
}
