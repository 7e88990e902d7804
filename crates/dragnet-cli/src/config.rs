//! Server configuration file handling.
//!
//! `dragnet init` writes a commented default config; `dragnet serve`
//! reads it (path from `--config`, `DRAGNET_CONFIG`, or the platform
//! config dir) and falls back to defaults when no file exists.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dragnet_core::config::{
    CronConfig, DispatcherConfig, EventConfig, NodeMonitorConfig, QueueSyncConfig,
};

/// Top-level server configuration.
///
/// Engine tuning lives with the worker nodes, not here; the control
/// plane only dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DragnetConfig {
    /// Address the admin API listens on.
    pub listen_addr: SocketAddr,
    pub dispatcher: DispatcherConfig,
    pub events: EventConfig,
    pub cron: CronConfig,
    pub node_monitor: NodeMonitorConfig,
    pub queue_sync: QueueSyncConfig,
}

impl Default for DragnetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8480".parse().expect("valid default addr"),
            dispatcher: DispatcherConfig::default(),
            events: EventConfig::default(),
            cron: CronConfig::default(),
            node_monitor: NodeMonitorConfig::default(),
            queue_sync: QueueSyncConfig::default(),
        }
    }
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dragnet")
        .join("config.toml")
}

/// Resolve the config path: flag > env > default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("DRAGNET_CONFIG").map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

/// Load a config file, or defaults when the file does not exist.
pub fn load(path: &Path) -> Result<DragnetConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(DragnetConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Write the default config to `path`.
pub fn write_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered =
        toml::to_string_pretty(&DragnetConfig::default()).context("failed to render config")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("failed to write config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let rendered = toml::to_string_pretty(&DragnetConfig::default()).unwrap();
        let parsed: DragnetConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.listen_addr, DragnetConfig::default().listen_addr);
        assert_eq!(parsed.dispatcher.worker_count, 4);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: DragnetConfig = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:9000"

            [dispatcher]
            worker_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(parsed.listen_addr.port(), 9000);
        assert_eq!(parsed.dispatcher.worker_count, 8);
        assert_eq!(parsed.events.channel_capacity, 1024);
    }

    #[test]
    fn write_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        write_default(&path, false).unwrap();
        assert!(write_default(&path, false).is_err());
        write_default(&path, true).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.dispatcher.worker_count, 4);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load(Path::new("/nonexistent/dragnet.toml")).unwrap();
        assert_eq!(loaded.dispatcher.worker_count, 4);
    }
}
