//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and
//! environment. Covers the backend endpoint and the coordination directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend endpoint settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Cross-process send coordination settings.
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

/// Backend endpoint and model defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the conversation backend (default http://127.0.0.1:8787).
    /// Overridden by PARLEY_BACKEND_URL env when set.
    pub base_url: Option<String>,

    /// Model name sent when the user does not pick one.
    pub default_model: Option<String>,
}

/// Where send claims live when consoles run as separate processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationConfig {
    /// Override the claim directory. Relative paths are resolved against the
    /// config file's parent. Default: `coordination` next to the config file
    /// (~/.parley/coordination when config is ~/.parley/config.json).
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Resolve the backend base URL: env PARLEY_BACKEND_URL overrides config.
pub fn resolve_backend_url(config: &Config) -> Option<String> {
    std::env::var("PARLEY_BACKEND_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .backend
                .base_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parley").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or PARLEY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Default claim directory when no override is set: `coordination` subdirectory
/// of the config file's parent.
pub fn coordination_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("coordination")
}

/// Resolve the claim directory: uses `config.coordination.directory` if set
/// (relative paths resolved against the config file's parent), otherwise the
/// default subdirectory.
pub fn resolve_coordination_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.coordination.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => coordination_dir(config_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_backend_url() {
        let config = Config::default();
        assert!(config.backend.base_url.is_none());
        assert!(config.coordination.directory.is_none());
    }

    #[test]
    fn resolve_coordination_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.parley/config.json");
        assert_eq!(
            resolve_coordination_dir(&config, path),
            PathBuf::from("/home/user/.parley/coordination")
        );
    }

    #[test]
    fn resolve_coordination_dir_override_relative() {
        let mut config = Config::default();
        config.coordination.directory = Some(PathBuf::from("custom/claims"));
        let path = Path::new("/home/user/.parley/config.json");
        assert_eq!(
            resolve_coordination_dir(&config, path),
            PathBuf::from("/home/user/.parley/custom/claims")
        );
    }

    #[test]
    fn resolve_coordination_dir_override_absolute() {
        let mut config = Config::default();
        config.coordination.directory = Some(PathBuf::from("/var/run/parley"));
        let path = Path::new("/home/user/.parley/config.json");
        assert_eq!(
            resolve_coordination_dir(&config, path),
            PathBuf::from("/var/run/parley")
        );
    }

    #[test]
    fn config_parses_camel_case_fields() {
        let config: Config = serde_json::from_str(
            r#"{"backend":{"baseUrl":"http://10.0.0.2:9999","defaultModel":"sous-chef"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.backend.base_url.as_deref(),
            Some("http://10.0.0.2:9999")
        );
        assert_eq!(config.backend.default_model.as_deref(), Some("sous-chef"));
    }
}
