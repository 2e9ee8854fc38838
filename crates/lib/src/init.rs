//! Initialize the configuration directory: create ~/.parley, the default
//! config file, and the coordination directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `coordination` subdirectory for cross-process send claims.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = b"{}";
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let coordination = config_dir.join("coordination");
    if !coordination.exists() {
        std::fs::create_dir_all(&coordination)
            .with_context(|| format!("creating coordination directory {}", coordination.display()))?;
        log::info!("created coordination directory at {}", coordination.display());
    }

    Ok(config_dir.to_path_buf())
}
