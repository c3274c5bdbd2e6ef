//! Locating, layering and saving config files.
//!
//! Two layers are read, the second overriding the first section by section:
//! the user file (`$TETHER_CONFIG_DIR/config.toml`, else
//! `<platform config dir>/tether/config.toml`) and `./tether.toml` in the
//! working directory. Command-line flags are applied by the binary on top.

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, TetherConfig};

const USER_CONFIG_FILE: &str = "config.toml";
const PROJECT_CONFIG_FILE: &str = "tether.toml";
const CONFIG_DIR_ENV: &str = "TETHER_CONFIG_DIR";

/// One candidate file and whether it contributed to the merged config.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub loaded: bool,
}

/// Merged configuration plus a record of how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TetherConfig,
    /// Candidates in precedence order, lowest first.
    pub sources: Vec<ConfigSource>,
    /// Broken layers and out-of-range values. Loading never fails on these.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of the layers that were actually merged.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Read the user and project layers and merge them over the defaults.
pub fn load_config() -> LoadedConfig {
    load_layers(user_config_path(), PathBuf::from(PROJECT_CONFIG_FILE))
}

/// Where the user-level config file lives.
pub fn user_config_path() -> Option<PathBuf> {
    let dir = match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()?.join("tether"),
    };
    Some(dir.join(USER_CONFIG_FILE))
}

/// Write `config` as TOML, creating parent directories.
pub fn save_config(config: &TetherConfig, path: &Path) -> Result<()> {
    let write_err = |path: &Path, source| ConfigError::WriteFile {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(|e| write_err(path, e))
}

fn load_layers(user: Option<PathBuf>, project: PathBuf) -> LoadedConfig {
    let mut loaded = LoadedConfig {
        config: TetherConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };

    for path in user.into_iter().chain(Some(project)) {
        let merged = path.is_file()
            && match read_layer(&path) {
                Ok(layer) => {
                    loaded.config.merge(layer);
                    true
                }
                Err(e) => {
                    loaded.warnings.push(format!("Skipping {}: {}", path.display(), e));
                    false
                }
            };
        loaded.sources.push(ConfigSource {
            path,
            loaded: merged,
        });
    }

    if let Err(e) = loaded.config.validate() {
        loaded.warnings.push(e.to_string());
    }
    loaded
}

fn read_layer(path: &Path) -> Result<TetherConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    TetherConfig::from_toml(&text)
}
