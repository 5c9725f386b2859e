//! Configuration for the noxt CLI: GC tuning knobs and default CLI
//! behavior, loadable from an optional TOML file and overridable by
//! flags and `NOXT_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NoxtError, Result};

pub const CONFIG_FILE_NAME: &str = "noxt.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub no_color: bool,

    #[serde(default)]
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GcConfig {
    /// Bytes allocated before the first collection.
    #[serde(default = "default_initial_heap_bytes")]
    pub initial_heap_bytes: usize,

    /// Multiplier applied to live bytes after a collection to pick
    /// the next threshold.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: usize,

    /// Force a collection on every allocation (matches `--gc-stress`).
    #[serde(default)]
    pub stress: bool,
}

fn default_initial_heap_bytes() -> usize {
    1024 * 1024
}

fn default_growth_factor() -> usize {
    2
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbose: false,
            no_color: false,
            gc: GcConfig::default(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_heap_bytes: default_initial_heap_bytes(),
            growth_factor: default_growth_factor(),
            stress: false,
        }
    }
}

impl Config {
    /// Searches the current directory, then the user config directory,
    /// for `noxt.toml`. Returns the default configuration if none is
    /// found.
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(NoxtError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| NoxtError::Config(format!("failed to parse configuration: {e}")))
    }

    fn check_current_dir_config() -> Option<PathBuf> {
        let path = PathBuf::from(CONFIG_FILE_NAME);
        path.exists().then_some(path)
    }

    fn check_user_config() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("noxt").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::check_current_dir_config().or_else(Self::check_user_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_sensible_gc_knobs() {
        let config = Config::default();
        assert_eq!(config.gc.initial_heap_bytes, 1024 * 1024);
        assert_eq!(config.gc.growth_factor, 2);
        assert!(!config.gc.stress);
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noxt.toml");
        std::fs::write(&path, "verbose = true\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(config.verbose);
        assert_eq!(config.gc.growth_factor, 2);
    }

    #[test]
    fn missing_path_is_an_error() {
        let result = Config::load_from_path(Path::new("/nonexistent/noxt.toml"));
        assert!(result.is_err());
    }
}
