//! Runtime configuration: the `smithers.toml` file plus environment
//! overrides, bridged into `EngineOptions`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;

const CONFIG_FILE: &str = "smithers.toml";
const DATA_DIR: &str = ".smithers";

/// Settings for one project. Every field has a default, so a project with
/// no config file still runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmithersConfig {
    /// Database file; `:memory:` is supported for dry runs.
    pub db_path: PathBuf,
    /// Name recorded on execution rows.
    pub execution_name: String,
    /// Minimum delay between two iteration advances of the same loop.
    pub iteration_timeout_ms: Option<u64>,
    /// Directory for captured reports and transcripts.
    pub report_dir: Option<PathBuf>,
}

impl Default for SmithersConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DATA_DIR).join("state.db"),
            execution_name: "workflow".to_string(),
            iteration_timeout_ms: None,
            report_dir: None,
        }
    }
}

impl SmithersConfig {
    /// Load `smithers.toml` from the project directory (defaults when
    /// absent), then apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(db) = std::env::var("SMITHERS_DB_PATH") {
            config.db_path = PathBuf::from(db);
        }
        if let Ok(timeout) = std::env::var("SMITHERS_ITERATION_TIMEOUT_MS") {
            config.iteration_timeout_ms = timeout.parse().ok();
        }

        if config.db_path.is_relative() && config.db_path != Path::new(":memory:") {
            config.db_path = project_dir.join(&config.db_path);
        }
        Ok(config)
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == Path::new(":memory:")
    }

    /// Create the data and report directories.
    pub fn ensure_directories(&self) -> Result<()> {
        if !self.is_in_memory() {
            if let Some(parent) = self.db_path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create data directory")?;
            }
        }
        if let Some(report_dir) = &self.report_dir {
            std::fs::create_dir_all(report_dir).context("Failed to create report directory")?;
        }
        Ok(())
    }

    /// Engine options seeded from this config; adapters are registered by
    /// the caller.
    pub fn engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions::default().with_name(self.execution_name.clone());
        if let Some(ms) = self.iteration_timeout_ms {
            options = options.with_iteration_timeout(Duration::from_millis(ms));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = tempdir().unwrap();
        let config = SmithersConfig::load(dir.path()).unwrap();
        assert!(config.db_path.ends_with(".smithers/state.db"));
        assert_eq!(config.execution_name, "workflow");
        assert!(config.iteration_timeout_ms.is_none());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("smithers.toml"),
            "db_path = \"runs/wf.db\"\nexecution_name = \"nightly\"\niteration_timeout_ms = 250\n",
        )
        .unwrap();

        let config = SmithersConfig::load(dir.path()).unwrap();
        assert!(config.db_path.ends_with("runs/wf.db"));
        assert_eq!(config.execution_name, "nightly");
        assert_eq!(config.iteration_timeout_ms, Some(250));
    }

    #[test]
    fn memory_path_is_not_joined_to_project_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("smithers.toml"), "db_path = \":memory:\"\n").unwrap();
        let config = SmithersConfig::load(dir.path()).unwrap();
        assert!(config.is_in_memory());
    }

    #[test]
    fn engine_options_carry_the_iteration_timeout() {
        let config = SmithersConfig {
            iteration_timeout_ms: Some(100),
            ..Default::default()
        };
        let options = config.engine_options();
        assert_eq!(options.iteration_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn ensure_directories_creates_data_dir() {
        let dir = tempdir().unwrap();
        let config = SmithersConfig {
            db_path: dir.path().join(".smithers/state.db"),
            report_dir: Some(dir.path().join("reports")),
            ..Default::default()
        };
        config.ensure_directories().unwrap();
        assert!(dir.path().join(".smithers").exists());
        assert!(dir.path().join("reports").exists());
    }
}
