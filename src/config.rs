//! Runtime settings.
//!
//! Settings come from an optional YAML file; every key is optional and falls
//! back to the defaults below. CLI flags and environment variables override
//! the file for the handful of options exposed there.
//!
//! ```yaml
//! data_dir: /var/lib/kitprice
//! max_concurrent_fetches: 2
//! render_service: http://localhost:3000/render
//! run_timeout_secs: 900
//! ```

use crate::error::ConfigError;
use crate::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

pub const STORE_FILE: &str = "catalog.json";
pub const LEDGER_FILE: &str = "runs.jsonl";
pub const EXPORT_DIR: &str = "exports";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Holds the store snapshot, the run ledger and exports.
    pub data_dir: PathBuf,
    /// Source registry; the built-in one is used when unset.
    pub sources_file: Option<PathBuf>,
    pub max_concurrent_fetches: usize,
    /// Per-request HTTP timeout.
    pub fetch_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub run_timeout_secs: Option<u64>,
    pub retries: usize,
    pub retry_base_delay_ms: u64,
    pub page_delay_ms: u64,
    /// Pause between listing pages during image backfill.
    pub image_delay_ms: u64,
    pub refresh_interval_hours: u64,
    pub user_agent: String,
    /// External JavaScript rendering endpoint; plain HTTP when unset.
    pub render_service: Option<String>,
    /// `awful_aj` template used for model-assisted extraction.
    pub llm_template: String,
    pub max_prompt_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sources_file: None,
            max_concurrent_fetches: 4,
            fetch_timeout_secs: 30,
            source_timeout_secs: 120,
            run_timeout_secs: None,
            retries: 3,
            retry_base_delay_ms: 1_000,
            page_delay_ms: 500,
            image_delay_ms: 600,
            refresh_interval_hours: 24,
            user_agent: concat!("kitprice/", env!("CARGO_PKG_VERSION")).to_string(),
            render_service: None,
            llm_template: "product_extractor".to_string(),
            max_prompt_chars: 12_000,
        }
    }
}

impl Settings {
    /// Read `path` when given; otherwise use the defaults.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml_str(&text, path)?;
        info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        // an empty file deserializes to unit, not to an all-defaults map
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join(EXPORT_DIR)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn image_delay(&self) -> Duration {
        Duration::from_millis(self.image_delay_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_hours.max(1) * 3600)
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            source_timeout: Duration::from_secs(self.source_timeout_secs),
            run_timeout: self.run_timeout_secs.map(Duration::from_secs),
            page_delay: Duration::from_millis(self.page_delay_ms),
            max_prompt_chars: self.max_prompt_chars,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_yaml_str(
            "data_dir: /tmp/kp\nmax_concurrent_fetches: 0\nrun_timeout_secs: 60\n",
            Path::new("settings.yaml"),
        )
        .unwrap();
        assert_eq!(settings.store_path(), PathBuf::from("/tmp/kp/catalog.json"));
        assert_eq!(settings.ledger_path(), PathBuf::from("/tmp/kp/runs.jsonl"));
        assert_eq!(settings.retries, 3);

        let pipeline = settings.to_pipeline_config();
        assert_eq!(pipeline.max_concurrent_fetches, 1);
        assert_eq!(pipeline.run_timeout, Some(Duration::from_secs(60)));
        assert_eq!(pipeline.source_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_empty_and_missing() {
        assert_eq!(
            Settings::from_yaml_str("\n", Path::new("empty.yaml")).unwrap(),
            Settings::default()
        );
        assert_eq!(Settings::load(None).unwrap(), Settings::default());
        let err = Settings::load(Some(Path::new("/nonexistent/kitprice.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = Settings::from_yaml_str("max_concurrent_fetches: lots\n", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn test_refresh_interval_floor() {
        let settings = Settings {
            refresh_interval_hours: 0,
            ..Settings::default()
        };
        assert_eq!(settings.refresh_interval(), Duration::from_secs(3600));
    }
}
