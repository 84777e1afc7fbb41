use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::digest::Algorithm;
use crate::core::models::{DEFAULT_CHUNK_SIZE, DEFAULT_PROGRESS_INTERVAL, JobOptions};
use crate::logging::LogConfig;

const SYSTEM_CONFIG: &str = "/etc/vericopy/config.toml";
const LOCAL_CONFIG: &str = "vericopy.toml";
const ENV_PREFIX: &str = "VERICOPY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bytes read from the source per chunk
    pub chunk_size: usize,
    /// Minimum interval between streaming progress events
    pub progress_interval_ms: u64,
    /// Digests computed when none are given on the command line
    pub algorithms: Vec<Algorithm>,
    /// Write `<basename>_file_report.csv` next to each report
    pub csv_report: bool,
    /// fsync every destination file before closing it
    pub sync_files: bool,
    pub log_json: bool,
    pub verbose: bool,
    /// Default operator name for the case metadata
    pub operator: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL.as_millis() as u64,
            algorithms: vec![Algorithm::Md5, Algorithm::Sha256],
            csv_report: false,
            sync_files: false,
            log_json: false,
            verbose: false,
            operator: String::new(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the system and local TOML files (or `config_file`
    /// in place of the local one), then `VERICOPY_*` variables, then
    /// `overrides` (typically the CLI args, with unset ones skipped).
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment =
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::file(SYSTEM_CONFIG));

        figment = match config_file {
            Some(path) => {
                if !path.is_file() {
                    bail!("Config file {} does not exist", path.display());
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(LOCAL_CONFIG)),
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.algorithms.is_empty() {
            bail!("at least one algorithm must be configured");
        }
        Ok(())
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            chunk_size: self.chunk_size,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            csv_report: self.csv_report,
            sync_files: self.sync_files,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            json: self.log_json,
            verbose: self.verbose,
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        csv_report: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        operator: Option<String>,
    }

    fn load(config_file: Option<&Path>, overrides: Option<&Overrides>) -> figment::error::Result<AppConfig> {
        AppConfig::new(config_file, overrides).map_err(|e| figment::Error::from(format!("{:#}", e)))
    }

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = load(None, None)?;
            assert_eq!(config, AppConfig::default());
            assert_eq!(config.job_options().chunk_size, DEFAULT_CHUNK_SIZE);
            Ok(())
        });
    }

    #[test]
    fn layers_apply_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "vericopy.toml",
                r#"
                chunk_size = 1024
                operator = "file"
                algorithms = ["sha1"]
                "#,
            )?;
            jail.set_env("VERICOPY_OPERATOR", "env");
            jail.set_env("VERICOPY_PROGRESS_INTERVAL_MS", "50");

            let config = load(None, None)?;
            assert_eq!(config.chunk_size, 1024);
            assert_eq!(config.algorithms, vec![Algorithm::Sha1]);
            assert_eq!(config.operator, "env");
            assert_eq!(config.job_options().progress_interval, Duration::from_millis(50));

            let config = load(
                None,
                Some(&Overrides {
                    csv_report: Some(true),
                    operator: Some("cli".into()),
                }),
            )?;
            assert!(config.csv_report);
            assert_eq!(config.operator, "cli");
            assert_eq!(config.chunk_size, 1024);
            Ok(())
        });
    }

    #[test]
    fn explicit_config_file_must_exist() {
        Jail::expect_with(|jail| {
            assert!(load(Some(Path::new("missing.toml")), None).is_err());

            jail.create_file("custom.toml", "csv_report = true")?;
            let config = load(Some(Path::new("custom.toml")), None)?;
            assert!(config.csv_report);
            Ok(())
        });
    }

    #[test]
    fn zero_chunk_size_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("VERICOPY_CHUNK_SIZE", "0");
            assert!(load(None, None).is_err());
            Ok(())
        });
    }

    #[test]
    fn config_serializes_to_toml() {
        let text = AppConfig::default().to_toml().unwrap();
        assert!(text.contains("chunk_size = 67108864"));
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }
}
