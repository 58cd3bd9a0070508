//! Configuration Loader
//!
//! Environment-aware loading: `processes.toml`, then `processes.{environment}.toml`
//! from the configuration directory, then `PROCESSES__SECTION__KEY` environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::ProcessesConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "PROCESSES";
const BASE_FILE_NAME: &str = "processes";

pub struct ConfigManager {
    config: ProcessesConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Avoids touching process-wide environment variables in tests.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading process engine configuration"
        );

        let base = config_directory.join(format!("{BASE_FILE_NAME}.toml"));
        let overrides = config_directory.join(format!("{BASE_FILE_NAME}.{environment}.toml"));

        let builder = Config::builder()
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overrides).format(FileFormat::Toml).required(false));
        let config = Self::finish(builder, environment)?;

        info!(
            environment = environment,
            max_connections = config.database.max_connections,
            poll_interval_ms = config.worker.poll_interval_ms,
            lock_expiry_seconds = config.worker.lock_expiry_seconds,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Load a single, required configuration file plus environment variable overrides
    pub fn load_from_file(path: &Path) -> ConfigResult<ProcessesConfig> {
        if !path.is_file() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let builder = Config::builder().add_source(
            File::from(path.to_path_buf())
                .format(FileFormat::Toml)
                .required(true),
        );
        Self::finish(builder, &Self::detect_environment())
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        environment: &str,
    ) -> ConfigResult<ProcessesConfig> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let config: ProcessesConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn config(&self) -> &ProcessesConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment from `PROCESSES_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("PROCESSES_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
