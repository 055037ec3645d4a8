use std::path::PathBuf;

use store_backup::config::Config;

/// Process settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    /// TOML pipeline config; when unset the default layout under `data_dir` is used
    pub config_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub log_level: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3100),
            config_path: std::env::var("STORE_BACKUP_CONFIG").ok().map(PathBuf::from),
            data_dir: PathBuf::from(
                std::env::var("STORE_BACKUP_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }

    /// Load and validate the pipeline configuration.
    pub fn pipeline(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => {
                let config = Config::for_data_dir(&self.data_dir);
                config.validate()?;
                config
            }
        };
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        Ok(config)
    }
}
