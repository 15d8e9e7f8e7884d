use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "LOG_COLLECTOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Locations and patterns file
    pub catalog_path: PathBuf,

    /// Event buffer capacity
    pub max_results: usize,

    /// Stage-1 workers (0 = auto based on CPU)
    pub scan_workers: usize,

    /// Stage-2 workers (0 = auto based on CPU)
    pub process_workers: usize,

    /// How long a stage may go without finishing a task, e.g. "60s"
    pub shutdown_grace: String,

    /// SFTP connect and read timeout
    pub remote_timeout: String,

    /// Package every listed file, matched or not
    pub package_all: bool,

    /// Persist the stage hand-off here when set
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let catalog_path = dirs::config_dir()
            .map(|d| d.join("log-collector").join("catalog.toml"))
            .unwrap_or_else(|| PathBuf::from("catalog.toml"));

        Self {
            port: 8888,
            catalog_path,
            max_results: 1000,
            scan_workers: 0,
            process_workers: 0,
            shutdown_grace: "60s".to_string(),
            remote_timeout: "30s".to_string(),
            package_all: false,
            checkpoint_path: None,
        }
    }
}

impl Config {
    /// Defaults, then `log-collector.{toml,json,yaml}` (or `$LOG_COLLECTOR_CONFIG`),
    /// then `LOG_COLLECTOR_*` variables, `.env` included
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = std::env::var(format!("{}_CONFIG", ENV_PREFIX))
            .unwrap_or_else(|_| "log-collector".to_string());

        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name(&file).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.shutdown_grace)
            .with_context(|| format!("Invalid shutdown_grace '{}'", self.shutdown_grace))?;
        humantime::parse_duration(&self.remote_timeout)
            .with_context(|| format!("Invalid remote_timeout '{}'", self.remote_timeout))?;
        if self.max_results == 0 {
            anyhow::bail!("max_results must be at least 1");
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(60))
    }

    pub fn remote_timeout(&self) -> Duration {
        humantime::parse_duration(&self.remote_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn effective_scan_workers(&self) -> usize {
        auto_workers(self.scan_workers)
    }

    pub fn effective_process_workers(&self) -> usize {
        auto_workers(self.process_workers)
    }
}

/// Available parallelism x 2 when unset
pub fn auto_workers(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get() * 2
    } else {
        requested
    }
}
