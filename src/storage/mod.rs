use crate::collect::{Location, LogPattern};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Read-only lookup of configured locations
pub trait LocationLookup: Send + Sync {
    fn get_by_code(&self, code: &str) -> Option<Location>;
}

/// Read-only lookup of log patterns
pub trait PatternLookup: Send + Sync {
    fn get_by_code(&self, code: &str) -> Option<LogPattern>;
    fn get_all(&self) -> Vec<LogPattern>;
}

/// Locations and patterns loaded from a catalog file (TOML, JSON or YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub patterns: Vec<LogPattern>,
}

impl Catalog {
    pub fn new(locations: Vec<Location>, patterns: Vec<LogPattern>) -> Self {
        Self { locations, patterns }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let catalog: Catalog = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("Failed to read catalog {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("Invalid catalog {}", path.display()))?;

        info!(
            "Loaded catalog {}: {} locations, {} patterns",
            path.display(),
            catalog.locations.len(),
            catalog.patterns.len()
        );

        Ok(catalog)
    }
}

impl LocationLookup for Catalog {
    fn get_by_code(&self, code: &str) -> Option<Location> {
        self.locations.iter().find(|l| l.code == code).cloned()
    }
}

impl PatternLookup for Catalog {
    fn get_by_code(&self, code: &str) -> Option<LogPattern> {
        self.patterns.iter().find(|p| p.code == code).cloned()
    }

    fn get_all(&self) -> Vec<LogPattern> {
        self.patterns.clone()
    }
}
