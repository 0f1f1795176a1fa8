use std::path::{Path, PathBuf};

use migrun_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const LOCAL_CANDIDATES: [&str; 3] = ["migrun.yml", "migrun.yaml", "migrun.toml"];

/// Locates and parses the configuration file, then applies environment
/// overrides (`MIGRUN_DATABASE`, `MIGRUN_MIGRATIONS_DIR`, `MIGRUN_APPLIED_BY`).
#[derive(Debug, Default)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of searching. A missing explicit file is an error.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<AppConfig> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let mut config = match self.resolve_path()? {
            Some(path) => {
                info!("loading config from {}", path.display());
                Self::load_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                AppConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());
        config.runner.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit_path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        let mut candidates: Vec<PathBuf> = LOCAL_CANDIDATES.iter().map(PathBuf::from).collect();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("migrun").join("config.yml"));
        }
        Ok(candidates.into_iter().find(|p| p.is_file()))
    }
}

fn apply_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup("MIGRUN_DATABASE").filter(|v| !v.is_empty()) {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dir) = lookup("MIGRUN_MIGRATIONS_DIR").filter(|v| !v.is_empty()) {
        config.migrations.dir = PathBuf::from(dir);
    }
    if let Some(who) = lookup("MIGRUN_APPLIED_BY").filter(|v| !v.is_empty()) {
        config.runner.applied_by = Some(who);
    }
}
