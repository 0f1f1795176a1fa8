use std::path::{Path, PathBuf};

use migrun_common::{ChangeOperation, Error, Migration, MigrationId, Result};
use serde::Deserialize;
use tracing::debug;

/// On-disk body of a migration file. The id and name come from the file name.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrationFile {
    up: Vec<ChangeOperation>,
    #[serde(default)]
    down: Option<Vec<ChangeOperation>>,
    /// Derive `down` from `up` instead of writing it out.
    #[serde(default)]
    reversible: bool,
}

/// Discovers migrations stored as `<id>_<name>.{yml,yaml,toml,json}` files.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every migration file, sorted by id.
    pub fn load(&self) -> Result<Vec<Migration>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::Config(format!(
                "failed to read migrations directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some((id, name)) = split_file_name(&path) else {
                debug!("skipping non-migration file {}", path.display());
                continue;
            };
            let id: MigrationId = id.parse().map_err(|e| {
                Error::InvalidMigration(format!("{}: {e}", path.display()))
            })?;
            migrations.push(parse_file(&path, id, name)?);
        }

        migrations.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(
            "discovered {} migrations in {}",
            migrations.len(),
            self.dir.display()
        );
        Ok(migrations)
    }
}

/// `20240105123000-2_add_person_nickname.yml` → (`20240105123000-2`, `add_person_nickname`).
fn split_file_name(path: &Path) -> Option<(&str, &str)> {
    let ext = path.extension()?.to_str()?;
    if !matches!(ext, "yml" | "yaml" | "toml" | "json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if !stem.as_bytes().first()?.is_ascii_digit() {
        return None;
    }
    stem.split_once('_')
}

fn parse_file(path: &Path, id: MigrationId, name: &str) -> Result<Migration> {
    let contents = std::fs::read_to_string(path)?;
    let invalid = |e: String| Error::InvalidMigration(format!("{}: {e}", path.display()));

    let file: MigrationFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
        Some("json") => serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
        _ => serde_yaml::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
    };

    match (file.down, file.reversible) {
        (Some(_), true) => Err(invalid(
            "set either `down` or `reversible: true`, not both".into(),
        )),
        (None, true) => Migration::new(id, name, file.up, Vec::new()).with_derived_down(),
        (down, false) => Ok(Migration::new(id, name, file.up, down.unwrap_or_default())),
    }
}
