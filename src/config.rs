use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings applied when opening a [`crate::Database`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file, or `:memory:`
    pub database: PathBuf,
    /// Capacity of the per-connection prepared statement cache
    pub statement_cache_capacity: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("locostore.db"),
            statement_cache_capacity: 64,
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    /// File read by [`StoreConfig::load`] when no path is given
    pub const DEFAULT_FILE: &'static str = "locostore.toml";

    /// Default settings for the given database path
    pub fn for_path(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        is_in_memory(&self.database)
    }

    /// Read settings from a TOML file. A missing file is `Ok(None)`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Option<Self>> {
        let path = path.unwrap_or(Path::new(Self::DEFAULT_FILE));
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config = toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(config))
    }

    /// Write settings as TOML. An existing file is kept unless `force` is set.
    pub fn save(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        if !force && path.exists() {
            anyhow::bail!("{} already exists (pass force to replace it)", path.display());
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
    }
}

pub(crate) fn is_in_memory(database: &Path) -> bool {
    database.as_os_str() == ":memory:"
}

/// Create the directory that will hold `database`. In-memory stores have none.
pub fn ensure_db_dir(database: &Path) -> std::io::Result<()> {
    if is_in_memory(database) {
        return Ok(());
    }
    match database.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
