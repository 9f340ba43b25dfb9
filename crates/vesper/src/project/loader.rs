//! Project Loader
//!
//! Reads configuration files from disk.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

/// Error type for project loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Extension of configuration files
const CONFIG_EXTENSION: &str = "toml";

/// Create `dir` if it does not exist yet
pub async fn ensure_dir(dir: &Path) -> Result<(), LoadError> {
    if !fs::try_exists(dir).await? {
        debug!("Creating directory {}", dir.display());
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Whether `path` names a configuration file
pub fn is_config_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(CONFIG_EXTENSION)
}

/// Absolute form of `path` that stays stable after the file is deleted
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Read and parse one configuration file; `None` when it does not exist
pub async fn read_table(path: &Path) -> Result<Option<toml::Table>, LoadError> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let content = fs::read_to_string(path).await?;
    let table = content.parse::<toml::Table>().map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(table))
}

/// Read every configuration file directly under `dir`, sorted by path.
///
/// Any unreadable or unparsable file fails the whole read.
pub async fn read_dir_tables(dir: &Path) -> Result<Vec<(PathBuf, toml::Table)>, LoadError> {
    let mut paths = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_config_file(&path) && entry.file_type().await?.is_file() {
            paths.push(normalize_path(&path));
        }
    }
    paths.sort();

    let mut tables = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(table) = read_table(&path).await? {
            debug!("Read {}", path.display());
            tables.push((path, table));
        }
    }
    Ok(tables)
}
