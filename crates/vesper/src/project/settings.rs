//! Project Settings
//!
//! Defines `vesper.toml`, the global settings file at the project root.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::loader::LoadError;

/// Settings file name at the project root
pub const SETTINGS_FILE: &str = "vesper.toml";

/// Directory holding handler definitions
pub const HANDLERS_DIR: &str = "handlers";

/// Directory holding schedule definitions
pub const SCHEDULES_DIR: &str = "schedules";

/// Default format for schedule `start`/`end` values
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Global settings (vesper.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Dispatcher ids to register
    #[serde(default)]
    pub dispatchers: Vec<String>,
    #[serde(default)]
    pub automatic_reload: AutomaticReload,
    #[serde(default)]
    pub schedule_setting: ScheduleSetting,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Per-kind hot reload switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticReload {
    #[serde(default = "default_true")]
    pub handler: bool,
    #[serde(default = "default_true")]
    pub schedule: bool,
}

impl Default for AutomaticReload {
    fn default() -> Self {
        Self {
            handler: true,
            schedule: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleSetting {
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

impl Default for ScheduleSetting {
    fn default() -> Self {
        Self {
            date_format: default_date_format(),
        }
    }
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

/// Script engine options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Extra namespaces to make known to the engine
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl Settings {
    /// Load settings from the project root; a missing file yields defaults
    pub async fn load(root: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = root.as_ref().join(SETTINGS_FILE);
        if !fs::try_exists(&path).await? {
            debug!("No {} found, using defaults", SETTINGS_FILE);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).await?;
        let settings: Settings = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.clone(),
            source: e,
        })?;
        info!(
            dispatchers = settings.dispatchers.len(),
            "Loaded settings from {}",
            path.display()
        );
        Ok(settings)
    }
}
