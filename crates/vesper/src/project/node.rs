//! Configuration Nodes
//!
//! One top-level table of a configuration file, plus the value shapes shared
//! by handler and schedule definitions.

use std::collections::BTreeSet;

use serde::Deserialize;

/// Error type for a single configuration entry
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {kind} '{id}': {source}")]
    Invalid {
        kind: &'static str,
        id: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {kind} '{id}': {message}")]
    Validation {
        kind: &'static str,
        id: String,
        message: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Node
// ─────────────────────────────────────────────────────────────────────────────

/// Raw configuration of one entity, kept for diffing on reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigNode {
    table: toml::Table,
}

impl ConfigNode {
    pub fn new(table: toml::Table) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &toml::Table {
        &self.table
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.table.get(key)
    }

    /// Deserialize the node into a typed view
    pub fn parse<T: serde::de::DeserializeOwned>(&self, kind: &'static str, id: &str) -> Result<T, ConfigError> {
        toml::Value::Table(self.table.clone())
            .try_into()
            .map_err(|source| ConfigError::Invalid {
                kind,
                id: id.to_string(),
                source,
            })
    }

    /// Replace the stored table, returning the top-level keys whose values
    /// differ between the old and new tables (added and removed keys included)
    pub fn update_source(&mut self, table: toml::Table) -> Vec<String> {
        let keys: BTreeSet<&String> = self.table.keys().chain(table.keys()).collect();
        let changed = keys
            .into_iter()
            .filter(|key| self.table.get(*key) != table.get(*key))
            .cloned()
            .collect();
        self.table = table;
        changed
    }
}

/// True when the entry carries `disable = true`
pub fn is_disabled(table: &toml::Table) -> bool {
    table
        .get("disable")
        .and_then(toml::Value::as_bool)
        .unwrap_or(false)
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Shapes
// ─────────────────────────────────────────────────────────────────────────────

/// A single string or a list of strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct StringList(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for StringList {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => StringList(vec![s]),
            OneOrMany::Many(v) => StringList(v),
        }
    }
}

impl StringList {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Script text written either as one string or as a list of lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct ScriptText(pub String);

impl From<OneOrMany> for ScriptText {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => ScriptText(s),
            OneOrMany::Many(lines) => ScriptText(lines.join("\n")),
        }
    }
}

impl ScriptText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}
