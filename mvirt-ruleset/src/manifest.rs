//! JSON rule files.
//!
//! ```json
//! { "rules": [ { "name": "office", "start_address": "10.0.0.1", "end_address": "10.0.0.9" } ] }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::rule::{FirewallRule, RuleSet};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: String,
        source: serde_json::Error,
    },

    #[error("{path}: {source}")]
    Invalid {
        path: String,
        source: ValidationError,
    },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamedRule {
    name: String,
    #[serde(flatten)]
    rule: FirewallRule,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<NamedRule>,
}

/// Parse a rule file body. Duplicate and colliding names are rejected.
pub fn parse_rules(path: &str, body: &str) -> Result<RuleSet<FirewallRule>> {
    let file: RuleFile = serde_json::from_str(body).map_err(|source| ManifestError::Parse {
        path: path.to_string(),
        source,
    })?;

    let mut set = RuleSet::new();
    for entry in file.rules {
        set.insert(entry.name, entry.rule)
            .map_err(|source| ManifestError::Invalid {
                path: path.to_string(),
                source,
            })?;
    }
    Ok(set)
}

/// Load a rule file. A missing file is an empty set when `missing_ok`.
pub fn load_rules(path: &Path, missing_ok: bool) -> Result<RuleSet<FirewallRule>> {
    let display = path.display().to_string();
    match fs::read_to_string(path) {
        Ok(body) => parse_rules(&display, &body),
        Err(e) if missing_ok && e.kind() == io::ErrorKind::NotFound => Ok(RuleSet::new()),
        Err(source) => Err(ManifestError::Read {
            path: display,
            source,
        }),
    }
}

/// Write `rules` as a rule file, sorted by name.
pub fn save_rules(path: &Path, rules: &BTreeMap<String, FirewallRule>) -> Result<()> {
    let file = RuleFile {
        rules: rules
            .iter()
            .map(|(name, rule)| NamedRule {
                name: name.clone(),
                rule: rule.clone(),
            })
            .collect(),
    };
    let display = path.display().to_string();
    let body = serde_json::to_string_pretty(&file).map_err(|source| ManifestError::Encode {
        path: display.clone(),
        source,
    })?;
    fs::write(path, body + "\n").map_err(|source| ManifestError::Write {
        path: display,
        source,
    })
}
