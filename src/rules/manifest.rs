//! Collection manifest (`spito-rules.yml`).
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::identifier::DependencySpec;
use crate::error::RuleError;

/// Manifest file names, in lookup order.
pub const MANIFEST_NAMES: [&str; 2] = ["spito-rules.yml", "spito-rules.yaml"];

/// Per-rule configuration declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    /// Script path relative to the collection root.
    pub path: PathBuf,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the rule may run shell commands.
    #[serde(default, rename = "unsafe")]
    pub is_unsafe: bool,
    /// Whether applying the rule replaces the current environment.
    #[serde(default)]
    pub environment: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRule {
    Path(PathBuf),
    Full(RuleConfig),
}

impl From<RawRule> for RuleConfig {
    fn from(raw: RawRule) -> Self {
        match raw {
            RawRule::Path(path) => Self {
                path,
                description: None,
                is_unsafe: false,
                environment: false,
            },
            RawRule::Full(config) => config,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawManifest {
    rules: BTreeMap<String, RawRule>,
    dependencies: Vec<String>,
}

/// A parsed collection manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// File the manifest was read from.
    pub path: PathBuf,
    /// Rules by name.
    pub rules: BTreeMap<String, RuleConfig>,
    /// Declared dependencies.
    pub dependencies: Vec<DependencySpec>,
}

impl Manifest {
    /// Locate and parse the manifest in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ManifestError`] if no manifest exists or it does
    /// not parse, and [`RuleError::InvalidIdentifier`] for a malformed
    /// dependency.
    pub fn load(dir: &Path, default_host: &str) -> Result<Self, RuleError> {
        for name in MANIFEST_NAMES {
            let path = dir.join(name);
            match fs::read_to_string(&path) {
                Ok(text) => return Self::parse(&path, &text, default_host),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(RuleError::ManifestError {
                        path,
                        message: e.to_string(),
                    });
                }
            }
        }
        Err(RuleError::ManifestError {
            path: dir.join("spito-rules.yml"),
            message: "no manifest in collection".to_string(),
        })
    }

    /// Parse manifest `text` read from `path`.
    ///
    /// # Errors
    ///
    /// See [`Manifest::load`].
    pub fn parse(path: &Path, text: &str, default_host: &str) -> Result<Self, RuleError> {
        let raw: RawManifest = if text.trim().is_empty() {
            RawManifest::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| RuleError::ManifestError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };
        let dependencies = raw
            .dependencies
            .iter()
            .map(|d| DependencySpec::parse(d, default_host))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            rules: raw.rules.into_iter().map(|(k, v)| (k, v.into())).collect(),
            dependencies,
        })
    }

    /// Look up a rule by name.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] if the manifest does not declare it.
    pub fn rule(&self, name: &str) -> Result<&RuleConfig, RuleError> {
        self.rules.get(name).ok_or_else(|| RuleError::NotFound {
            what: format!("rule '{name}' in {}", self.path.display()),
        })
    }
}
