//! Mounted secret lookup.
//!
//! Secrets are plain files laid out as `{root}/{name}/{key}`, the way
//! orchestrators project secret volumes.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

/// Reference to one key of a named secret.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    std::env::var("EVENTGATE_SECRETS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/eventgate/secrets"))
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecretStore {
    root: PathBuf,
}

impl SecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        Self::new(config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `selector`.
    ///
    /// Rejects names or keys that would escape the root.
    pub fn path_of(&self, selector: &SecretKeySelector) -> Result<PathBuf> {
        for part in [&selector.name, &selector.key] {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => {}
                _ => bail!("invalid secret reference '{}/{}'", selector.name, selector.key),
            }
        }
        Ok(self.root.join(&selector.name).join(&selector.key))
    }

    /// Reads the secret value with surrounding whitespace trimmed.
    pub fn read(&self, selector: &SecretKeySelector) -> Result<String> {
        let path = self.path_of(selector)?;
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read secret {}", path.display()))?;
        Ok(value.trim().to_string())
    }
}
