//! Alias management
//!
//! An alias names an S3-compatible endpoint together with its credentials.
//! Aliases live in the `aliases` array of the configuration file.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{Config, ConfigManager};
use crate::error::{Error, Result};

/// A named storage endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// Alias name used in paths (`alias/bucket/key`)
    pub name: String,

    /// Endpoint URL
    pub endpoint: String,

    /// Access key ID
    pub access_key: String,

    /// Secret access key
    pub secret_key: String,

    /// Region
    #[serde(default = "default_region")]
    pub region: String,

    /// Bucket lookup style: auto, path or dns
    #[serde(default = "default_bucket_lookup")]
    pub bucket_lookup: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket_lookup() -> String {
    "auto".to_string()
}

impl Alias {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: default_region(),
            bucket_lookup: default_bucket_lookup(),
        }
    }

    /// Check name, endpoint URL and lookup style
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!("Invalid alias name: '{}'", self.name)));
        }

        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {e}", self.endpoint)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::Config(format!(
                "Endpoint must use http or https: {}",
                self.endpoint
            )));
        }

        if !matches!(self.bucket_lookup.as_str(), "auto" | "path" | "dns") {
            return Err(Error::Config(format!(
                "Bucket lookup must be auto, path or dns: {}",
                self.bucket_lookup
            )));
        }

        Ok(())
    }
}

/// Reads and updates aliases in the configuration file
#[derive(Debug, Clone)]
pub struct AliasManager {
    config_manager: ConfigManager,
}

impl AliasManager {
    /// Manager over the default config location
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_manager: ConfigManager::new()?,
        })
    }

    pub fn with_config_manager(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }

    fn load(&self) -> Result<Config> {
        self.config_manager.load()
    }

    /// Look up an alias by name
    pub fn get(&self, name: &str) -> Result<Alias> {
        self.load()?
            .aliases
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::AliasNotFound(name.to_string()))
    }

    /// All aliases sorted by name
    pub fn list(&self) -> Result<Vec<Alias>> {
        let mut aliases = self.load()?.aliases;
        aliases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(aliases)
    }

    /// Add or replace an alias
    pub fn set(&self, alias: Alias) -> Result<()> {
        alias.validate()?;

        let mut config = self.load()?;
        config.aliases.retain(|a| a.name != alias.name);
        config.aliases.push(alias);
        self.config_manager.save(&config)
    }

    /// Remove an alias, failing if it does not exist
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut config = self.load()?;
        let before = config.aliases.len();
        config.aliases.retain(|a| a.name != name);

        if config.aliases.len() == before {
            return Err(Error::AliasNotFound(name.to_string()));
        }

        self.config_manager.save(&config)
    }
}
