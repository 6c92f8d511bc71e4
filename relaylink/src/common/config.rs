// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pairing credentials and the store they are persisted in

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
  #[error("No relay URL is configured; the connector must be paired")]
  MissingRelayUrl,
  #[error("No relay token is configured; the connector must be paired")]
  MissingToken,
  #[error("Relay URL {url:?} is invalid: {reason}")]
  InvalidRelayUrl { url: String, reason: String },
  #[error("Configuration could not be loaded: {0}")]
  Unavailable(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigStoreError {
  #[error("Failure accessing config file {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Config file {path:?} is not a valid JSON object: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("Failure serializing config: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Relay endpoint and bearer token, fixed for the lifetime of a channel
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  relay_url: String,
  token: String,
}

impl Credentials {
  pub fn new<U: Into<String>, T: Into<String>>(relay_url: U, token: T) -> Self {
    Self {
      relay_url: relay_url.into(),
      token: token.into(),
    }
  }

  /// Loads and validates credentials from a store
  pub fn from_store(store: &dyn ConfigStore) -> Result<Self, ConfigurationError> {
    let stored = store
      .load()
      .map_err(|e| ConfigurationError::Unavailable(e.to_string()))?;
    let credentials = Self::new(stored.relay_url, stored.token);
    credentials.validate()?;
    Ok(credentials)
  }

  pub fn relay_url(&self) -> &str {
    &self.relay_url
  }

  pub fn token(&self) -> &str {
    &self.token
  }

  pub fn validate(&self) -> Result<(), ConfigurationError> {
    if self.relay_url.trim().is_empty() {
      return Err(ConfigurationError::MissingRelayUrl);
    }
    if self.token.trim().is_empty() {
      return Err(ConfigurationError::MissingToken);
    }
    crate::util::validators::parse_relay_url(&self.relay_url).map_err(|e| {
      ConfigurationError::InvalidRelayUrl {
        url: self.relay_url.clone(),
        reason: e.to_string(),
      }
    })?;
    Ok(())
  }
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials")
      .field("relay_url", &self.relay_url)
      .field("token", &"<redacted>")
      .finish()
  }
}

/// The persisted pairing document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConfig {
  #[serde(default)]
  pub relay_url: String,
  #[serde(default)]
  pub token: String,
}

impl StoredConfig {
  pub fn has_valid_auth(&self) -> bool {
    !self.relay_url.is_empty() && !self.token.is_empty()
  }

  fn apply(&mut self, partial: PartialConfig) {
    if let Some(relay_url) = partial.relay_url {
      self.relay_url = relay_url;
    }
    if let Some(token) = partial.token {
      self.token = token;
    }
  }
}

/// Fields to overwrite on save; `None` leaves the stored value untouched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialConfig {
  pub relay_url: Option<String>,
  pub token: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send + Sync {
  fn load(&self) -> Result<StoredConfig, ConfigStoreError>;

  fn save(&self, partial: PartialConfig) -> Result<(), ConfigStoreError>;

  /// True iff both the relay URL and the token are non-empty
  fn has_valid_auth(&self) -> bool {
    match self.load() {
      Ok(config) => config.has_valid_auth(),
      Err(error) => {
        tracing::warn!(%error, "Config unreadable while checking pairing");
        false
      }
    }
  }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
  config: Mutex<StoredConfig>,
}

impl MemoryConfigStore {
  pub fn new(config: StoredConfig) -> Self {
    Self {
      config: Mutex::new(config),
    }
  }

  fn with_config<R>(&self, f: impl FnOnce(&mut StoredConfig) -> R) -> R {
    let mut guard = self
      .config
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    f(&mut guard)
  }
}

impl ConfigStore for MemoryConfigStore {
  fn load(&self) -> Result<StoredConfig, ConfigStoreError> {
    Ok(self.with_config(|c| c.clone()))
  }

  fn save(&self, partial: PartialConfig) -> Result<(), ConfigStoreError> {
    self.with_config(|c| c.apply(partial));
    Ok(())
  }
}

/// Stores the pairing as a JSON object on disk
///
/// Keys other than `relayUrl` and `token` are left as they were found.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
  path: PathBuf,
}

type JsonObject = serde_json::Map<String, serde_json::Value>;

impl JsonFileConfigStore {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn io_error(&self, source: std::io::Error) -> ConfigStoreError {
    ConfigStoreError::Io {
      path: self.path.clone(),
      source,
    }
  }

  fn read_object(&self) -> Result<JsonObject, ConfigStoreError> {
    let raw = match std::fs::read(&self.path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JsonObject::new()),
      Err(e) => return Err(self.io_error(e)),
    };
    serde_json::from_slice::<JsonObject>(&raw).map_err(|source| ConfigStoreError::Parse {
      path: self.path.clone(),
      source,
    })
  }

  fn write_object(&self, object: &JsonObject) -> Result<(), ConfigStoreError> {
    let rendered = serde_json::to_vec_pretty(object)?;
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
    }
    let staging = self.path.with_extension("json.tmp");
    std::fs::write(&staging, rendered).map_err(|e| self.io_error(e))?;
    std::fs::rename(&staging, &self.path).map_err(|e| self.io_error(e))
  }
}

impl ConfigStore for JsonFileConfigStore {
  fn load(&self) -> Result<StoredConfig, ConfigStoreError> {
    let object = self.read_object()?;
    serde_json::from_value(serde_json::Value::Object(object)).map_err(|source| {
      ConfigStoreError::Parse {
        path: self.path.clone(),
        source,
      }
    })
  }

  fn save(&self, partial: PartialConfig) -> Result<(), ConfigStoreError> {
    let mut object = self.read_object()?;
    if let Some(relay_url) = partial.relay_url {
      object.insert("relayUrl".into(), relay_url.into());
    }
    if let Some(token) = partial.token {
      object.insert("token".into(), token.into());
    }
    self.write_object(&object)?;
    tracing::debug!(path = ?self.path, "Saved connector config");
    Ok(())
  }
}
