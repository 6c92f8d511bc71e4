// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use relaylink::common::config::{ConfigStore, JsonFileConfigStore, PartialConfig};
use std::path::PathBuf;

#[derive(Eq, PartialEq, Clone)]
pub struct PairArgs {
  pub config_path: PathBuf,
  pub relay_url: String,
  pub token: String,
}

impl std::fmt::Debug for PairArgs {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PairArgs")
      .field("config_path", &self.config_path)
      .field("relay_url", &self.relay_url)
      .finish_non_exhaustive()
  }
}

pub async fn pair_main(config: PairArgs) -> Result<()> {
  let store = JsonFileConfigStore::new(&config.config_path);
  store
    .save(PartialConfig {
      relay_url: Some(config.relay_url.clone()),
      token: Some(config.token),
    })
    .with_context(|| format!("Saving pairing to {}", config.config_path.display()))?;
  tracing::info!(
    path = %config.config_path.display(),
    relay = %config.relay_url,
    "Connector paired"
  );
  Ok(())
}
