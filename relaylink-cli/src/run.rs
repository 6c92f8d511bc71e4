// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use relaylink::common::{
  config::{ConfigStore, Credentials, JsonFileConfigStore},
  dispatch::{DispatchConfig, Dispatcher, OverflowPolicy},
  executor::{ExecutorConfig, HttpExecutor},
  health::HealthReporter,
  transport::{websocket::WebSocketConnector, ChannelExit, TransportChannel, TransportConfig},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_futures::Instrument;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ConnectorArgs {
  pub config_path: PathBuf,
  pub max_in_flight: Option<usize>,
  pub overflow: OverflowPolicy,
  pub heartbeat_interval: Option<Duration>,
  pub liveness_timeout: Option<Duration>,
}

pub async fn run_main(config: ConnectorArgs) -> Result<()> {
  let store: Arc<dyn ConfigStore> = Arc::new(JsonFileConfigStore::new(&config.config_path));
  let credentials = Credentials::from_store(store.as_ref()).with_context(|| {
    format!(
      "Connector is not paired; run `pair` against {}",
      config.config_path.display()
    )
  })?;

  let executor = HttpExecutor::new(ExecutorConfig::default()).context("HTTP client setup failed")?;
  let dispatcher = Dispatcher::new(
    Arc::new(executor),
    DispatchConfig {
      max_in_flight: config.max_in_flight,
      overflow: config.overflow,
    },
  );

  let mut transport_config = TransportConfig::default();
  if let Some(interval) = config.heartbeat_interval {
    transport_config.heartbeat_interval = interval;
  }
  transport_config.liveness_timeout = config.liveness_timeout;

  let channel = TransportChannel::new(
    Arc::new(WebSocketConnector::new()),
    credentials,
    transport_config,
    Arc::new(dispatcher),
  );
  let mut health = HealthReporter::new(Arc::clone(&store), channel.state());
  tracing::info!(health = ?health.snapshot(), "Connector starting");

  let health_task = tokio::task::spawn(
    async move {
      while let Some(snapshot) = health.changed().await {
        tracing::info!(
          paired = snapshot.paired,
          connected = snapshot.connected,
          "Health changed"
        );
      }
    }
    .instrument(tracing::info_span!("health")),
  );

  channel.connect()?;

  let interrupt = {
    let channel = Arc::clone(&channel);
    tokio::task::spawn(async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received; shutting down"),
        Err(error) => tracing::warn!(%error, "Unable to listen for interrupts"),
      }
      channel.close();
    })
  };

  let exit = channel.join().await;
  interrupt.abort();
  let _ = interrupt.await;
  drop(channel);
  let _ = health_task.await;
  match exit {
    Some(ChannelExit::ReconnectExhausted { attempts }) => Err(anyhow::anyhow!(
      "Gave up reconnecting to the relay after {} attempts; restart the connector",
      attempts
    )),
    Some(ChannelExit::Closed) | None => Ok(()),
  }
}
