// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::{config::ConfigStore, transport::ConnectionState};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
  pub status: &'static str,
  pub paired: bool,
  pub connected: bool,
}

/// Read-only view of pairing and relay connectivity for external monitors
pub struct HealthReporter {
  store: Arc<dyn ConfigStore>,
  state: watch::Receiver<ConnectionState>,
}

impl HealthReporter {
  pub fn new(store: Arc<dyn ConfigStore>, state: watch::Receiver<ConnectionState>) -> Self {
    Self { store, state }
  }

  pub fn is_paired(&self) -> bool {
    self.store.has_valid_auth()
  }

  pub fn is_connected(&self) -> bool {
    *self.state.borrow() == ConnectionState::Connected
  }

  pub fn snapshot(&self) -> HealthSnapshot {
    HealthSnapshot {
      status: "UP",
      paired: self.is_paired(),
      connected: self.is_connected(),
    }
  }

  /// Waits for the next connection state transition, returning the new snapshot
  ///
  /// Returns `None` once the transport has been dropped.
  pub async fn changed(&mut self) -> Option<HealthSnapshot> {
    self.state.changed().await.ok()?;
    Some(self.snapshot())
  }
}
