// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The single long-lived relay connection
//!
//! A [TransportChannel] owns at most one physical connection at a time. It
//! answers heartbeats itself, forwards every other decoded message to its
//! [InboundHandler], and reconnects with capped exponential backoff until its
//! attempt budget runs out or [TransportChannel::close] is called.

use std::{
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
  },
  time::Duration,
};

use arc_swap::ArcSwapOption;
use futures::{
  future::{BoxFuture, FusedFuture, FutureExt},
  stream::BoxStream,
  Sink, SinkExt, StreamExt,
};
use tokio::{
  sync::{mpsc, watch},
  task::JoinHandle,
  time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{
  common::{
    config::{ConfigurationError, Credentials},
    protocol::{self, Message},
  },
  util::{backoff::ReconnectPolicy, cancellation::CancellationListener},
};

pub mod memory;
pub mod websocket;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Relay handshake request could not be built: {0}")]
  Request(String),
  #[error("Failed to connect to relay: {0}")]
  Connect(#[source] BoxError),
  #[error("Relay connection read failure: {0}")]
  Read(#[source] BoxError),
  #[error("Relay connection write failure: {0}")]
  Write(#[source] BoxError),
}

/// Inbound text frames of one connection; the stream ends when the connection closes
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;
/// Outbound text frames of one connection; closing it closes the connection
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

pub struct RelayDuplex {
  pub incoming: FrameStream,
  pub outgoing: FrameSink,
}

/// Establishes authenticated physical connections to the relay
pub trait RelayConnector: Send + Sync + 'static {
  fn connect<'a>(
    &'a self,
    credentials: &'a Credentials,
  ) -> BoxFuture<'a, Result<RelayDuplex, TransportError>>;
}

/// Anything response frames can be written to
pub trait FrameSender: Send + Sync {
  /// Hands the frame to a live connection, or drops it with a warning.
  ///
  /// Returns whether the frame was accepted for writing.
  fn send(&self, message: &Message) -> bool;
}

/// Receives every decoded non-heartbeat message, along with the connection it arrived on
///
/// Called from the connection's read loop; implementations must not block.
pub trait InboundHandler: Send + Sync + 'static {
  fn handle(&self, message: Message, link: Link);
}

/// Write handle bound to one physical connection
///
/// Once that connection ends, every send through the handle is dropped, even
/// if the channel has since reconnected.
#[derive(Clone)]
pub struct Link {
  id: Uuid,
  frames: mpsc::UnboundedSender<String>,
  lifetime: CancellationToken,
}

impl Link {
  pub fn new(frames: mpsc::UnboundedSender<String>, lifetime: CancellationToken) -> Self {
    Self {
      id: Uuid::new_v4(),
      frames,
      lifetime,
    }
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn is_open(&self) -> bool {
    !self.lifetime.is_cancelled() && !self.frames.is_closed()
  }

  /// Fires when the connection behind this link goes away
  pub fn closed_listener(&self) -> CancellationListener {
    self.lifetime.clone().into()
  }
}

impl std::fmt::Debug for Link {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Link")
      .field("id", &self.id)
      .field("open", &self.is_open())
      .finish()
  }
}

impl FrameSender for Link {
  fn send(&self, message: &Message) -> bool {
    if !self.is_open() {
      tracing::warn!(
        connection = %self.id,
        kind = message.kind(),
        request_id = ?message.request_id(),
        "Relay connection is gone; dropping frame"
      );
      return false;
    }
    let frame = match message.encode() {
      Ok(frame) => frame,
      Err(error) => {
        tracing::warn!(%error, kind = message.kind(), "Dropping unencodable frame");
        return false;
      }
    };
    if self.frames.send(frame).is_err() {
      tracing::warn!(
        connection = %self.id,
        kind = message.kind(),
        "Relay writer has stopped; dropping frame"
      );
      return false;
    }
    true
  }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
  pub heartbeat_interval: Duration,
  pub reconnect: ReconnectPolicy,
  /// Close the connection when nothing arrives from the relay for this long
  pub liveness_timeout: Option<Duration>,
  /// How long a closing connection may spend flushing and sending its close frame
  pub close_grace: Duration,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_millis(30000),
      reconnect: ReconnectPolicy::default(),
      liveness_timeout: None,
      close_grace: Duration::from_secs(5),
    }
  }
}

/// Why the channel's driver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelExit {
  /// [TransportChannel::close] was called
  Closed,
  /// Every reconnect attempt failed; only a restart recovers
  ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
  Requested,
  RemoteClosed,
  ReadFailed,
  WriteFailed,
  LivenessTimeout,
}

pub struct TransportChannel {
  connector: Arc<dyn RelayConnector>,
  credentials: Credentials,
  config: TransportConfig,
  handler: Arc<dyn InboundHandler>,
  state: watch::Sender<ConnectionState>,
  current: ArcSwapOption<Link>,
  shutdown: CancellationToken,
  started: AtomicBool,
  driver: Mutex<Option<JoinHandle<ChannelExit>>>,
}

impl TransportChannel {
  pub fn new(
    connector: Arc<dyn RelayConnector>,
    credentials: Credentials,
    config: TransportConfig,
    handler: Arc<dyn InboundHandler>,
  ) -> Arc<Self> {
    Arc::new(Self {
      connector,
      credentials,
      config,
      handler,
      state: watch::channel(ConnectionState::Disconnected).0,
      current: ArcSwapOption::empty(),
      shutdown: CancellationToken::new(),
      started: AtomicBool::new(false),
      driver: Mutex::new(None),
    })
  }

  pub fn connection_state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  /// Subscribes to connection state transitions
  pub fn state(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  /// Starts maintaining the relay connection
  ///
  /// Missing credentials fail immediately and are never retried. Calling this
  /// on a channel that is already running, or was closed, does nothing.
  pub fn connect(self: &Arc<Self>) -> Result<(), ConfigurationError> {
    if let Err(error) = self.credentials.validate() {
      tracing::error!(%error, "Refusing to connect without valid pairing");
      return Err(error);
    }
    if self.started.swap(true, Ordering::SeqCst) {
      tracing::debug!("Relay channel already started");
      return Ok(());
    }
    let span = tracing::info_span!("relay_channel", relay = self.credentials.relay_url());
    let driver = tokio::task::spawn(Arc::clone(self).drive().instrument(span));
    *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
    Ok(())
  }

  /// Deliberately closes the connection; no reconnect follows
  pub fn close(&self) {
    tracing::info!("Closing relay channel");
    self.shutdown.cancel();
  }

  /// Waits for the channel to stop for good
  ///
  /// Returns `None` if the channel was never started or was already joined.
  pub async fn join(&self) -> Option<ChannelExit> {
    let driver = self
      .driver
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()?;
    match driver.await {
      Ok(exit) => Some(exit),
      Err(error) => {
        tracing::error!(%error, "Relay channel driver failed");
        None
      }
    }
  }

  async fn drive(self: Arc<Self>) -> ChannelExit {
    let mut attempts: u32 = 0;
    loop {
      self.state.send_replace(ConnectionState::Connecting);
      let connected = tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => None,
        result = self.connector.connect(&self.credentials) => Some(result),
      };
      match connected {
        None => break,
        Some(Ok(duplex)) => {
          attempts = 0;
          let reason = self.run_connection(duplex).await;
          tracing::info!(?reason, "Relay connection closed");
        }
        Some(Err(error)) => tracing::warn!(%error, "Relay connection attempt failed"),
      }
      self.state.send_replace(ConnectionState::Disconnected);
      if self.shutdown.is_cancelled() {
        break;
      }

      let delay = match self.config.reconnect.delay_for(attempts) {
        Some(delay) => delay,
        None => {
          tracing::error!(
            attempts,
            "Relay reconnect attempts exhausted; the connector must be restarted"
          );
          return ChannelExit::ReconnectExhausted { attempts };
        }
      };
      attempts += 1;
      tracing::info!(
        attempt = attempts,
        delay_ms = delay.as_millis() as u64,
        "Scheduling relay reconnect"
      );
      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        _ = tokio::time::sleep(delay) => {}
      }
    }
    self.state.send_replace(ConnectionState::Disconnected);
    tracing::info!("Relay channel closed");
    ChannelExit::Closed
  }

  async fn run_connection(&self, duplex: RelayDuplex) -> CloseReason {
    let RelayDuplex { incoming, outgoing } = duplex;
    let (frames, queued) = mpsc::unbounded_channel();
    let lifetime = self.shutdown.child_token();
    let link = Link::new(frames, lifetime.clone());
    let span = tracing::info_span!("relay_connection", connection = %link.id());
    async move {
      self.current.store(Some(Arc::new(link.clone())));
      self.state.send_replace(ConnectionState::Connected);
      tracing::info!("Connected to relay");

      let pump = Self::pump_frames(outgoing, queued, lifetime.clone()).fuse();
      let reader = self.read_frames(incoming, &link).fuse();
      futures::pin_mut!(pump, reader);
      let reason = tokio::select! {
        reason = &mut reader => reason,
        result = &mut pump => match result {
          Ok(()) => CloseReason::Requested,
          Err(error) => {
            tracing::warn!(%error, "Relay connection write failed");
            CloseReason::WriteFailed
          }
        },
      };

      // Requests still running against this connection observe the cancellation
      lifetime.cancel();
      self.current.store(None);
      self.state.send_replace(ConnectionState::Disconnected);
      if !pump.is_terminated()
        && tokio::time::timeout(self.config.close_grace, pump)
          .await
          .is_err()
      {
        tracing::debug!("Relay connection did not close within the grace period");
      }
      reason
    }
    .instrument(span)
    .await
  }

  /// Writes queued frames in order until the connection's lifetime ends, then closes the sink
  async fn pump_frames(
    mut outgoing: FrameSink,
    mut queued: mpsc::UnboundedReceiver<String>,
    lifetime: CancellationToken,
  ) -> Result<(), TransportError> {
    loop {
      tokio::select! {
        biased;
        frame = queued.recv() => match frame {
          Some(frame) => outgoing.send(frame).await?,
          None => break,
        },
        _ = lifetime.cancelled() => break,
      }
    }
    while let Ok(frame) = queued.try_recv() {
      outgoing.send(frame).await?;
    }
    outgoing.close().await
  }

  async fn read_frames(&self, mut incoming: FrameStream, link: &Link) -> CloseReason {
    let period = self.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    loop {
      let liveness_deadline = self.config.liveness_timeout.map(|t| last_seen + t);
      tokio::select! {
        _ = link.lifetime.cancelled() => return CloseReason::Requested,
        _ = heartbeat.tick() => {
          tracing::trace!("Sending heartbeat");
          link.send(&Message::ping());
        }
        _ = wait_until(liveness_deadline) => {
          tracing::warn!(
            timeout = ?self.config.liveness_timeout,
            "Relay went silent; dropping connection"
          );
          return CloseReason::LivenessTimeout;
        }
        frame = incoming.next() => match frame {
          Some(Ok(raw)) => {
            last_seen = Instant::now();
            self.on_frame(&raw, link);
          }
          Some(Err(error)) => {
            tracing::warn!(%error, "Relay connection error");
            return CloseReason::ReadFailed;
          }
          None => return CloseReason::RemoteClosed,
        },
      }
    }
  }

  fn on_frame(&self, raw: &str, link: &Link) {
    match protocol::decode(raw) {
      Err(error) => tracing::warn!(%error, "Discarding undecodable relay frame"),
      Ok(Message::Ping(beat)) => {
        tracing::trace!(ts = beat.ts, "Answering relay heartbeat");
        link.send(&Message::pong());
      }
      Ok(Message::Pong(beat)) => tracing::trace!(ts = beat.ts, "Relay heartbeat acknowledged"),
      Ok(message) => self.handler.handle(message, link.clone()),
    }
  }
}

impl FrameSender for TransportChannel {
  fn send(&self, message: &Message) -> bool {
    match self.current.load_full() {
      Some(link) if self.connection_state() == ConnectionState::Connected => link.send(message),
      _ => {
        tracing::warn!(
          kind = message.kind(),
          request_id = ?message.request_id(),
          "Relay not connected; dropping frame"
        );
        false
      }
    }
  }
}

async fn wait_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => futures::future::pending().await,
  }
}
