// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-process stand-ins for the relay, for driving channels without a network

use std::{
  collections::VecDeque,
  sync::{Mutex, MutexGuard, PoisonError},
};

use futures::{
  channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
  future::{self, BoxFuture, FutureExt},
  SinkExt, StreamExt,
};
use tokio::time::Instant;

use super::{FrameSender, RelayConnector, RelayDuplex, TransportError};
use crate::common::{
  config::Credentials,
  protocol::{self, Message},
};

enum Scripted {
  Refuse,
  Accept {
    incoming: UnboundedReceiver<Result<String, TransportError>>,
    outgoing: UnboundedSender<String>,
  },
}

/// A [RelayConnector] whose connection outcomes are queued up ahead of time
///
/// Once the queue is empty every attempt is refused.
#[derive(Default)]
pub struct MemoryConnector {
  script: Mutex<VecDeque<Scripted>>,
  attempts: Mutex<Vec<Instant>>,
  tokens: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryConnector {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn refuse_next(&self) {
    lock(&self.script).push_back(Scripted::Refuse);
  }

  /// Queues a successful connection and returns the relay's end of it
  pub fn accept_next(&self) -> RelayPeer {
    let (to_connector, incoming) = unbounded();
    let (outgoing, from_connector) = unbounded();
    lock(&self.script).push_back(Scripted::Accept { incoming, outgoing });
    RelayPeer {
      to_connector,
      from_connector,
    }
  }

  /// When each connection attempt was made
  pub fn attempts(&self) -> Vec<Instant> {
    lock(&self.attempts).clone()
  }

  /// The bearer token presented on each attempt
  pub fn tokens(&self) -> Vec<String> {
    lock(&self.tokens).clone()
  }
}

impl RelayConnector for MemoryConnector {
  fn connect<'a>(
    &'a self,
    credentials: &'a Credentials,
  ) -> BoxFuture<'a, Result<RelayDuplex, TransportError>> {
    lock(&self.attempts).push(Instant::now());
    lock(&self.tokens).push(credentials.token().to_owned());
    let next = lock(&self.script).pop_front().unwrap_or(Scripted::Refuse);
    let result = match next {
      Scripted::Refuse => Err(TransportError::Connect("connection refused".into())),
      Scripted::Accept { incoming, outgoing } => Ok(RelayDuplex {
        incoming: incoming.boxed(),
        outgoing: Box::pin(outgoing.sink_map_err(|e| TransportError::Write(Box::new(e)))),
      }),
    };
    future::ready(result).boxed()
  }
}

/// The relay side of an in-memory connection; dropping it closes the connection
pub struct RelayPeer {
  to_connector: UnboundedSender<Result<String, TransportError>>,
  from_connector: UnboundedReceiver<String>,
}

impl RelayPeer {
  pub fn send(&self, message: &Message) -> bool {
    match message.encode() {
      Ok(frame) => self.send_raw(&frame),
      Err(_) => false,
    }
  }

  pub fn send_raw(&self, frame: &str) -> bool {
    self.to_connector.unbounded_send(Ok(frame.to_owned())).is_ok()
  }

  /// Makes the connector observe a socket error on this connection
  pub fn fail(&self, error: TransportError) -> bool {
    self.to_connector.unbounded_send(Err(error)).is_ok()
  }

  /// Next frame written by the connector, or `None` once it closed the connection
  pub async fn next_frame(&mut self) -> Option<String> {
    self.from_connector.next().await
  }

  pub async fn next_message(&mut self) -> Option<Message> {
    loop {
      let frame = self.next_frame().await?;
      match protocol::decode(&frame) {
        Ok(message) => return Some(message),
        Err(error) => tracing::warn!(%error, "Connector wrote an undecodable frame"),
      }
    }
  }

  /// A frame that has already been written, without waiting for more
  pub fn try_next_frame(&mut self) -> Option<String> {
    self.from_connector.try_recv().ok()
  }
}

/// A [FrameSender] that keeps every frame in memory
#[derive(Debug, Default)]
pub struct RecordingSender {
  frames: Mutex<Vec<Message>>,
}

impl RecordingSender {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn messages(&self) -> Vec<Message> {
    lock(&self.frames).clone()
  }
}

impl FrameSender for RecordingSender {
  fn send(&self, message: &Message) -> bool {
    lock(&self.frames).push(message.clone());
    true
  }
}
