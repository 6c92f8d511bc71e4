// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::{
  future::{self, BoxFuture, FutureExt},
  SinkExt, StreamExt,
};
use tokio_tungstenite::tungstenite::{
  client::IntoClientRequest,
  handshake::client::Request,
  http::{header::AUTHORIZATION, HeaderValue},
  Message as WsMessage,
};

use super::{RelayConnector, RelayDuplex, TransportError};
use crate::common::config::Credentials;

/// Connects to the relay over a websocket, authenticating with the pairing token
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
  pub fn new() -> Self {
    Self
  }
}

/// Builds the upgrade request carrying `Authorization: Bearer <token>`
pub fn handshake_request(credentials: &Credentials) -> Result<Request, TransportError> {
  let mut request = credentials
    .relay_url()
    .into_client_request()
    .map_err(|e| TransportError::Request(e.to_string()))?;
  let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token()))
    .map_err(|_| TransportError::Request("token is not a valid header value".into()))?;
  request.headers_mut().insert(AUTHORIZATION, bearer);
  Ok(request)
}

fn inbound_text(
  item: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
  match item {
    Ok(WsMessage::Text(text)) => Some(Ok(text)),
    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
      Ok(text) => Some(Ok(text)),
      Err(error) => {
        tracing::warn!(%error, "Discarding non-text binary frame from relay");
        None
      }
    },
    Ok(WsMessage::Close(frame)) => {
      tracing::debug!(?frame, "Relay sent close frame");
      None
    }
    // Protocol-level pings are answered by tungstenite itself
    Ok(_) => None,
    Err(error) => Some(Err(TransportError::Read(Box::new(error)))),
  }
}

impl RelayConnector for WebSocketConnector {
  fn connect<'a>(
    &'a self,
    credentials: &'a Credentials,
  ) -> BoxFuture<'a, Result<RelayDuplex, TransportError>> {
    async move {
      let request = handshake_request(credentials)?;
      let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(Box::new(e)))?;
      tracing::debug!(status = %response.status(), "Relay websocket handshake complete");
      let (sink, stream) = socket.split();
      let incoming = stream
        .filter_map(|item| future::ready(inbound_text(item)))
        .boxed();
      let outgoing = sink
        .sink_map_err(|e| TransportError::Write(Box::new(e)))
        .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(frame))));
      Ok(RelayDuplex {
        incoming,
        outgoing: Box::pin(outgoing),
      })
    }
    .boxed()
  }
}
