// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Relay wire messages
//!
//! Every frame carries exactly one JSON object with a `type` discriminator.
//! Response bodies travel as base64 text inside `HTTP_RESPONSE_CHUNK` messages.

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::headers::Headers;

/// Relay-assigned label for one logical HTTP call
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
  pub fn new<T: Into<String>>(id: T) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "RequestId({})", &self.0)
  }
}

impl From<&str> for RequestId {
  fn from(id: &str) -> Self {
    Self::new(id)
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  HttpRequest(HttpRequest),
  HttpResponseStart(ResponseStart),
  HttpResponseChunk(ResponseChunk),
  HttpResponseEnd(ResponseEnd),
  HttpResponseError(ResponseError),
  Ping(Heartbeat),
  Pong(Heartbeat),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
  pub request_id: RequestId,
  pub target: Target,
  pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
  pub method: String,
  pub path: String,
  pub base_url: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(default, skip_serializing_if = "BodyEncoding::is_utf8")]
  pub body_encoding: BodyEncoding,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  #[default]
  Utf8,
  Base64,
}

impl BodyEncoding {
  fn is_utf8(&self) -> bool {
    *self == BodyEncoding::Utf8
  }
}

impl Target {
  /// Raw request body bytes, if the command carries a body
  pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
    match (&self.body, self.body_encoding) {
      (None, _) => Ok(None),
      (Some(body), BodyEncoding::Utf8) => Ok(Some(body.as_bytes().to_vec())),
      (Some(body), BodyEncoding::Base64) => {
        base64::engine::general_purpose::STANDARD
          .decode(body)
          .map(Some)
      }
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStart {
  pub request_id: RequestId,
  pub status_code: u16,
  pub headers: Headers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
  pub request_id: RequestId,
  /// Base64 of the body bytes carried by this chunk
  pub data: String,
  pub index: u64,
}

impl ResponseChunk {
  pub fn encode(request_id: RequestId, bytes: &[u8], index: u64) -> Self {
    Self {
      request_id,
      data: base64::engine::general_purpose::STANDARD.encode(bytes),
      index,
    }
  }

  pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(&self.data)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnd {
  pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
  pub request_id: RequestId,
  pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
  /// Milliseconds since the unix epoch at the sender; zero when omitted
  #[serde(default)]
  pub ts: u64,
}

impl Heartbeat {
  pub fn now() -> Self {
    let ts = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or_default();
    Self { ts }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
  #[error("Frame is not a recognized relay message: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
  #[error("Failure serializing relay message: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Parses one text frame into a message
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
  Ok(serde_json::from_str(raw)?)
}

impl Message {
  pub fn ping() -> Self {
    Message::Ping(Heartbeat::now())
  }

  pub fn pong() -> Self {
    Message::Pong(Heartbeat::now())
  }

  pub fn start(request_id: RequestId, status_code: u16, headers: Headers) -> Self {
    Message::HttpResponseStart(ResponseStart {
      request_id,
      status_code,
      headers,
    })
  }

  pub fn chunk(request_id: RequestId, bytes: &[u8], index: u64) -> Self {
    Message::HttpResponseChunk(ResponseChunk::encode(request_id, bytes, index))
  }

  pub fn end(request_id: RequestId) -> Self {
    Message::HttpResponseEnd(ResponseEnd { request_id })
  }

  pub fn error<E: Into<String>>(request_id: RequestId, error: E) -> Self {
    Message::HttpResponseError(ResponseError {
      request_id,
      error: error.into(),
    })
  }

  /// Serializes to a single text frame
  pub fn encode(&self) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(self)?)
  }

  /// The wire discriminator of this message
  pub fn kind(&self) -> &'static str {
    match self {
      Message::HttpRequest(_) => "HTTP_REQUEST",
      Message::HttpResponseStart(_) => "HTTP_RESPONSE_START",
      Message::HttpResponseChunk(_) => "HTTP_RESPONSE_CHUNK",
      Message::HttpResponseEnd(_) => "HTTP_RESPONSE_END",
      Message::HttpResponseError(_) => "HTTP_RESPONSE_ERROR",
      Message::Ping(_) => "PING",
      Message::Pong(_) => "PONG",
    }
  }

  pub fn request_id(&self) -> Option<&RequestId> {
    match self {
      Message::HttpRequest(m) => Some(&m.request_id),
      Message::HttpResponseStart(m) => Some(&m.request_id),
      Message::HttpResponseChunk(m) => Some(&m.request_id),
      Message::HttpResponseEnd(m) => Some(&m.request_id),
      Message::HttpResponseError(m) => Some(&m.request_id),
      Message::Ping(_) | Message::Pong(_) => None,
    }
  }

  /// Whether this is the last frame a request may produce
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Message::HttpResponseEnd(_) | Message::HttpResponseError(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use serde_json::{json, Value};

  use super::*;

  #[test]
  fn decodes_http_request() {
    let raw = json!({
      "type": "HTTP_REQUEST",
      "requestId": "r1",
      "target": {
        "method": "GET",
        "path": "/status",
        "baseUrl": "http://127.0.0.1:9000",
        "headers": {"accept": "text/plain"},
      },
      "timeoutMs": 5000,
    })
    .to_string();
    let message = decode(&raw).expect("Request must decode");
    let request = match message {
      Message::HttpRequest(request) => request,
      other => panic!("Unexpected message {:?}", other),
    };
    assert_eq!(request.request_id.as_str(), "r1");
    assert_eq!(request.timeout_ms, 5000);
    assert_eq!(request.target.method, "GET");
    assert_eq!(request.target.base_url, "http://127.0.0.1:9000");
    assert_eq!(request.target.headers.get("accept"), Some("text/plain"));
    assert_eq!(request.target.body_bytes().unwrap(), None);
  }

  #[test]
  fn request_bodies_honour_encoding() {
    let raw = json!({
      "type": "HTTP_REQUEST",
      "requestId": "r2",
      "target": {
        "method": "POST",
        "path": "upload",
        "baseUrl": "http://10.0.0.2/",
        "body": "AAEC",
        "bodyEncoding": "base64",
      },
      "timeoutMs": 100,
    })
    .to_string();
    match decode(&raw).unwrap() {
      Message::HttpRequest(request) => {
        assert_eq!(request.target.body_bytes().unwrap(), Some(vec![0, 1, 2]));
      }
      other => panic!("Unexpected message {:?}", other),
    }
  }

  #[test]
  fn encodes_response_frames_with_wire_names() {
    let id = RequestId::from("r1");
    let start: Value =
      serde_json::from_str(&Message::start(id.clone(), 200, Headers::new()).encode().unwrap())
        .unwrap();
    assert_eq!(
      start,
      json!({"type": "HTTP_RESPONSE_START", "requestId": "r1", "statusCode": 200, "headers": {}})
    );
    let chunk: Value =
      serde_json::from_str(&Message::chunk(id.clone(), b"ok", 0).encode().unwrap()).unwrap();
    assert_eq!(
      chunk,
      json!({"type": "HTTP_RESPONSE_CHUNK", "requestId": "r1", "data": "b2s=", "index": 0})
    );
    let end: Value = serde_json::from_str(&Message::end(id.clone()).encode().unwrap()).unwrap();
    assert_eq!(end, json!({"type": "HTTP_RESPONSE_END", "requestId": "r1"}));
    let error: Value =
      serde_json::from_str(&Message::error(id, "boom").encode().unwrap()).unwrap();
    assert_eq!(
      error,
      json!({"type": "HTTP_RESPONSE_ERROR", "requestId": "r1", "error": "boom"})
    );
  }

  #[test]
  fn heartbeats_carry_timestamps() {
    assert_eq!(
      decode(r#"{"type":"PING","ts":1700000000000}"#).unwrap(),
      Message::Ping(Heartbeat { ts: 1700000000000 })
    );
    assert_eq!(
      decode(r#"{"type":"PING"}"#).unwrap(),
      Message::Ping(Heartbeat { ts: 0 })
    );
    let pong: Value = serde_json::from_str(&Message::pong().encode().unwrap()).unwrap();
    assert_eq!(pong["type"], "PONG");
    assert!(pong["ts"].as_u64().unwrap() > 0);
  }

  #[test]
  fn rejects_unknown_or_malformed_frames() {
    assert!(decode("not json").is_err());
    assert!(decode("[1,2,3]").is_err());
    assert!(decode(r#"{"ts": 1}"#).is_err());
    assert!(decode(r#"{"type": "HTTP_CANCEL", "requestId": "r1"}"#).is_err());
    assert!(decode(r#"{"type": "HTTP_REQUEST", "requestId": "r1"}"#).is_err());
  }

  #[test]
  fn terminal_classification() {
    let id = RequestId::from("r1");
    assert!(Message::end(id.clone()).is_terminal());
    assert!(Message::error(id.clone(), "x").is_terminal());
    assert!(!Message::chunk(id.clone(), b"", 0).is_terminal());
    assert!(!Message::ping().is_terminal());
    assert_eq!(Message::chunk(id.clone(), b"", 3).request_id(), Some(&id));
    assert_eq!(Message::pong().request_id(), None);
  }
}
