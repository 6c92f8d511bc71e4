// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Performs tunnelled HTTP requests against private targets
//!
//! Each request produces `HTTP_RESPONSE_START`, zero or more
//! `HTTP_RESPONSE_CHUNK`s, and exactly one terminal frame: `HTTP_RESPONSE_END`
//! on success, or `HTTP_RESPONSE_ERROR` on any transport-level failure, which
//! may arrive after START and CHUNKs have already been sent.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{redirect, Method, Url};

use super::{
  protocol::{Headers, HttpRequest, Message, Target},
  transport::FrameSender,
};
use crate::util::cancellation::CancellationListener;

/// Request headers that describe the connector's own connection to the target
const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub follow_redirects: bool,
  /// Used when a command arrives with `timeoutMs` of zero
  pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      follow_redirects: false,
      default_timeout: Duration::from_secs(30),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
  #[error("Cannot resolve path {path:?} against {base_url:?}: {reason}")]
  InvalidUrl {
    base_url: String,
    path: String,
    reason: String,
  },
  #[error("Invalid HTTP method {0:?}")]
  InvalidMethod(String),
  #[error("Request body is not valid base64: {0}")]
  InvalidBody(#[from] base64::DecodeError),
  #[error("{0}")]
  Http(#[from] reqwest::Error),
  #[error("Timed out after {0:?} waiting on the target")]
  TimedOut(Duration),
}

/// Renders an error with its full source chain, for the relay's benefit
fn describe(error: &dyn std::error::Error) -> String {
  let mut message = error.to_string();
  let mut source = error.source();
  while let Some(cause) = source {
    let cause_text = cause.to_string();
    if !message.contains(&cause_text) {
      message.push_str(": ");
      message.push_str(&cause_text);
    }
    source = cause.source();
  }
  message
}

/// Resolves `path` as a URL reference against `base_url`
pub fn resolve_url(base_url: &str, path: &str) -> Result<Url, ExecutionError> {
  let invalid = |reason: String| ExecutionError::InvalidUrl {
    base_url: base_url.to_owned(),
    path: path.to_owned(),
    reason,
  };
  let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
  base.join(path).map_err(|e| invalid(e.to_string()))
}

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP_HEADERS
    .iter()
    .any(|hop| hop.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Completed { chunks: u64 },
  Failed,
  /// The connection that delivered the request went away first
  Cancelled,
}

/// Executes one request, writing its response frames to `sink`
///
/// Implementations report every failure as a frame; nothing is returned.
pub trait RequestExecutor: Send + Sync + 'static {
  fn execute<'a>(
    &'a self,
    request: HttpRequest,
    sink: &'a dyn FrameSender,
    cancellation: CancellationListener,
  ) -> BoxFuture<'a, ()>;
}

pub struct HttpExecutor {
  client: reqwest::Client,
  default_timeout: Duration,
}

impl HttpExecutor {
  pub fn new(config: ExecutorConfig) -> Result<Self, reqwest::Error> {
    let redirects = if config.follow_redirects {
      redirect::Policy::default()
    } else {
      redirect::Policy::none()
    };
    let client = reqwest::Client::builder().redirect(redirects).build()?;
    Ok(Self {
      client,
      default_timeout: config.default_timeout,
    })
  }

  fn timeout_for(&self, request: &HttpRequest) -> Duration {
    match request.timeout_ms {
      0 => self.default_timeout,
      ms => Duration::from_millis(ms),
    }
  }

  fn build_request(&self, target: &Target) -> Result<reqwest::Request, ExecutionError> {
    let url = resolve_url(&target.base_url, &target.path)?;
    let method = Method::from_bytes(target.method.to_ascii_uppercase().as_bytes())
      .map_err(|_| ExecutionError::InvalidMethod(target.method.clone()))?;
    let mut builder = self.client.request(method, url);
    for (name, value) in target.headers.iter() {
      if is_hop_by_hop(name) {
        continue;
      }
      builder = builder.header(name, value);
    }
    if let Some(body) = target.body_bytes()? {
      builder = builder.body(body);
    }
    Ok(builder.build()?)
  }

  /// Runs the request to its terminal frame, unless `cancellation` fires first
  pub async fn run(
    &self,
    request: HttpRequest,
    sink: &dyn FrameSender,
    cancellation: CancellationListener,
  ) -> Outcome {
    let result = tokio::select! {
      result = self.stream_response(&request, sink) => result,
      _ = cancellation.cancelled() => {
        tracing::debug!("Relay connection ended before the response finished; abandoning request");
        return Outcome::Cancelled;
      }
    };
    match result {
      Ok(chunks) => {
        tracing::debug!(chunks, "Tunnelled request complete");
        Outcome::Completed { chunks }
      }
      Err(error) => {
        let message = describe(&error);
        tracing::debug!(error = %message, "Tunnelled request failed");
        sink.send(&Message::error(request.request_id.clone(), message));
        Outcome::Failed
      }
    }
  }

  /// Streams START, CHUNKs and END; any error returned means END was not sent
  async fn stream_response(
    &self,
    request: &HttpRequest,
    sink: &dyn FrameSender,
  ) -> Result<u64, ExecutionError> {
    let timeout = self.timeout_for(request);
    let outbound = self.build_request(&request.target)?;
    tracing::debug!(method = %outbound.method(), url = %outbound.url(), "Forwarding to target");

    let mut response = tokio::time::timeout(timeout, self.client.execute(outbound))
      .await
      .map_err(|_| ExecutionError::TimedOut(timeout))??;
    let request_id = &request.request_id;
    sink.send(&Message::start(
      request_id.clone(),
      response.status().as_u16(),
      Headers::from(response.headers()),
    ));

    let mut index = 0u64;
    while let Some(bytes) = tokio::time::timeout(timeout, response.chunk())
      .await
      .map_err(|_| ExecutionError::TimedOut(timeout))??
    {
      if bytes.is_empty() {
        continue;
      }
      sink.send(&Message::chunk(request_id.clone(), &bytes, index));
      index += 1;
    }
    sink.send(&Message::end(request_id.clone()));
    Ok(index)
  }
}

impl RequestExecutor for HttpExecutor {
  fn execute<'a>(
    &'a self,
    request: HttpRequest,
    sink: &'a dyn FrameSender,
    cancellation: CancellationListener,
  ) -> BoxFuture<'a, ()> {
    self.run(request, sink, cancellation).map(|_| ()).boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
  };
  use tokio_util::sync::CancellationToken;

  use super::{resolve_url, ExecutorConfig, HttpExecutor, Outcome};
  use crate::{
    common::{
      protocol::{Headers, HttpRequest, Message, RequestId, Target},
      transport::memory::RecordingSender,
    },
    util::cancellation::CancellationListener,
  };

  enum Step {
    Write(&'static [u8]),
    Pause(Duration),
  }

  async fn read_request(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut scratch = [0u8; 1024];
    loop {
      if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
        let head = String::from_utf8_lossy(&buffer[..end]).into_owned();
        let length = head
          .lines()
          .filter_map(|line| line.split_once(':'))
          .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
          .and_then(|(_, value)| value.trim().parse::<usize>().ok())
          .unwrap_or(0);
        if buffer.len() >= end + 4 + length {
          return String::from_utf8_lossy(&buffer).into_owned();
        }
      }
      let read = socket.read(&mut scratch).await.unwrap();
      if read == 0 {
        return String::from_utf8_lossy(&buffer).into_owned();
      }
      buffer.extend_from_slice(&scratch[..read]);
    }
  }

  /// Serves one connection with a scripted response, yielding the raw request it received
  async fn serve(steps: Vec<Step>) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let request = read_request(&mut socket).await;
      for step in steps {
        match step {
          Step::Write(bytes) => {
            if socket.write_all(bytes).await.is_err() {
              break;
            }
            let _ = socket.flush().await;
          }
          Step::Pause(duration) => tokio::time::sleep(duration).await,
        }
      }
      request
    });
    (format!("http://{}", addr), server)
  }

  fn request(base_url: &str, path: &str, timeout_ms: u64) -> HttpRequest {
    HttpRequest {
      request_id: RequestId::from("r1"),
      target: Target {
        method: "GET".into(),
        path: path.into(),
        base_url: base_url.into(),
        headers: Headers::new(),
        body: None,
        body_encoding: Default::default(),
      },
      timeout_ms,
    }
  }

  fn executor() -> HttpExecutor {
    HttpExecutor::new(ExecutorConfig::default()).expect("Client must build")
  }

  /// Asserts the frame-ordering contract and returns the concatenated body
  fn assert_well_formed(frames: &[Message]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut expected_index = 0;
    let (last, rest) = frames.split_last().expect("A terminal frame is required");
    assert!(last.is_terminal(), "Last frame must be terminal: {:?}", last);
    for (position, frame) in rest.iter().enumerate() {
      assert_eq!(frame.request_id(), Some(&RequestId::from("r1")));
      match frame {
        Message::HttpResponseStart(_) => assert_eq!(position, 0, "START must come first"),
        Message::HttpResponseChunk(chunk) => {
          assert_eq!(chunk.index, expected_index, "Chunk indices must not skip");
          expected_index += 1;
          body.extend(chunk.decode_data().unwrap());
        }
        other => panic!("Unexpected non-terminal frame {:?}", other),
      }
    }
    body
  }

  #[tokio::test]
  async fn streams_simple_response() {
    let (base, _server) = serve(vec![Step::Write(
      b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
    )])
    .await;
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(request(&base, "/status", 5000), &sink, Default::default())
      .await;
    assert_eq!(outcome, Outcome::Completed { chunks: 1 });

    let frames = sink.messages();
    assert_eq!(frames.len(), 3, "{:?}", frames);
    match &frames[0] {
      Message::HttpResponseStart(start) => {
        assert_eq!(start.request_id, RequestId::from("r1"));
        assert_eq!(start.status_code, 200);
        assert_eq!(start.headers.get("content-type"), Some("text/plain"));
      }
      other => panic!("Expected START, got {:?}", other),
    }
    assert_eq!(frames[1], Message::chunk(RequestId::from("r1"), b"ok", 0));
    match &frames[1] {
      Message::HttpResponseChunk(chunk) => assert_eq!(chunk.data, "b2s="),
      other => panic!("Expected CHUNK, got {:?}", other),
    }
    assert_eq!(frames[2], Message::end(RequestId::from("r1")));
  }

  #[tokio::test]
  async fn error_statuses_still_end_normally() {
    for (raw, status) in [
      (
        &b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found"[..],
        404u16,
      ),
      (
        &b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"[..],
        500u16,
      ),
    ] {
      let (base, _server) = serve(vec![Step::Write(raw)]).await;
      let sink = RecordingSender::new();
      executor()
        .run(request(&base, "/missing", 5000), &sink, Default::default())
        .await;
      let frames = sink.messages();
      match &frames[0] {
        Message::HttpResponseStart(start) => assert_eq!(start.status_code, status),
        other => panic!("Expected START, got {:?}", other),
      }
      assert!(matches!(frames.last(), Some(Message::HttpResponseEnd(_))));
      assert_well_formed(&frames);
    }
  }

  #[tokio::test]
  async fn chunked_bodies_stream_in_order() {
    let (base, _server) = serve(vec![
      Step::Write(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"),
      Step::Write(b"5\r\nhello\r\n"),
      Step::Pause(Duration::from_millis(50)),
      Step::Write(b"6\r\n world\r\n"),
      Step::Pause(Duration::from_millis(50)),
      Step::Write(b"0\r\n\r\n"),
    ])
    .await;
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(request(&base, "/", 5000), &sink, Default::default())
      .await;
    assert!(matches!(outcome, Outcome::Completed { chunks } if chunks >= 2));
    let frames = sink.messages();
    assert!(matches!(frames.last(), Some(Message::HttpResponseEnd(_))));
    assert_eq!(assert_well_formed(&frames), b"hello world");
  }

  #[tokio::test]
  async fn refused_connections_produce_a_single_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(
        request(&format!("http://{}", addr), "/status", 5000),
        &sink,
        Default::default(),
      )
      .await;
    assert_eq!(outcome, Outcome::Failed);
    let frames = sink.messages();
    assert_eq!(frames.len(), 1, "{:?}", frames);
    match &frames[0] {
      Message::HttpResponseError(error) => {
        assert_eq!(error.request_id, RequestId::from("r1"));
        assert!(
          error.error.to_lowercase().contains("refused"),
          "Error should name the cause: {}",
          error.error
        );
      }
      other => panic!("Expected ERROR, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn header_timeout_is_an_error() {
    let (base, _server) = serve(vec![Step::Pause(Duration::from_secs(10))]).await;
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(request(&base, "/slow", 200), &sink, Default::default())
      .await;
    assert_eq!(outcome, Outcome::Failed);
    let frames = sink.messages();
    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0], Message::HttpResponseError(e) if e.error.contains("Timed out")));
  }

  #[tokio::test]
  async fn stalled_body_ends_with_error_after_start() {
    let (base, _server) = serve(vec![
      Step::Write(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello"),
      Step::Pause(Duration::from_secs(10)),
    ])
    .await;
    let sink = RecordingSender::new();
    executor()
      .run(request(&base, "/", 200), &sink, Default::default())
      .await;
    let frames = sink.messages();
    assert!(matches!(frames[0], Message::HttpResponseStart(_)));
    assert!(matches!(frames.last(), Some(Message::HttpResponseError(_))));
    assert!(!frames
      .iter()
      .any(|f| matches!(f, Message::HttpResponseEnd(_))));
    assert_eq!(assert_well_formed(&frames), b"hello");
  }

  #[tokio::test]
  async fn truncated_body_ends_with_error() {
    let (base, _server) = serve(vec![Step::Write(
      b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello",
    )])
    .await;
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(request(&base, "/", 5000), &sink, Default::default())
      .await;
    assert_eq!(outcome, Outcome::Failed);
    let frames = sink.messages();
    assert!(matches!(frames[0], Message::HttpResponseStart(_)));
    assert!(matches!(frames.last(), Some(Message::HttpResponseError(_))));
    assert_well_formed(&frames);
  }

  #[tokio::test]
  async fn timeout_applies_per_read_not_per_transfer() {
    let (base, _server) = serve(vec![
      Step::Write(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"),
      Step::Pause(Duration::from_millis(150)),
      Step::Write(b"1\r\na\r\n"),
      Step::Pause(Duration::from_millis(150)),
      Step::Write(b"1\r\nb\r\n"),
      Step::Pause(Duration::from_millis(150)),
      Step::Write(b"1\r\nc\r\n"),
      Step::Pause(Duration::from_millis(150)),
      Step::Write(b"0\r\n\r\n"),
    ])
    .await;
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(request(&base, "/", 400), &sink, Default::default())
      .await;
    assert!(matches!(outcome, Outcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(assert_well_formed(&sink.messages()), b"abc");
  }

  #[tokio::test]
  async fn forwards_method_headers_and_body() {
    let (base, server) = serve(vec![Step::Write(
      b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
    )])
    .await;
    let mut outbound = request(&format!("{}/", base), "api/submit?x=1", 5000);
    outbound.target.method = "post".into();
    outbound.target.headers = vec![
      ("X-Custom", "a"),
      ("X-Custom", "b"),
      ("Host", "spoofed.example"),
    ]
    .into_iter()
    .collect();
    outbound.target.body = Some("payload".into());
    let sink = RecordingSender::new();
    executor().run(outbound, &sink, Default::default()).await;

    let received = server.await.unwrap().to_ascii_lowercase();
    assert!(received.starts_with("post /api/submit?x=1 http/1.1\r\n"), "{}", received);
    assert!(received.contains("x-custom: a\r\n"));
    assert!(received.contains("x-custom: b\r\n"));
    assert!(!received.contains("spoofed.example"));
    assert!(received.ends_with("\r\n\r\npayload"));
    assert!(matches!(
      &sink.messages()[0],
      Message::HttpResponseStart(start) if start.status_code == 201
    ));
  }

  #[tokio::test]
  async fn setup_failures_are_reported() {
    let bad_url = request("not a url", "/", 1000);
    let mut bad_method = request("http://127.0.0.1:1", "/", 1000);
    bad_method.target.method = "BAD METHOD".into();
    for bad in [bad_url, bad_method] {
      let sink = RecordingSender::new();
      assert_eq!(
        executor().run(bad, &sink, Default::default()).await,
        Outcome::Failed
      );
      let frames = sink.messages();
      assert_eq!(frames.len(), 1);
      assert!(matches!(frames[0], Message::HttpResponseError(_)));
    }
  }

  #[tokio::test]
  async fn cancellation_abandons_without_frames() {
    let (base, _server) = serve(vec![Step::Pause(Duration::from_secs(10))]).await;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      trigger.cancel();
    });
    let sink = RecordingSender::new();
    let outcome = executor()
      .run(
        request(&base, "/", 5000),
        &sink,
        CancellationListener::from(token),
      )
      .await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(sink.messages().is_empty());
  }

  #[test]
  fn url_resolution_follows_reference_rules() {
    let resolve = |base: &str, path: &str| resolve_url(base, path).unwrap().to_string();
    assert_eq!(
      resolve("http://127.0.0.1:9000", "/status"),
      "http://127.0.0.1:9000/status"
    );
    assert_eq!(
      resolve("http://svc.local/api/v1/", "items?id=2"),
      "http://svc.local/api/v1/items?id=2"
    );
    assert_eq!(
      resolve("http://svc.local/api/v1", "items"),
      "http://svc.local/api/items"
    );
    assert_eq!(
      resolve("http://svc.local/api/", "http://other.local/x"),
      "http://other.local/x"
    );
    assert!(resolve_url("relative/base", "/x").is_err());
  }
}
