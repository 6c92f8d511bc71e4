// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use dashmap::DashMap;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing_futures::Instrument;

use super::{
  executor::RequestExecutor,
  protocol::{HttpRequest, Message, RequestId},
  transport::{FrameSender, InboundHandler, Link},
};

pub const AT_CAPACITY: &str = "connector is at capacity";

/// What happens to a request that arrives while `max_in_flight` are running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
  /// Wait for a slot; abandoned if the delivering connection drops first
  #[default]
  Queue,
  /// Answer immediately with an error frame
  Reject,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
  /// `None` runs every request as soon as it arrives
  pub max_in_flight: Option<usize>,
  pub overflow: OverflowPolicy,
}

/// Counts one in-flight request until dropped
struct PendingEntry {
  pending: Arc<DashMap<RequestId, usize>>,
  request_id: RequestId,
}

impl PendingEntry {
  fn track(pending: &Arc<DashMap<RequestId, usize>>, request_id: RequestId) -> Self {
    let mut count = pending.entry(request_id.clone()).or_insert(0);
    *count += 1;
    if *count > 1 {
      tracing::warn!(
        request_id = %request_id,
        in_flight = *count,
        "Relay reused a request id that is still in flight"
      );
    }
    drop(count);
    Self {
      pending: Arc::clone(pending),
      request_id,
    }
  }
}

impl Drop for PendingEntry {
  fn drop(&mut self) {
    self
      .pending
      .remove_if_mut(&self.request_id, |_, count| {
        *count -= 1;
        *count == 0
      });
  }
}

/// Routes relay commands to concurrent executions
///
/// Each request runs as its own task, writing its frames through the link of
/// the connection it arrived on.
pub struct Dispatcher {
  executor: Arc<dyn RequestExecutor>,
  overflow: OverflowPolicy,
  permits: Option<Arc<Semaphore>>,
  pending: Arc<DashMap<RequestId, usize>>,
}

impl Dispatcher {
  pub fn new(executor: Arc<dyn RequestExecutor>, config: DispatchConfig) -> Self {
    Self {
      executor,
      overflow: config.overflow,
      permits: config
        .max_in_flight
        .map(|limit| Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS)))),
      pending: Default::default(),
    }
  }

  /// Number of requests accepted and not yet finished, queued ones included
  pub fn pending_count(&self) -> usize {
    self.pending.iter().map(|entry| *entry.value()).sum()
  }

  pub fn is_pending(&self, request_id: &RequestId) -> bool {
    self.pending.contains_key(request_id)
  }

  /// Spawns execution of `request`, returning `None` if it was turned away
  pub fn dispatch(&self, request: HttpRequest, link: Link) -> Option<JoinHandle<()>> {
    let permit = match (&self.permits, self.overflow) {
      (Some(permits), OverflowPolicy::Reject) => match Arc::clone(permits).try_acquire_owned() {
        Ok(permit) => Some(permit),
        Err(_) => {
          tracing::warn!(request_id = %request.request_id, "Rejecting request at capacity");
          link.send(&Message::error(request.request_id, AT_CAPACITY));
          return None;
        }
      },
      _ => None,
    };
    let queue = match self.overflow {
      OverflowPolicy::Queue => self.permits.clone(),
      OverflowPolicy::Reject => None,
    };

    let entry = PendingEntry::track(&self.pending, request.request_id.clone());
    let executor = Arc::clone(&self.executor);
    let span = tracing::info_span!(
      "http_request",
      request_id = %request.request_id,
      method = %request.target.method,
      path = %request.target.path,
    );
    let task = async move {
      let _entry = entry;
      let cancellation = link.closed_listener();
      let _permit = match (permit, queue) {
        (Some(permit), _) => Some(permit),
        (None, Some(queue)) => tokio::select! {
          acquired = queue.acquire_owned() => match acquired {
            Ok(permit) => Some(permit),
            Err(_) => return,
          },
          _ = cancellation.cancelled() => {
            tracing::debug!("Relay connection dropped while request was queued");
            return;
          }
        },
        (None, None) => None,
      };
      executor.execute(request, &link, cancellation).await;
    };
    Some(tokio::task::spawn(task.instrument(span)))
  }
}

impl InboundHandler for Dispatcher {
  fn handle(&self, message: Message, link: Link) {
    match message {
      Message::HttpRequest(request) => {
        self.dispatch(request, link);
      }
      other => tracing::debug!(kind = other.kind(), "Ignoring unexpected relay message"),
    }
  }
}
