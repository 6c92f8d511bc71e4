// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

/// Exponential reconnect schedule with a ceiling and a finite attempt budget
///
/// The n-th reconnect attempt (counting from 1) waits `min(base * 2^n, cap)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub base: Duration,
  pub cap: Duration,
  pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(1000),
      cap: Duration::from_millis(30000),
      max_attempts: 50,
    }
  }
}

impl ReconnectPolicy {
  /// Delay before the next attempt, given how many attempts have already been made
  /// since the last successful connection; `None` once the budget is spent.
  pub fn delay_for(&self, attempts_made: u32) -> Option<Duration> {
    if attempts_made >= self.max_attempts {
      return None;
    }
    let exponent = attempts_made.saturating_add(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    Some(self.base.saturating_mul(factor).min(self.cap))
  }
}
