// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use reqwest::Url;

pub fn parse_relay_url(v: &str) -> Result<Url> {
  let url = Url::parse(v)?;
  match url.scheme() {
    "ws" | "wss" => Ok(url),
    other => Err(AnyErr::msg(format!(
      "Relay URL scheme must be ws or wss, not {}",
      other
    ))),
  }
}

pub fn parse_positive_u64(v: &str) -> Result<u64> {
  match v.parse::<u64>() {
    Ok(0) => Err(AnyErr::msg("Value must be greater than zero")),
    Ok(n) => Ok(n),
    Err(_) => Err(AnyErr::msg("Value must be a positive integer")),
  }
}

pub fn validate_relay_url(v: &str) -> Result<(), String> {
  parse_relay_url(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_positive_u64(v: &str) -> Result<(), String> {
  parse_positive_u64(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_non_empty(v: &str) -> Result<(), String> {
  if v.trim().is_empty() {
    Err(String::from("Value must not be empty"))
  } else {
    Ok(())
  }
}
