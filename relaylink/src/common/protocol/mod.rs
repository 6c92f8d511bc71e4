// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire contract between the relay and the connector

pub mod headers;
pub mod message;

pub use headers::Headers;
pub use message::{
  decode, BodyEncoding, DecodeError, EncodeError, Heartbeat, HttpRequest, Message, RequestId,
  ResponseChunk, ResponseEnd, ResponseError, ResponseStart, Target,
};
