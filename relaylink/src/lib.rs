// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connector side of an HTTP relay tunnel
//!
//! The connector keeps one outbound websocket to a relay, receives HTTP
//! request commands over it, performs them against private targets, and
//! streams the responses back as ordered frames.

pub mod common;
pub mod util;
