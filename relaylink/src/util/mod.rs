// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod backoff;
pub mod cancellation;
pub mod validators;
