// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket stream wrapper.
//!
//! - [`byte_stream`] - the stream trait (TCP or in-memory mock)
//! - [`bsock`] - staging/prefetch buffering and async send tracking

pub(crate) mod byte_stream;
pub(crate) mod bsock;

pub(crate) use bsock::BufferedSocket;
