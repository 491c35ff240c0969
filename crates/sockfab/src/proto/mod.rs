// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire formats: the data-path header and the handshake message.

pub(crate) mod cm;
pub(crate) mod header;

pub use cm::{CM_VERSION, MAX_CM_DATA};
pub use header::{RmaIov, WireOrder, HDR_VERSION, IOV_LIMIT, MAX_HDR_SIZE, MAX_INJECT};
pub(crate) use header::{BaseHeader, Header, HeaderExt, HeaderFlags, HeaderSwap, Op, BASE_HDR_SIZE};
