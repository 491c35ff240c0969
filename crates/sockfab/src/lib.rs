// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # sockfab - message and RMA fabric over TCP sockets
//!
//! Connection-oriented endpoints with tagged messaging, remote memory
//! access and asynchronous completion reporting, implemented over plain
//! non-blocking TCP byte streams.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                           Application                               |
//! |   Domain -> Endpoint / PassiveEndpoint -> CompletionQueue / EQ      |
//! +---------------------------------------------------------------------+
//! |                         Progress engine                             |
//! |   poll (epoll | poll array) | FdSignal wake | auto thread / manual  |
//! +---------------------------------------------------------------------+
//! |                           Endpoints                                 |
//! |   handshake state machine | rx handlers | tx queues | xfer pool     |
//! +---------------------------------------------------------------------+
//! |                         Socket wrapper                              |
//! |   staging send buffer | prefetch receive buffer | TCP or mock       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Domain`] | Owns one progress engine, factory for everything else |
//! | [`Endpoint`] | Connected endpoint: send, recv, tagged, RMA |
//! | [`PassiveEndpoint`] | Listener producing [`ConnRequest`] events |
//! | [`CompletionQueue`] | Success and error completions of data operations |
//! | [`EventQueue`] | Connection-management events |
//! | [`Counter`] | Lightweight success/error counts |
//!
//! ## Progress
//!
//! Nothing blocks on the network when posting. All I/O happens inside a
//! progress pass, run either by a background thread
//! ([`ProgressMode::Auto`]) or by the application through
//! [`Domain::progress`] and the blocking queue reads
//! ([`ProgressMode::Manual`]).

pub mod api;
pub mod av;
pub mod config;
pub mod cq;
pub mod domain;
pub mod eq;
pub mod error;
pub mod flags;
pub mod metrics;
pub mod mr;
pub mod proto;

pub(crate) mod arena;
pub(crate) mod endpoint;
pub(crate) mod listener;
pub(crate) mod lock_order;
pub(crate) mod notify;
pub(crate) mod poll;
pub(crate) mod progress;
pub(crate) mod queue;
pub(crate) mod stream;
pub(crate) mod xfer;

pub use api::{Endpoint, PassiveEndpoint, RecvMsg, RmaMsg, SendMsg, TaggedMsg};
pub use av::{AddressVector, FabricAddr};
pub use config::{DomainConfig, PollMode, ProgressMode, DEFAULT_MAX_EVENTS, DEFAULT_MIN_MULTI_RECV};
pub use cq::{Completion, CompletionError, CompletionQueue, Counter, Counters, CqConfig};
pub use domain::{Domain, EndpointAttr};
pub use endpoint::{EndpointId, EpState};
pub use eq::{CmEvent, ConnRequest, EqError, EventQueue};
pub use error::{Error, ErrorCode, Result};
pub use flags::{CompletionFlags, MrAccess, OpFlags};
pub use metrics::MetricsSnapshot;
pub use mr::MemoryRegion;
pub use proto::{RmaIov, WireOrder, MAX_CM_DATA, MAX_INJECT};
