// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain configuration.
//!
//! [`DomainConfig`] holds every tunable of one progress domain. Defaults
//! match the wire constants; [`DomainConfig::from_env`] layers
//! `SOCKFAB_*` environment overrides on top.
//!
//! # Example
//!
//! ```
//! use sockfab::{DomainConfig, ProgressMode};
//!
//! let config = DomainConfig::default()
//!     .with_progress(ProgressMode::Auto)
//!     .with_staging_sbuf_size(0);
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::proto::WireOrder;

/// Minimum remaining space before a multi-receive buffer is released.
pub const DEFAULT_MIN_MULTI_RECV: usize = 16384;

/// Maximum readiness events fetched per poll call.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Who drives socket progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// A background thread polls and progresses every endpoint.
    Auto,
    /// Progress only runs inside application calls (CQ/EQ reads,
    /// `Domain::progress`).
    Manual,
}

impl FromStr for ProgressMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProgressMode::Auto),
            "manual" => Ok(ProgressMode::Manual),
            other => Err(Error::InvalidArgument(format!("progress mode {other:?}"))),
        }
    }
}

/// Readiness mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Scalable kernel event notification (epoll/kqueue through mio).
    Epoll,
    /// Plain `poll(2)` over a descriptor array.
    Poll,
}

impl FromStr for PollMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" => Ok(PollMode::Epoll),
            "poll" => Ok(PollMode::Poll),
            other => Err(Error::InvalidArgument(format!("poll mode {other:?}"))),
        }
    }
}

/// Configuration of one domain (one progress context).
#[derive(Clone, Debug)]
pub struct DomainConfig {
    // === Progress ===
    /// Background thread or application-driven progress
    pub progress: ProgressMode,

    /// Readiness mechanism used by the progress engine
    pub poll_mode: PollMode,

    /// Tick of the automatic progress thread when idle
    pub poll_timeout: Duration,

    /// Readiness events fetched per poll call
    pub max_events: usize,

    /// Messages parsed per endpoint per pass before yielding to siblings
    pub rx_budget: usize,

    // === Sockets ===
    /// Disable Nagle's algorithm on data sockets
    pub nodelay: bool,

    /// Listen backlog of passive endpoints
    pub listen_backlog: i32,

    /// Ports tried in order when a passive endpoint binds to port 0
    pub port_range: Option<(u16, u16)>,

    // === Buffers ===
    /// Staging buffer for small sends (0 disables staging)
    pub staging_sbuf_size: usize,

    /// Prefetch buffer for small reads (0 disables prefetch)
    pub prefetch_rbuf_size: usize,

    // === Limits ===
    /// Transfer-entry pool capacity
    pub max_xfers: usize,

    /// Largest accepted message payload
    pub max_msg_size: usize,

    /// Default multi-receive release threshold
    pub min_multi_recv: usize,

    // === Wire ===
    /// Byte order this domain writes headers in. Defaults to the host
    /// order; overriding it simulates a foreign-endian peer.
    pub wire_order: WireOrder,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            progress: ProgressMode::Manual,
            poll_mode: PollMode::Epoll,
            poll_timeout: Duration::from_millis(100),
            max_events: DEFAULT_MAX_EVENTS,
            rx_budget: 64,

            nodelay: true,
            listen_backlog: 128,
            port_range: None,

            staging_sbuf_size: 9000,
            prefetch_rbuf_size: 9000,

            max_xfers: 4096,
            max_msg_size: 64 * 1024 * 1024,
            min_multi_recv: DEFAULT_MIN_MULTI_RECV,

            wire_order: WireOrder::native(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("[config] ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("[config] ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

impl DomainConfig {
    /// Defaults overridden by `SOCKFAB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(mode) = env_parse("SOCKFAB_PROGRESS") {
            config.progress = mode;
        }
        if let Some(mode) = env_parse("SOCKFAB_POLL") {
            config.poll_mode = mode;
        }
        if let Some(nodelay) = env_bool("SOCKFAB_NODELAY") {
            config.nodelay = nodelay;
        }
        if let Some(size) = env_parse("SOCKFAB_STAGING_SBUF_SIZE") {
            config.staging_sbuf_size = size;
        }
        if let Some(size) = env_parse("SOCKFAB_PREFETCH_RBUF_SIZE") {
            config.prefetch_rbuf_size = size;
        }
        if let Some(max) = env_parse("SOCKFAB_MAX_XFERS") {
            config.max_xfers = max;
        }
        if let Some(max) = env_parse("SOCKFAB_MAX_MSG_SIZE") {
            config.max_msg_size = max;
        }
        let low: Option<u16> = env_parse("SOCKFAB_PORT_LOW");
        let high: Option<u16> = env_parse("SOCKFAB_PORT_HIGH");
        if let (Some(low), Some(high)) = (low, high) {
            config.port_range = Some((low, high));
        }
        config
    }

    pub fn with_progress(mut self, mode: ProgressMode) -> Self {
        self.progress = mode;
        self
    }

    pub fn with_poll_mode(mut self, mode: PollMode) -> Self {
        self.poll_mode = mode;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_staging_sbuf_size(mut self, size: usize) -> Self {
        self.staging_sbuf_size = size;
        self
    }

    pub fn with_prefetch_rbuf_size(mut self, size: usize) -> Self {
        self.prefetch_rbuf_size = size;
        self
    }

    pub fn with_max_xfers(mut self, max: usize) -> Self {
        self.max_xfers = max;
        self
    }

    pub fn with_max_msg_size(mut self, max: usize) -> Self {
        self.max_msg_size = max;
        self
    }

    pub fn with_port_range(mut self, low: u16, high: u16) -> Self {
        self.port_range = Some((low, high));
        self
    }

    pub fn with_wire_order(mut self, order: WireOrder) -> Self {
        self.wire_order = order;
        self
    }

    pub fn with_min_multi_recv(mut self, size: usize) -> Self {
        self.min_multi_recv = size;
        self
    }

    /// Reject inconsistent settings before any resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.max_xfers == 0 || self.max_xfers > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "max_xfers {} out of range",
                self.max_xfers
            )));
        }
        if self.max_events == 0 {
            return Err(Error::InvalidArgument("max_events must be > 0".into()));
        }
        if self.rx_budget == 0 {
            return Err(Error::InvalidArgument("rx_budget must be > 0".into()));
        }
        if let Some((low, high)) = self.port_range {
            if low == 0 || low > high {
                return Err(Error::InvalidArgument(format!(
                    "port range {low}..={high} invalid"
                )));
            }
        }
        Ok(())
    }
}
