// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Progress-engine counters.
//!
//! The engine bumps relaxed atomics while it runs; applications only see
//! the [`MetricsSnapshot`] returned by [`Domain::metrics`].
//!
//! ```
//! use sockfab::{Domain, DomainConfig};
//!
//! let domain = Domain::open(DomainConfig::default())?;
//! let m = domain.metrics();
//! assert_eq!(m.active_connections, 0);
//! assert_eq!(m.messages_sent, 0);
//! # Ok::<(), sockfab::Error>(())
//! ```
//!
//! [`Domain::metrics`]: crate::Domain::metrics

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ProgressMetrics {
    active: AtomicU64,
    established: AtomicU64,
    failed: AtomicU64,
    tx_msgs: AtomicU64,
    rx_msgs: AtomicU64,
    // headers included
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    protocol_errors: AtomicU64,
    truncations: AtomicU64,
    blocked: AtomicU64,
    exhausted: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ProgressMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connection_established(&self) {
        bump(&self.established, 1);
        bump(&self.active, 1);
    }

    /// Saturates at zero: an endpoint torn down before its handshake
    /// finished was never counted as active.
    pub(crate) fn record_connection_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn record_connection_failed(&self) {
        bump(&self.failed, 1);
    }

    pub(crate) fn record_message_sent(&self, bytes: usize) {
        bump(&self.tx_msgs, 1);
        bump(&self.tx_bytes, bytes as u64);
    }

    pub(crate) fn record_message_received(&self, bytes: usize) {
        bump(&self.rx_msgs, 1);
        bump(&self.rx_bytes, bytes as u64);
    }

    pub(crate) fn record_protocol_error(&self) {
        bump(&self.protocol_errors, 1);
    }

    pub(crate) fn record_truncation(&self) {
        bump(&self.truncations, 1);
    }

    pub(crate) fn record_send_blocked(&self) {
        bump(&self.blocked, 1);
    }

    pub(crate) fn record_xfer_exhausted(&self) {
        bump(&self.exhausted, 1);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_connections: get(&self.active),
            connections_established: get(&self.established),
            connections_failed: get(&self.failed),
            messages_sent: get(&self.tx_msgs),
            messages_received: get(&self.rx_msgs),
            bytes_sent: get(&self.tx_bytes),
            bytes_received: get(&self.rx_bytes),
            protocol_errors: get(&self.protocol_errors),
            truncations: get(&self.truncations),
            send_blocked_count: get(&self.blocked),
            xfer_exhausted: get(&self.exhausted),
        }
    }
}

/// Domain counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Endpoints currently connected
    pub active_connections: u64,
    pub connections_established: u64,
    /// Refused, rejected or version-mismatched handshakes
    pub connections_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Malformed headers, sequence gaps, unexpected acks
    pub protocol_errors: u64,
    pub truncations: u64,
    /// Transmit attempts that hit `WouldBlock`
    pub send_blocked_count: u64,
    /// Transfer-entry allocations refused
    pub xfer_exhausted: u64,
}
