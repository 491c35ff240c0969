// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-management event queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use crate::endpoint::EndpointId;
use crate::error::{Error, ErrorCode, Result};
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::notify::WakeNotifier;
use crate::progress::Progress;

/// Incoming connection waiting for `Domain::accept` or `Domain::reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnRequest {
    pub(crate) slot: u32,
    pub(crate) serial: u64,
    /// Address of the connecting peer
    pub peer_addr: SocketAddr,
    /// Connection data sent by the peer
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    ConnRequest(ConnRequest),
    /// Handshake finished; `data` is the peer's accept payload (empty on
    /// the accepting side).
    Connected { endpoint: EndpointId, data: Vec<u8> },
    /// The peer closed or shut down a connected endpoint.
    Shutdown { endpoint: EndpointId },
}

/// Failed connection attempt or fatal connection error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqError {
    /// `None` for failures on a listener before an endpoint exists
    pub endpoint: Option<EndpointId>,
    pub code: ErrorCode,
    /// Reject payload, if the peer sent one
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct EqState {
    events: VecDeque<CmEvent>,
    errors: VecDeque<EqError>,
}

#[derive(Debug)]
pub struct EventQueue {
    state: OrderedMutex<EqState>,
    notifier: WakeNotifier,
    progress: Weak<Progress>,
}

impl EventQueue {
    pub(crate) fn new(progress: Weak<Progress>) -> Self {
        Self {
            state: OrderedMutex::new(LockLevel::Queue, EqState::default()),
            notifier: WakeNotifier::new(),
            progress,
        }
    }

    /// Next event, if any. `Err(ErrorAvailable)` while error events are
    /// queued.
    pub fn read(&self) -> Result<Option<CmEvent>> {
        if let Some(p) = self.progress.upgrade() {
            if !p.is_auto() {
                p.assist(Some(Duration::ZERO));
            }
        }
        let mut state = self.state.lock();
        if !state.errors.is_empty() {
            return Err(Error::ErrorAvailable);
        }
        Ok(state.events.pop_front())
    }

    pub fn read_error(&self) -> Option<EqError> {
        self.state.lock().errors.pop_front()
    }

    /// Wait up to `timeout` for an event.
    pub fn sread(&self, timeout: Duration) -> Result<Option<CmEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.read()? {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = deadline - now;
            match self.progress.upgrade() {
                Some(p) if !p.is_auto() => {
                    if !p.assist(Some(slice)) {
                        self.notifier.wait_timeout(slice.min(Duration::from_millis(1)));
                    }
                }
                _ => {
                    self.notifier.wait_timeout(slice);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.events.len() + state.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, event: CmEvent) {
        log::debug!("[cm] event {:?}", event);
        self.state.lock().events.push_back(event);
        self.notifier.notify();
    }

    pub(crate) fn push_error(&self, error: EqError) {
        log::debug!("[cm] error event {:?}", error);
        self.state.lock().errors.push_back(error);
        self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_take_precedence() {
        let eq = EventQueue::new(Weak::new());
        let ep = EndpointId::new(3, 0);
        eq.push(CmEvent::Shutdown { endpoint: ep });
        eq.push_error(EqError {
            endpoint: Some(ep),
            code: ErrorCode::Rejected,
            data: b"busy".to_vec(),
        });
        assert_eq!(eq.len(), 2);

        assert!(matches!(eq.read(), Err(Error::ErrorAvailable)));
        let err = eq.read_error().unwrap();
        assert_eq!(err.code, ErrorCode::Rejected);
        assert_eq!(err.data, b"busy");
        assert_eq!(eq.read().unwrap(), Some(CmEvent::Shutdown { endpoint: ep }));
        assert!(eq.is_empty());
    }

    #[test]
    fn test_sread_timeout() {
        let eq = EventQueue::new(Weak::new());
        assert_eq!(eq.sread(Duration::from_millis(5)).unwrap(), None);
    }
}
