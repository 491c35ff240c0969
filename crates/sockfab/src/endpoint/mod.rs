// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-oriented endpoint core.
//!
//! An [`EpInner`] is owned by the progress state and only touched under
//! the progress lock. It carries:
//!
//! - the connection state machine ([`state`], [`cm`])
//! - the receive cursor and its header-driven handlers ([`rx`])
//! - the transmit cursor and the work queues ([`tx`])
//!
//! Teardown goes through [`EpInner::disable`], which flushes every queued
//! transfer entry exactly once.

pub(crate) mod cm;
pub(crate) mod rx;
pub(crate) mod state;
pub(crate) mod tx;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub use state::EpState;

use crate::av::FabricAddr;
use crate::config::DomainConfig;
use crate::cq::Reporter;
use crate::eq::{CmEvent, EqError, EventQueue};
use crate::error::{Error, ErrorCode, Result};
use crate::metrics::ProgressMetrics;
use crate::mr::MrRegistry;
use crate::poll::{interest, PollRegistry, Target};
use crate::proto::HeaderSwap;
use crate::queue::EpQueues;
use crate::stream::BufferedSocket;
use crate::xfer::{CtrlFlags, XferId, XferPool};

use self::cm::CmProgress;
use self::rx::CurRx;

/// Handle identifying an endpoint inside its domain.
///
/// The slot is reused once the endpoint is closed; the generation tells a
/// stale handle apart from the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    slot: u32,
    generation: u32,
}

impl EndpointId {
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub(crate) const fn slot(self) -> u32 {
        self.slot
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}.{}", self.slot, self.generation)
    }
}

/// Borrowed pieces of the progress state an endpoint needs while it runs.
pub(crate) struct Ctx<'a> {
    pub pool: &'a mut XferPool,
    pub regs: &'a MrRegistry,
    pub registry: &'a PollRegistry,
    pub metrics: &'a ProgressMetrics,
    pub config: &'a DomainConfig,
}

/// Why an endpoint is being disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Cause {
    /// Application closed the endpoint
    Close,
    /// Application shut the endpoint down
    Shutdown,
    /// Connection or handshake failure
    Failed { code: ErrorCode, data: Vec<u8> },
}

impl Cause {
    fn completion_code(&self) -> ErrorCode {
        match self {
            Cause::Close => ErrorCode::Canceled,
            Cause::Shutdown => ErrorCode::Shutdown,
            Cause::Failed { code, .. } => *code,
        }
    }
}

/// Per-endpoint completion defaults, fixed at creation.
#[derive(Debug, Clone)]
pub(crate) struct EpSetup {
    pub reporter: Reporter,
    pub eq: Option<Arc<EventQueue>>,
    pub selective_tx: bool,
    pub selective_rx: bool,
    pub min_multi_recv: usize,
    pub peer_fi_addr: Option<FabricAddr>,
}

pub(crate) struct EpInner {
    pub(crate) id: EndpointId,
    pub(crate) state: EpState,
    pub(crate) bsock: Option<BufferedSocket>,
    pub(crate) cur_rx: CurRx,
    pub(crate) cur_tx: Option<XferId>,
    pub(crate) queues: EpQueues,
    pub(crate) swap: HeaderSwap,
    pub(crate) reporter: Reporter,
    pub(crate) eq: Option<Arc<EventQueue>>,
    pub(crate) peer_fi_addr: Option<FabricAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) min_multi_recv: usize,
    pub(crate) selective_tx: bool,
    pub(crate) selective_rx: bool,
    pub(crate) cm: CmProgress,
    pub(crate) pollout_set: bool,
    pub(crate) registered: bool,
    /// Sequence id stamped on the next transmitted header
    pub(crate) tx_id: u8,
    /// Sequence id expected on the next received header
    pub(crate) rx_id: u8,
    /// Receive budget ran out with data possibly left in the kernel
    pub(crate) rx_resume: bool,
}

impl fmt::Debug for EpInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpInner")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cur_tx", &self.cur_tx)
            .field("queued", &self.queues.len())
            .field("swap", &self.swap)
            .finish_non_exhaustive()
    }
}

impl EpInner {
    pub(crate) fn new(id: EndpointId, setup: EpSetup, config: &DomainConfig) -> Self {
        Self {
            id,
            state: EpState::Idle,
            bsock: None,
            cur_rx: CurRx::new(),
            cur_tx: None,
            queues: EpQueues::default(),
            swap: HeaderSwap::None,
            reporter: setup.reporter,
            eq: setup.eq,
            peer_fi_addr: setup.peer_fi_addr,
            peer_addr: None,
            min_multi_recv: setup.min_multi_recv,
            selective_tx: setup.selective_tx,
            selective_rx: setup.selective_rx,
            cm: CmProgress::new(config.wire_order),
            pollout_set: false,
            registered: false,
            tx_id: 0,
            rx_id: 0,
            rx_resume: false,
        }
    }

    pub(crate) fn set_state(&mut self, to: EpState) {
        debug_assert!(
            self.state.can_transition(to),
            "illegal transition {} -> {}",
            self.state,
            to
        );
        log::debug!("[cm] {} {} -> {}", self.id, self.state, to);
        self.state = to;
    }

    /// Needs a progress pass even without socket readiness.
    pub(crate) fn needs_active_wait(&self) -> bool {
        if self.state != EpState::Connected {
            return false;
        }
        let buffered = self.bsock.as_ref().is_some_and(BufferedSocket::readable);
        let parked = self.cur_rx.handler.is_some() && self.cur_rx.entry.is_none();
        buffered || parked || self.rx_resume
    }

    /// Register the socket with the poll set.
    pub(crate) fn register(&mut self, ctx: &Ctx<'_>, want_out: bool) -> Result<()> {
        let Some(bsock) = self.bsock.as_ref() else {
            return Ok(());
        };
        ctx.registry
            .register(bsock.fd(), Target::Endpoint(self.id.slot()), interest(want_out))?;
        self.registered = true;
        self.pollout_set = want_out;
        Ok(())
    }

    /// Track `POLLOUT` interest: wanted while anything waits to be written.
    pub(crate) fn update_poll(&mut self, ctx: &Ctx<'_>) {
        if !self.registered {
            return;
        }
        let Some(bsock) = self.bsock.as_ref() else {
            return;
        };
        let want_out = self.cur_tx.is_some()
            || !self.queues.priority.is_empty()
            || !self.queues.tx.is_empty()
            || bsock.tosend() > 0
            || self.state.is_handshake();
        if want_out == self.pollout_set {
            return;
        }
        match ctx
            .registry
            .reregister(bsock.fd(), Target::Endpoint(self.id.slot()), interest(want_out))
        {
            Ok(()) => self.pollout_set = want_out,
            Err(e) => log::warn!("[progress] {} reregister failed: {}", self.id, e),
        }
    }

    /// Run whatever the current state allows. Fatal errors disable the
    /// endpoint.
    pub(crate) fn progress(&mut self, ctx: &mut Ctx<'_>) {
        if let Err(err) = self.drive(ctx) {
            self.fail(&err, ctx);
        }
        self.update_poll(ctx);
    }

    fn drive(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        if self.state.is_handshake() {
            self.progress_cm(ctx)?;
        }
        if self.state == EpState::Connected {
            self.progress_rx(ctx)?;
            self.progress_tx(ctx)?;
        }
        Ok(())
    }

    /// Disable after an error returned from the data path or handshake.
    pub(crate) fn fail(&mut self, err: &Error, ctx: &mut Ctx<'_>) {
        if matches!(err, Error::Protocol(_) | Error::VersionMismatch { .. }) {
            ctx.metrics.record_protocol_error();
        }
        let code = ErrorCode::from(err);
        log::debug!("[progress] {} error in state {}: {}", self.id, self.state, err);
        self.disable(
            Cause::Failed {
                code,
                data: Vec::new(),
            },
            ctx,
        );
    }

    /// Tear the connection down and flush every queued entry.
    ///
    /// Internal entries are released silently; application entries get
    /// one error completion each. Idempotent.
    pub(crate) fn disable(&mut self, cause: Cause, ctx: &mut Ctx<'_>) {
        if self.state == EpState::Disconnected {
            return;
        }
        let was = self.state;
        match &cause {
            Cause::Failed { code, .. } => {
                log::warn!("[progress] {} disable ({}): {}", self.id, was, code);
            }
            other => log::debug!("[progress] {} disable ({}): {:?}", self.id, was, other),
        }
        self.set_state(EpState::Disconnected);

        if let Some(mut bsock) = self.bsock.take() {
            if self.registered {
                ctx.registry.deregister(bsock.fd(), Target::Endpoint(self.id.slot()));
                self.registered = false;
            }
            // best effort: hand queued bytes to the kernel before closing
            let _ = bsock.flush();
            bsock.shutdown();
        }

        self.flush_entries(cause.completion_code(), ctx);

        if was == EpState::Connected {
            ctx.metrics.record_connection_closed();
        } else if was.is_handshake() {
            ctx.metrics.record_connection_failed();
        }
        self.post_disable_event(was, cause);
    }

    fn flush_entries(&mut self, code: ErrorCode, ctx: &mut Ctx<'_>) {
        let mut ids: Vec<XferId> = Vec::with_capacity(self.queues.len() + 3);
        ids.extend(self.cur_tx.take());
        ids.extend(self.queues.drain_all());
        if let Some(id) = self.cur_rx.entry.take() {
            // a multi-receive buffer stays on the rx queue while in use
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.extend(self.cur_rx.ack.take());

        for id in ids {
            let entry = ctx.pool.get_mut(id);
            let internal = entry
                .ctrl_flags
                .intersects(CtrlFlags::INTERNAL | CtrlFlags::NEED_DYN_RBUF);
            if !internal {
                self.reporter.error(entry, code);
            }
            ctx.pool.release(id);
        }
        self.cur_rx.reset();
        self.rx_resume = false;
    }

    fn post_disable_event(&self, was: EpState, cause: Cause) {
        let Some(eq) = self.eq.as_ref() else {
            return;
        };
        let Cause::Failed { code, data } = cause else {
            return;
        };
        if was == EpState::Connected && code == ErrorCode::ConnectionReset {
            eq.push(CmEvent::Shutdown { endpoint: self.id });
        } else {
            eq.push_error(EqError {
                endpoint: Some(self.id),
                code,
                data,
            });
        }
    }
}
