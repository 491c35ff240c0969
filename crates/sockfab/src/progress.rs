// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Progress engine.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                          Progress                             |
//! |                                                               |
//! |  waiter (Wait lock)          state (Progress lock)            |
//! |  +-------------------+       +-----------------------------+  |
//! |  | Poller            |       | XferPool                    |  |
//! |  |  - endpoint fds   |  -->  | Arena<EpInner>   endpoints  |  |
//! |  |  - listener fds   |       | Arena<PepInner>  listeners  |  |
//! |  |  - pending conns  |       | Arena<ConnHandle> requests  |  |
//! |  |  - FdSignal       |       +-----------------------------+  |
//! |  +-------------------+                                        |
//! +---------------------------------------------------------------+
//! ```
//!
//! One pass: take the waiter lock, wait for readiness (zero timeout when
//! an endpoint needs an active pass), then take the progress lock and
//! dispatch every event by token kind. Endpoints that hold buffered input
//! or a parked receive handler are progressed even without an event.
//!
//! In automatic mode a `sockfab-progress` thread runs passes until the
//! domain is dropped. In manual mode passes run inside CQ/EQ/counter reads
//! and [`crate::Domain::progress`]; whoever fails to take the waiter lock
//! simply lets the current waiter do the work.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Interest;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::{DomainConfig, ProgressMode};
use crate::endpoint::{Cause, Ctx, EndpointId, EpInner, EpSetup};
use crate::eq::{ConnRequest, EventQueue};
use crate::error::{Error, Result};
use crate::listener::{bind_listener, ConnHandle, ConnStatus, PepInner};
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::metrics::ProgressMetrics;
use crate::mr::MrRegistry;
use crate::poll::{new_poller, FdSignal, PollEvent, PollRegistry, Poller, Target};
use crate::proto::MAX_CM_DATA;
use crate::xfer::XferPool;

struct Waiter {
    poller: Poller,
    events: Vec<PollEvent>,
}

/// Everything mutated by a progress pass.
pub(crate) struct ProgressState {
    pub(crate) pool: XferPool,
    pub(crate) eps: Arena<EpInner>,
    pub(crate) peps: Arena<PepInner>,
    pub(crate) conns: Arena<ConnHandle>,
    next_serial: u64,
}

impl ProgressState {
    fn has_active(&self) -> bool {
        self.eps.values().any(EpInner::needs_active_wait)
    }
}

pub(crate) struct Progress {
    config: DomainConfig,
    waiter: OrderedMutex<Waiter>,
    state: OrderedMutex<ProgressState>,
    registry: PollRegistry,
    signal: FdSignal,
    metrics: Arc<ProgressMetrics>,
    regs: Arc<MrRegistry>,
    running: AtomicBool,
    /// A thread is blocked in the poll wait
    waiting: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("mode", &self.config.progress)
            .field("poll", &self.config.poll_mode)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Build a [`Ctx`] from disjoint borrows of the engine and its state.
macro_rules! ctx {
    ($progress:expr, $state:expr) => {
        Ctx {
            pool: &mut $state.pool,
            regs: &$progress.regs,
            registry: &$progress.registry,
            metrics: &$progress.metrics,
            config: &$progress.config,
        }
    };
}

impl Progress {
    pub(crate) fn new(config: DomainConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (poller, registry) = new_poller(config.poll_mode, config.max_events)?;
        let signal = FdSignal::new()?;
        registry.register(signal.fd(), Target::Signal, Interest::READABLE)?;

        let state = ProgressState {
            pool: XferPool::new(config.max_xfers),
            eps: Arena::default(),
            peps: Arena::default(),
            conns: Arena::default(),
            next_serial: 0,
        };
        Ok(Arc::new(Self {
            waiter: OrderedMutex::new(
                LockLevel::Wait,
                Waiter {
                    poller,
                    events: Vec::with_capacity(config.max_events),
                },
            ),
            state: OrderedMutex::new(LockLevel::Progress, state),
            registry,
            signal,
            metrics: Arc::new(ProgressMetrics::new()),
            regs: Arc::new(MrRegistry::new()),
            running: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            thread: Mutex::new(None),
            config,
        }))
    }

    pub(crate) fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub(crate) fn is_auto(&self) -> bool {
        self.config.progress == ProgressMode::Auto
    }

    pub(crate) fn metrics(&self) -> &Arc<ProgressMetrics> {
        &self.metrics
    }

    pub(crate) fn regs(&self) -> &Arc<MrRegistry> {
        &self.regs
    }

    pub(crate) fn xfer_in_use(&self) -> usize {
        self.state.lock().pool.in_use()
    }

    // === Driving ===

    /// Run one pass unless another thread is already waiting. Returns
    /// `false` when the pass was left to that thread.
    pub(crate) fn assist(&self, timeout: Option<Duration>) -> bool {
        let Some(mut waiter) = self.waiter.try_lock() else {
            return false;
        };
        self.pass(&mut waiter, timeout);
        true
    }

    /// Run one pass, waiting for the waiter lock if needed.
    pub(crate) fn run_pass(&self, timeout: Option<Duration>) {
        let mut waiter = self.waiter.lock();
        self.pass(&mut waiter, timeout);
    }

    fn pass(&self, waiter: &mut Waiter, timeout: Option<Duration>) {
        let timeout = if self.state.lock().has_active() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let Waiter { poller, events } = waiter;
        events.clear();
        self.waiting.store(true, Ordering::SeqCst);
        let result = poller.wait(events, timeout);
        self.waiting.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            log::warn!("[progress] poll failed: {}", e);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for event in events.iter() {
            match event.target {
                Target::Signal => self.signal.drain(),
                Target::Endpoint(index) => {
                    if let Some(ep) = state.eps.get_mut(index) {
                        ep.progress(&mut ctx!(self, state));
                    }
                }
                Target::Listener(index) => self.accept_on(state, index),
                Target::Conn(slot) => self.progress_conn(state, slot),
            }
        }
        for index in state.eps.indices() {
            if let Some(ep) = state.eps.get_mut(index) {
                if ep.needs_active_wait() {
                    ep.progress(&mut ctx!(self, state));
                }
            }
        }
    }

    /// Interrupt a blocked poll wait so new work is picked up.
    pub(crate) fn wake(&self) {
        if self.is_auto() || self.waiting.load(Ordering::SeqCst) {
            self.signal.signal();
        }
    }

    /// Start the automatic progress thread. No-op in manual mode.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if !self.is_auto() || self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let progress = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sockfab-progress".to_string())
            .spawn(move || progress.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Io(e)
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(&self) {
        log::debug!("[progress] thread started ({:?})", self.config.poll_mode);
        while self.running.load(Ordering::Relaxed) {
            self.run_pass(Some(self.config.poll_timeout));
        }
        log::debug!("[progress] thread stopped");
    }

    /// Stop and join the automatic progress thread.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.signal.signal();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[progress] thread panicked");
            }
        }
    }

    // === Endpoints ===

    pub(crate) fn create_ep(&self, setup: EpSetup) -> EndpointId {
        let mut state = self.state.lock();
        let index = state.eps.insert_with(|slot, generation| {
            EpInner::new(EndpointId::new(slot, generation), setup, &self.config)
        });
        EndpointId::new(index, state.eps.generation(index))
    }

    /// Run `f` against one endpoint under the progress lock, then wake the
    /// waiter so queued work is seen.
    pub(crate) fn with_ep<R>(
        &self,
        id: EndpointId,
        f: impl FnOnce(&mut EpInner, &mut Ctx<'_>) -> Result<R>,
    ) -> Result<R> {
        let out = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ep = state
                .eps
                .get_mut_at(id.slot(), id.generation())
                .ok_or(Error::NoSuchEndpoint)?;
            f(ep, &mut ctx!(self, state))
        };
        self.wake();
        out
    }

    /// Disable and free an endpoint. Unknown ids are ignored.
    pub(crate) fn close_ep(&self, id: EndpointId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(mut ep) = state.eps.remove_at(id.slot(), id.generation()) {
            ep.disable(Cause::Close, &mut ctx!(self, state));
            log::debug!("[progress] {} closed", id);
        }
    }

    // === Passive side ===

    pub(crate) fn create_pep(&self, addr: SocketAddr, eq: Arc<EventQueue>) -> Result<(u32, SocketAddr)> {
        let listener = bind_listener(addr, &self.config)?;
        let local_addr = listener.local_addr()?;
        let mut state = self.state.lock();
        let index = state
            .peps
            .insert_with(|i, _| PepInner::new(i, listener, local_addr, eq));
        let registered = match state.peps.get(index) {
            Some(pep) => self
                .registry
                .register(pep.fd(), Target::Listener(index), Interest::READABLE),
            None => Ok(()),
        };
        if let Err(e) = registered {
            state.peps.remove(index);
            return Err(e.into());
        }
        log::info!("[cm] listening on {}", local_addr);
        drop(state);
        self.wake();
        Ok((index, local_addr))
    }

    /// Close a listener and drop its pending connections.
    pub(crate) fn close_pep(&self, index: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(mut pep) = state.peps.remove(index) else {
            return;
        };
        pep.close(&self.registry);
        for slot in state.conns.indices() {
            if state.conns.get(slot).is_some_and(|c| c.pep == index) {
                if let Some(mut conn) = state.conns.remove(slot) {
                    conn.close(slot, &self.registry);
                }
            }
        }
    }

    fn accept_on(&self, state: &mut ProgressState, index: u32) {
        let Some(pep) = state.peps.get(index) else {
            return;
        };
        for (stream, peer) in pep.accept_pending() {
            state.next_serial += 1;
            let conn = match ConnHandle::new(state.next_serial, pep, stream, peer, &self.config) {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("[cm] cannot set up connection from {}: {}", peer, e);
                    continue;
                }
            };
            let slot = state.conns.insert(conn);
            log::debug!("[cm] accepted {} on {}", peer, pep.local_addr);
            let registered = match state.conns.get_mut(slot) {
                Some(conn) => conn.register(slot, &self.registry),
                None => Ok(()),
            };
            if let Err(e) = registered {
                log::warn!("[cm] cannot poll connection from {}: {}", peer, e);
                if let Some(mut conn) = state.conns.remove(slot) {
                    conn.close(slot, &self.registry);
                }
                continue;
            }
            // the request may already be buffered
            let ctx = ctx!(self, state);
            if let Some(conn) = state.conns.get_mut(slot) {
                if conn.progress(slot, &ctx) == ConnStatus::Closed {
                    state.conns.remove(slot);
                }
            }
        }
    }

    fn progress_conn(&self, state: &mut ProgressState, slot: u32) {
        let ctx = ctx!(self, state);
        let Some(conn) = state.conns.get_mut(slot) else {
            return;
        };
        if conn.progress(slot, &ctx) == ConnStatus::Closed {
            state.conns.remove(slot);
        }
    }

    /// Promote a requested connection to a new endpoint and answer it.
    pub(crate) fn accept(&self, req: &ConnRequest, setup: EpSetup, data: &[u8]) -> Result<EndpointId> {
        if data.len() > MAX_CM_DATA {
            return Err(Error::InvalidArgument(format!(
                "accept data {} bytes exceeds {}",
                data.len(),
                MAX_CM_DATA
            )));
        }
        let id = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.conns.get(req.slot) {
                Some(conn) if conn.serial == req.serial => {}
                _ => return Err(Error::NoSuchEndpoint),
            }
            let mut conn = state
                .conns
                .remove(req.slot)
                .ok_or(Error::NoSuchEndpoint)?;
            let bsock = conn
                .take_socket(req.slot, &self.registry)
                .ok_or(Error::NoSuchEndpoint)?;

            let index = state.eps.insert_with(|slot, generation| {
                EpInner::new(EndpointId::new(slot, generation), setup, &self.config)
            });
            let started = match state.eps.get_mut(index) {
                Some(ep) => ep.start_accept(
                    &mut ctx!(self, state),
                    bsock,
                    conn.endian_match,
                    conn.peer_addr,
                    data,
                ),
                None => Err(Error::NoSuchEndpoint),
            };
            if let Err(e) = started {
                state.eps.remove(index);
                return Err(e);
            }
            EndpointId::new(index, state.eps.generation(index))
        };
        self.wake();
        Ok(id)
    }

    pub(crate) fn reject(&self, req: &ConnRequest, data: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.conns.get(req.slot) {
            Some(conn) if conn.serial == req.serial => {}
            _ => return Err(Error::NoSuchEndpoint),
        }
        if let Some(mut conn) = state.conns.remove(req.slot) {
            log::info!("[cm] rejecting {}", conn.peer_addr);
            conn.reject(req.slot, &self.registry, data, &self.config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollMode;
    use std::sync::Weak;
    use std::time::Instant;

    #[test]
    fn test_assist_is_exclusive() {
        let progress = Progress::new(DomainConfig::default()).unwrap();
        let waiter = progress.waiter.lock();
        let other = Arc::clone(&progress);
        let assisted = thread::spawn(move || other.assist(Some(Duration::ZERO)))
            .join()
            .unwrap();
        assert!(!assisted);
        drop(waiter);
        assert!(progress.assist(Some(Duration::ZERO)));
    }

    #[test]
    fn test_wake_interrupts_blocked_pass() {
        let progress = Progress::new(DomainConfig::default().with_poll_mode(PollMode::Poll)).unwrap();
        let waker = Arc::clone(&progress);
        let handle = thread::spawn(move || {
            while !waker.waiting.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            waker.wake();
        });
        let start = Instant::now();
        progress.run_pass(Some(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn test_auto_thread_start_stop() {
        let config = DomainConfig::default().with_progress(ProgressMode::Auto);
        let progress = Progress::new(config).unwrap();
        progress.start().unwrap();
        assert!(progress.thread.lock().is_some());
        progress.stop();
        assert!(progress.thread.lock().is_none());
        // stopping twice is harmless
        progress.stop();
    }

    #[test]
    fn test_stale_request_is_refused() {
        let progress = Progress::new(DomainConfig::default()).unwrap();
        let eq = Arc::new(EventQueue::new(Weak::new()));
        let (pep, _addr) = progress.create_pep("127.0.0.1:0".parse().unwrap(), eq).unwrap();
        let req = ConnRequest {
            slot: 3,
            serial: 9,
            peer_addr: "127.0.0.1:1".parse().unwrap(),
            data: Vec::new(),
        };
        assert!(matches!(progress.reject(&req, b""), Err(Error::NoSuchEndpoint)));
        progress.close_pep(pep);
        progress.close_pep(pep);
    }
}
