// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Completion reporting.
//!
//! A finished transfer entry becomes either a [`Completion`] (or
//! [`CompletionError`]) in a [`CompletionQueue`], a [`Counter`] increment,
//! or both. Which one is decided per endpoint by its [`Reporter`], fixed
//! when the endpoint is created.
//!
//! In manual progress mode, reading a queue or counter first runs a
//! zero-timeout progress pass, so polling the CQ is enough to move data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::av::FabricAddr;
use crate::error::{Error, ErrorCode, Result};
use crate::flags::CompletionFlags;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::notify::WakeNotifier;
use crate::progress::Progress;
use crate::xfer::XferEntry;

/// Successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    /// Context supplied when the operation was posted
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes transferred
    pub len: usize,
    /// Buffers handed back to the application. Empty for inject and for
    /// multi-receive completions that do not release the buffer.
    pub buffers: Vec<Vec<u8>>,
    /// Offset of this message inside a multi-receive buffer
    pub buf_offset: usize,
    /// Remote completion data (valid with `REMOTE_CQ_DATA`)
    pub data: u64,
    /// Tag of the matched message (tagged receives)
    pub tag: u64,
    /// Sender, when the endpoint is bound to an address vector
    pub src_addr: Option<FabricAddr>,
}

impl Completion {
    /// The first `len` bytes across `buffers`, concatenated.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let mut skip = self.buf_offset;
        for buf in &self.buffers {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let want = self.len - out.len();
            let end = buf.len().min(skip + want);
            out.extend_from_slice(&buf[skip..end]);
            skip = 0;
            if out.len() == self.len {
                break;
            }
        }
        out
    }
}

/// Failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionError {
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes transferred before the failure
    pub len: usize,
    /// Bytes discarded (truncation)
    pub olen: usize,
    pub code: ErrorCode,
    pub buffers: Vec<Vec<u8>>,
    pub data: u64,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CqConfig {
    /// Soft capacity; the queue grows past it but `is_full` reports it.
    pub size: usize,
}

#[derive(Debug, Default)]
struct CqState {
    entries: VecDeque<Completion>,
    errors: VecDeque<CompletionError>,
}

#[derive(Debug)]
pub struct CompletionQueue {
    state: OrderedMutex<CqState>,
    notifier: WakeNotifier,
    progress: Weak<Progress>,
    config: CqConfig,
}

/// Run one progress pass or sleep until notified, bounded by `slice`.
fn assist_or_wait(progress: &Weak<Progress>, notifier: &WakeNotifier, slice: Duration) {
    match progress.upgrade() {
        Some(p) if !p.is_auto() => {
            if !p.assist(Some(slice)) {
                // another thread owns the poll wait
                notifier.wait_timeout(slice.min(Duration::from_millis(1)));
            }
        }
        _ => {
            notifier.wait_timeout(slice);
        }
    }
}

fn assist_now(progress: &Weak<Progress>) {
    if let Some(p) = progress.upgrade() {
        if !p.is_auto() {
            p.assist(Some(Duration::ZERO));
        }
    }
}

impl CompletionQueue {
    pub(crate) fn new(progress: Weak<Progress>, config: CqConfig) -> Self {
        Self {
            state: OrderedMutex::new(LockLevel::Queue, CqState::default()),
            notifier: WakeNotifier::new(),
            progress,
            config,
        }
    }

    /// Non-blocking read of up to `max` completions.
    ///
    /// Returns `Err(ErrorAvailable)` while error entries are pending; drain
    /// them with [`read_error`](Self::read_error).
    pub fn read(&self, max: usize) -> Result<Vec<Completion>> {
        assist_now(&self.progress);
        self.take(max)
    }

    fn take(&self, max: usize) -> Result<Vec<Completion>> {
        let mut state = self.state.lock();
        if !state.errors.is_empty() {
            return Err(Error::ErrorAvailable);
        }
        let n = max.min(state.entries.len());
        Ok(state.entries.drain(..n).collect())
    }

    pub fn read_error(&self) -> Option<CompletionError> {
        self.state.lock().errors.pop_front()
    }

    /// Blocking read: waits up to `timeout` for at least one completion.
    /// Returns an empty vector on timeout.
    pub fn sread(&self, max: usize, timeout: Duration) -> Result<Vec<Completion>> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.read(max)?;
            if !ready.is_empty() {
                return Ok(ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            assist_or_wait(&self.progress, &self.notifier, deadline - now);
        }
    }

    /// Successful entries waiting to be read.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn error_len(&self) -> usize {
        self.state.lock().errors.len()
    }

    pub fn is_full(&self) -> bool {
        self.config.size > 0 && self.len() >= self.config.size
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.state.lock().entries.push_back(completion);
        self.notifier.notify();
    }

    pub(crate) fn push_error(&self, error: CompletionError) {
        self.state.lock().errors.push_back(error);
        self.notifier.notify();
    }
}

/// Success/error counter bound to one operation class of an endpoint.
#[derive(Debug)]
pub struct Counter {
    success: AtomicU64,
    errors: AtomicU64,
    notifier: WakeNotifier,
    progress: Weak<Progress>,
}

impl Counter {
    pub(crate) fn new(progress: Weak<Progress>) -> Self {
        Self {
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            notifier: WakeNotifier::new(),
            progress,
        }
    }

    pub fn read(&self) -> u64 {
        assist_now(&self.progress);
        self.success.load(Ordering::Acquire)
    }

    pub fn read_errors(&self) -> u64 {
        assist_now(&self.progress);
        self.errors.load(Ordering::Acquire)
    }

    /// Wait until the success count reaches `threshold`.
    pub fn wait(&self, threshold: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read() >= threshold {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            assist_or_wait(&self.progress, &self.notifier, deadline - now);
        }
    }

    pub(crate) fn inc(&self) {
        self.success.fetch_add(1, Ordering::AcqRel);
        self.notifier.notify();
    }

    pub(crate) fn inc_err(&self) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        self.notifier.notify();
    }
}

/// Counters an endpoint may bind, one per operation class.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub send: Option<Arc<Counter>>,
    pub recv: Option<Arc<Counter>>,
    pub read: Option<Arc<Counter>>,
    pub write: Option<Arc<Counter>>,
    pub remote_write: Option<Arc<Counter>>,
}

impl Counters {
    fn for_flags(&self, flags: CompletionFlags) -> Option<&Arc<Counter>> {
        if flags.contains(CompletionFlags::REMOTE_WRITE) {
            self.remote_write.as_ref()
        } else if flags.contains(CompletionFlags::READ) {
            self.read.as_ref()
        } else if flags.contains(CompletionFlags::WRITE) {
            self.write.as_ref()
        } else if flags.contains(CompletionFlags::RECV) {
            self.recv.as_ref()
        } else {
            self.send.as_ref()
        }
    }
}

/// How successes are reported for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Report {
    /// CQ entry (subject to selective completion) plus counter
    Cq,
    /// Counter only; no CQ bound for this direction
    CounterOnly,
}

/// Per-endpoint completion strategy.
#[derive(Debug, Clone)]
pub(crate) struct Reporter {
    tx_cq: Option<Arc<CompletionQueue>>,
    rx_cq: Option<Arc<CompletionQueue>>,
    counters: Counters,
    tx_mode: Report,
    rx_mode: Report,
}

fn is_rx(flags: CompletionFlags) -> bool {
    flags.intersects(CompletionFlags::RECV | CompletionFlags::REMOTE_WRITE)
}

impl Reporter {
    pub(crate) fn new(
        tx_cq: Option<Arc<CompletionQueue>>,
        rx_cq: Option<Arc<CompletionQueue>>,
        counters: Counters,
    ) -> Self {
        let mode = |cq: &Option<Arc<CompletionQueue>>| {
            if cq.is_some() {
                Report::Cq
            } else {
                Report::CounterOnly
            }
        };
        Self {
            tx_mode: mode(&tx_cq),
            rx_mode: mode(&rx_cq),
            tx_cq,
            rx_cq,
            counters,
        }
    }

    fn route(&self, flags: CompletionFlags) -> (Report, Option<&Arc<CompletionQueue>>) {
        if is_rx(flags) {
            (self.rx_mode, self.rx_cq.as_ref())
        } else {
            (self.tx_mode, self.tx_cq.as_ref())
        }
    }

    /// Report a satisfied entry. Takes its buffers.
    pub(crate) fn success(&self, entry: &mut XferEntry) {
        self.success_with(entry, 0, CompletionFlags::empty(), true);
    }

    /// Report with an explicit buffer offset and extra flags; `release`
    /// hands the buffers back.
    pub(crate) fn success_with(
        &self,
        entry: &mut XferEntry,
        buf_offset: usize,
        extra: CompletionFlags,
        release: bool,
    ) {
        let flags = entry.cq_flags | extra;
        if let Some(counter) = self.counters.for_flags(flags) {
            counter.inc();
        }
        let (mode, cq) = self.route(flags);
        let wants_entry = entry.report || extra.contains(CompletionFlags::MULTI_RECV);
        if let (Report::Cq, Some(cq), true) = (mode, cq, wants_entry) {
            cq.push(Completion {
                context: entry.context,
                flags,
                len: entry.xfer_len,
                buffers: if release {
                    std::mem::take(&mut entry.iov)
                } else {
                    Vec::new()
                },
                buf_offset,
                data: entry.hdr.ext.cq_data().unwrap_or(0),
                tag: entry.tag,
                src_addr: entry.src_addr,
            });
        }
    }

    /// Report a failed entry. Errors ignore selective completion.
    pub(crate) fn error(&self, entry: &mut XferEntry, code: ErrorCode) {
        let flags = entry.cq_flags;
        if let Some(counter) = self.counters.for_flags(flags) {
            counter.inc_err();
        }
        if let (_, Some(cq)) = self.route(flags) {
            cq.push_error(CompletionError {
                context: entry.context,
                flags,
                len: entry.xfer_len,
                olen: entry.olen,
                code,
                buffers: std::mem::take(&mut entry.iov),
                data: entry.hdr.ext.cq_data().unwrap_or(0),
                tag: entry.tag,
            });
        }
    }
}
