// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application-facing endpoint handles.
//!
//! Every data operation only queues work under the progress lock and
//! returns; completions arrive on the bound queues and counters. Posting
//! fails with [`Error::Again`] when the transfer pool is exhausted.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::av::{AddressVector, FabricAddr};
use crate::domain::DomainInner;
use crate::endpoint::tx::SendArgs;
use crate::endpoint::{Ctx, EndpointId, EpInner, EpState};
use crate::error::{Error, Result};
use crate::flags::OpFlags;
use crate::proto::{Op, RmaIov};

/// Untagged send with explicit flags.
#[derive(Debug, Clone, Default)]
pub struct SendMsg {
    pub bufs: Vec<Vec<u8>>,
    pub context: u64,
    /// Remote completion data; implies `OpFlags::REMOTE_CQ_DATA`
    pub data: Option<u64>,
    pub flags: OpFlags,
}

/// Tagged send or receive.
#[derive(Debug, Clone, Default)]
pub struct TaggedMsg {
    pub bufs: Vec<Vec<u8>>,
    pub tag: u64,
    /// Bits of `tag` ignored when matching (receives only)
    pub ignore: u64,
    pub context: u64,
    pub data: Option<u64>,
    pub flags: OpFlags,
}

/// RMA read or write against remote region descriptors.
#[derive(Debug, Clone, Default)]
pub struct RmaMsg {
    /// Local buffers: the source of a write, the destination of a read
    pub bufs: Vec<Vec<u8>>,
    pub rma: Vec<RmaIov>,
    pub context: u64,
    pub data: Option<u64>,
    pub flags: OpFlags,
}

#[derive(Debug, Clone, Default)]
pub struct RecvMsg {
    pub bufs: Vec<Vec<u8>>,
    pub context: u64,
    pub flags: OpFlags,
}

fn cq_data(data: Option<u64>, flags: OpFlags) -> Option<u64> {
    match data {
        Some(v) => Some(v),
        None if flags.contains(OpFlags::REMOTE_CQ_DATA) => Some(0),
        None => None,
    }
}

/// Connection-oriented endpoint. Closed on drop.
pub struct Endpoint {
    domain: Arc<DomainInner>,
    id: EndpointId,
    av: Option<Arc<AddressVector>>,
    closed: AtomicBool,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(domain: Arc<DomainInner>, id: EndpointId, av: Option<Arc<AddressVector>>) -> Self {
        Self {
            domain,
            id,
            av,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Current connection state; `Disconnected` once closed.
    pub fn state(&self) -> EpState {
        self.with_ep(|ep, _| Ok(ep.state)).unwrap_or(EpState::Disconnected)
    }

    fn with_ep<R>(&self, f: impl FnOnce(&mut EpInner, &mut Ctx<'_>) -> Result<R>) -> Result<R> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoSuchEndpoint);
        }
        self.domain.progress.with_ep(self.id, f)
    }

    fn post(&self, args: SendArgs) -> Result<()> {
        self.with_ep(|ep, ctx| ep.post_send(ctx, args))
    }

    // === Connection management ===

    /// Start connecting to `addr`. Completion is a `Connected` event (or
    /// an error event) on the bound event queue.
    pub fn connect(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        let fi_addr = self.av.as_ref().and_then(|av| av.reverse_lookup(&addr));
        self.with_ep(|ep, ctx| {
            ep.peer_fi_addr = fi_addr;
            ep.start_connect(ctx, addr, data)
        })
    }

    /// Connect to an address vector entry.
    pub fn connect_addr(&self, fi_addr: FabricAddr, data: &[u8]) -> Result<()> {
        let av = self
            .av
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no address vector bound".into()))?;
        let addr = av
            .lookup(fi_addr)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown address {fi_addr}")))?;
        self.with_ep(|ep, ctx| {
            ep.peer_fi_addr = Some(fi_addr);
            ep.start_connect(ctx, addr, data)
        })
    }

    /// Stop all traffic. The endpoint stays allocated until closed.
    pub fn shutdown(&self) -> Result<()> {
        self.with_ep(|ep, ctx| ep.shutdown(ctx))
    }

    /// Free the endpoint. Queued operations complete with `Canceled`.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.domain.close_endpoint(self.id);
            self.domain.progress.wake();
        }
        Ok(())
    }

    // === Messages ===

    pub fn send(&self, buf: Vec<u8>, context: u64) -> Result<()> {
        self.post(SendArgs::msg(vec![buf], context))
    }

    pub fn sendv(&self, bufs: Vec<Vec<u8>>, context: u64) -> Result<()> {
        self.post(SendArgs::msg(bufs, context))
    }

    pub fn senddata(&self, buf: Vec<u8>, data: u64, context: u64) -> Result<()> {
        let mut args = SendArgs::msg(vec![buf], context);
        args.data = Some(data);
        self.post(args)
    }

    pub fn sendmsg(&self, msg: SendMsg) -> Result<()> {
        let mut args = SendArgs::msg(msg.bufs, msg.context);
        args.data = cq_data(msg.data, msg.flags);
        args.flags = msg.flags;
        self.post(args)
    }

    /// Send a small payload without generating a completion entry.
    pub fn inject(&self, buf: &[u8]) -> Result<()> {
        let mut args = SendArgs::msg(vec![buf.to_vec()], 0);
        args.flags = OpFlags::INJECT;
        self.post(args)
    }

    pub fn recv(&self, buf: Vec<u8>, context: u64) -> Result<()> {
        self.recvmsg(RecvMsg {
            bufs: vec![buf],
            context,
            flags: OpFlags::empty(),
        })
    }

    pub fn recvmsg(&self, msg: RecvMsg) -> Result<()> {
        self.with_ep(|ep, ctx| {
            ep.post_recv(ctx, msg.bufs, msg.context, msg.flags)
        })
    }

    // === Tagged ===

    pub fn tsend(&self, buf: Vec<u8>, tag: u64, context: u64) -> Result<()> {
        self.tsendmsg(TaggedMsg {
            bufs: vec![buf],
            tag,
            context,
            ..TaggedMsg::default()
        })
    }

    pub fn tsenddata(&self, buf: Vec<u8>, data: u64, tag: u64, context: u64) -> Result<()> {
        self.tsendmsg(TaggedMsg {
            bufs: vec![buf],
            tag,
            context,
            data: Some(data),
            ..TaggedMsg::default()
        })
    }

    pub fn tinject(&self, buf: &[u8], tag: u64) -> Result<()> {
        self.tsendmsg(TaggedMsg {
            bufs: vec![buf.to_vec()],
            tag,
            flags: OpFlags::INJECT,
            ..TaggedMsg::default()
        })
    }

    pub fn tsendmsg(&self, msg: TaggedMsg) -> Result<()> {
        let mut args = SendArgs::new(Op::Tag, msg.bufs, msg.context);
        args.tag = Some(msg.tag);
        args.data = cq_data(msg.data, msg.flags);
        args.flags = msg.flags;
        self.post(args)
    }

    /// Post a tagged receive matching `tag` outside the `ignore` bits.
    pub fn trecv(&self, buf: Vec<u8>, tag: u64, ignore: u64, context: u64) -> Result<()> {
        self.trecvmsg(TaggedMsg {
            bufs: vec![buf],
            tag,
            ignore,
            context,
            ..TaggedMsg::default()
        })
    }

    pub fn trecvmsg(&self, msg: TaggedMsg) -> Result<()> {
        self.with_ep(|ep, ctx| {
            ep.post_trecv(ctx, msg.bufs, msg.tag, msg.ignore, msg.context, msg.flags)
        })
    }

    // === RMA ===

    /// Read `remote` into `buf`. The completion returns `buf` filled.
    pub fn read(&self, buf: Vec<u8>, remote: RmaIov, context: u64) -> Result<()> {
        self.readmsg(RmaMsg {
            bufs: vec![buf],
            rma: vec![remote],
            context,
            ..RmaMsg::default()
        })
    }

    pub fn readmsg(&self, msg: RmaMsg) -> Result<()> {
        let mut args = SendArgs::new(Op::ReadReq, msg.bufs, msg.context);
        args.rma = msg.rma;
        args.flags = msg.flags;
        self.post(args)
    }

    pub fn write(&self, buf: Vec<u8>, remote: RmaIov, context: u64) -> Result<()> {
        self.writemsg(RmaMsg {
            bufs: vec![buf],
            rma: vec![remote],
            context,
            ..RmaMsg::default()
        })
    }

    /// Write and raise a `REMOTE_WRITE` completion carrying `data` at the target.
    pub fn writedata(&self, buf: Vec<u8>, data: u64, remote: RmaIov, context: u64) -> Result<()> {
        self.writemsg(RmaMsg {
            bufs: vec![buf],
            rma: vec![remote],
            context,
            data: Some(data),
            ..RmaMsg::default()
        })
    }

    /// Unacknowledged write of a small payload; access errors at the
    /// target are not reported back.
    pub fn inject_write(&self, buf: &[u8], remote: RmaIov) -> Result<()> {
        self.writemsg(RmaMsg {
            bufs: vec![buf.to_vec()],
            rma: vec![remote],
            flags: OpFlags::INJECT,
            ..RmaMsg::default()
        })
    }

    pub fn writemsg(&self, msg: RmaMsg) -> Result<()> {
        let mut args = SendArgs::new(Op::Write, msg.bufs, msg.context);
        args.rma = msg.rma;
        args.data = cq_data(msg.data, msg.flags);
        args.flags = msg.flags;
        self.post(args)
    }

    /// Withdraw a posted receive by context. Returns whether one was found;
    /// it completes with `Canceled`.
    pub fn cancel(&self, context: u64) -> Result<bool> {
        self.with_ep(|ep, ctx| Ok(ep.cancel(ctx, context)))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Listening endpoint. Connection requests arrive as
/// [`crate::CmEvent::ConnRequest`] on its event queue.
pub struct PassiveEndpoint {
    domain: Arc<DomainInner>,
    index: u32,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl fmt::Debug for PassiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveEndpoint")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl PassiveEndpoint {
    pub(crate) fn new(domain: Arc<DomainInner>, index: u32, local_addr: SocketAddr) -> Self {
        Self {
            domain,
            index,
            local_addr,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and drop requests not yet accepted.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.domain.progress.close_pep(self.index);
        }
    }
}

impl Drop for PassiveEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
