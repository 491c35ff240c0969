// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive path: incremental header parsing and payload streaming.
//!
//! ```text
//!  read base header (16 B) --> validate, check sequence id
//!        |
//!  read variant fields (hdr_size - 16 B) --> swap to host order
//!        |
//!  dispatch on op --> handler
//!        |
//!  claim a destination entry  (may park: no receive posted, pool empty)
//!        |
//!  stream payload into it     (may park: WouldBlock)
//!        |
//!  complete, ack if requested, reset cursor
//! ```
//!
//! Every step survives any fragmentation of the byte stream. A parked
//! handler keeps its consumed header and is resumed by the next pass.

use std::io;

use super::{Ctx, EpInner, EpState};
use crate::error::{Error, ErrorCode, Result};
use crate::flags::{CompletionFlags, MrAccess, OpFlags};
use crate::mr::described_len;
use crate::proto::{BaseHeader, Header, Op, BASE_HDR_SIZE, IOV_LIMIT, MAX_HDR_SIZE};
use crate::xfer::{CtrlFlags, IovCursor, XferId};

/// What to do with the message whose header was just parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxHandler {
    /// Untagged message into the posted receive queue
    Msg,
    /// Tagged message into the first matching tagged receive
    Tag,
    /// Remote read request: answer from a registered region
    ReadReq,
    /// Response to one of our read requests
    ReadRsp,
    /// Remote write into a registered region
    Write,
}

/// Receive cursor of one endpoint.
#[derive(Debug)]
pub(crate) struct CurRx {
    hdr_buf: [u8; MAX_HDR_SIZE],
    hdr_want: usize,
    hdr_read: usize,
    base: Option<BaseHeader>,
    pub(crate) hdr_done: bool,
    pub(crate) hdr: Header,
    pub(crate) data_left: u64,
    pub(crate) entry: Option<XferId>,
    pub(crate) handler: Option<RxHandler>,
    /// Pre-allocated ack for a message that asked for one
    pub(crate) ack: Option<XferId>,
    multi_offset: usize,
}

impl CurRx {
    pub(crate) fn new() -> Self {
        Self {
            hdr_buf: [0u8; MAX_HDR_SIZE],
            hdr_want: BASE_HDR_SIZE,
            hdr_read: 0,
            base: None,
            hdr_done: false,
            hdr: Header::default(),
            data_left: 0,
            entry: None,
            handler: None,
            ack: None,
            multi_offset: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.hdr_want = BASE_HDR_SIZE;
        self.hdr_read = 0;
        self.base = None;
        self.hdr_done = false;
        self.hdr = Header::default();
        self.data_left = 0;
        self.entry = None;
        self.handler = None;
        self.ack = None;
        self.multi_offset = 0;
    }
}

const DISCARD_CHUNK: usize = 4096;

enum Step {
    Done,
    Parked,
}

impl EpInner {
    /// Post a receive. Allowed in every state but `Disconnected`.
    pub(crate) fn post_recv(
        &mut self,
        ctx: &mut Ctx<'_>,
        bufs: Vec<Vec<u8>>,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        self.post_rx(ctx, bufs, context, flags, None)
    }

    pub(crate) fn post_trecv(
        &mut self,
        ctx: &mut Ctx<'_>,
        bufs: Vec<Vec<u8>>,
        tag: u64,
        ignore: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        self.post_rx(ctx, bufs, context, flags, Some((tag, ignore)))
    }

    fn post_rx(
        &mut self,
        ctx: &mut Ctx<'_>,
        bufs: Vec<Vec<u8>>,
        context: u64,
        flags: OpFlags,
        tagged: Option<(u64, u64)>,
    ) -> Result<()> {
        if self.state == EpState::Disconnected {
            return Err(Error::InvalidState { state: self.state });
        }
        if bufs.len() > IOV_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "at most {IOV_LIMIT} receive segments"
            )));
        }
        let multi = flags.contains(OpFlags::MULTI_RECV);
        if multi && (tagged.is_some() || bufs.len() != 1) {
            return Err(Error::InvalidArgument(
                "multi-receive takes exactly one untagged buffer".into(),
            ));
        }
        let Some(id) = ctx.pool.alloc_rx(self.id) else {
            ctx.metrics.record_xfer_exhausted();
            return Err(Error::Again);
        };

        let entry = ctx.pool.get_mut(id);
        entry.iov = bufs;
        entry.context = context;
        entry.report = !self.selective_rx || flags.contains(OpFlags::COMPLETION);
        if multi {
            entry.ctrl_flags |= CtrlFlags::MULTI_RECV;
        }
        match tagged {
            Some((tag, ignore)) => {
                entry.tag = tag;
                entry.ignore = ignore;
                entry.cq_flags = CompletionFlags::RECV | CompletionFlags::TAGGED;
                self.queues.tag.push_back(id);
            }
            None => {
                entry.cq_flags = CompletionFlags::RECV | CompletionFlags::MSG;
                self.queues.rx.push_back(id);
            }
        }
        Ok(())
    }

    /// Withdraw a posted receive that has not started matching.
    pub(crate) fn cancel(&mut self, ctx: &mut Ctx<'_>, context: u64) -> bool {
        let Some(id) = self.queues.cancel_rx(ctx.pool, context, self.cur_rx.entry) else {
            return false;
        };
        self.reporter.error(ctx.pool.get_mut(id), ErrorCode::Canceled);
        ctx.pool.release(id);
        true
    }

    /// Parse and deliver as many messages as the socket holds, up to the
    /// per-pass budget.
    pub(crate) fn progress_rx(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        self.rx_resume = false;
        let mut budget = ctx.config.rx_budget;
        while self.state == EpState::Connected {
            if !self.cur_rx.hdr_done {
                if !self.read_header(ctx)? {
                    return Ok(());
                }
                self.dispatch(ctx)?;
            }
            if self.cur_rx.handler.is_some() {
                match self.run_handler(ctx)? {
                    Step::Done => {}
                    Step::Parked => return Ok(()),
                }
            }
            self.cur_rx.reset();
            budget -= 1;
            if budget == 0 {
                self.rx_resume = true;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns `false` on `WouldBlock`.
    fn read_header(&mut self, ctx: &mut Ctx<'_>) -> Result<bool> {
        let order = ctx.config.wire_order;
        let swap = self.swap;
        let Some(bsock) = self.bsock.as_mut() else {
            return Ok(false);
        };
        let cur = &mut self.cur_rx;

        loop {
            if cur.hdr_read < cur.hdr_want {
                match bsock.recv(&mut cur.hdr_buf[cur.hdr_read..cur.hdr_want]) {
                    Ok(n) => cur.hdr_read += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            if cur.base.is_some() {
                break;
            }

            let mut base = BaseHeader::decode(&cur.hdr_buf[..BASE_HDR_SIZE], order);
            swap.base(&mut base);
            base.validate()?;
            if base.id != self.rx_id {
                return Err(Error::protocol(format!(
                    "sequence id {} where {} was expected",
                    base.id, self.rx_id
                )));
            }
            cur.hdr_want = base.hdr_size as usize;
            cur.base = Some(base);
        }

        let Some(base) = cur.base else {
            return Ok(false);
        };
        let mut hdr = Header::decode_ext(base, &cur.hdr_buf[BASE_HDR_SIZE..cur.hdr_want], order);
        swap.ext(&mut hdr);

        let payload = hdr.payload_len();
        if payload > ctx.config.max_msg_size as u64 {
            return Err(Error::MessageTooLarge {
                size: payload as usize,
                max: ctx.config.max_msg_size,
            });
        }
        self.rx_id = self.rx_id.wrapping_add(1);
        cur.hdr = hdr;
        cur.data_left = payload;
        cur.hdr_done = true;
        ctx.metrics.record_message_received(hdr.base.size as usize);
        Ok(true)
    }

    fn dispatch(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        let hdr = self.cur_rx.hdr;
        let op = hdr
            .base
            .op()
            .ok_or_else(|| Error::protocol(format!("unknown op {}", hdr.base.op)))?;
        let handler = match op {
            Op::Msg => RxHandler::Msg,
            Op::Tag => RxHandler::Tag,
            Op::ReadReq => {
                if self.cur_rx.data_left != 0 {
                    return Err(Error::protocol("read request with payload"));
                }
                RxHandler::ReadReq
            }
            Op::ReadRsp => {
                let id = self
                    .queues
                    .rma_read
                    .pop_front()
                    .ok_or_else(|| Error::protocol("read response without a pending read"))?;
                let entry = ctx.pool.get_mut(id);
                entry.cursor = IovCursor::default();
                entry.xfer_len = 0;
                entry.olen = 0;
                entry.status = ErrorCode::from_status(hdr.base.op_data);
                self.cur_rx.entry = Some(id);
                RxHandler::ReadRsp
            }
            Op::Write => RxHandler::Write,
            Op::Ack => {
                if self.cur_rx.data_left != 0 {
                    return Err(Error::protocol("ack with payload"));
                }
                let id = self
                    .queues
                    .need_ack
                    .pop_front()
                    .ok_or_else(|| Error::protocol("ack without a pending transmit"))?;
                let entry = ctx.pool.get_mut(id);
                match ErrorCode::from_status(hdr.base.op_data) {
                    Some(code) => self.reporter.error(entry, code),
                    None => self.reporter.success(entry),
                }
                ctx.pool.release(id);
                return Ok(());
            }
        };
        self.cur_rx.handler = Some(handler);
        Ok(())
    }

    fn run_handler(&mut self, ctx: &mut Ctx<'_>) -> Result<Step> {
        let Some(handler) = self.cur_rx.handler else {
            return Ok(Step::Done);
        };
        if self.cur_rx.entry.is_none() && !self.claim_entry(handler, ctx) {
            return Ok(Step::Parked);
        }
        if !self.stream_payload(ctx)? {
            return Ok(Step::Parked);
        }
        self.complete_rx(handler, ctx)?;
        Ok(Step::Done)
    }

    /// Find or build the destination entry. `false` parks the handler.
    fn claim_entry(&mut self, handler: RxHandler, ctx: &mut Ctx<'_>) -> bool {
        let hdr = self.cur_rx.hdr;

        // the ack comes first so a park never strands a claimed entry
        let acked = matches!(handler, RxHandler::Msg | RxHandler::Tag | RxHandler::Write);
        if acked && hdr.flags().wants_ack() && self.cur_rx.ack.is_none() {
            match ctx.pool.alloc_tx(self.id) {
                Some(id) => self.cur_rx.ack = Some(id),
                None => {
                    ctx.metrics.record_xfer_exhausted();
                    return false;
                }
            }
        }

        let id = match handler {
            RxHandler::Msg => {
                let Some(&id) = self.queues.rx.front() else {
                    return false;
                };
                let entry = ctx.pool.get_mut(id);
                if entry.ctrl_flags.contains(CtrlFlags::MULTI_RECV) {
                    // stays queued until released
                    entry.cursor = IovCursor {
                        index: 0,
                        offset: entry.multi_used,
                    };
                    entry.xfer_len = 0;
                    entry.olen = 0;
                    self.cur_rx.multi_offset = entry.multi_used;
                } else {
                    self.queues.rx.pop_front();
                }
                id
            }
            RxHandler::Tag => {
                let tag = hdr.ext.tag().unwrap_or(0);
                match self.queues.match_tag(ctx.pool, tag) {
                    Some(id) => id,
                    None => return false,
                }
            }
            RxHandler::ReadReq => {
                let Some(id) = ctx.pool.alloc_tx(self.id) else {
                    ctx.metrics.record_xfer_exhausted();
                    return false;
                };
                let (data, status) = match ctx.regs.gather(hdr.rma_iovs()) {
                    Ok(data) => (data, None),
                    Err(code) => (Vec::new(), Some(code)),
                };
                let entry = ctx.pool.get_mut(id);
                entry.hdr = Header::new(Op::ReadRsp);
                entry.hdr.base.op_data = status.map_or(0, ErrorCode::to_status);
                entry.hdr.seal(data.len());
                entry.iov = vec![data];
                entry.ctrl_flags = CtrlFlags::INTERNAL;
                id
            }
            RxHandler::Write => {
                let Some(id) = ctx.pool.alloc_rx(self.id) else {
                    ctx.metrics.record_xfer_exhausted();
                    return false;
                };
                let iovs = hdr.rma_iovs();
                let status = if described_len(iovs) == Some(self.cur_rx.data_left) {
                    ctx.regs.validate(iovs, MrAccess::REMOTE_WRITE).err()
                } else {
                    Some(ErrorCode::AccessDenied)
                };
                let entry = ctx.pool.get_mut(id);
                entry.hdr = hdr;
                entry.ctrl_flags = CtrlFlags::NEED_DYN_RBUF;
                entry.status = status;
                if status.is_none() {
                    entry.iov = vec![vec![0u8; self.cur_rx.data_left as usize]];
                }
                id
            }
            // claimed at dispatch
            RxHandler::ReadRsp => return true,
        };
        self.cur_rx.entry = Some(id);
        true
    }

    /// Move payload bytes into the claimed entry; bytes beyond its
    /// capacity are read and dropped. `false` on `WouldBlock`.
    fn stream_payload(&mut self, ctx: &mut Ctx<'_>) -> Result<bool> {
        let Some(id) = self.cur_rx.entry else {
            return Ok(true);
        };
        let Some(bsock) = self.bsock.as_mut() else {
            return Ok(false);
        };
        while self.cur_rx.data_left > 0 {
            let want = usize::try_from(self.cur_rx.data_left).unwrap_or(usize::MAX);
            let entry = ctx.pool.get_mut(id);
            let result = match entry.rx_slice() {
                Some(slice) => {
                    let n = slice.len().min(want);
                    bsock.recv(&mut slice[..n]).map(|got| (got, true))
                }
                None => {
                    let mut scratch = [0u8; DISCARD_CHUNK];
                    let n = want.min(DISCARD_CHUNK);
                    bsock.recv(&mut scratch[..n]).map(|got| (got, false))
                }
            };
            match result {
                Ok((n, true)) => {
                    entry.advance_rx(n);
                    self.cur_rx.data_left -= n as u64;
                }
                Ok((n, false)) => {
                    entry.olen += n;
                    self.cur_rx.data_left -= n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn complete_rx(&mut self, handler: RxHandler, ctx: &mut Ctx<'_>) -> Result<()> {
        let Some(id) = self.cur_rx.entry.take() else {
            return Ok(());
        };
        match handler {
            RxHandler::Msg | RxHandler::Tag => self.complete_recv(id, ctx),
            RxHandler::ReadReq => self.tx_queue_insert(id, ctx),
            RxHandler::ReadRsp => {
                let entry = ctx.pool.get_mut(id);
                let status = entry
                    .status
                    .or((entry.olen > 0).then_some(ErrorCode::Truncated));
                match status {
                    Some(code) => self.reporter.error(entry, code),
                    None => self.reporter.success(entry),
                }
                ctx.pool.release(id);
                Ok(())
            }
            RxHandler::Write => self.complete_write(id, ctx),
        }
    }

    fn complete_recv(&mut self, id: XferId, ctx: &mut Ctx<'_>) -> Result<()> {
        let hdr = self.cur_rx.hdr;
        let entry = ctx.pool.get_mut(id);
        entry.src_addr = self.peer_fi_addr;
        entry.hdr.ext = hdr.ext;
        if let Some(tag) = hdr.ext.tag() {
            entry.tag = tag;
        }
        if hdr.ext.cq_data().is_some() {
            entry.cq_flags |= CompletionFlags::REMOTE_CQ_DATA;
        }

        let truncated = entry.olen > 0;
        if truncated {
            ctx.metrics.record_truncation();
            log::debug!(
                "[rx] {} message truncated: {} bytes kept, {} dropped",
                self.id,
                entry.xfer_len,
                entry.olen
            );
        }
        let status = truncated.then_some(ErrorCode::Truncated);

        if entry.ctrl_flags.contains(CtrlFlags::MULTI_RECV) {
            let offset = self.cur_rx.multi_offset;
            entry.multi_used += entry.xfer_len;
            let release = truncated || entry.iov_len() - entry.multi_used < self.min_multi_recv;
            match status {
                Some(code) => self.reporter.error(entry, code),
                None if release => {
                    self.reporter
                        .success_with(entry, offset, CompletionFlags::MULTI_RECV, true);
                }
                None => self
                    .reporter
                    .success_with(entry, offset, CompletionFlags::empty(), false),
            }
            if release {
                debug_assert_eq!(self.queues.rx.front(), Some(&id));
                self.queues.rx.pop_front();
                ctx.pool.release(id);
            }
        } else {
            match status {
                Some(code) => self.reporter.error(entry, code),
                None => self.reporter.success(entry),
            }
            ctx.pool.release(id);
        }
        self.send_ack(status, ctx)
    }

    fn complete_write(&mut self, id: XferId, ctx: &mut Ctx<'_>) -> Result<()> {
        let hdr = self.cur_rx.hdr;
        let entry = ctx.pool.get_mut(id);
        let mut status = entry.status;
        if status.is_none() {
            let data = entry.iov.first().map_or(&[][..], Vec::as_slice);
            status = ctx.regs.scatter(hdr.rma_iovs(), data).err();
        }
        match status {
            None => {
                entry.iov.clear();
                entry.src_addr = self.peer_fi_addr;
                entry.cq_flags = CompletionFlags::REMOTE_WRITE | CompletionFlags::RMA;
                // only writes carrying completion data surface in the CQ
                entry.report = hdr.ext.cq_data().is_some();
                if entry.report {
                    entry.cq_flags |= CompletionFlags::REMOTE_CQ_DATA;
                }
                self.reporter.success(entry);
            }
            Some(code) => {
                log::debug!("[rx] {} remote write refused: {}", self.id, code);
            }
        }
        ctx.pool.release(id);
        self.send_ack(status, ctx)
    }

    fn send_ack(&mut self, status: Option<ErrorCode>, ctx: &mut Ctx<'_>) -> Result<()> {
        match self.cur_rx.ack.take() {
            Some(id) => self.queue_ack(id, status, ctx),
            None => Ok(()),
        }
    }
}
