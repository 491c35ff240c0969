// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmit path.
//!
//! Posting builds a transfer entry and queues it. Whenever the endpoint
//! has no current transmit, the next entry is started right away: its
//! header is stamped with the rolling sequence id and encoded, then
//! header and payload go out with vectored writes that resume from the
//! exact byte left off.
//!
//! A fully written entry leaves the transmit side through one of:
//!
//! | condition       | next stop                           |
//! |-----------------|-------------------------------------|
//! | `NEED_RESP`     | `rma_read` until the read response  |
//! | `NEED_ACK`      | `need_ack` until the ack            |
//! | `INTERNAL`      | released silently                   |
//! | bytes staged    | `async_q` until the staging flushes |
//! | otherwise       | completed                           |

use std::io::{self, IoSlice};

use super::{Ctx, EpInner, EpState};
use crate::error::{Error, ErrorCode, Result};
use crate::flags::{CompletionFlags, OpFlags};
use crate::proto::{Header, HeaderExt, HeaderFlags, Op, RmaIov, IOV_LIMIT, MAX_INJECT};
use crate::stream::bsock::async_reached;
use crate::xfer::{CtrlFlags, IovCursor, XferId};

/// Everything needed to post one transmit.
#[derive(Debug, Clone)]
pub(crate) struct SendArgs {
    pub op: Op,
    pub bufs: Vec<Vec<u8>>,
    pub context: u64,
    pub tag: Option<u64>,
    pub data: Option<u64>,
    pub rma: Vec<RmaIov>,
    pub flags: OpFlags,
}

impl SendArgs {
    pub(crate) fn new(op: Op, bufs: Vec<Vec<u8>>, context: u64) -> Self {
        Self {
            op,
            bufs,
            context,
            tag: None,
            data: None,
            rma: Vec::new(),
            flags: OpFlags::empty(),
        }
    }

    pub(crate) fn msg(bufs: Vec<Vec<u8>>, context: u64) -> Self {
        Self::new(Op::Msg, bufs, context)
    }
}

fn header_ack_flags(op: Op, flags: OpFlags) -> HeaderFlags {
    let mut out = HeaderFlags::empty();
    if op == Op::ReadReq {
        // reads complete on their response
        return out;
    }
    if flags.contains(OpFlags::TRANSMIT_COMPLETE) {
        out |= HeaderFlags::TRANSMIT_COMPLETE;
    }
    if flags.contains(OpFlags::DELIVERY_COMPLETE) {
        out |= HeaderFlags::DELIVERY_COMPLETE;
    }
    if flags.contains(OpFlags::COMMIT_COMPLETE) {
        out |= HeaderFlags::COMMIT_COMPLETE | HeaderFlags::DELIVERY_COMPLETE;
    }
    // writes are acknowledged so access errors at the target come back
    if op == Op::Write && !flags.contains(OpFlags::INJECT) {
        out |= HeaderFlags::DELIVERY_COMPLETE;
    }
    out
}

fn completion_flags(op: Op) -> CompletionFlags {
    match op {
        Op::Msg => CompletionFlags::SEND | CompletionFlags::MSG,
        Op::Tag => CompletionFlags::SEND | CompletionFlags::TAGGED,
        Op::ReadReq => CompletionFlags::READ | CompletionFlags::RMA,
        Op::Write => CompletionFlags::WRITE | CompletionFlags::RMA,
        Op::ReadRsp | Op::Ack => CompletionFlags::empty(),
    }
}

impl EpInner {
    /// Queue a transmit. Fails without side effects unless the entry was
    /// accepted; I/O errors after acceptance disable the endpoint and
    /// surface as error completions.
    pub(crate) fn post_send(&mut self, ctx: &mut Ctx<'_>, args: SendArgs) -> Result<()> {
        if self.state != EpState::Connected {
            return Err(Error::NotConnected { state: self.state });
        }
        if args.bufs.len() > IOV_LIMIT || args.rma.len() > IOV_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "at most {IOV_LIMIT} local and remote segments"
            )));
        }
        let payload: usize = args.bufs.iter().map(Vec::len).sum();
        let inject = args.flags.contains(OpFlags::INJECT);
        if inject && payload > MAX_INJECT {
            return Err(Error::InvalidArgument(format!(
                "inject payload {payload} exceeds {MAX_INJECT}"
            )));
        }
        let wire_len = if args.op == Op::ReadReq { 0 } else { payload };
        if wire_len > ctx.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: wire_len,
                max: ctx.config.max_msg_size,
            });
        }

        let Some(id) = ctx.pool.alloc_tx(self.id) else {
            ctx.metrics.record_xfer_exhausted();
            return Err(Error::Again);
        };

        let mut hdr = Header::new(args.op);
        hdr.set_ext(HeaderExt::from_parts(args.tag, args.data));
        hdr.set_rma(&args.rma);
        let acks = header_ack_flags(args.op, args.flags);
        hdr.insert_flags(acks);
        hdr.seal(wire_len);

        let mut ctrl = CtrlFlags::empty();
        ctrl.set(CtrlFlags::NEED_ACK, !acks.is_empty());
        ctrl.set(CtrlFlags::NEED_RESP, args.op == Op::ReadReq);
        ctrl.set(CtrlFlags::INJECT, inject);

        let entry = ctx.pool.get_mut(id);
        entry.hdr = hdr;
        entry.iov = args.bufs;
        entry.tag = args.tag.unwrap_or(0);
        entry.context = args.context;
        entry.cq_flags = completion_flags(args.op);
        entry.ctrl_flags = ctrl;
        entry.report =
            !inject && (!self.selective_tx || args.flags.contains(OpFlags::COMPLETION));

        if let Err(err) = self.tx_queue_insert(id, ctx) {
            self.fail(&err, ctx);
        }
        self.update_poll(ctx);
        Ok(())
    }

    /// Queue `id` (control traffic on the priority queue) and start
    /// transmitting if the endpoint is idle.
    pub(crate) fn tx_queue_insert(&mut self, id: XferId, ctx: &mut Ctx<'_>) -> Result<()> {
        if ctx.pool.get(id).ctrl_flags.contains(CtrlFlags::INTERNAL) {
            self.queues.priority.push_back(id);
        } else {
            self.queues.tx.push_back(id);
        }
        if self.cur_tx.is_none() {
            self.progress_tx(ctx)?;
        }
        Ok(())
    }

    /// Queue an acknowledgement on a pre-allocated entry.
    pub(crate) fn queue_ack(
        &mut self,
        id: XferId,
        status: Option<ErrorCode>,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        let entry = ctx.pool.get_mut(id);
        entry.hdr = Header::new(Op::Ack);
        entry.hdr.base.op_data = status.map_or(0, ErrorCode::to_status);
        entry.hdr.seal(0);
        entry.ctrl_flags = CtrlFlags::INTERNAL;
        self.tx_queue_insert(id, ctx)
    }

    /// Write as much as the socket takes.
    pub(crate) fn progress_tx(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        let Some(bsock) = self.bsock.as_mut() else {
            return Ok(());
        };
        match bsock.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        loop {
            let id = match self.cur_tx {
                Some(id) => id,
                None => match self.queues.next_tx() {
                    Some(id) => {
                        self.start_tx(id, ctx);
                        id
                    }
                    None => break,
                },
            };
            let Some(bsock) = self.bsock.as_mut() else {
                break;
            };

            let sent = {
                let entry = ctx.pool.get(id);
                let mut slices = [IoSlice::new(&[]); IOV_LIMIT + 1];
                let n = entry.tx_slices(&mut slices);
                (n > 0).then(|| bsock.sendv(&slices[..n]))
            };
            match sent {
                None => self.complete_tx(id, ctx),
                Some(Ok(n)) => ctx.pool.get_mut(id).advance_tx(n),
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    ctx.metrics.record_send_blocked();
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }

        self.progress_async(ctx);
        Ok(())
    }

    fn start_tx(&mut self, id: XferId, ctx: &mut Ctx<'_>) {
        let order = ctx.config.wire_order;
        let entry = ctx.pool.get_mut(id);
        entry.hdr.base.id = self.tx_id;
        self.tx_id = self.tx_id.wrapping_add(1);

        let mut len = entry.hdr.encode(order, &mut entry.hdr_bytes);
        if entry.ctrl_flags.contains(CtrlFlags::INJECT) {
            for seg in entry.iov.drain(..) {
                entry.hdr_bytes[len..len + seg.len()].copy_from_slice(&seg);
                len += seg.len();
            }
        }
        entry.hdr_len = len;
        entry.cursor = IovCursor::default();
        entry.xfer_len = entry.hdr.payload_len() as usize;
        ctx.metrics.record_message_sent(entry.hdr.base.size as usize);
        self.cur_tx = Some(id);
    }

    fn complete_tx(&mut self, id: XferId, ctx: &mut Ctx<'_>) {
        self.cur_tx = None;
        let entry = ctx.pool.get_mut(id);
        let ctrl = entry.ctrl_flags;

        if ctrl.contains(CtrlFlags::NEED_RESP) {
            self.queues.rma_read.push_back(id);
        } else if ctrl.contains(CtrlFlags::NEED_ACK) {
            self.queues.need_ack.push_back(id);
        } else if ctrl.contains(CtrlFlags::INTERNAL) {
            ctx.pool.release(id);
        } else {
            let staged = self
                .bsock
                .as_mut()
                .filter(|bsock| bsock.tosend() > 0 && !ctrl.contains(CtrlFlags::INJECT));
            match staged {
                Some(bsock) => {
                    entry.async_index = bsock.mark_async();
                    entry.ctrl_flags |= CtrlFlags::ASYNC;
                    self.queues.async_q.push_back(id);
                }
                None => {
                    self.reporter.success(entry);
                    ctx.pool.release(id);
                }
            }
        }
    }

    /// Complete sends whose staged bytes have reached the kernel.
    fn progress_async(&mut self, ctx: &mut Ctx<'_>) {
        let Some(bsock) = self.bsock.as_mut() else {
            return;
        };
        let done = bsock.async_done();
        while let Some(&id) = self.queues.async_q.front() {
            let entry = ctx.pool.get_mut(id);
            if !async_reached(entry.async_index, done) {
                break;
            }
            self.queues.async_q.pop_front();
            self.reporter.success(entry);
            ctx.pool.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::endpoint::testing::{single, Rig};
    use crate::proto::{BaseHeader, BASE_HDR_SIZE};

    fn decode_all(bytes: &[u8]) -> Vec<(BaseHeader, Vec<u8>)> {
        let order = crate::proto::WireOrder::native();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let base = BaseHeader::decode(&bytes[pos..pos + BASE_HDR_SIZE], order);
            let end = pos + base.size as usize;
            out.push((base, bytes[pos + base.hdr_size as usize..end].to_vec()));
            pos = end;
        }
        out
    }

    #[test]
    fn test_sends_go_out_in_order_with_rolling_ids() {
        let mut rig = Rig::new(DomainConfig::default());
        let (mut t, handle) = single(&rig.config);
        let mut ctx = rig.ctx();

        for (i, payload) in [&b"first"[..], b"", b"third"].iter().enumerate() {
            t.ep.post_send(&mut ctx, SendArgs::msg(vec![payload.to_vec()], i as u64))
                .unwrap();
        }
        let frames = decode_all(&handle.take_written());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].1, b"first");
        assert!(frames[1].1.is_empty());
        assert_eq!(
            frames.iter().map(|(b, _)| b.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let done = t.cq.read(8).unwrap();
        assert_eq!(done.iter().map(|c| c.context).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(done[0].buffers, vec![b"first".to_vec()]);
        assert_eq!(rig.pool.in_use(), 0);
    }

    #[test]
    fn test_short_writes_resume_mid_entry() {
        let mut rig = Rig::new(DomainConfig::default().with_staging_sbuf_size(0));
        let (mut t, handle) = single(&rig.config);
        handle.set_write_chunk(3);
        let mut ctx = rig.ctx();

        let payload: Vec<u8> = (0..40u8).collect();
        t.ep.post_send(&mut ctx, SendArgs::msg(vec![payload[..17].to_vec(), payload[17..].to_vec()], 9))
            .unwrap();
        let frames = decode_all(&handle.take_written());
        assert_eq!(frames[0].1, payload);
        assert_eq!(t.cq.read(1).unwrap()[0].context, 9);
    }

    #[test]
    fn test_blocked_send_completes_after_flush() {
        let mut rig = Rig::new(DomainConfig::default());
        let (mut t, handle) = single(&rig.config);
        handle.set_write_blocked(true);
        let mut ctx = rig.ctx();

        t.ep.post_send(&mut ctx, SendArgs::msg(vec![b"staged".to_vec()], 1)).unwrap();
        // header and payload sit in the staging buffer: no completion yet
        assert!(t.cq.is_empty());
        assert_eq!(t.ep.queues.async_q.len(), 1);

        handle.set_write_blocked(false);
        t.ep.progress_tx(&mut ctx).unwrap();
        assert_eq!(t.cq.read(1).unwrap()[0].context, 1);
        assert_eq!(decode_all(&handle.take_written())[0].1, b"staged");
    }

    #[test]
    fn test_inject_is_inline_and_silent() {
        let mut rig = Rig::new(DomainConfig::default());
        let (mut t, handle) = single(&rig.config);
        let mut ctx = rig.ctx();

        let mut args = SendArgs::msg(vec![b"tiny".to_vec()], 0);
        args.flags = OpFlags::INJECT;
        t.ep.post_send(&mut ctx, args).unwrap();
        assert_eq!(decode_all(&handle.take_written())[0].1, b"tiny");
        assert!(t.cq.is_empty());

        let mut big = SendArgs::msg(vec![vec![0u8; MAX_INJECT + 1]], 0);
        big.flags = OpFlags::INJECT;
        assert!(matches!(
            t.ep.post_send(&mut ctx, big),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_send_requires_connection() {
        let mut rig = Rig::new(DomainConfig::default());
        let (mut t, _handle) = single(&rig.config);
        t.ep.state = EpState::Idle;
        let mut ctx = rig.ctx();
        assert!(matches!(
            t.ep.post_send(&mut ctx, SendArgs::msg(vec![], 0)),
            Err(Error::NotConnected { state: EpState::Idle })
        ));
    }

    #[test]
    fn test_pool_exhaustion_is_again() {
        let mut rig = Rig::new(DomainConfig::default().with_max_xfers(1));
        let (mut t, handle) = single(&rig.config);
        handle.set_write_blocked(true);
        let mut ctx = rig.ctx();
        t.ep.post_send(&mut ctx, SendArgs::msg(vec![vec![1]], 0)).unwrap();
        assert!(matches!(
            t.ep.post_send(&mut ctx, SendArgs::msg(vec![vec![2]], 1)),
            Err(Error::Again)
        ));
        assert_eq!(rig.metrics.snapshot().xfer_exhausted, 1);
    }

    #[test]
    fn test_write_requests_ack() {
        let acks = header_ack_flags(Op::Write, OpFlags::empty());
        assert!(acks.wants_ack());
        assert!(!header_ack_flags(Op::Write, OpFlags::INJECT).wants_ack());
        assert!(header_ack_flags(Op::Msg, OpFlags::COMMIT_COMPLETE)
            .contains(HeaderFlags::DELIVERY_COMPLETE));
        assert!(header_ack_flags(Op::ReadReq, OpFlags::DELIVERY_COMPLETE).is_empty());
    }
}
