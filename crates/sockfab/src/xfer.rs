// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transfer entries and their pool.
//!
//! One [`XferEntry`] describes one in-flight operation, transmit or
//! receive. Entries live in a bounded arena owned by the progress context
//! and are referenced by [`XferId`] from the endpoint queues, so moving an
//! entry between queues never moves the record itself.
//!
//! The pool is not synchronized; it is only touched under the progress lock.

use std::io::IoSlice;

use bitflags::bitflags;

use crate::av::FabricAddr;
use crate::endpoint::EndpointId;
use crate::error::ErrorCode;
use crate::flags::CompletionFlags;
use crate::proto::{Header, IOV_LIMIT, MAX_HDR_SIZE, MAX_INJECT};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CtrlFlags: u32 {
        /// Completes when the peer's response arrives (RMA read request).
        const NEED_RESP = 1 << 1;
        /// Completes when the peer's ack arrives.
        const NEED_ACK = 1 << 2;
        /// Generated by the engine; never reported to the application.
        const INTERNAL = 1 << 3;
        /// Receive buffer allocated by the engine (remote write staging).
        const NEED_DYN_RBUF = 1 << 4;
        /// Waiting for its staged bytes to be flushed.
        const ASYNC = 1 << 5;
        const INJECT = 1 << 6;
        const MULTI_RECV = 1 << 16;
    }
}

/// Stable index of an entry in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct XferId(u32);

/// Position inside a segment list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IovCursor {
    pub index: usize,
    pub offset: usize,
}

#[derive(Debug)]
pub(crate) struct XferEntry {
    pub hdr: Header,
    /// Encoded header followed by inline inject data (transmit only)
    pub hdr_bytes: [u8; MAX_HDR_SIZE + MAX_INJECT],
    pub hdr_len: usize,
    /// Application buffers (payload to send, or space to receive into)
    pub iov: Vec<Vec<u8>>,
    pub cursor: IovCursor,
    pub ep: Option<EndpointId>,
    pub tag: u64,
    pub ignore: u64,
    pub src_addr: Option<FabricAddr>,
    pub cq_flags: CompletionFlags,
    pub ctrl_flags: CtrlFlags,
    /// Generate a completion-queue entry on success
    pub report: bool,
    pub async_index: u32,
    pub context: u64,
    /// Error recorded while the entry was in flight
    pub status: Option<ErrorCode>,
    /// Payload bytes moved so far
    pub xfer_len: usize,
    /// Bytes discarded because the posted buffer was too small
    pub olen: usize,
    /// Consumed prefix of a multi-receive buffer
    pub multi_used: usize,
    allocated: bool,
}

impl Default for XferEntry {
    fn default() -> Self {
        Self {
            hdr: Header::default(),
            hdr_bytes: [0u8; MAX_HDR_SIZE + MAX_INJECT],
            hdr_len: 0,
            iov: Vec::with_capacity(IOV_LIMIT),
            cursor: IovCursor::default(),
            ep: None,
            tag: 0,
            ignore: 0,
            src_addr: None,
            cq_flags: CompletionFlags::empty(),
            ctrl_flags: CtrlFlags::empty(),
            report: false,
            async_index: 0,
            context: 0,
            status: None,
            xfer_len: 0,
            olen: 0,
            multi_used: 0,
            allocated: false,
        }
    }
}

impl XferEntry {
    fn reset(&mut self) {
        self.hdr = Header::default();
        self.hdr_len = 0;
        self.iov.clear();
        self.cursor = IovCursor::default();
        self.ep = None;
        self.tag = 0;
        self.ignore = 0;
        self.src_addr = None;
        self.cq_flags = CompletionFlags::empty();
        self.ctrl_flags = CtrlFlags::empty();
        self.report = false;
        self.async_index = 0;
        self.context = 0;
        self.status = None;
        self.xfer_len = 0;
        self.olen = 0;
        self.multi_used = 0;
    }

    pub(crate) fn iov_len(&self) -> usize {
        self.iov.iter().map(Vec::len).sum()
    }

    /// Space left to receive into.
    pub(crate) fn rx_capacity(&self) -> usize {
        self.iov_len() - self.multi_used
    }

    fn sends_payload(&self) -> bool {
        // read requests carry their destination buffers, not a payload
        !self.ctrl_flags.contains(CtrlFlags::NEED_RESP)
    }

    fn tx_segment_len(&self, index: usize) -> usize {
        if index == 0 {
            self.hdr_len
        } else {
            self.iov[index - 1].len()
        }
    }

    /// Fill `out` with the unsent remainder: header bytes then payload.
    pub(crate) fn tx_slices<'a>(&'a self, out: &mut [IoSlice<'a>; IOV_LIMIT + 1]) -> usize {
        let cursor = self.cursor;
        let mut n = 0;
        if cursor.index == 0 && cursor.offset < self.hdr_len {
            out[n] = IoSlice::new(&self.hdr_bytes[cursor.offset..self.hdr_len]);
            n += 1;
        }
        if !self.sends_payload() {
            return n;
        }
        for (i, seg) in self.iov.iter().enumerate() {
            let index = i + 1;
            if index < cursor.index {
                continue;
            }
            let offset = if index == cursor.index { cursor.offset } else { 0 };
            if offset < seg.len() {
                out[n] = IoSlice::new(&seg[offset..]);
                n += 1;
            }
        }
        n
    }

    pub(crate) fn advance_tx(&mut self, mut n: usize) {
        let segments = 1 + self.iov.len();
        while n > 0 && self.cursor.index < segments {
            let remaining = self.tx_segment_len(self.cursor.index) - self.cursor.offset;
            if n >= remaining {
                n -= remaining;
                self.cursor.index += 1;
                self.cursor.offset = 0;
            } else {
                self.cursor.offset += n;
                n = 0;
            }
        }
        debug_assert_eq!(n, 0, "advanced past the end of the entry");
    }

    /// Writable remainder of the current receive segment.
    pub(crate) fn rx_slice(&mut self) -> Option<&mut [u8]> {
        while self.cursor.index < self.iov.len() {
            let seg = &self.iov[self.cursor.index];
            if self.cursor.offset < seg.len() {
                let offset = self.cursor.offset;
                return Some(&mut self.iov[self.cursor.index][offset..]);
            }
            self.cursor.index += 1;
            self.cursor.offset = 0;
        }
        None
    }

    pub(crate) fn advance_rx(&mut self, n: usize) {
        self.cursor.offset += n;
        self.xfer_len += n;
    }
}

/// Bounded arena of transfer entries.
#[derive(Debug)]
pub(crate) struct XferPool {
    entries: Vec<XferEntry>,
    free: Vec<u32>,
    max: usize,
    in_use: usize,
}

impl XferPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            max,
            in_use: 0,
        }
    }

    /// Hand out a cleared entry, or `None` when the pool is exhausted.
    pub(crate) fn alloc(&mut self) -> Option<XferId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.entries.len() < self.max => {
                self.entries.push(XferEntry::default());
                (self.entries.len() - 1) as u32
            }
            None => {
                log::debug!("[xfer] pool exhausted ({} entries)", self.max);
                return None;
            }
        };
        let entry = &mut self.entries[index as usize];
        debug_assert!(!entry.allocated);
        entry.allocated = true;
        self.in_use += 1;
        Some(XferId(index))
    }

    /// Entry for a transmit: header version set, `op_data` zero.
    pub(crate) fn alloc_tx(&mut self, ep: EndpointId) -> Option<XferId> {
        let id = self.alloc()?;
        let entry = self.get_mut(id);
        entry.hdr.base.version = crate::proto::HDR_VERSION;
        entry.hdr.base.op_data = 0;
        entry.ep = Some(ep);
        Some(id)
    }

    pub(crate) fn alloc_rx(&mut self, ep: EndpointId) -> Option<XferId> {
        let id = self.alloc()?;
        self.get_mut(id).ep = Some(ep);
        Some(id)
    }

    /// Return an entry. Its buffers are dropped with it; callers that
    /// hand buffers back to the application take them out first.
    pub(crate) fn release(&mut self, id: XferId) {
        let entry = &mut self.entries[id.0 as usize];
        debug_assert!(entry.allocated, "double release of {id:?}");
        entry.reset();
        entry.allocated = false;
        self.in_use -= 1;
        self.free.push(id.0);
    }

    pub(crate) fn get(&self, id: XferId) -> &XferEntry {
        &self.entries[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: XferId) -> &mut XferEntry {
        &mut self.entries[id.0 as usize]
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }
}
