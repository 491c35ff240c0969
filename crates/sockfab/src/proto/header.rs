// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-path wire header.
//!
//! ```text
//! +---------+----+-------+---------+-------------+----------+----+---------+
//! | version | op | flags | op_data | rma_iov_cnt | hdr_size | id |  size   |
//! |   u8    | u8 |  u16  |   u8    |     u8      |    u8    | u8 |   u64   |
//! +---------+----+-------+---------+-------------+----------+----+---------+
//! [cq_data: u64]         if flags & REMOTE_CQ_DATA
//! [tag: u64]             if flags & TAGGED
//! [addr, len, key: u64]  x rma_iov_cnt
//! ```
//!
//! Multi-byte fields are written in the sender's [`WireOrder`]. The
//! receiver decodes in its own order and then applies the per-connection
//! [`HeaderSwap`] strategy, negotiated once at handshake time.

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Data-path protocol version.
pub const HDR_VERSION: u8 = 3;

/// Size of the fixed base header.
pub const BASE_HDR_SIZE: usize = 16;

/// Maximum scatter/gather entries per operation, local or remote.
pub const IOV_LIMIT: usize = 4;

/// Encoded size of one RMA descriptor.
pub const RMA_IOV_SIZE: usize = 24;

/// Largest header: base, completion data, tag, and a full RMA iov list.
pub const MAX_HDR_SIZE: usize = BASE_HDR_SIZE + 16 + IOV_LIMIT * RMA_IOV_SIZE;

/// Largest payload carried inline by inject operations.
pub const MAX_INJECT: usize = 128;

/// Byte order a domain writes its headers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOrder {
    Little,
    Big,
}

impl WireOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            WireOrder::Big
        } else {
            WireOrder::Little
        }
    }

    pub(crate) fn put_u16(self, out: &mut [u8], v: u16) {
        let bytes = match self {
            WireOrder::Little => v.to_le_bytes(),
            WireOrder::Big => v.to_be_bytes(),
        };
        out[..2].copy_from_slice(&bytes);
    }

    pub(crate) fn put_u32(self, out: &mut [u8], v: u32) {
        let bytes = match self {
            WireOrder::Little => v.to_le_bytes(),
            WireOrder::Big => v.to_be_bytes(),
        };
        out[..4].copy_from_slice(&bytes);
    }

    pub(crate) fn put_u64(self, out: &mut [u8], v: u64) {
        let bytes = match self {
            WireOrder::Little => v.to_le_bytes(),
            WireOrder::Big => v.to_be_bytes(),
        };
        out[..8].copy_from_slice(&bytes);
    }

    pub(crate) fn get_u16(self, buf: &[u8]) -> u16 {
        let bytes = [buf[0], buf[1]];
        match self {
            WireOrder::Little => u16::from_le_bytes(bytes),
            WireOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    pub(crate) fn get_u32(self, buf: &[u8]) -> u32 {
        let bytes = [buf[0], buf[1], buf[2], buf[3]];
        match self {
            WireOrder::Little => u32::from_le_bytes(bytes),
            WireOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    pub(crate) fn get_u64(self, buf: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        match self {
            WireOrder::Little => u64::from_le_bytes(bytes),
            WireOrder::Big => u64::from_be_bytes(bytes),
        }
    }
}

/// Wire operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Op {
    Msg = 0,
    Tag = 1,
    ReadReq = 2,
    ReadRsp = 3,
    Write = 4,
    Ack = 5,
}

impl Op {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Op::Msg,
            1 => Op::Tag,
            2 => Op::ReadReq,
            3 => Op::ReadRsp,
            4 => Op::Write,
            5 => Op::Ack,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct HeaderFlags: u16 {
        const REMOTE_CQ_DATA = 1 << 0;
        const TRANSMIT_COMPLETE = 1 << 1;
        const DELIVERY_COMPLETE = 1 << 2;
        const COMMIT_COMPLETE = 1 << 3;
        const TAGGED = 1 << 7;
    }
}

impl HeaderFlags {
    /// Any of the flags that make the receiver send an ack.
    pub(crate) fn wants_ack(self) -> bool {
        self.intersects(
            HeaderFlags::TRANSMIT_COMPLETE
                | HeaderFlags::DELIVERY_COMPLETE
                | HeaderFlags::COMMIT_COMPLETE,
        )
    }
}

/// Remote memory descriptor: offset `addr` of `len` bytes in region `key`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmaIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

impl RmaIov {
    pub fn new(addr: u64, len: u64, key: u64) -> Self {
        Self { addr, len, key }
    }
}

/// Fixed 16-byte prefix shared by every header variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BaseHeader {
    pub version: u8,
    pub op: u8,
    pub flags: u16,
    pub op_data: u8,
    pub rma_iov_cnt: u8,
    pub hdr_size: u8,
    /// Rolling per-direction sequence number.
    pub id: u8,
    /// Total message size, header included.
    pub size: u64,
}

impl BaseHeader {
    pub(crate) fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    pub(crate) fn op(&self) -> Option<Op> {
        Op::from_u8(self.op)
    }

    pub(crate) fn decode(buf: &[u8], order: WireOrder) -> Self {
        Self {
            version: buf[0],
            op: buf[1],
            flags: order.get_u16(&buf[2..4]),
            op_data: buf[4],
            rma_iov_cnt: buf[5],
            hdr_size: buf[6],
            id: buf[7],
            size: order.get_u64(&buf[8..16]),
        }
    }

    fn encode(&self, order: WireOrder, out: &mut [u8]) {
        out[0] = self.version;
        out[1] = self.op;
        order.put_u16(&mut out[2..4], self.flags);
        out[4] = self.op_data;
        out[5] = self.rma_iov_cnt;
        out[6] = self.hdr_size;
        out[7] = self.id;
        order.put_u64(&mut out[8..16], self.size);
    }

    /// Check a host-order base header before any variant field is read.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.version != HDR_VERSION {
            return Err(Error::VersionMismatch {
                expected: HDR_VERSION,
                got: self.version,
            });
        }
        if self.op().is_none() {
            return Err(Error::protocol(format!("unknown op {}", self.op)));
        }
        let cnt = self.rma_iov_cnt as usize;
        if cnt > IOV_LIMIT {
            return Err(Error::protocol(format!("rma_iov_cnt {cnt} exceeds limit")));
        }
        let expected = expected_hdr_size(self.flags(), cnt);
        if self.hdr_size as usize != expected {
            return Err(Error::protocol(format!(
                "hdr_size {} does not match variant size {}",
                self.hdr_size, expected
            )));
        }
        if self.size < u64::from(self.hdr_size) {
            return Err(Error::protocol(format!(
                "message size {} smaller than header",
                self.size
            )));
        }
        Ok(())
    }
}

/// Variant fields following the base header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum HeaderExt {
    #[default]
    None,
    CqData(u64),
    Tag(u64),
    TagCqData {
        tag: u64,
        data: u64,
    },
}

impl HeaderExt {
    pub(crate) fn from_parts(tag: Option<u64>, data: Option<u64>) -> Self {
        match (tag, data) {
            (None, None) => HeaderExt::None,
            (None, Some(data)) => HeaderExt::CqData(data),
            (Some(tag), None) => HeaderExt::Tag(tag),
            (Some(tag), Some(data)) => HeaderExt::TagCqData { tag, data },
        }
    }

    pub(crate) fn tag(&self) -> Option<u64> {
        match *self {
            HeaderExt::Tag(tag) | HeaderExt::TagCqData { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub(crate) fn cq_data(&self) -> Option<u64> {
        match *self {
            HeaderExt::CqData(data) | HeaderExt::TagCqData { data, .. } => Some(data),
            _ => None,
        }
    }

    fn flags(&self) -> HeaderFlags {
        let mut flags = HeaderFlags::empty();
        flags.set(HeaderFlags::TAGGED, self.tag().is_some());
        flags.set(HeaderFlags::REMOTE_CQ_DATA, self.cq_data().is_some());
        flags
    }
}

pub(crate) fn expected_hdr_size(flags: HeaderFlags, rma_iov_cnt: usize) -> usize {
    let mut size = BASE_HDR_SIZE + rma_iov_cnt * RMA_IOV_SIZE;
    if flags.contains(HeaderFlags::REMOTE_CQ_DATA) {
        size += 8;
    }
    if flags.contains(HeaderFlags::TAGGED) {
        size += 8;
    }
    size
}

/// Decoded header in host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Header {
    pub base: BaseHeader,
    pub ext: HeaderExt,
    pub rma: [RmaIov; IOV_LIMIT],
}

impl Header {
    pub(crate) fn new(op: Op) -> Self {
        let mut hdr = Self::default();
        hdr.base.version = HDR_VERSION;
        hdr.base.op = op as u8;
        hdr
    }

    pub(crate) fn flags(&self) -> HeaderFlags {
        self.base.flags()
    }

    pub(crate) fn insert_flags(&mut self, flags: HeaderFlags) {
        self.base.flags |= flags.bits();
    }

    pub(crate) fn set_ext(&mut self, ext: HeaderExt) {
        let cleared = self.flags() - (HeaderFlags::TAGGED | HeaderFlags::REMOTE_CQ_DATA);
        self.base.flags = (cleared | ext.flags()).bits();
        self.ext = ext;
    }

    pub(crate) fn set_rma(&mut self, iovs: &[RmaIov]) {
        debug_assert!(iovs.len() <= IOV_LIMIT);
        self.rma[..iovs.len()].copy_from_slice(iovs);
        self.base.rma_iov_cnt = iovs.len() as u8;
    }

    pub(crate) fn rma_iovs(&self) -> &[RmaIov] {
        &self.rma[..self.base.rma_iov_cnt as usize]
    }

    /// Fix `hdr_size` and `size` for a payload of `payload_len` bytes.
    pub(crate) fn seal(&mut self, payload_len: usize) {
        let hdr_size = expected_hdr_size(self.flags(), self.base.rma_iov_cnt as usize);
        self.base.hdr_size = hdr_size as u8;
        self.base.size = (hdr_size + payload_len) as u64;
    }

    pub(crate) fn hdr_size(&self) -> usize {
        self.base.hdr_size as usize
    }

    pub(crate) fn payload_len(&self) -> u64 {
        self.base.size - u64::from(self.base.hdr_size)
    }

    /// Encode into `out` (at least `hdr_size` bytes). Returns bytes written.
    pub(crate) fn encode(&self, order: WireOrder, out: &mut [u8]) -> usize {
        self.base.encode(order, out);
        let mut pos = BASE_HDR_SIZE;
        if let Some(data) = self.ext.cq_data() {
            order.put_u64(&mut out[pos..], data);
            pos += 8;
        }
        if let Some(tag) = self.ext.tag() {
            order.put_u64(&mut out[pos..], tag);
            pos += 8;
        }
        for iov in self.rma_iovs() {
            order.put_u64(&mut out[pos..], iov.addr);
            order.put_u64(&mut out[pos + 8..], iov.len);
            order.put_u64(&mut out[pos + 16..], iov.key);
            pos += RMA_IOV_SIZE;
        }
        debug_assert_eq!(pos, self.hdr_size());
        pos
    }

    /// Decode the variant fields that follow a validated, host-order base.
    /// `rest` holds exactly `hdr_size - BASE_HDR_SIZE` bytes.
    pub(crate) fn decode_ext(base: BaseHeader, rest: &[u8], order: WireOrder) -> Self {
        let flags = base.flags();
        let mut pos = 0;
        let data = flags.contains(HeaderFlags::REMOTE_CQ_DATA).then(|| {
            let v = order.get_u64(&rest[pos..]);
            pos += 8;
            v
        });
        let tag = flags.contains(HeaderFlags::TAGGED).then(|| {
            let v = order.get_u64(&rest[pos..]);
            pos += 8;
            v
        });

        let mut rma = [RmaIov::default(); IOV_LIMIT];
        for iov in rma.iter_mut().take(base.rma_iov_cnt as usize) {
            iov.addr = order.get_u64(&rest[pos..]);
            iov.len = order.get_u64(&rest[pos + 8..]);
            iov.key = order.get_u64(&rest[pos + 16..]);
            pos += RMA_IOV_SIZE;
        }

        Self {
            base,
            ext: HeaderExt::from_parts(tag, data),
            rma,
        }
    }
}

/// Byte-swap strategy for one connection, fixed at handshake time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum HeaderSwap {
    #[default]
    None,
    Swap,
}

impl HeaderSwap {
    pub(crate) fn for_peer(endian_match: bool) -> Self {
        if endian_match {
            HeaderSwap::None
        } else {
            HeaderSwap::Swap
        }
    }

    pub(crate) fn base(self, base: &mut BaseHeader) {
        if self == HeaderSwap::Swap {
            base.flags = base.flags.swap_bytes();
            base.size = base.size.swap_bytes();
        }
    }

    pub(crate) fn ext(self, hdr: &mut Header) {
        if self == HeaderSwap::None {
            return;
        }
        hdr.ext = match hdr.ext {
            HeaderExt::None => HeaderExt::None,
            HeaderExt::CqData(d) => HeaderExt::CqData(d.swap_bytes()),
            HeaderExt::Tag(t) => HeaderExt::Tag(t.swap_bytes()),
            HeaderExt::TagCqData { tag, data } => HeaderExt::TagCqData {
                tag: tag.swap_bytes(),
                data: data.swap_bytes(),
            },
        };
        let cnt = hdr.base.rma_iov_cnt as usize;
        for iov in hdr.rma.iter_mut().take(cnt) {
            iov.addr = iov.addr.swap_bytes();
            iov.len = iov.len.swap_bytes();
            iov.key = iov.key.swap_bytes();
        }
    }
}
