// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-management handshake message.
//!
//! ```text
//! +------------+------+--------------+-----------------+-------------+----------+
//! | cm_version | type | data_len(BE) | endian marker   | hdr_version | reserved |
//! |     u8     |  u8  |     u16      | u32 sender order|     u8      |   7 B    |
//! +------------+------+--------------+-----------------+-------------+----------+
//! | data (0..=256 bytes)                                                         |
//! +------------------------------------------------------------------------------+
//! ```
//!
//! The marker is the value 1 written in the sender's wire order. Reading it
//! back as 1 means both sides agree on byte order; reading `0x0100_0000`
//! means the data path needs the swap strategy.

use std::io;

use super::header::{WireOrder, HDR_VERSION};
use crate::error::{Error, Result};
use crate::stream::BufferedSocket;

pub const CM_VERSION: u8 = 1;

pub const CM_HDR_SIZE: usize = 16;

/// Largest application payload carried by connect/accept/reject.
pub const MAX_CM_DATA: usize = 256;

const ENDIAN_MARKER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CmType {
    ConnReq = 1,
    ConnResp = 2,
    Reject = 3,
}

impl CmType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(CmType::ConnReq),
            2 => Some(CmType::ConnResp),
            3 => Some(CmType::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CmMessage {
    pub kind: CmType,
    /// Peer writes headers in our byte order.
    pub endian_match: bool,
    pub data: Vec<u8>,
}

/// Encode a handshake message in `order`.
pub(crate) fn encode(kind: CmType, data: &[u8], order: WireOrder) -> Result<Vec<u8>> {
    if data.len() > MAX_CM_DATA {
        return Err(Error::InvalidArgument(format!(
            "connection data {} bytes exceeds {}",
            data.len(),
            MAX_CM_DATA
        )));
    }
    let mut out = vec![0u8; CM_HDR_SIZE + data.len()];
    out[0] = CM_VERSION;
    out[1] = kind as u8;
    out[2..4].copy_from_slice(&(data.len() as u16).to_be_bytes());
    order.put_u32(&mut out[4..8], ENDIAN_MARKER);
    out[8] = HDR_VERSION;
    out[CM_HDR_SIZE..].copy_from_slice(data);
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingHeader { bytes_read: usize },
    ReadingData { expected_len: usize, bytes_read: usize },
}

/// Incremental handshake reader; survives any fragmentation.
#[derive(Debug)]
pub(crate) struct CmReader {
    state: ReadState,
    order: WireOrder,
    buf: [u8; CM_HDR_SIZE + MAX_CM_DATA],
    kind: CmType,
    endian_match: bool,
}

impl CmReader {
    pub(crate) fn new(order: WireOrder) -> Self {
        Self {
            state: ReadState::ReadingHeader { bytes_read: 0 },
            order,
            buf: [0u8; CM_HDR_SIZE + MAX_CM_DATA],
            kind: CmType::ConnReq,
            endian_match: true,
        }
    }

    /// Read as much of the message as is available.
    ///
    /// - `Ok(Some(msg))` - message complete
    /// - `Ok(None)` - need more data (WouldBlock)
    /// - `Err(_)` - I/O failure, version mismatch or malformed message
    pub(crate) fn read_from(&mut self, sock: &mut BufferedSocket) -> Result<Option<CmMessage>> {
        loop {
            match self.state {
                ReadState::ReadingHeader { bytes_read } => {
                    match sock.recv(&mut self.buf[bytes_read..CM_HDR_SIZE]) {
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < CM_HDR_SIZE {
                                self.state = ReadState::ReadingHeader { bytes_read: total };
                                continue;
                            }
                            let expected_len = self.parse_header()?;
                            if expected_len == 0 {
                                return Ok(Some(self.finish(0)));
                            }
                            self.state = ReadState::ReadingData {
                                expected_len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                }

                ReadState::ReadingData {
                    expected_len,
                    bytes_read,
                } => {
                    let range = CM_HDR_SIZE + bytes_read..CM_HDR_SIZE + expected_len;
                    match sock.recv(&mut self.buf[range]) {
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingData {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }
                            return Ok(Some(self.finish(expected_len)));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn parse_header(&mut self) -> Result<usize> {
        let version = self.buf[0];
        if version != CM_VERSION {
            return Err(Error::VersionMismatch {
                expected: CM_VERSION,
                got: version,
            });
        }
        let hdr_version = self.buf[8];
        if hdr_version != HDR_VERSION {
            return Err(Error::VersionMismatch {
                expected: HDR_VERSION,
                got: hdr_version,
            });
        }
        self.kind = CmType::from_u8(self.buf[1])
            .ok_or_else(|| Error::protocol(format!("unknown handshake type {}", self.buf[1])))?;

        let marker = self.order.get_u32(&self.buf[4..8]);
        self.endian_match = if marker == ENDIAN_MARKER {
            true
        } else if marker == ENDIAN_MARKER.swap_bytes() {
            false
        } else {
            return Err(Error::protocol(format!("bad endian marker {marker:#x}")));
        };

        let data_len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if data_len > MAX_CM_DATA {
            return Err(Error::protocol(format!(
                "handshake data {data_len} bytes exceeds {MAX_CM_DATA}"
            )));
        }
        Ok(data_len)
    }

    fn finish(&mut self, data_len: usize) -> CmMessage {
        self.state = ReadState::ReadingHeader { bytes_read: 0 };
        CmMessage {
            kind: self.kind,
            endian_match: self.endian_match,
            data: self.buf[CM_HDR_SIZE..CM_HDR_SIZE + data_len].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::byte_stream::mock::{MockHandle, MockStream};

    fn socket() -> (BufferedSocket, MockHandle) {
        let (stream, handle) = MockStream::new();
        (BufferedSocket::new(Box::new(stream), 0, 0), handle)
    }

    #[test]
    fn test_request_roundtrip() {
        let (mut sock, handle) = socket();
        handle.feed(&encode(CmType::ConnReq, b"hi there", WireOrder::native()).unwrap());

        let mut reader = CmReader::new(WireOrder::native());
        let msg = reader.read_from(&mut sock).unwrap().unwrap();
        assert_eq!(msg.kind, CmType::ConnReq);
        assert!(msg.endian_match);
        assert_eq!(msg.data, b"hi there");
    }

    #[test]
    fn test_byte_at_a_time() {
        let (mut sock, handle) = socket();
        let bytes = encode(CmType::ConnResp, b"xyz", WireOrder::native()).unwrap();
        let mut reader = CmReader::new(WireOrder::native());

        for (i, b) in bytes.iter().enumerate() {
            handle.feed(&[*b]);
            let res = reader.read_from(&mut sock).unwrap();
            if i + 1 < bytes.len() {
                assert!(res.is_none());
            } else {
                assert_eq!(res.unwrap().data, b"xyz");
            }
        }
    }

    #[test]
    fn test_endianness_mismatch_detected() {
        let (mut sock, handle) = socket();
        handle.feed(&encode(CmType::ConnReq, &[], WireOrder::Big).unwrap());
        let mut reader = CmReader::new(WireOrder::Little);
        let msg = reader.read_from(&mut sock).unwrap().unwrap();
        assert!(!msg.endian_match);
        assert!(msg.data.is_empty());
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let (mut sock, handle) = socket();
        let mut bytes = encode(CmType::ConnReq, &[], WireOrder::native()).unwrap();
        bytes[0] = CM_VERSION + 1;
        handle.feed(&bytes);
        let mut reader = CmReader::new(WireOrder::native());
        assert!(matches!(
            reader.read_from(&mut sock),
            Err(Error::VersionMismatch { .. })
        ));

        let (mut sock, handle) = socket();
        let mut bytes = encode(CmType::ConnReq, &[], WireOrder::native()).unwrap();
        bytes[8] = HDR_VERSION + 1;
        handle.feed(&bytes);
        let mut reader = CmReader::new(WireOrder::native());
        assert!(matches!(
            reader.read_from(&mut sock),
            Err(Error::VersionMismatch { got, .. }) if got == HDR_VERSION + 1
        ));
    }

    #[test]
    fn test_bad_marker_and_oversized_data() {
        assert!(encode(CmType::Reject, &[0u8; MAX_CM_DATA + 1], WireOrder::native()).is_err());

        let (mut sock, handle) = socket();
        let mut bytes = encode(CmType::ConnReq, &[], WireOrder::native()).unwrap();
        bytes[4..8].copy_from_slice(&[7, 7, 7, 7]);
        handle.feed(&bytes);
        let mut reader = CmReader::new(WireOrder::native());
        assert!(matches!(reader.read_from(&mut sock), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_eof_mid_message() {
        let (mut sock, handle) = socket();
        handle.feed(&encode(CmType::ConnReq, b"abc", WireOrder::native()).unwrap()[..5]);
        handle.close_inbound();
        let mut reader = CmReader::new(WireOrder::native());
        assert!(matches!(reader.read_from(&mut sock), Err(Error::Io(_))));
    }
}
