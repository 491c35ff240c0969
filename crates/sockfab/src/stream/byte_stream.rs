// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte stream abstraction.
//!
//! The buffered socket and the connection state machine talk to a
//! [`ByteStream`] rather than a concrete `TcpStream` so the framer can be
//! exercised against the in-memory [`mock::MockStream`], which can deliver
//! data one byte at a time, accept short writes, or report `WouldBlock`
//! on demand.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// A bidirectional, ordered, reliable byte stream.
///
/// Implementations are expected to be in non-blocking mode: reads and
/// writes return `WouldBlock` instead of parking the thread.
pub trait ByteStream: Read + Write + Send {
    /// Shut down the read, write, or both halves.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Enable or disable Nagle's algorithm.
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Pending socket error (`SO_ERROR`), used to finish a non-blocking
    /// connect.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Descriptor registered with the poll set. In-memory streams return -1.
    fn as_raw_fd(&self) -> RawFd;
}

impl ByteStream for TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(self)
    }
}

/// Boxed stream, as stored by the buffered socket.
pub type BoxedByteStream = Box<dyn ByteStream>;

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory stream with fragmentation and backpressure knobs.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Pipe {
        data: VecDeque<u8>,
        closed: bool,
    }

    #[derive(Debug, Default)]
    struct Knobs {
        /// Max bytes returned per read (0 = unlimited)
        read_chunk: usize,
        /// Max bytes accepted per write (0 = unlimited)
        write_chunk: usize,
        write_blocked: bool,
        read_error: Option<io::ErrorKind>,
        write_error: Option<io::ErrorKind>,
    }

    /// Mock stream end. Writes land in `outbound`, reads drain `inbound`.
    #[derive(Debug)]
    pub(crate) struct MockStream {
        inbound: Arc<Mutex<Pipe>>,
        outbound: Arc<Mutex<Pipe>>,
        knobs: Arc<Mutex<Knobs>>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    }

    /// Test-side control of a [`MockStream`] after it was moved into a socket.
    #[derive(Debug, Clone)]
    pub(crate) struct MockHandle {
        inbound: Arc<Mutex<Pipe>>,
        outbound: Arc<Mutex<Pipe>>,
        knobs: Arc<Mutex<Knobs>>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    impl MockStream {
        /// Detached stream; the handle feeds reads and inspects writes.
        pub(crate) fn new() -> (Self, MockHandle) {
            Self::with_pipes(
                Arc::new(Mutex::new(Pipe::default())),
                Arc::new(Mutex::new(Pipe::default())),
                addr(12345),
                addr(54321),
            )
        }

        /// Two connected ends: bytes written on one are read on the other.
        pub(crate) fn pair() -> ((Self, MockHandle), (Self, MockHandle)) {
            let a_to_b = Arc::new(Mutex::new(Pipe::default()));
            let b_to_a = Arc::new(Mutex::new(Pipe::default()));
            let a = Self::with_pipes(b_to_a.clone(), a_to_b.clone(), addr(10001), addr(10002));
            let b = Self::with_pipes(a_to_b, b_to_a, addr(10002), addr(10001));
            (a, b)
        }

        fn with_pipes(
            inbound: Arc<Mutex<Pipe>>,
            outbound: Arc<Mutex<Pipe>>,
            local_addr: SocketAddr,
            peer_addr: SocketAddr,
        ) -> (Self, MockHandle) {
            let knobs = Arc::new(Mutex::new(Knobs::default()));
            let handle = MockHandle {
                inbound: inbound.clone(),
                outbound: outbound.clone(),
                knobs: knobs.clone(),
            };
            (
                Self {
                    inbound,
                    outbound,
                    knobs,
                    local_addr,
                    peer_addr,
                },
                handle,
            )
        }
    }

    impl MockHandle {
        pub(crate) fn feed(&self, data: &[u8]) {
            self.inbound.lock().unwrap().data.extend(data);
        }

        /// Reads return EOF once buffered data is drained.
        pub(crate) fn close_inbound(&self) {
            self.inbound.lock().unwrap().closed = true;
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            self.outbound.lock().unwrap().data.drain(..).collect()
        }

        pub(crate) fn written_len(&self) -> usize {
            self.outbound.lock().unwrap().data.len()
        }

        pub(crate) fn set_read_chunk(&self, n: usize) {
            self.knobs.lock().unwrap().read_chunk = n;
        }

        pub(crate) fn set_write_chunk(&self, n: usize) {
            self.knobs.lock().unwrap().write_chunk = n;
        }

        pub(crate) fn set_write_blocked(&self, blocked: bool) {
            self.knobs.lock().unwrap().write_blocked = blocked;
        }

        pub(crate) fn inject_read_error(&self, kind: io::ErrorKind) {
            self.knobs.lock().unwrap().read_error = Some(kind);
        }

        pub(crate) fn inject_write_error(&self, kind: io::ErrorKind) {
            self.knobs.lock().unwrap().write_error = Some(kind);
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let chunk = {
                let mut knobs = self.knobs.lock().unwrap();
                if let Some(kind) = knobs.read_error.take() {
                    return Err(io::Error::new(kind, "injected error"));
                }
                knobs.read_chunk
            };

            let mut pipe = self.inbound.lock().unwrap();
            if pipe.data.is_empty() {
                if pipe.closed {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"));
            }

            let mut to_read = buf.len().min(pipe.data.len());
            if chunk > 0 {
                to_read = to_read.min(chunk);
            }
            for (slot, byte) in buf.iter_mut().zip(pipe.data.drain(..to_read)) {
                *slot = byte;
            }
            Ok(to_read)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let chunk = {
                let mut knobs = self.knobs.lock().unwrap();
                if let Some(kind) = knobs.write_error.take() {
                    return Err(io::Error::new(kind, "injected error"));
                }
                if knobs.write_blocked {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"));
                }
                knobs.write_chunk
            };

            let mut pipe = self.outbound.lock().unwrap();
            if pipe.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "not connected"));
            }
            let n = if chunk > 0 { buf.len().min(chunk) } else { buf.len() };
            pipe.data.extend(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteStream for MockStream {
        fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
            self.outbound.lock().unwrap().closed = true;
            self.inbound.lock().unwrap().closed = true;
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local_addr)
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.peer_addr)
        }

        fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
            Ok(())
        }

        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(None)
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }
}
