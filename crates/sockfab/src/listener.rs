// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Passive endpoints and pending incoming connections.
//!
//! ```text
//! listener readable
//!     -> accept() until WouldBlock
//!     -> ConnHandle per socket, registered for reads
//!     -> ConnReq read (any fragmentation)
//!     -> CmEvent::ConnRequest on the listener's EQ
//!     -> Domain::accept  (socket moves into a new endpoint)
//!        Domain::reject  (Reject sent, socket closed)
//! ```

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::DomainConfig;
use crate::endpoint::{Ctx, EpState};
use crate::eq::{CmEvent, ConnRequest, EqError, EventQueue};
use crate::error::{Error, ErrorCode, Result};
use crate::poll::{PollRegistry, Target};
use crate::proto::cm::{self, CmReader, CmType};
use crate::stream::BufferedSocket;

fn bind_one(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind a non-blocking listener. Port 0 with a configured port range tries
/// each port of the range in order.
pub(crate) fn bind_listener(addr: SocketAddr, config: &DomainConfig) -> Result<TcpListener> {
    let Some((low, high)) = config.port_range.filter(|_| addr.port() == 0) else {
        return Ok(bind_one(addr, config.listen_backlog)?);
    };
    let mut last = None;
    for port in low..=high {
        let mut candidate = addr;
        candidate.set_port(port);
        match bind_one(candidate, config.listen_backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log::debug!("[cm] port {} in use", port);
                last = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "empty port range"))
        .into())
}

/// Listening socket of a passive endpoint.
#[derive(Debug)]
pub(crate) struct PepInner {
    pub(crate) id: u32,
    listener: TcpListener,
    pub(crate) local_addr: SocketAddr,
    pub(crate) eq: Arc<EventQueue>,
    pub(crate) state: EpState,
}

impl PepInner {
    pub(crate) fn new(
        id: u32,
        listener: TcpListener,
        local_addr: SocketAddr,
        eq: Arc<EventQueue>,
    ) -> Self {
        Self {
            id,
            listener,
            local_addr,
            eq,
            state: EpState::Listening,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Drain the accept backlog.
    pub(crate) fn accept_pending(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut out = Vec::new();
        loop {
            match self.listener.accept() {
                Ok(pair) => out.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    log::warn!("[cm] accept on {} failed: {}", self.local_addr, e);
                    break;
                }
            }
        }
        out
    }

    pub(crate) fn close(&mut self, registry: &PollRegistry) {
        if self.state == EpState::Disconnected {
            return;
        }
        registry.deregister(self.fd(), Target::Listener(self.id));
        self.state = EpState::Disconnected;
        log::debug!("[cm] listener {} closed", self.local_addr);
    }
}

/// Result of driving a pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    /// Handshake request not complete yet
    Pending,
    /// Request surfaced on the EQ; waiting for accept or reject
    Requested,
    /// Dropped; remove the handle
    Closed,
}

/// Accepted socket whose connection request is being read.
#[derive(Debug)]
pub(crate) struct ConnHandle {
    pub(crate) serial: u64,
    pub(crate) pep: u32,
    eq: Arc<EventQueue>,
    bsock: Option<BufferedSocket>,
    reader: CmReader,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) endian_match: bool,
    registered: bool,
}

impl ConnHandle {
    pub(crate) fn new(
        serial: u64,
        pep: &PepInner,
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: &DomainConfig,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(config.nodelay)?;
        Ok(Self {
            serial,
            pep: pep.id,
            eq: Arc::clone(&pep.eq),
            bsock: Some(BufferedSocket::new(
                Box::new(stream),
                config.staging_sbuf_size,
                config.prefetch_rbuf_size,
            )),
            reader: CmReader::new(config.wire_order),
            peer_addr,
            endian_match: true,
            registered: false,
        })
    }

    pub(crate) fn register(&mut self, slot: u32, registry: &PollRegistry) -> Result<()> {
        if let Some(bsock) = self.bsock.as_ref() {
            registry.register(bsock.fd(), Target::Conn(slot), mio::Interest::READABLE)?;
            self.registered = true;
        }
        Ok(())
    }

    fn deregister(&mut self, slot: u32, registry: &PollRegistry) {
        if !self.registered {
            return;
        }
        if let Some(bsock) = self.bsock.as_ref() {
            registry.deregister(bsock.fd(), Target::Conn(slot));
        }
        self.registered = false;
    }

    /// Read as much of the connection request as is available.
    pub(crate) fn progress(&mut self, slot: u32, ctx: &Ctx<'_>) -> ConnStatus {
        let Some(bsock) = self.bsock.as_mut() else {
            return ConnStatus::Closed;
        };
        match self.reader.read_from(bsock) {
            Ok(None) => ConnStatus::Pending,
            Ok(Some(msg)) if msg.kind == CmType::ConnReq => {
                self.deregister(slot, ctx.registry);
                self.endian_match = msg.endian_match;
                log::debug!(
                    "[cm] connection request from {} ({} bytes of data)",
                    self.peer_addr,
                    msg.data.len()
                );
                self.eq.push(CmEvent::ConnRequest(ConnRequest {
                    slot,
                    serial: self.serial,
                    peer_addr: self.peer_addr,
                    data: msg.data,
                }));
                ConnStatus::Requested
            }
            Ok(Some(msg)) => {
                log::warn!("[cm] {} sent {:?} instead of a request", self.peer_addr, msg.kind);
                ctx.metrics.record_protocol_error();
                self.close(slot, ctx.registry);
                ConnStatus::Closed
            }
            Err(Error::VersionMismatch { expected, got }) => {
                log::warn!(
                    "[cm] {} speaks version {}, expected {}",
                    self.peer_addr,
                    got,
                    expected
                );
                ctx.metrics.record_protocol_error();
                ctx.metrics.record_connection_failed();
                self.eq.push_error(EqError {
                    endpoint: None,
                    code: ErrorCode::VersionMismatch,
                    data: Vec::new(),
                });
                self.reject(slot, ctx.registry, &[], ctx.config);
                ConnStatus::Closed
            }
            Err(e) => {
                if matches!(e, Error::Protocol(_)) {
                    ctx.metrics.record_protocol_error();
                }
                log::debug!("[cm] pending connection from {} dropped: {}", self.peer_addr, e);
                self.close(slot, ctx.registry);
                ConnStatus::Closed
            }
        }
    }

    /// Hand the socket over to an accepting endpoint.
    pub(crate) fn take_socket(&mut self, slot: u32, registry: &PollRegistry) -> Option<BufferedSocket> {
        self.deregister(slot, registry);
        self.bsock.take()
    }

    /// Best-effort `Reject`, then close.
    pub(crate) fn reject(
        &mut self,
        slot: u32,
        registry: &PollRegistry,
        data: &[u8],
        config: &DomainConfig,
    ) {
        if let (Some(bsock), Ok(msg)) = (
            self.bsock.as_mut(),
            cm::encode(CmType::Reject, data, config.wire_order),
        ) {
            let sent = bsock.send(&msg).and_then(|_| bsock.flush());
            if let Err(e) = sent {
                log::debug!("[cm] reject to {} not delivered: {}", self.peer_addr, e);
            }
        }
        self.close(slot, registry);
    }

    pub(crate) fn close(&mut self, slot: u32, registry: &PollRegistry) {
        self.deregister(slot, registry);
        if let Some(mut bsock) = self.bsock.take() {
            bsock.shutdown();
        }
    }
}
