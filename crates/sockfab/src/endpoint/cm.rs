// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handshake of an active endpoint.
//!
//! The connecting side sends `ConnReq` once the non-blocking connect
//! finishes and waits for `ConnResp` or `Reject`. The accepting side
//! sends `ConnResp` and is connected as soon as it is written. Both
//! sides learn the peer's byte order from the endian marker and fix the
//! header swap strategy for the rest of the connection.

use std::io;
use std::net::{SocketAddr, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

use super::{Cause, Ctx, EpInner, EpState};
use crate::eq::CmEvent;
use crate::error::{Error, ErrorCode, Result};
use crate::proto::cm::{self, CmReader, CmType};
use crate::proto::{HeaderSwap, WireOrder};
use crate::stream::BufferedSocket;

/// Outgoing handshake message and the reader for the incoming one.
#[derive(Debug)]
pub(crate) struct CmProgress {
    out: Vec<u8>,
    sent: usize,
    reader: CmReader,
}

impl CmProgress {
    pub(crate) fn new(order: WireOrder) -> Self {
        Self {
            out: Vec::new(),
            sent: 0,
            reader: CmReader::new(order),
        }
    }
}

fn in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Start a non-blocking TCP connect to `addr`.
fn open_stream(addr: SocketAddr, nodelay: bool) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(nodelay)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(TcpStream::from(socket))
}

impl EpInner {
    /// Begin connecting to `addr`, carrying `data` in the request.
    pub(crate) fn start_connect(
        &mut self,
        ctx: &mut Ctx<'_>,
        addr: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        if self.state != EpState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }
        let out = cm::encode(CmType::ConnReq, data, ctx.config.wire_order)?;
        let stream = open_stream(addr, ctx.config.nodelay)?;
        let bsock = BufferedSocket::new(
            Box::new(stream),
            ctx.config.staging_sbuf_size,
            ctx.config.prefetch_rbuf_size,
        );
        self.begin_connect(ctx, bsock, addr, out)
    }

    fn begin_connect(
        &mut self,
        ctx: &mut Ctx<'_>,
        bsock: BufferedSocket,
        addr: SocketAddr,
        out: Vec<u8>,
    ) -> Result<()> {
        self.bsock = Some(bsock);
        if let Err(e) = self.register(ctx, true) {
            self.bsock = None;
            return Err(e);
        }
        self.cm.out = out;
        self.cm.sent = 0;
        self.peer_addr = Some(addr);
        self.set_state(EpState::Connecting);
        log::debug!("[cm] {} connecting to {}", self.id, addr);
        Ok(())
    }

    /// Take over a socket whose `ConnReq` was accepted and answer it.
    pub(crate) fn start_accept(
        &mut self,
        ctx: &mut Ctx<'_>,
        bsock: BufferedSocket,
        endian_match: bool,
        peer_addr: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        if self.state != EpState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }
        let out = cm::encode(CmType::ConnResp, data, ctx.config.wire_order)?;
        self.bsock = Some(bsock);
        if let Err(e) = self.register(ctx, true) {
            self.bsock = None;
            return Err(e);
        }
        self.cm.out = out;
        self.cm.sent = 0;
        self.swap = HeaderSwap::for_peer(endian_match);
        self.peer_addr = Some(peer_addr);
        self.set_state(EpState::Accepting);
        self.progress(ctx);
        Ok(())
    }

    /// Application shutdown: no further transfers, queued ones flushed.
    pub(crate) fn shutdown(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        if self.state == EpState::Disconnected {
            return Err(Error::InvalidState { state: self.state });
        }
        self.disable(Cause::Shutdown, ctx);
        Ok(())
    }

    pub(crate) fn progress_cm(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        match self.state {
            EpState::Connecting => {
                let Some(bsock) = self.bsock.as_ref() else {
                    return Ok(());
                };
                if let Some(err) = bsock.stream().take_error()? {
                    return Err(err.into());
                }
                match bsock.stream().peer_addr() {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
                if !self.flush_cm()? {
                    return Ok(());
                }
                self.set_state(EpState::RequestSent);
                self.read_cm_reply(ctx)
            }
            EpState::RequestSent => {
                self.flush_cm()?;
                self.read_cm_reply(ctx)
            }
            EpState::Accepting => {
                if self.flush_cm()? {
                    self.set_state(EpState::Connected);
                    self.on_connected(Vec::new(), ctx);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Push the pending handshake message. `true` once all of it left.
    fn flush_cm(&mut self) -> Result<bool> {
        let Some(bsock) = self.bsock.as_mut() else {
            return Ok(false);
        };
        let cm = &mut self.cm;
        while cm.sent < cm.out.len() {
            match bsock.send(&cm.out[cm.sent..]) {
                Ok(n) => cm.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        match bsock.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    fn read_cm_reply(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        let Some(bsock) = self.bsock.as_mut() else {
            return Ok(());
        };
        let Some(msg) = self.cm.reader.read_from(bsock)? else {
            return Ok(());
        };
        match msg.kind {
            CmType::ConnResp => {
                self.swap = HeaderSwap::for_peer(msg.endian_match);
                if !msg.endian_match {
                    log::info!("[cm] {} peer writes the other byte order, swapping headers", self.id);
                }
                self.set_state(EpState::Connected);
                self.on_connected(msg.data, ctx);
                Ok(())
            }
            CmType::Reject => {
                log::info!("[cm] {} connection rejected by {:?}", self.id, self.peer_addr);
                self.disable(
                    Cause::Failed {
                        code: ErrorCode::Rejected,
                        data: msg.data,
                    },
                    ctx,
                );
                Ok(())
            }
            CmType::ConnReq => Err(Error::protocol("connection request sent to the connecting side")),
        }
    }

    fn on_connected(&mut self, data: Vec<u8>, ctx: &mut Ctx<'_>) {
        self.cm.out = Vec::new();
        self.cm.sent = 0;
        ctx.metrics.record_connection_established();
        log::info!("[cm] {} connected to {:?}", self.id, self.peer_addr);
        if let Some(eq) = self.eq.as_ref() {
            eq.push(CmEvent::Connected {
                endpoint: self.id,
                data,
            });
        }
    }
}
