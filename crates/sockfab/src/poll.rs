// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness polling.
//!
//! ```text
//!  PollRegistry (shared, used under the progress lock)
//!        |  register / reregister / deregister (fd, token, interest)
//!        v
//!  +-------------------+        +---------------------------+
//!  | Epoll: mio::Poll  |   or   | Fds: FdTable -> poll(2)   |
//!  +-------------------+        +---------------------------+
//!        |  wait(timeout) -> Vec<PollEvent>   (waiter lock only)
//!        v
//!  progress pass dispatches by token kind
//! ```
//!
//! Both backends are driven the same way: every readiness event is
//! treated as a hint, and the endpoint reads or writes until `WouldBlock`.
//! That keeps edge-triggered epoll and level-triggered `poll(2)`
//! interchangeable.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Registry, Token};
use parking_lot::Mutex;

use crate::config::PollMode;

/// What a poll token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Signal,
    Endpoint(u32),
    Listener(u32),
    Conn(u32),
}

const KIND_BITS: usize = 2;

impl Target {
    pub(crate) fn token(self) -> Token {
        let (kind, index) = match self {
            Target::Signal => (0, 0),
            Target::Endpoint(i) => (1, i),
            Target::Listener(i) => (2, i),
            Target::Conn(i) => (3, i),
        };
        Token(((index as usize) << KIND_BITS) | kind)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        let index = (token.0 >> KIND_BITS) as u32;
        match token.0 & ((1 << KIND_BITS) - 1) {
            0 => Target::Signal,
            1 => Target::Endpoint(index),
            2 => Target::Listener(index),
            _ => Target::Conn(index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollEvent {
    pub target: Target,
    pub readable: bool,
    pub writable: bool,
}

/// Interest set for a socket that may or may not want `POLLOUT`.
pub(crate) fn interest(want_out: bool) -> Interest {
    if want_out {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Registered descriptors of the `poll(2)` backend.
#[derive(Debug, Default)]
pub(crate) struct FdTable {
    entries: Mutex<HashMap<Token, (RawFd, Interest)>>,
}

/// Wait side; owned by whoever holds the waiter lock.
pub(crate) enum Poller {
    Epoll {
        poll: mio::Poll,
        events: Events,
    },
    Fds {
        table: Arc<FdTable>,
        fds: Vec<libc::pollfd>,
        tokens: Vec<Token>,
    },
}

/// Registration side; cheap to share.
#[derive(Debug)]
pub(crate) enum PollRegistry {
    Epoll(Registry),
    Fds(Arc<FdTable>),
}

/// Build a poller and its registry for `mode`.
pub(crate) fn new_poller(mode: PollMode, max_events: usize) -> io::Result<(Poller, PollRegistry)> {
    match mode {
        PollMode::Epoll => {
            let poll = mio::Poll::new()?;
            let registry = poll.registry().try_clone()?;
            Ok((
                Poller::Epoll {
                    poll,
                    events: Events::with_capacity(max_events),
                },
                PollRegistry::Epoll(registry),
            ))
        }
        PollMode::Poll => {
            let table = Arc::new(FdTable::default());
            Ok((
                Poller::Fds {
                    table: Arc::clone(&table),
                    fds: Vec::new(),
                    tokens: Vec::new(),
                },
                PollRegistry::Fds(table),
            ))
        }
    }
}

impl Poller {
    /// Block up to `timeout` (`None` waits forever) and append ready
    /// targets to `out`.
    pub(crate) fn wait(&mut self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Poller::Epoll { poll, events } => {
                match poll.poll(events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                    Err(e) => return Err(e),
                }
                for event in events.iter() {
                    out.push(PollEvent {
                        target: Target::from_token(event.token()),
                        // errors and hangups surface through the next read
                        readable: event.is_readable() || event.is_error() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                    });
                }
                Ok(())
            }
            Poller::Fds { table, fds, tokens } => {
                fds.clear();
                tokens.clear();
                for (&token, &(fd, interest)) in table.entries.lock().iter() {
                    let mut events = libc::POLLIN;
                    if interest.is_writable() {
                        events |= libc::POLLOUT;
                    }
                    fds.push(libc::pollfd {
                        fd,
                        events,
                        revents: 0,
                    });
                    tokens.push(token);
                }

                let timeout_ms = match timeout {
                    Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
                    None => -1,
                };
                // SAFETY: `fds` is a valid, exclusively borrowed array of
                // `fds.len()` pollfd structs for the duration of the call.
                let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        return Ok(());
                    }
                    return Err(err);
                }

                for (pfd, &token) in fds.iter().zip(tokens.iter()) {
                    if pfd.revents == 0 {
                        continue;
                    }
                    let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
                    out.push(PollEvent {
                        target: Target::from_token(token),
                        readable: pfd.revents & libc::POLLIN != 0 || failed,
                        writable: pfd.revents & libc::POLLOUT != 0,
                    });
                }
                Ok(())
            }
        }
    }
}

impl PollRegistry {
    pub(crate) fn register(&self, fd: RawFd, target: Target, interest: Interest) -> io::Result<()> {
        match self {
            PollRegistry::Epoll(registry) => {
                registry.register(&mut SourceFd(&fd), target.token(), interest)
            }
            PollRegistry::Fds(table) => {
                table.entries.lock().insert(target.token(), (fd, interest));
                Ok(())
            }
        }
    }

    pub(crate) fn reregister(&self, fd: RawFd, target: Target, interest: Interest) -> io::Result<()> {
        match self {
            PollRegistry::Epoll(registry) => {
                registry.reregister(&mut SourceFd(&fd), target.token(), interest)
            }
            PollRegistry::Fds(table) => {
                table.entries.lock().insert(target.token(), (fd, interest));
                Ok(())
            }
        }
    }

    pub(crate) fn deregister(&self, fd: RawFd, target: Target) {
        let result = match self {
            PollRegistry::Epoll(registry) => registry.deregister(&mut SourceFd(&fd)),
            PollRegistry::Fds(table) => {
                table.entries.lock().remove(&target.token());
                Ok(())
            }
        };
        if let Err(e) = result {
            log::debug!("[progress] deregister {:?}: {}", target, e);
        }
    }
}

/// Self-pipe used to wake a thread blocked in [`Poller::wait`].
#[derive(Debug)]
pub(crate) struct FdSignal {
    tx: UnixStream,
    rx: UnixStream,
}

impl FdSignal {
    pub(crate) fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    pub(crate) fn signal(&self) {
        // a full pipe already guarantees a wakeup
        if let Err(e) = (&self.tx).write(&[1]) {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::debug!("[progress] signal write failed: {}", e);
            }
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}
