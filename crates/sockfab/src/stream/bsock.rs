// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffered socket.
//!
//! Wraps a non-blocking [`ByteStream`] with two byte queues:
//!
//! - a staging send queue: small writes are copied here and flushed
//!   opportunistically, so one syscall carries several small messages
//! - a prefetch receive queue: small reads pull a larger chunk from the
//!   kernel and later reads are served from memory
//!
//! A send whose bytes are still sitting in the staging queue when its
//! transfer entry finishes is *asynchronous*: the caller takes an index
//! from [`BufferedSocket::mark_async`] and completes the entry once
//! [`BufferedSocket::async_done`] has reached it.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::os::unix::io::RawFd;

use super::byte_stream::BoxedByteStream;

/// Contiguous FIFO of bytes with head/tail indexes.
#[derive(Debug)]
struct ByteQueue {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl ByteQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn len(&self) -> usize {
        self.tail - self.head
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }

    fn readable(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    fn consume(&mut self, n: usize) {
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.buf[self.head..self.head + n]);
        self.consume(n);
        n
    }

    fn writable(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.buf[self.tail..]
    }

    fn commit(&mut self, n: usize) {
        self.tail += n;
    }

    fn write_iov(&mut self, bufs: &[IoSlice<'_>]) {
        self.compact();
        for b in bufs {
            self.buf[self.tail..self.tail + b.len()].copy_from_slice(b);
            self.tail += b.len();
        }
    }
}

fn closed_by_peer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

/// `true` once `done` has reached `index` in wrapping sequence space.
pub(crate) fn async_reached(index: u32, done: u32) -> bool {
    done.wrapping_sub(index) as i32 >= 0
}

pub(crate) struct BufferedSocket {
    stream: BoxedByteStream,
    sq: ByteQueue,
    rq: ByteQueue,
    /// Total bytes ever accepted into `sq`
    staged: u64,
    /// Total bytes ever written out of `sq`
    flushed: u64,
    next_async: u32,
    done_async: u32,
    /// (staged offset, async index) waiting for the flush to pass them
    marks: VecDeque<(u64, u32)>,
}

impl std::fmt::Debug for BufferedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSocket")
            .field("sq", &self.sq)
            .field("rq", &self.rq)
            .field("staged", &self.staged)
            .field("flushed", &self.flushed)
            .field("next_async", &self.next_async)
            .field("done_async", &self.done_async)
            .field("marks", &self.marks)
            .finish_non_exhaustive()
    }
}

impl BufferedSocket {
    pub(crate) fn new(stream: BoxedByteStream, sbuf_size: usize, rbuf_size: usize) -> Self {
        Self {
            stream,
            sq: ByteQueue::new(sbuf_size),
            rq: ByteQueue::new(rbuf_size),
            staged: 0,
            flushed: 0,
            next_async: 0,
            done_async: 0,
            marks: VecDeque::new(),
        }
    }

    pub(crate) fn stream(&self) -> &BoxedByteStream {
        &self.stream
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Bytes staged but not yet handed to the kernel.
    pub(crate) fn tosend(&self) -> usize {
        self.sq.len()
    }

    /// Prefetched bytes are waiting to be consumed.
    pub(crate) fn readable(&self) -> bool {
        !self.rq.is_empty()
    }

    /// Write out staged bytes. `Err(WouldBlock)` means some remain.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while !self.sq.is_empty() {
            match self.stream.write(self.sq.readable()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.sq.consume(n);
                    self.flushed += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush_nonblocking(&mut self) -> io::Result<()> {
        match self.flush() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other,
        }
    }

    /// Vectored send. Returns how many bytes were accepted; accepted bytes
    /// are either in the kernel or staged behind earlier staged bytes.
    /// `Err(WouldBlock)` means nothing was accepted.
    pub(crate) fn sendv(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }

        if !self.sq.is_empty() {
            self.flush_nonblocking()?;
            if !self.sq.is_empty() {
                if total <= self.sq.available() {
                    self.stage(bufs, total);
                    return Ok(total);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }

        if total < self.sq.capacity() {
            self.stage(bufs, total);
            self.flush_nonblocking()?;
            return Ok(total);
        }

        loop {
            match self.stream.write_vectored(bufs) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sendv(&[IoSlice::new(buf)])
    }

    fn stage(&mut self, bufs: &[IoSlice<'_>], total: usize) {
        self.sq.write_iov(bufs);
        self.staged += total as u64;
    }

    /// Receive into `buf`, serving prefetched bytes first. A zero-length
    /// read from the kernel is reported as `UnexpectedEof`.
    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.rq.is_empty() {
            return Ok(self.rq.read(buf));
        }

        if buf.len() >= self.rq.capacity() {
            return self.read_stream(buf);
        }

        let n = loop {
            match self.stream.read(self.rq.writable()) {
                Ok(0) => return Err(closed_by_peer()),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.rq.commit(n);
        Ok(self.rq.read(buf))
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(closed_by_peer()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reserve an async index covering every byte staged so far.
    pub(crate) fn mark_async(&mut self) -> u32 {
        self.next_async = self.next_async.wrapping_add(1);
        self.marks.push_back((self.staged, self.next_async));
        self.next_async
    }

    /// Highest async index whose bytes have left the staging queue.
    pub(crate) fn async_done(&mut self) -> u32 {
        while let Some(&(end, index)) = self.marks.front() {
            if end > self.flushed {
                break;
            }
            self.done_async = index;
            self.marks.pop_front();
        }
        self.done_async
    }

    pub(crate) fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("[bsock] shutdown: {}", e);
        }
    }
}
