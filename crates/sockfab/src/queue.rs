// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint work queues.
//!
//! ```text
//! transmit side                  receive side
//! +-----------+                  +-----------+
//! | priority  | acks, read rsps  | rx        | posted receives (FIFO)
//! +-----------+                  +-----------+
//! | tx        | app sends        | tag       | posted tagged receives
//! +-----------+                  +-----------+
//!       |  header+payload written
//!       v
//! +-----------+ +-----------+ +-----------+
//! | need_ack  | | async     | | rma_read  |
//! +-----------+ +-----------+ +-----------+
//!  wait for ack  wait for      wait for the
//!                staged flush  read response
//! ```
//!
//! The priority queue is always drained before the ordinary tx queue.
//! Every queue is FIFO; an entry sits on at most one queue at a time.

use std::collections::VecDeque;

use crate::xfer::{XferId, XferPool};

#[derive(Debug, Default)]
pub(crate) struct EpQueues {
    pub priority: VecDeque<XferId>,
    pub need_ack: VecDeque<XferId>,
    pub tx: VecDeque<XferId>,
    pub async_q: VecDeque<XferId>,
    pub rma_read: VecDeque<XferId>,
    pub rx: VecDeque<XferId>,
    pub tag: VecDeque<XferId>,
}

/// Tag comparison under the posted receive's ignore mask.
pub(crate) fn tag_matches(posted_tag: u64, ignore: u64, tag: u64) -> bool {
    (posted_tag & !ignore) == (tag & !ignore)
}

impl EpQueues {
    /// Next entry to transmit: control traffic first.
    pub(crate) fn next_tx(&mut self) -> Option<XferId> {
        self.priority.pop_front().or_else(|| self.tx.pop_front())
    }

    /// Remove and return the oldest posted tagged receive accepting `tag`.
    pub(crate) fn match_tag(&mut self, pool: &XferPool, tag: u64) -> Option<XferId> {
        let pos = self.tag.iter().position(|&id| {
            let entry = pool.get(id);
            tag_matches(entry.tag, entry.ignore, tag)
        })?;
        self.tag.remove(pos)
    }

    /// Remove a posted receive by application context. `busy` is the
    /// entry currently being filled and is never removed.
    pub(crate) fn cancel_rx(
        &mut self,
        pool: &XferPool,
        context: u64,
        busy: Option<XferId>,
    ) -> Option<XferId> {
        for queue in [&mut self.rx, &mut self.tag] {
            let found = queue
                .iter()
                .position(|&id| Some(id) != busy && pool.get(id).context == context);
            if let Some(pos) = found {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Drain every queue, in teardown order.
    pub(crate) fn drain_all(&mut self) -> Vec<XferId> {
        let mut out = Vec::new();
        for queue in [
            &mut self.tx,
            &mut self.priority,
            &mut self.rma_read,
            &mut self.need_ack,
            &mut self.async_q,
            &mut self.rx,
            &mut self.tag,
        ] {
            out.extend(queue.drain(..));
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.priority.len()
            + self.need_ack.len()
            + self.tx.len()
            + self.async_q.len()
            + self.rma_read.len()
            + self.rx.len()
            + self.tag.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointId;

    fn post_tagged(pool: &mut XferPool, q: &mut EpQueues, tag: u64, ignore: u64) -> XferId {
        let id = pool.alloc_rx(EndpointId::new(0, 0)).unwrap();
        let e = pool.get_mut(id);
        e.tag = tag;
        e.ignore = ignore;
        e.context = tag;
        q.tag.push_back(id);
        id
    }

    #[test]
    fn test_tag_mask_semantics() {
        assert!(tag_matches(5, 0, 5));
        assert!(!tag_matches(5, 0, 4));
        assert!(tag_matches(0x10, 0x0f, 0x1a));
        assert!(!tag_matches(0x10, 0x0f, 0x2a));
    }

    #[test]
    fn test_first_eligible_match_wins() {
        let mut pool = XferPool::new(8);
        let mut q = EpQueues::default();
        let narrow = post_tagged(&mut pool, &mut q, 0x21, 0);
        let wide_a = post_tagged(&mut pool, &mut q, 0x20, 0xff);
        let wide_b = post_tagged(&mut pool, &mut q, 0x20, 0xff);

        // older wide receive wins over the newer one
        assert_eq!(q.match_tag(&pool, 0x33), Some(wide_a));
        // exact receive was posted first, so it wins for its tag
        assert_eq!(q.match_tag(&pool, 0x21), Some(narrow));
        assert_eq!(q.match_tag(&pool, 0x21), Some(wide_b));
        assert_eq!(q.match_tag(&pool, 0x21), None);
    }

    #[test]
    fn test_priority_before_tx() {
        let mut pool = XferPool::new(4);
        let mut q = EpQueues::default();
        let ep = EndpointId::new(0, 0);
        let send = pool.alloc_tx(ep).unwrap();
        let ack = pool.alloc_tx(ep).unwrap();
        q.tx.push_back(send);
        q.priority.push_back(ack);
        assert_eq!(q.next_tx(), Some(ack));
        assert_eq!(q.next_tx(), Some(send));
        assert_eq!(q.next_tx(), None);
    }

    #[test]
    fn test_cancel_and_drain() {
        let mut pool = XferPool::new(8);
        let mut q = EpQueues::default();
        let a = post_tagged(&mut pool, &mut q, 1, 0);
        let b = post_tagged(&mut pool, &mut q, 2, 0);
        assert_eq!(q.cancel_rx(&pool, 1, Some(a)), None);
        assert_eq!(q.cancel_rx(&pool, 2, None), Some(b));
        assert_eq!(q.cancel_rx(&pool, 2, None), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain_all(), vec![a]);
        assert_eq!(q.len(), 0);
    }
}
