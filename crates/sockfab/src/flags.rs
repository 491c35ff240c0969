// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operation and completion flags.

use bitflags::bitflags;

bitflags! {
    /// Per-operation flags supplied when posting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u64 {
        /// Generate a completion entry even when the endpoint uses
        /// selective completion.
        const COMPLETION = 1 << 0;
        /// Copy the payload inline; no completion entry is generated.
        const INJECT = 1 << 1;
        /// Posted receive buffer absorbs several messages.
        const MULTI_RECV = 1 << 2;
        /// Carry 64-bit remote completion data.
        const REMOTE_CQ_DATA = 1 << 3;
        const TRANSMIT_COMPLETE = 1 << 4;
        const DELIVERY_COMPLETE = 1 << 5;
        const COMMIT_COMPLETE = 1 << 6;
    }
}

bitflags! {
    /// Flags reported in completion entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompletionFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const MSG = 1 << 2;
        const TAGGED = 1 << 3;
        const RMA = 1 << 4;
        const READ = 1 << 5;
        const WRITE = 1 << 6;
        const REMOTE_READ = 1 << 7;
        const REMOTE_WRITE = 1 << 8;
        const REMOTE_CQ_DATA = 1 << 9;
        /// Last completion for a multi-receive buffer; the buffer is released.
        const MULTI_RECV = 1 << 10;
    }
}

bitflags! {
    /// Access rights granted to remote peers on a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MrAccess: u32 {
        const REMOTE_READ = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
    }
}
