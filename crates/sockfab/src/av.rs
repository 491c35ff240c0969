// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address vector: maps peer socket addresses to compact fabric addresses.
//!
//! The table is guarded by the group lock, which sits between the list
//! lock and the progress lock. Endpoints resolve their peer's
//! [`FabricAddr`] once, when connecting or accepting, so the progress pass
//! never needs the group lock.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::lock_order::{LockLevel, OrderedMutex};

/// Index of an address in an [`AddressVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FabricAddr(pub u64);

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fi_addr:{}", self.0)
    }
}

#[derive(Debug, Default)]
struct AvTable {
    addrs: Vec<Option<SocketAddr>>,
    reverse: HashMap<SocketAddr, FabricAddr>,
}

#[derive(Debug)]
pub struct AddressVector {
    table: OrderedMutex<AvTable>,
}

impl AddressVector {
    pub(crate) fn new() -> Self {
        Self {
            table: OrderedMutex::new(LockLevel::Group, AvTable::default()),
        }
    }

    /// Insert `addr`; inserting an address twice returns the same index.
    pub fn insert(&self, addr: SocketAddr) -> FabricAddr {
        let mut table = self.table.lock();
        if let Some(&fi_addr) = table.reverse.get(&addr) {
            return fi_addr;
        }
        let fi_addr = FabricAddr(table.addrs.len() as u64);
        table.addrs.push(Some(addr));
        table.reverse.insert(addr, fi_addr);
        fi_addr
    }

    pub fn lookup(&self, fi_addr: FabricAddr) -> Option<SocketAddr> {
        let table = self.table.lock();
        table.addrs.get(fi_addr.0 as usize).copied().flatten()
    }

    /// Reverse lookup used to tag incoming traffic with its source.
    pub fn reverse_lookup(&self, addr: &SocketAddr) -> Option<FabricAddr> {
        self.table.lock().reverse.get(addr).copied()
    }

    /// Remove an entry. Indices are never reused.
    pub fn remove(&self, fi_addr: FabricAddr) -> bool {
        let mut table = self.table.lock();
        let Some(slot) = table.addrs.get_mut(fi_addr.0 as usize) else {
            return false;
        };
        match slot.take() {
            Some(addr) => {
                table.reverse.remove(&addr);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
