// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memory regions for emulated RMA.
//!
//! A region owns a byte buffer published under a key. Remote peers
//! address it as `(key, offset, len)`. Region locks are leaves: no other
//! lock is taken while one is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::ErrorCode;
use crate::flags::MrAccess;
use crate::proto::RmaIov;

#[derive(Debug)]
struct Region {
    access: MrAccess,
    bytes: RwLock<Vec<u8>>,
}

/// Domain-wide key -> region table.
#[derive(Debug, Default)]
pub(crate) struct MrRegistry {
    regions: RwLock<HashMap<u64, Arc<Region>>>,
    next_key: AtomicU64,
}

impl MrRegistry {
    pub(crate) fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, bytes: Vec<u8>, access: MrAccess) -> MemoryRegion {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(Region {
            access,
            bytes: RwLock::new(bytes),
        });
        self.regions.write().insert(key, region.clone());
        MemoryRegion {
            key,
            region,
            registry: Arc::downgrade(self),
        }
    }

    fn resolve(&self, iov: &RmaIov, needed: MrAccess) -> Result<Arc<Region>, ErrorCode> {
        let region = self
            .regions
            .read()
            .get(&iov.key)
            .cloned()
            .ok_or(ErrorCode::AccessDenied)?;
        if !region.access.contains(needed) {
            return Err(ErrorCode::AccessDenied);
        }
        let end = iov.addr.checked_add(iov.len).ok_or(ErrorCode::AccessDenied)?;
        if end > region.bytes.read().len() as u64 {
            return Err(ErrorCode::AccessDenied);
        }
        Ok(region)
    }

    /// Check every descriptor against region bounds and rights.
    pub(crate) fn validate(&self, iovs: &[RmaIov], needed: MrAccess) -> Result<(), ErrorCode> {
        iovs.iter()
            .try_for_each(|iov| self.resolve(iov, needed).map(|_| ()))
    }

    /// Copy the described ranges out, concatenated. Nothing is allocated
    /// until every descriptor has been checked.
    pub(crate) fn gather(&self, iovs: &[RmaIov]) -> Result<Vec<u8>, ErrorCode> {
        let regions = iovs
            .iter()
            .map(|iov| self.resolve(iov, MrAccess::REMOTE_READ))
            .collect::<Result<Vec<_>, _>>()?;
        let total = described_len(iovs).ok_or(ErrorCode::AccessDenied)?;
        let total = usize::try_from(total).map_err(|_| ErrorCode::AccessDenied)?;
        let mut out = Vec::with_capacity(total);
        for (iov, region) in iovs.iter().zip(regions) {
            let bytes = region.bytes.read();
            let range = iov.addr as usize..(iov.addr + iov.len) as usize;
            out.extend_from_slice(bytes.get(range).ok_or(ErrorCode::AccessDenied)?);
        }
        Ok(out)
    }

    /// Copy `data` into the described ranges, in order.
    pub(crate) fn scatter(&self, iovs: &[RmaIov], data: &[u8]) -> Result<(), ErrorCode> {
        let mut pos = 0usize;
        for iov in iovs {
            let region = self.resolve(iov, MrAccess::REMOTE_WRITE)?;
            let len = iov.len as usize;
            let end = pos.checked_add(len).ok_or(ErrorCode::AccessDenied)?;
            let src = data.get(pos..end).ok_or(ErrorCode::AccessDenied)?;
            let mut bytes = region.bytes.write();
            let dst = bytes
                .get_mut(iov.addr as usize..iov.addr as usize + len)
                .ok_or(ErrorCode::AccessDenied)?;
            dst.copy_from_slice(src);
            pos = end;
        }
        Ok(())
    }

    fn deregister(&self, key: u64) {
        self.regions.write().remove(&key);
    }
}

/// Sum of descriptor lengths, `None` on overflow.
pub(crate) fn described_len(iovs: &[RmaIov]) -> Option<u64> {
    iovs.iter().try_fold(0u64, |total, iov| total.checked_add(iov.len))
}

/// Registered memory region. Dropping it revokes remote access.
pub struct MemoryRegion {
    key: u64,
    region: Arc<Region>,
    registry: Weak<MrRegistry>,
}

impl MemoryRegion {
    /// Key remote peers use to address this region.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.region.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor for `len` bytes at `offset`.
    pub fn rma_iov(&self, offset: u64, len: u64) -> RmaIov {
        RmaIov::new(offset, len, self.key)
    }

    /// Copy of the region contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.region.bytes.read().clone()
    }

    /// Overwrite bytes starting at `offset`. Returns false if out of range.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut bytes = self.region.bytes.write();
        match bytes.get_mut(offset..offset + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &self.key)
            .field("access", &self.region.access)
            .finish()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.key);
        }
    }
}
