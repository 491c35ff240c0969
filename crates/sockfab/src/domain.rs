// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain: the resource container that owns one progress engine.
//!
//! Every queue, counter, address vector, memory region and endpoint is
//! created from a [`Domain`] and shares its progress engine.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use sockfab::{CqConfig, Domain, DomainConfig, EndpointAttr};
//!
//! # fn main() -> sockfab::Result<()> {
//! let domain = Domain::open(DomainConfig::default())?;
//! let cq = domain.completion_queue(CqConfig::default());
//! let eq = domain.event_queue();
//!
//! let ep = domain.endpoint(EndpointAttr::new().with_cq(&cq).with_eq(&eq))?;
//! ep.connect("127.0.0.1:7500".parse().unwrap(), b"hi")?;
//!
//! if let Some(event) = eq.sread(Duration::from_secs(1))? {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{Endpoint, PassiveEndpoint};
use crate::av::AddressVector;
use crate::config::DomainConfig;
use crate::cq::{CompletionQueue, Counter, Counters, CqConfig, Reporter};
use crate::endpoint::{EndpointId, EpSetup};
use crate::eq::{ConnRequest, EventQueue};
use crate::error::Result;
use crate::flags::MrAccess;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::metrics::MetricsSnapshot;
use crate::mr::MemoryRegion;
use crate::progress::Progress;

/// Completion bindings and defaults for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointAttr {
    pub tx_cq: Option<Arc<CompletionQueue>>,
    pub rx_cq: Option<Arc<CompletionQueue>>,
    pub counters: Counters,
    pub eq: Option<Arc<EventQueue>>,
    pub av: Option<Arc<AddressVector>>,
    /// Only operations posted with `OpFlags::COMPLETION` write CQ entries
    pub selective_tx: bool,
    pub selective_rx: bool,
    /// Overrides `DomainConfig::min_multi_recv`
    pub min_multi_recv: Option<usize>,
}

impl EndpointAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind one queue for both directions.
    pub fn with_cq(mut self, cq: &Arc<CompletionQueue>) -> Self {
        self.tx_cq = Some(Arc::clone(cq));
        self.rx_cq = Some(Arc::clone(cq));
        self
    }

    pub fn with_tx_cq(mut self, cq: &Arc<CompletionQueue>) -> Self {
        self.tx_cq = Some(Arc::clone(cq));
        self
    }

    pub fn with_rx_cq(mut self, cq: &Arc<CompletionQueue>) -> Self {
        self.rx_cq = Some(Arc::clone(cq));
        self
    }

    pub fn with_eq(mut self, eq: &Arc<EventQueue>) -> Self {
        self.eq = Some(Arc::clone(eq));
        self
    }

    pub fn with_av(mut self, av: &Arc<AddressVector>) -> Self {
        self.av = Some(Arc::clone(av));
        self
    }

    pub fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_selective(mut self, tx: bool, rx: bool) -> Self {
        self.selective_tx = tx;
        self.selective_rx = rx;
        self
    }

    pub fn with_min_multi_recv(mut self, size: usize) -> Self {
        self.min_multi_recv = Some(size);
        self
    }

    pub(crate) fn setup(&self, config: &DomainConfig) -> EpSetup {
        EpSetup {
            reporter: Reporter::new(self.tx_cq.clone(), self.rx_cq.clone(), self.counters.clone()),
            eq: self.eq.clone(),
            selective_tx: self.selective_tx,
            selective_rx: self.selective_rx,
            min_multi_recv: self.min_multi_recv.unwrap_or(config.min_multi_recv),
            peer_fi_addr: None,
        }
    }
}

/// State shared by a domain handle and everything opened from it.
#[derive(Debug)]
pub(crate) struct DomainInner {
    pub(crate) progress: Arc<Progress>,
    /// Open endpoint ids; held across teardown
    open: OrderedMutex<BTreeSet<EndpointId>>,
}

impl DomainInner {
    pub(crate) fn track(&self, id: EndpointId) {
        self.open.lock().insert(id);
    }

    /// Close an endpoint once. Later calls find it gone and return.
    pub(crate) fn close_endpoint(&self, id: EndpointId) {
        let mut open = self.open.lock();
        if open.remove(&id) {
            self.progress.close_ep(id);
        }
    }
}

impl Drop for DomainInner {
    fn drop(&mut self) {
        let mut open = self.open.lock();
        for id in std::mem::take(&mut *open) {
            self.progress.close_ep(id);
        }
        drop(open);
        self.progress.stop();
        log::debug!("[progress] domain closed");
    }
}

/// Handle to a domain. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    /// Open a domain. In automatic mode this starts the progress thread.
    pub fn open(config: DomainConfig) -> Result<Self> {
        let progress = Progress::new(config)?;
        progress.start()?;
        log::debug!(
            "[progress] domain open ({:?}, {:?})",
            progress.config().progress,
            progress.config().poll_mode
        );
        Ok(Self {
            inner: Arc::new(DomainInner {
                progress,
                open: OrderedMutex::new(LockLevel::List, BTreeSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &DomainConfig {
        self.inner.progress.config()
    }

    pub fn completion_queue(&self, config: CqConfig) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue::new(Arc::downgrade(&self.inner.progress), config))
    }

    pub fn event_queue(&self) -> Arc<EventQueue> {
        Arc::new(EventQueue::new(Arc::downgrade(&self.inner.progress)))
    }

    pub fn counter(&self) -> Arc<Counter> {
        Arc::new(Counter::new(Arc::downgrade(&self.inner.progress)))
    }

    pub fn address_vector(&self) -> Arc<AddressVector> {
        Arc::new(AddressVector::new())
    }

    /// Register `bytes` as an RMA target with the given remote access.
    pub fn register_memory(&self, bytes: Vec<u8>, access: MrAccess) -> MemoryRegion {
        self.inner.progress.regs().register(bytes, access)
    }

    /// Create an idle endpoint; connect it with [`Endpoint::connect`].
    pub fn endpoint(&self, attr: EndpointAttr) -> Result<Endpoint> {
        let id = self.inner.progress.create_ep(attr.setup(self.config()));
        self.inner.track(id);
        Ok(Endpoint::new(Arc::clone(&self.inner), id, attr.av))
    }

    /// Listen on `addr`. Connection requests arrive on `eq`.
    pub fn passive_endpoint(&self, addr: SocketAddr, eq: &Arc<EventQueue>) -> Result<PassiveEndpoint> {
        let (index, local_addr) = self.inner.progress.create_pep(addr, Arc::clone(eq))?;
        Ok(PassiveEndpoint::new(Arc::clone(&self.inner), index, local_addr))
    }

    /// Accept a connection request, answering with `data`.
    pub fn accept(&self, req: &ConnRequest, attr: EndpointAttr, data: &[u8]) -> Result<Endpoint> {
        let mut setup = attr.setup(self.config());
        setup.peer_fi_addr = attr.av.as_ref().and_then(|av| av.reverse_lookup(&req.peer_addr));
        let id = self.inner.progress.accept(req, setup, data)?;
        self.inner.track(id);
        Ok(Endpoint::new(Arc::clone(&self.inner), id, attr.av))
    }

    /// Refuse a connection request. The initiator sees `Rejected` with `data`.
    pub fn reject(&self, req: &ConnRequest, data: &[u8]) -> Result<()> {
        self.inner.progress.reject(req, data)
    }

    /// Run one progress pass, waiting up to `timeout` for readiness.
    /// Does nothing in automatic mode.
    pub fn progress(&self, timeout: Duration) -> Result<()> {
        if !self.inner.progress.is_auto() {
            self.inner.progress.run_pass(Some(timeout));
        }
        Ok(())
    }

    /// Transfer entries currently allocated from the pool.
    pub fn xfer_in_use(&self) -> usize {
        self.inner.progress.xfer_in_use()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.progress.metrics().snapshot()
    }
}
