// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for loopback integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use sockfab::{
    CmEvent, Completion, CompletionError, CompletionQueue, CqConfig, Domain, DomainConfig,
    Endpoint, EndpointAttr, EventQueue, PassiveEndpoint,
};

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Drive manual progress on every domain until `done` holds.
pub fn progress_until(domains: &[&Domain], mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < DEADLINE, "condition not reached within {DEADLINE:?}");
        for domain in domains {
            domain.progress(Duration::from_millis(1)).unwrap();
        }
    }
}

/// Next event from `eq`, progressing `domains` meanwhile.
pub fn next_event(domains: &[&Domain], eq: &EventQueue) -> CmEvent {
    let mut out = None;
    progress_until(domains, || {
        out = eq.read().unwrap();
        out.is_some()
    });
    out.unwrap()
}

/// Collect `n` completions from `cq`.
pub fn completions(domains: &[&Domain], cq: &CompletionQueue, n: usize) -> Vec<Completion> {
    let mut out = Vec::new();
    progress_until(domains, || {
        out.extend(cq.read(n - out.len()).unwrap());
        out.len() == n
    });
    out
}

/// Next error completion from `cq`.
pub fn error_completion(domains: &[&Domain], cq: &CompletionQueue) -> CompletionError {
    let mut out = None;
    progress_until(domains, || {
        let _ = cq.read(0);
        out = cq.read_error();
        out.is_some()
    });
    out.unwrap()
}

/// One side of a connection with its own queues.
pub struct Side {
    pub cq: Arc<CompletionQueue>,
    pub eq: Arc<EventQueue>,
    pub ep: Endpoint,
}

/// Two connected endpoints, possibly in different domains.
pub struct Pair {
    pub client_domain: Domain,
    pub server_domain: Domain,
    pub client: Side,
    pub server: Side,
    pub pep: PassiveEndpoint,
}

impl Pair {
    pub fn domains(&self) -> [&Domain; 2] {
        [&self.client_domain, &self.server_domain]
    }
}

/// Connect a client to a listener over loopback and finish the handshake.
pub fn connected_pair(client_config: DomainConfig, server_config: DomainConfig) -> Pair {
    connected_pair_with(client_config, server_config, EndpointAttr::new(), EndpointAttr::new())
}

pub fn connected_pair_with(
    client_config: DomainConfig,
    server_config: DomainConfig,
    client_attr: EndpointAttr,
    server_attr: EndpointAttr,
) -> Pair {
    init_logging();
    let client_domain = Domain::open(client_config).unwrap();
    let server_domain = Domain::open(server_config).unwrap();
    connect_domains(client_domain, server_domain, client_attr, server_attr)
}

/// Like [`connected_pair_with`] for domains the caller already opened.
pub fn connect_domains(
    client_domain: Domain,
    server_domain: Domain,
    client_attr: EndpointAttr,
    server_attr: EndpointAttr,
) -> Pair {
    init_logging();
    let domains = [&client_domain, &server_domain];

    let listen_eq = server_domain.event_queue();
    let pep = server_domain
        .passive_endpoint("127.0.0.1:0".parse().unwrap(), &listen_eq)
        .unwrap();

    let client_cq = client_domain.completion_queue(CqConfig::default());
    let client_eq = client_domain.event_queue();
    let client_ep = client_domain
        .endpoint(client_attr.with_cq(&client_cq).with_eq(&client_eq))
        .unwrap();
    client_ep.connect(pep.local_addr(), b"hello server").unwrap();

    let req = match next_event(&domains, &listen_eq) {
        CmEvent::ConnRequest(req) => req,
        other => panic!("expected a connection request, got {other:?}"),
    };
    assert_eq!(req.data, b"hello server");

    let server_cq = server_domain.completion_queue(CqConfig::default());
    let server_ep = server_domain
        .accept(&req, server_attr.with_cq(&server_cq).with_eq(&listen_eq), b"welcome")
        .unwrap();

    match next_event(&domains, &client_eq) {
        CmEvent::Connected { endpoint, data } => {
            assert_eq!(endpoint, client_ep.id());
            assert_eq!(data, b"welcome");
        }
        other => panic!("expected connected, got {other:?}"),
    }
    match next_event(&domains, &listen_eq) {
        CmEvent::Connected { endpoint, .. } => assert_eq!(endpoint, server_ep.id()),
        other => panic!("expected connected, got {other:?}"),
    }

    Pair {
        client_domain,
        server_domain,
        client: Side {
            cq: client_cq,
            eq: client_eq,
            ep: client_ep,
        },
        server: Side {
            cq: server_cq,
            eq: listen_eq,
            ep: server_ep,
        },
        pep,
    }
}

pub fn manual() -> DomainConfig {
    DomainConfig::default()
}
