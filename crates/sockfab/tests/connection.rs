// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability

//! Connection management: handshake, reject, teardown, byte order and
//! both progress modes.

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use common::{
    completions, connected_pair, error_completion, init_logging, manual, next_event,
    progress_until, DEADLINE,
};
use sockfab::proto::{CM_VERSION, HDR_VERSION};
use sockfab::{
    CmEvent, CompletionFlags, CqConfig, Domain, DomainConfig, EndpointAttr, EpState, EqError,
    Error, ErrorCode, EventQueue, MrAccess, PollMode, ProgressMode, WireOrder,
};

/// Wait for an error event, progressing `domains`.
fn eq_error(domains: &[&Domain], eq: &EventQueue) -> EqError {
    let mut out = None;
    progress_until(domains, || {
        match eq.read() {
            Err(Error::ErrorAvailable) => out = eq.read_error(),
            Ok(Some(event)) => panic!("unexpected event {event:?}"),
            Ok(None) => {}
            Err(e) => panic!("event queue read failed: {e}"),
        }
        out.is_some()
    });
    out.unwrap()
}

fn foreign(order: WireOrder) -> WireOrder {
    match order {
        WireOrder::Little => WireOrder::Big,
        WireOrder::Big => WireOrder::Little,
    }
}

#[test]
fn test_close_cancels_each_entry_once() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();
    let baseline = pair.server_domain.xfer_in_use();

    for i in 0..3 {
        pair.server.ep.recv(vec![0u8; 8], i).unwrap();
    }
    pair.server.ep.trecv(vec![0u8; 8], 1, 0, 3).unwrap();
    assert!(pair.server_domain.xfer_in_use() > baseline);

    pair.server.ep.close().unwrap();
    pair.server.ep.close().unwrap();

    let mut contexts = Vec::new();
    while let Some(err) = pair.server.cq.read_error() {
        assert_eq!(err.code, ErrorCode::Canceled);
        contexts.push(err.context);
    }
    contexts.sort_unstable();
    assert_eq!(contexts, vec![0, 1, 2, 3]);
    assert_eq!(pair.server_domain.xfer_in_use(), baseline);
    assert_eq!(pair.server.ep.state(), EpState::Disconnected);

    // the peer sees the connection go away
    match next_event(&domains, &pair.client.eq) {
        CmEvent::Shutdown { endpoint } => assert_eq!(endpoint, pair.client.ep.id()),
        other => panic!("expected shutdown, got {other:?}"),
    }
    assert_eq!(pair.client.ep.state(), EpState::Disconnected);
}

#[test]
fn test_shutdown_flushes_and_notifies_peer() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    pair.client.ep.recv(vec![0u8; 8], 1).unwrap();
    pair.client.ep.shutdown().unwrap();
    assert!(matches!(pair.client.ep.shutdown(), Err(Error::InvalidState { .. })));

    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!(err.code, ErrorCode::Shutdown);
    assert_eq!(err.context, 1);
    assert!(matches!(
        pair.client.ep.send(b"late".to_vec(), 2),
        Err(Error::NotConnected { state: EpState::Disconnected })
    ));

    match next_event(&domains, &pair.server.eq) {
        CmEvent::Shutdown { endpoint } => assert_eq!(endpoint, pair.server.ep.id()),
        other => panic!("expected shutdown, got {other:?}"),
    }
    assert_eq!(pair.client_domain.metrics().active_connections, 0);
}

#[test]
fn test_reject_carries_data() {
    init_logging();
    let server = Domain::open(manual()).unwrap();
    let client = Domain::open(manual()).unwrap();
    let domains = [&client, &server];

    let listen_eq = server.event_queue();
    let pep = server
        .passive_endpoint("127.0.0.1:0".parse().unwrap(), &listen_eq)
        .unwrap();
    let client_eq = client.event_queue();
    let ep = client.endpoint(EndpointAttr::new().with_eq(&client_eq)).unwrap();
    ep.connect(pep.local_addr(), b"let me in").unwrap();

    let req = match next_event(&domains, &listen_eq) {
        CmEvent::ConnRequest(req) => req,
        other => panic!("expected a connection request, got {other:?}"),
    };
    server.reject(&req, b"go away").unwrap();
    // a request answers once
    assert!(matches!(server.reject(&req, b""), Err(Error::NoSuchEndpoint)));
    assert!(server.accept(&req, EndpointAttr::new(), b"").is_err());

    let err = eq_error(&domains, &client_eq);
    assert_eq!(err.endpoint, Some(ep.id()));
    assert_eq!(err.code, ErrorCode::Rejected);
    assert_eq!(err.data, b"go away");
    assert_eq!(ep.state(), EpState::Disconnected);
}

#[test]
fn test_connection_refused() {
    init_logging();
    let domain = Domain::open(manual()).unwrap();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let eq = domain.event_queue();
    let ep = domain.endpoint(EndpointAttr::new().with_eq(&eq)).unwrap();
    match ep.connect(addr, b"") {
        Ok(()) => {
            let err = eq_error(&[&domain], &eq);
            assert_eq!(err.code, ErrorCode::ConnectionRefused);
            assert_eq!(domain.metrics().connections_failed, 1);
        }
        // loopback may refuse before the connect goes asynchronous
        Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
        Err(e) => panic!("unexpected connect error: {e}"),
    }
}

#[test]
fn test_version_mismatch_is_reported_and_rejected() {
    init_logging();
    let domain = Domain::open(DomainConfig::default().with_progress(ProgressMode::Auto)).unwrap();
    let eq = domain.event_queue();
    let pep = domain
        .passive_endpoint("127.0.0.1:0".parse().unwrap(), &eq)
        .unwrap();

    let mut raw = TcpStream::connect(pep.local_addr()).unwrap();
    raw.set_read_timeout(Some(DEADLINE)).unwrap();
    let mut hello = [0u8; 16];
    hello[0] = CM_VERSION.wrapping_add(1);
    hello[1] = 1; // connection request
    hello[4..8].copy_from_slice(&1u32.to_ne_bytes());
    hello[8] = HDR_VERSION;
    raw.write_all(&hello).unwrap();

    let mut reply = [0u8; 16];
    raw.read_exact(&mut reply).unwrap();
    assert_eq!(reply[1], 3, "expected a reject message");

    let err = match eq.sread(DEADLINE) {
        Err(Error::ErrorAvailable) => eq.read_error().unwrap(),
        other => panic!("expected an error event, got {other:?}"),
    };
    assert_eq!(err.endpoint, None);
    assert_eq!(err.code, ErrorCode::VersionMismatch);
    assert_eq!(domain.metrics().protocol_errors, 1);
}

#[test]
fn test_foreign_byte_order_is_transparent() {
    let client_config = manual().with_wire_order(foreign(WireOrder::native()));
    let pair = connected_pair(client_config, manual());
    let domains = pair.domains();

    pair.server.ep.trecv(vec![0u8; 32], 0x0102_0304_0506_0708, 0, 1).unwrap();
    pair.client
        .ep
        .tsenddata(b"swapped".to_vec(), 0x1122_3344_5566_7788, 0x0102_0304_0506_0708, 2)
        .unwrap();
    let got = completions(&domains, &pair.server.cq, 1);
    assert_eq!(got[0].tag, 0x0102_0304_0506_0708);
    assert_eq!(got[0].data, 0x1122_3344_5566_7788);
    assert_eq!(got[0].payload(), b"swapped");

    // and back, including an RMA descriptor
    let mr = pair
        .client_domain
        .register_memory(b"client side".to_vec(), MrAccess::REMOTE_READ);
    pair.server.ep.read(vec![0u8; 6], mr.rma_iov(5, 6), 3).unwrap();
    let got = completions(&domains, &pair.server.cq, 1);
    assert_eq!(got[0].payload(), b"t side");
    assert_eq!(got[0].len, 6);
}

fn ping_pong_auto(poll_mode: PollMode) {
    let config = DomainConfig::default()
        .with_progress(ProgressMode::Auto)
        .with_poll_mode(poll_mode);
    let pair = connected_pair(config.clone(), config);

    for round in 0..50u64 {
        pair.server.ep.recv(vec![0u8; 64], round).unwrap();
        pair.client.ep.recv(vec![0u8; 64], round).unwrap();
        pair.client.ep.send(format!("ping {round}").into_bytes(), round).unwrap();

        let got = pair.server.cq.sread(1, DEADLINE).unwrap();
        assert_eq!(got[0].payload(), format!("ping {round}").into_bytes());
        pair.server.ep.send(format!("pong {round}").into_bytes(), round).unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let batch = pair.client.cq.sread(2, DEADLINE).unwrap();
            assert!(!batch.is_empty(), "timed out in round {round}");
            seen.extend(batch);
        }
        let pong = seen
            .iter()
            .find(|c| c.flags.contains(CompletionFlags::RECV))
            .unwrap();
        assert_eq!(pong.payload(), format!("pong {round}").into_bytes());
        assert_eq!(pair.server.cq.sread(1, DEADLINE).unwrap().len(), 1);
    }
}

#[test]
fn test_auto_progress_epoll() {
    ping_pong_auto(PollMode::Epoll);
}

#[test]
fn test_auto_progress_poll() {
    ping_pong_auto(PollMode::Poll);
}

#[test]
fn test_connect_by_address_vector_index() {
    init_logging();
    let client = Domain::open(manual()).unwrap();
    let server = Domain::open(manual()).unwrap();
    let domains = [&client, &server];

    let listen_eq = server.event_queue();
    let pep = server
        .passive_endpoint("127.0.0.1:0".parse().unwrap(), &listen_eq)
        .unwrap();

    let av = client.address_vector();
    let fi_addr = av.insert(pep.local_addr());
    let cq = client.completion_queue(CqConfig::default());
    let eq = client.event_queue();
    let ep = client
        .endpoint(EndpointAttr::new().with_cq(&cq).with_eq(&eq).with_av(&av))
        .unwrap();
    let unknown = sockfab::FabricAddr(fi_addr.0 + 1);
    assert!(matches!(ep.connect_addr(unknown, b""), Err(Error::InvalidArgument(_))));
    ep.connect_addr(fi_addr, b"").unwrap();

    let req = match next_event(&domains, &listen_eq) {
        CmEvent::ConnRequest(req) => req,
        other => panic!("expected a connection request, got {other:?}"),
    };
    let server_ep = server.accept(&req, EndpointAttr::new(), b"").unwrap();
    assert!(matches!(next_event(&domains, &eq), CmEvent::Connected { .. }));

    ep.recv(vec![0u8; 8], 1).unwrap();
    progress_until(&domains, || server_ep.state() == EpState::Connected);
    server_ep.send(b"from av".to_vec(), 0).unwrap();
    let got = completions(&domains, &cq, 1);
    assert_eq!(got[0].src_addr, Some(fi_addr));
}

#[test]
fn test_passive_endpoint_uses_port_range() {
    init_logging();
    let low = 41_000 + (std::process::id() % 1000) as u16 * 10;
    let domain = Domain::open(manual().with_port_range(low, low + 9)).unwrap();
    let eq = domain.event_queue();
    let pep = domain
        .passive_endpoint("127.0.0.1:0".parse().unwrap(), &eq)
        .unwrap();
    let port = pep.local_addr().port();
    assert!((low..=low + 9).contains(&port), "port {port} outside range");
    pep.close();
    pep.close();
}

#[test]
fn test_operations_before_connect() {
    init_logging();
    let domain = Domain::open(manual()).unwrap();
    let ep = domain.endpoint(EndpointAttr::new()).unwrap();
    assert!(matches!(
        ep.send(b"x".to_vec(), 0),
        Err(Error::NotConnected { state: EpState::Idle })
    ));
    // receives may be posted early
    ep.recv(vec![0u8; 4], 0).unwrap();
    assert_eq!(domain.xfer_in_use(), 1);
    ep.close().unwrap();
    assert_eq!(domain.xfer_in_use(), 0);
    domain.progress(Duration::ZERO).unwrap();
}

#[test]
fn test_closed_handle_is_isolated_from_reused_slot() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let old_id = pair.server.ep.id();
    pair.server.ep.close().unwrap();

    // a second client lands on the same listener and reuses the freed slot
    let cq = pair.client_domain.completion_queue(CqConfig::default());
    let eq = pair.client_domain.event_queue();
    let client = pair
        .client_domain
        .endpoint(EndpointAttr::new().with_cq(&cq).with_eq(&eq))
        .unwrap();
    client.connect(pair.pep.local_addr(), b"again").unwrap();

    let req = loop {
        match next_event(&domains, &pair.server.eq) {
            CmEvent::ConnRequest(req) => break req,
            CmEvent::Shutdown { .. } => continue,
            other => panic!("expected a connection request, got {other:?}"),
        }
    };
    let server_cq = pair.server_domain.completion_queue(CqConfig::default());
    let server = pair
        .server_domain
        .accept(&req, EndpointAttr::new().with_cq(&server_cq).with_eq(&pair.server.eq), b"")
        .unwrap();
    assert_ne!(server.id(), old_id);
    loop {
        match next_event(&domains, &eq) {
            CmEvent::Connected { .. } => break,
            other => panic!("expected connected, got {other:?}"),
        }
    }

    let baseline = pair.server_domain.xfer_in_use();
    assert!(matches!(pair.server.ep.recv(vec![0u8; 8], 1), Err(Error::NoSuchEndpoint)));
    assert!(matches!(
        pair.server.ep.send(b"stale".to_vec(), 2),
        Err(Error::NoSuchEndpoint)
    ));
    assert!(matches!(pair.server.ep.cancel(1), Err(Error::NoSuchEndpoint)));
    assert_eq!(pair.server.ep.state(), EpState::Disconnected);
    assert_eq!(pair.server_domain.xfer_in_use(), baseline);

    server.recv(vec![0u8; 8], 3).unwrap();
    client.send(b"fresh".to_vec(), 4).unwrap();
    let got = completions(&domains, &server_cq, 1);
    assert_eq!(got[0].context, 3);
    assert_eq!(got[0].payload(), b"fresh");
    assert!(pair.server.cq.read(4).unwrap().is_empty());
}

#[test]
fn test_metrics_follow_connection_and_traffic() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();
    for domain in domains {
        let m = domain.metrics();
        assert_eq!(m.active_connections, 1);
        assert_eq!(m.connections_established, 1);
    }

    pair.server.ep.recv(vec![0u8; 16], 1).unwrap();
    pair.client.ep.send(b"counted".to_vec(), 2).unwrap();
    completions(&domains, &pair.server.cq, 1);
    completions(&domains, &pair.client.cq, 1);

    let sent = pair.client_domain.metrics();
    let received = pair.server_domain.metrics();
    assert_eq!(sent.messages_sent, 1);
    assert!(sent.bytes_sent > 7);
    assert_eq!(received.messages_received, 1);
    assert_eq!(received.bytes_received, sent.bytes_sent);

    pair.client.ep.close().unwrap();
    assert_eq!(pair.client_domain.metrics().active_connections, 0);
    progress_until(&domains, || pair.server.ep.state() == EpState::Disconnected);
    assert_eq!(pair.server_domain.metrics().active_connections, 0);
}
