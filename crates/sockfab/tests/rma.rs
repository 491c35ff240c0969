// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::cast_possible_truncation)] // Test parameters

//! RMA reads and writes against registered memory regions.

mod common;

use std::time::Duration;

use common::{completions, connected_pair, error_completion, manual};
use sockfab::{CompletionFlags, ErrorCode, MrAccess, RmaIov, RmaMsg};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn test_read_completes_once() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    // large enough that the response spans many socket reads
    let len = 1 << 20;
    let mr = pair
        .server_domain
        .register_memory(pattern(len), MrAccess::REMOTE_READ);
    pair.client.ep.read(vec![0u8; len], mr.rma_iov(0, len as u64), 11).unwrap();

    let got = completions(&domains, &pair.client.cq, 1);
    assert_eq!(got[0].context, 11);
    assert_eq!(got[0].len, len);
    assert!(got[0].flags.contains(CompletionFlags::READ | CompletionFlags::RMA));
    assert_eq!(got[0].payload(), pattern(len));

    for _ in 0..20 {
        pair.client_domain.progress(Duration::from_millis(1)).unwrap();
        pair.server_domain.progress(Duration::from_millis(1)).unwrap();
    }
    assert!(pair.client.cq.read(4).unwrap().is_empty());
    assert_eq!(pair.client.cq.error_len(), 0);
    // the target never sees a completion for a remote read
    assert!(pair.server.cq.read(4).unwrap().is_empty());
}

#[test]
fn test_read_gathers_segments() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let a = pair.server_domain.register_memory(b"0123456789".to_vec(), MrAccess::REMOTE_READ);
    let b = pair.server_domain.register_memory(b"abcdefghij".to_vec(), MrAccess::REMOTE_READ);
    pair.client
        .ep
        .readmsg(RmaMsg {
            bufs: vec![vec![0u8; 4], vec![0u8; 4]],
            rma: vec![a.rma_iov(2, 3), b.rma_iov(5, 5)],
            context: 1,
            ..RmaMsg::default()
        })
        .unwrap();

    let got = completions(&domains, &pair.client.cq, 1);
    assert_eq!(got[0].len, 8);
    assert_eq!(got[0].payload(), b"234fghij");
}

#[test]
fn test_write_lands_in_region() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let mr = pair
        .server_domain
        .register_memory(vec![0u8; 64], MrAccess::REMOTE_WRITE);
    pair.client.ep.write(b"remote".to_vec(), mr.rma_iov(8, 6), 3).unwrap();

    let got = completions(&domains, &pair.client.cq, 1);
    assert_eq!(got[0].context, 3);
    assert!(got[0].flags.contains(CompletionFlags::WRITE | CompletionFlags::RMA));
    assert_eq!(&mr.to_vec()[8..14], b"remote");
    // plain writes are silent at the target
    assert!(pair.server.cq.read(4).unwrap().is_empty());
}

#[test]
fn test_writedata_raises_remote_completion() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let mr = pair
        .server_domain
        .register_memory(vec![0u8; 16], MrAccess::REMOTE_WRITE);
    pair.client
        .ep
        .writedata(b"data".to_vec(), 0x1234, mr.rma_iov(0, 4), 5)
        .unwrap();

    let remote = completions(&domains, &pair.server.cq, 1);
    assert!(remote[0].flags.contains(
        CompletionFlags::REMOTE_WRITE | CompletionFlags::RMA | CompletionFlags::REMOTE_CQ_DATA
    ));
    assert_eq!(remote[0].data, 0x1234);
    assert!(remote[0].buffers.is_empty());
    completions(&domains, &pair.client.cq, 1);
    assert_eq!(&mr.to_vec()[..4], b"data");
}

#[test]
fn test_inject_write() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let mr = pair
        .server_domain
        .register_memory(vec![0u8; 8], MrAccess::REMOTE_WRITE);
    pair.client.ep.inject_write(b"inj", mr.rma_iov(1, 3)).unwrap();
    common::progress_until(&domains, || &mr.to_vec()[1..4] == b"inj");
    assert!(pair.client.cq.read(4).unwrap().is_empty());
}

#[test]
fn test_bad_key_and_access_are_denied() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let read_only = pair
        .server_domain
        .register_memory(vec![1u8; 32], MrAccess::REMOTE_READ);

    pair.client
        .ep
        .read(vec![0u8; 8], RmaIov::new(0, 8, read_only.key() + 1000), 1)
        .unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!(err.context, 1);
    assert_eq!(err.code, ErrorCode::AccessDenied);

    pair.client.ep.write(b"nope".to_vec(), read_only.rma_iov(0, 4), 2).unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!(err.context, 2);
    assert_eq!(err.code, ErrorCode::AccessDenied);
    assert_eq!(read_only.to_vec(), vec![1u8; 32]);

    pair.client.ep.read(vec![0u8; 8], read_only.rma_iov(30, 8), 3).unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!(err.code, ErrorCode::AccessDenied);

    // the connection survives access errors
    pair.client.ep.read(vec![0u8; 4], read_only.rma_iov(0, 4), 4).unwrap();
    let got = completions(&domains, &pair.client.cq, 1);
    assert_eq!(got[0].payload(), vec![1u8; 4]);
}

#[test]
fn test_dropped_region_revokes_access() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let mr = pair
        .server_domain
        .register_memory(vec![0u8; 8], MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE);
    let iov = mr.rma_iov(0, 8);
    drop(mr);

    pair.client.ep.read(vec![0u8; 8], iov, 1).unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!(err.code, ErrorCode::AccessDenied);
}

#[test]
fn test_overflowing_lengths_are_denied() {
    let pair = connected_pair(manual(), manual());
    let domains = pair.domains();

    let mr = pair
        .server_domain
        .register_memory(b"abcdefgh".to_vec(), MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE);

    pair.client
        .ep
        .read(vec![0u8; 8], RmaIov::new(0, u64::MAX, mr.key() + 7), 1)
        .unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!((err.context, err.code), (1, ErrorCode::AccessDenied));

    pair.client
        .ep
        .readmsg(RmaMsg {
            bufs: vec![vec![0u8; 8]],
            rma: vec![mr.rma_iov(0, u64::MAX), mr.rma_iov(0, 2)],
            context: 2,
            ..RmaMsg::default()
        })
        .unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!((err.context, err.code), (2, ErrorCode::AccessDenied));

    pair.client
        .ep
        .writemsg(RmaMsg {
            bufs: vec![b"xy".to_vec()],
            rma: vec![mr.rma_iov(0, u64::MAX), mr.rma_iov(0, 3)],
            context: 3,
            ..RmaMsg::default()
        })
        .unwrap();
    let err = error_completion(&domains, &pair.client.cq);
    assert_eq!((err.context, err.code), (3, ErrorCode::AccessDenied));
    assert_eq!(mr.to_vec(), b"abcdefgh");

    pair.client.ep.read(vec![0u8; 3], mr.rma_iov(5, 3), 4).unwrap();
    let got = completions(&domains, &pair.client.cq, 1);
    assert_eq!(got[0].payload(), b"fgh");
}
