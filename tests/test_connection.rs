// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection handshake against a real queue segment: ticket issue, FIFO
// accepts with monotonic session ids, and the terminate handshake.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shmwire::{ConnectionAcceptor, ConnectionQueue, WireError};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_conn_{}_{n}", std::process::id())
}

// Scenario: two clients, two accepts; session ids are issued in listen
// order and each waiter sees exactly its own.
#[test]
fn handshake_issues_monotonic_session_ids() {
    let name = unique_name("seg");
    let acceptor = ConnectionAcceptor::create(&name).expect("acceptor");

    let client_a = ConnectionQueue::open(&name).expect("client a");
    let client_b = ConnectionQueue::open(&name).expect("client b");

    let ticket_a = client_a.request().expect("request a");
    let ticket_b = client_b.request().expect("request b");
    assert_eq!((ticket_a, ticket_b), (0, 1));

    let queue = acceptor.queue();
    let candidate = queue.listen().expect("listen").expect("candidate");
    assert_eq!(candidate, 1);
    queue.accept(candidate).expect("accept");
    assert_eq!(
        client_a
            .wait(ticket_a, Some(Duration::from_secs(2)))
            .expect("wait a"),
        1
    );

    let candidate = queue.listen().expect("listen").expect("candidate");
    assert_eq!(candidate, 2);
    queue.accept(candidate).expect("accept");
    assert_eq!(
        client_b
            .wait(ticket_b, Some(Duration::from_secs(2)))
            .expect("wait b"),
        2
    );
}

// A client blocked in wait() is woken by the accept from another process'
// worth of distance (separate queue handles over the same segment).
#[test]
fn wait_blocks_until_accept() {
    let name = unique_name("seg");
    let acceptor = ConnectionAcceptor::create(&name).expect("acceptor");
    let client = ConnectionQueue::open(&name).expect("client");

    let ticket = client.request().expect("request");
    let waiter = thread::spawn(move || {
        client
            .wait(ticket, Some(Duration::from_secs(2)))
            .expect("wait")
    });

    thread::sleep(Duration::from_millis(50));
    acceptor.accept_n(1).expect("accept");
    assert_eq!(waiter.join().unwrap(), 1);
}

// Exhausting the free ring fails fast instead of blocking.
#[test]
fn ticket_exhaustion_fails_fast() {
    let name = unique_name("seg");
    let _acceptor = ConnectionAcceptor::create_with_capacity(&name, 2).expect("acceptor");
    let client = ConnectionQueue::open(&name).expect("client");

    client.request().expect("t0");
    client.request().expect("t1");
    match client.request() {
        Err(WireError::CapacityExceeded(_)) => {}
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

// check() is a non-blocking probe of the rendezvous.
#[test]
fn check_probes_without_blocking() {
    let name = unique_name("seg");
    let acceptor = ConnectionAcceptor::create(&name).expect("acceptor");
    let client = ConnectionQueue::open(&name).expect("client");

    let ticket = client.request().expect("request");
    assert!(!client.check(ticket).expect("check"));

    acceptor.accept_n(1).expect("accept");
    assert!(client.check(ticket).expect("check"));
    client
        .wait(ticket, Some(Duration::from_secs(2)))
        .expect("wait");
}

// request_terminate wakes the listener and blocks until the server
// confirms.
#[test]
fn terminate_handshake_completes() {
    let name = unique_name("seg");
    let acceptor = ConnectionAcceptor::create(&name).expect("acceptor");
    let client = ConnectionQueue::open(&name).expect("client");

    let listener = thread::spawn(move || {
        acceptor.accept_n(usize::MAX).expect("listen loop");
        acceptor
    });

    thread::sleep(Duration::from_millis(50));
    client.request_terminate().expect("terminate");
    let acceptor = listener.join().unwrap();
    assert!(acceptor.queue().is_terminated());
}
