// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request-wire framing over a real shared-memory segment: wraparound,
// capacity-exact records, oversize multi-hop delivery, and straddled
// headers, driven through the server harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shmwire::{Session, ServerWire, WireConfig, WireError};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_wire_{}_{n}", std::process::id())
}

fn harness(request_capacity: usize) -> (ServerWire, Session, shmwire::StatusLock) {
    let name = unique_name("seg");
    let status_path = std::env::temp_dir().join(format!("{name}.lock"));
    let config = WireConfig {
        request_wire_capacity: request_capacity,
        status_mutex_file: status_path.to_string_lossy().into_owned(),
        ..WireConfig::default()
    };
    let server = ServerWire::create(&name, &config).expect("server");
    let lock = shmwire::StatusLock::hold(&config.status_mutex_file).expect("status lock");
    let session = Session::open(&name).expect("session");
    (server, session, lock)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

// Scenario: capacity 1024, 200-byte records, write 5 / read 3 / write 2;
// every payload read must be byte-exact even across the wrap.
#[test]
fn wraparound_interleaved_records() {
    let (server, session, _lock) = harness(1024);
    let slot = session.get_response_box().expect("slot");

    let writer = thread::spawn(move || {
        for round in 0..7u8 {
            session
                .send(&slot, &pattern(200, round))
                .expect("send");
        }
        session
    });

    for round in 0..3u8 {
        let (header, payload) = server.read_request().expect("read");
        assert_eq!(header.length, 200);
        assert_eq!(payload, pattern(200, round));
    }
    for round in 3..7u8 {
        let (_, payload) = server.read_request().expect("read");
        assert_eq!(payload, pattern(200, round));
    }

    let session = writer.join().unwrap();
    drop(session);
}

// A record whose total size equals the capacity exactly fits; the next
// write blocks until the reader frees room.
#[test]
fn capacity_exact_record_then_backpressure() {
    let capacity = 1024usize;
    let (server, session, _lock) = harness(capacity);
    let slot = session.get_response_box().expect("slot");

    let exact = pattern(capacity - 6, 0xE0);
    session.send(&slot, &exact).expect("exact-fit send");

    let follow_up = pattern(32, 0xF0);
    let expected = follow_up.clone();
    let writer = thread::spawn(move || {
        // Blocks on not-full until the reader consumes the first record.
        session.send(&slot, &follow_up).expect("blocked send");
        session
    });

    thread::sleep(Duration::from_millis(50));
    let (_, payload) = server.read_request().expect("read exact");
    assert_eq!(payload, exact);

    let (_, payload) = server.read_request().expect("read follow-up");
    assert_eq!(payload, expected);
    drop(writer.join().unwrap());
}

// A frame larger than the wire is delivered in capacity-sized hops and
// reassembled byte-exactly.
#[test]
fn oversize_frame_multi_hop() {
    let (server, session, _lock) = harness(256);
    let slot = session.get_response_box().expect("slot");

    let big = pattern(10_000, 0x11);
    let expected = big.clone();
    let writer = thread::spawn(move || {
        session.send(&slot, &big).expect("oversize send");
        session
    });

    let (header, payload) = server.read_request().expect("read oversize");
    assert_eq!(header.length as usize, expected.len());
    assert_eq!(payload, expected);
    drop(writer.join().unwrap());
}

// Position the second frame so its header straddles the wrap boundary.
#[test]
fn header_straddles_wrap_boundary() {
    let capacity = 1024usize;
    let (server, session, _lock) = harness(capacity);
    let slot = session.get_response_box().expect("slot");

    // First frame: 6 + 1013 = 1019 bytes, leaving the cursor 5 bytes short
    // of the boundary so the next 6-byte header wraps.
    let first = pattern(1013, 0x21);
    session.send(&slot, &first).expect("first send");
    let (_, payload) = server.read_request().expect("read first");
    assert_eq!(payload, first);

    let second = pattern(50, 0x42);
    session.send(&slot, &second).expect("second send");
    let (header, payload) = server.read_request().expect("read straddled");
    assert_eq!(header.idx, slot.index());
    assert_eq!(header.length, 50);
    assert_eq!(payload, second);
}

// The disconnect sentinel is readable by the server as ClientDisconnected.
#[test]
fn disconnect_sentinel_reaches_the_server() {
    let (server, session, _lock) = harness(1024);
    session.disconnect().expect("disconnect");
    assert!(session.is_deletable());
    match server.read_request() {
        Err(WireError::ClientDisconnected) => {}
        other => panic!("expected ClientDisconnected, got {other:?}"),
    }
}
