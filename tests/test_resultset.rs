// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Result-set streaming end to end: chunked record delivery with a wrap
// view, the end-of-records protocol, query-mode slot hand-off, and the
// cross-wire record-arrival wait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shmwire::{Session, ServerWire, StatusLock, WireConfig};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_rs_{}_{n}", std::process::id())
}

fn harness() -> (ServerWire, Session, StatusLock) {
    let name = unique_name("seg");
    let status_path = std::env::temp_dir().join(format!("{name}.lock"));
    let config = WireConfig {
        status_mutex_file: status_path.to_string_lossy().into_owned(),
        ..WireConfig::default()
    };
    let server = ServerWire::create(&name, &config).expect("server");
    let lock = StatusLock::hold(&config.status_mutex_file).expect("status lock");
    let session = Session::open(&name).expect("session");
    (server, session, lock)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// Scenario: a short record, a record large enough to straddle the wire's
// wrap boundary (delivered as two views), then the end-of-record marker
// and EOR.
#[test]
fn chunk_stream_with_wrap_view() {
    let (server, session, _lock) = harness();
    let pool = server
        .create_result_set_pool("rs1", 8, 1 << 17)
        .expect("pool");
    let writer = pool.acquire().expect("acquire");

    let small = pattern(10, 1);
    let filler = pattern(65_000, 2);
    let big = pattern(70_000, 3);

    writer.write(&small).expect("write small");
    writer.flush();
    writer.write(&filler).expect("write filler");
    writer.flush();

    let mut rs = session.create_result_set_wire("rs1").expect("connect");

    let chunk = rs
        .get_chunk_with_timeout(Some(Duration::from_secs(2)))
        .expect("chunk")
        .expect("small record")
        .to_vec();
    assert_eq!(chunk, small);
    rs.dispose_used(chunk.len());

    let chunk = rs
        .get_chunk_with_timeout(Some(Duration::from_secs(2)))
        .expect("chunk")
        .expect("filler record")
        .to_vec();
    assert_eq!(chunk, filler);
    rs.dispose_used(chunk.len());

    // Consuming the first two records positioned the cursor so this record
    // straddles the wrap boundary.
    writer.write(&big).expect("write big");
    writer.flush();
    writer.write(&[]).expect("end-of-record marker");
    writer.flush();
    pool.set_eor();

    let first = rs
        .get_chunk_with_timeout(Some(Duration::from_secs(2)))
        .expect("chunk")
        .expect("first part")
        .to_vec();
    assert!(first.len() < big.len(), "record must arrive split");
    rs.dispose_used(first.len());

    let second = rs
        .get_chunk_with_timeout(Some(Duration::from_secs(2)))
        .expect("chunk")
        .expect("wrap view")
        .to_vec();
    assert_eq!(first.len() + second.len(), big.len());
    let mut whole = first;
    whole.extend_from_slice(&second);
    assert_eq!(whole, big);
    rs.dispose_used(second.len());

    // The zero-length marker is skipped; end-of-records surfaces as None.
    assert_eq!(
        rs.get_chunk_with_timeout(Some(Duration::from_millis(100)))
            .expect("chunk"),
        None
    );
    assert!(rs.is_eor());
}

// Query mode: the response box only carries the result-set wire name; the
// payload streams through the pool.
#[test]
fn query_mode_hand_off() {
    let (server, session, _lock) = harness();

    let slot = session.get_response_box().expect("slot");
    slot.set_query_mode();
    session.send(&slot, b"select").expect("send");

    let (header, payload) = server.read_request().expect("read");
    assert_eq!(payload, b"select");

    let pool = server
        .create_result_set_pool("rs_q", 8, shmwire::DEFAULT_WIRE_CAPACITY)
        .expect("pool");
    let writer = pool.acquire().expect("acquire");
    server.respond_box_query(header.idx, "rs_q").expect("post");

    for round in 0..3u8 {
        writer.write(&pattern(100, round)).expect("write");
        writer.flush();
    }
    pool.set_eor();

    let name = slot.recv(Some(Duration::from_secs(2))).expect("recv");
    assert!(slot.is_query_mode());
    assert_eq!(name, b"rs_q");

    let mut rs = session
        .create_result_set_wire(std::str::from_utf8(&name).expect("utf-8"))
        .expect("connect");
    for round in 0..3u8 {
        let chunk = rs
            .get_chunk_with_timeout(Some(Duration::from_secs(2)))
            .expect("chunk")
            .expect("record")
            .to_vec();
        assert_eq!(chunk, pattern(100, round));
        rs.dispose_used(chunk.len());
    }
    assert_eq!(
        rs.get_chunk_with_timeout(Some(Duration::from_millis(100)))
            .expect("chunk"),
        None
    );

    // Teardown gating: the session is deletable only once the result-set
    // handle is closed and the response wire shut down.
    session.disconnect().expect("disconnect");
    assert!(!session.is_deletable());
    rs.close();
    assert!(session.is_deletable());
}

// A reader parked on the pool's record-arrival condition wakes when any
// child receives a record.
#[test]
fn reader_wakes_on_record_arrival() {
    let (server, session, _lock) = harness();
    let pool = server
        .create_result_set_pool("rs_wake", 4, shmwire::DEFAULT_WIRE_CAPACITY)
        .expect("pool");
    let _w0 = pool.acquire().expect("w0");
    let w1 = pool.acquire().expect("w1");

    let mut rs = session.create_result_set_wire("rs_wake").expect("connect");
    let reader = thread::spawn(move || {
        let chunk = rs
            .get_chunk_with_timeout(Some(Duration::from_secs(2)))
            .expect("chunk")
            .expect("record")
            .to_vec();
        rs.dispose_used(chunk.len());
        (rs, chunk)
    });

    thread::sleep(Duration::from_millis(50));
    w1.write(b"late record").expect("write");
    w1.flush();

    let (_rs, chunk) = reader.join().unwrap();
    assert_eq!(chunk, b"late record");
}

// Closing the handle closes every child: a stalled writer wakes and drops
// its write instead of blocking forever.
#[test]
fn close_unblocks_a_stalled_writer() {
    let (server, session, _lock) = harness();
    let pool = server
        .create_result_set_pool("rs_close", 2, 1 << 12)
        .expect("pool");
    let writer = pool.acquire().expect("acquire");

    let mut rs = session.create_result_set_wire("rs_close").expect("connect");

    let filler = pattern((1 << 12) - 8, 9);
    writer.write(&filler).expect("fill the wire");
    writer.flush();

    let stalled = thread::spawn(move || {
        // No room left: this blocks on not-full until the close lands,
        // then the write is dropped silently.
        writer.write(&pattern(64, 10)).expect("dropped write");
    });

    thread::sleep(Duration::from_millis(50));
    rs.close();
    stalled.join().unwrap();
}
