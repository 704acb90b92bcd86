// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The two session wires: request (client → server) and response
// (server → client). Both are ring buffers; the request wire adds the
// incremental reserve-then-commit write used to build a frame before its
// header exists, plus the disconnect sentinel.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::header::{RequestHeader, ResponseHeader};
use crate::ring::Ring;
use crate::segment::Segment;

/// Directory name of the request wire within a session segment.
pub const REQUEST_WIRE_NAME: &str = "request_wire";
/// Directory name of the response wire within a session segment.
pub const RESPONSE_WIRE_NAME: &str = "response_wire";

// ---------------------------------------------------------------------------
// Request wire
// ---------------------------------------------------------------------------

/// Client → server wire of request frames.
///
/// Written by one client thread at a time (the session serialises senders);
/// read by the server.
#[derive(Debug)]
pub struct RequestWire {
    ring: Ring<RequestHeader>,
}

impl RequestWire {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self {
            ring: Ring::new(seg, state),
        }
    }

    /// Write one complete framed request.
    pub fn send(&self, idx: u16, payload: &[u8]) -> Result<()> {
        self.ring
            .push(payload, RequestHeader::new(idx, payload.len() as u32))
    }

    /// Reserve the header hole for an incrementally built frame.
    pub fn brand_new(&self) -> Result<bool> {
        self.ring.brand_new()
    }

    /// Append payload bytes to the frame under construction.
    pub fn write(&self, bytes: &[u8]) -> Result<bool> {
        self.ring.append(bytes)
    }

    /// Commit the frame under construction, routing its response to slot
    /// `idx`. The frame becomes visible to the server atomically.
    pub fn flush(&self, idx: u16) {
        self.ring.flush(|len| RequestHeader::new(idx, len));
    }

    /// Commit the zero-payload disconnect sentinel. The server reads it as
    /// "client is gone".
    pub fn disconnect(&self) -> Result<()> {
        if self.ring.brand_new()? {
            self.ring.flush(|_| RequestHeader::new(RequestHeader::NOT_IN_USE, 0));
            debug!("request wire: disconnect sentinel committed");
        }
        Ok(())
    }

    // -- server read side ---------------------------------------------------

    /// Read the front frame's header without consuming it. With
    /// `wait == false` a zero-filled header means "none ready".
    pub fn peek(&mut self, wait: bool) -> Result<RequestHeader> {
        self.ring.peek(wait)
    }

    /// Contiguous view of the front frame's payload.
    pub fn payload(&mut self) -> Result<&[u8]> {
        self.ring.payload()
    }

    /// Copy the front frame's payload into `to` and consume the frame.
    pub fn read(&mut self, to: &mut [u8]) -> Result<()> {
        self.ring.read(to)
    }

    /// Consume the frame exposed by the last `payload()` call.
    pub fn dispose(&mut self) {
        self.ring.dispose()
    }

    /// Header of the last peeked frame.
    pub fn last_header(&self) -> RequestHeader {
        self.ring.last_header()
    }

    /// Bytes consumed so far.
    pub fn read_point(&self) -> u64 {
        self.ring.read_point()
    }
}

// ---------------------------------------------------------------------------
// Response wire
// ---------------------------------------------------------------------------

/// Server → client wire of response frames. Written by the server, read by
/// the client; only the client closes it.
#[derive(Debug)]
pub struct ResponseWire {
    ring: Ring<ResponseHeader>,
}

impl ResponseWire {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self {
            ring: Ring::new(seg, state),
        }
    }

    /// Block until a response header is readable or the deadline elapses.
    ///
    /// A closed wire yields the all-zero header rather than an error; an
    /// elapsed deadline raises `Timeout`. `timeout == None` blocks
    /// indefinitely; `Some(Duration::ZERO)` polls.
    pub fn await_header(&mut self, timeout: Option<Duration>) -> Result<ResponseHeader> {
        self.ring.await_header(timeout)
    }

    /// Copy the payload of the last awaited header into `to`, consuming the
    /// frame (multi-hop for frames longer than the wire).
    pub fn read(&mut self, to: &mut [u8]) -> Result<()> {
        self.ring.read(to)
    }

    /// Header returned by the last `await_header`.
    pub fn last_header(&self) -> ResponseHeader {
        self.ring.last_header()
    }

    /// Close the wire (client teardown); wakes any parked peer.
    pub fn close(&self) {
        debug!("response wire: closed by client");
        self.ring.close()
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    // -- server write side --------------------------------------------------

    /// Write one complete framed response.
    pub fn write(&self, header: ResponseHeader, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(header.length as usize, payload.len());
        self.ring.push(payload, header)
    }
}
