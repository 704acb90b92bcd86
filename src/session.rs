// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The session container: one request wire, one response wire, the response
// box, and the result-set pool lookups, all bound to one named segment.
//
// Concurrency contract: slot acquisition is atomic (CAS on the slot's
// in-use flag) and `send` is serialised internally, but a caller must pair
// its own slot with its own send. The response wire is single-consumer;
// `await_header` and `receive` share one internal lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, WireError};
use crate::header::ResponseHeader;
use crate::response_box::{ResponseBox, SlotHandle, RESPONSE_BOX_NAME};
use crate::resultset::ResultSetHandle;
use crate::segment::Segment;
use crate::status::{StatusProvider, STATUS_PROVIDER_NAME};
use crate::wire::{RequestWire, ResponseWire, REQUEST_WIRE_NAME, RESPONSE_WIRE_NAME};

/// A client session over one shared-memory segment.
#[derive(Debug)]
pub struct Session {
    seg: Arc<Segment>,
    name: String,
    request: RequestWire,
    response: Mutex<ResponseWire>,
    boxes: ResponseBox,
    status: StatusProvider,
    send_lock: Mutex<()>,
    /// Latched once `await_header` diagnoses a dead server.
    dead: AtomicBool,
    /// Latched on end-of-response-stream or local disconnect.
    closed: AtomicBool,
    disconnected: AtomicBool,
    /// Outstanding result-set handles; deletability gate.
    rs_handles: Arc<AtomicUsize>,
}

impl Session {
    /// Open the named segment and locate the session objects. Fails with
    /// `NotFound` when the segment or any required object is missing.
    pub fn open(name: &str) -> Result<Session> {
        let not_found =
            || WireError::NotFound(format!("a session with the specified name: {name}"));
        let seg = Segment::open(name).map_err(|_| not_found())?;
        let request = seg.find(REQUEST_WIRE_NAME).map_err(|_| not_found())?;
        let response = seg.find(RESPONSE_WIRE_NAME).map_err(|_| not_found())?;
        let boxes = seg.find(RESPONSE_BOX_NAME).map_err(|_| not_found())?;
        let status = seg.find(STATUS_PROVIDER_NAME).map_err(|_| not_found())?;
        info!(name, "session opened");
        Ok(Session {
            request: RequestWire::new(Arc::clone(&seg), request),
            response: Mutex::new(ResponseWire::new(Arc::clone(&seg), response)),
            boxes: ResponseBox::new(Arc::clone(&seg), boxes),
            status: StatusProvider::new(Arc::clone(&seg), status),
            seg,
            name: name.to_string(),
            send_lock: Mutex::new(()),
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            rs_handles: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Segment name this session is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_usable(&self) -> Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(WireError::ServerDead);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Closed);
        }
        Ok(())
    }

    /// Allocate a response-box slot. Fails with `CapacityExceeded` when all
    /// slots are taken.
    pub fn get_response_box(&self) -> Result<SlotHandle> {
        self.check_usable()?;
        self.boxes.acquire_handle()
    }

    /// Write one framed request routed to `slot`. Thread-safe at the
    /// granularity of one request per call; concurrent senders serialise on
    /// an internal lock.
    pub fn send(&self, slot: &SlotHandle, payload: &[u8]) -> Result<()> {
        self.check_usable()?;
        let _guard = self.send_lock.lock().unwrap();
        self.request.send(slot.index(), payload)
    }

    /// Block on the response wire for the next header.
    ///
    /// An end-of-response-stream header (type zero) latches the session
    /// closed; a timeout with the status provider reporting the server gone
    /// latches `ServerDead`, and every later call fails the same way.
    pub fn await_header(&self, timeout: Option<Duration>) -> Result<ResponseHeader> {
        self.check_usable()?;
        let mut response = self.response.lock().unwrap();
        match response.await_header(timeout) {
            Ok(header) if header.is_end_of_stream() => {
                self.closed.store(true, Ordering::Release);
                debug!("response wire: end of stream");
                Err(WireError::Closed)
            }
            Ok(header) => Ok(header),
            Err(WireError::Timeout(what)) => {
                if !self.status.is_alive() {
                    self.dead.store(true, Ordering::Release);
                    warn!(name = %self.name, "server crashed");
                    Err(WireError::ServerDead)
                } else {
                    Err(WireError::Timeout(what))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Header of the last awaited response.
    pub fn last_header(&self) -> ResponseHeader {
        self.response.lock().unwrap().last_header()
    }

    /// Read the payload of the last awaited header.
    pub fn receive(&self) -> Result<Vec<u8>> {
        self.check_usable()?;
        let mut response = self.response.lock().unwrap();
        let length = response.last_header().length as usize;
        let mut payload = vec![0u8; length];
        response.read(&mut payload)?;
        Ok(payload)
    }

    /// Connect to the result-set pool registered under `name` (the name
    /// arrives in a protocol message, typically via a query-mode slot).
    pub fn create_result_set_wire(&self, name: &str) -> Result<ResultSetHandle> {
        if self.dead.load(Ordering::Acquire) {
            return Err(WireError::ServerDead);
        }
        ResultSetHandle::connect(
            Arc::clone(&self.seg),
            name,
            Some(Arc::clone(&self.rs_handles)),
        )
    }

    /// Whether the server still holds its liveness lock.
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire) && self.status.is_alive()
    }

    /// Commit the disconnect sentinel and close the response wire.
    /// Idempotent; also runs on drop.
    pub fn disconnect(&self) -> Result<()> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let _guard = self.send_lock.lock().unwrap();
            self.request.disconnect()?;
        }
        self.response.lock().unwrap().close();
        self.closed.store(true, Ordering::Release);
        info!(name = %self.name, "session disconnected");
        Ok(())
    }

    /// Whether teardown may proceed: the response wire has been closed and
    /// every result-set handle has been disposed.
    pub fn is_deletable(&self) -> bool {
        self.rs_handles.load(Ordering::Acquire) == 0
            && self.response.lock().unwrap().is_closed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_session_fails_with_not_found() {
        let err = Session::open("no_such_session_segment").unwrap_err();
        match err {
            WireError::NotFound(what) => assert!(what.contains("no_such_session_segment")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
