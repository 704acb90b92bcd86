// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server-side bootstrap of the shared segment: constructs the wires, the
// response box, the status provider, and result-set pools that clients
// locate by name. The client core never creates segments; this exists for
// the test harness and for embedding a mock server in-process.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::connection::{construct_connection_queue, ConnectionQueue, DEFAULT_QUEUE_CAPACITY};
use crate::error::{Result, WireError};
use crate::header::{RequestHeader, ResponseHeader};
use crate::response_box::{construct_response_box, ResponseBox, DEFAULT_BOX_SLOTS};
use crate::resultset::{construct_resultset_pool, ResultSetPool};
use crate::ring::construct_ring;
use crate::segment::Segment;
use crate::status::construct_status_provider;
use crate::wire::{RequestWire, ResponseWire, REQUEST_WIRE_NAME, RESPONSE_WIRE_NAME};

/// Capacities used when bootstrapping a session segment.
#[derive(Debug, Clone)]
pub struct WireConfig {
    pub segment_size: usize,
    pub request_wire_capacity: usize,
    pub response_wire_capacity: usize,
    pub response_box_slots: usize,
    /// Path of the mutex file the server flocks while alive.
    pub status_mutex_file: String,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            segment_size: 1 << 20,
            request_wire_capacity: 1 << 12,
            response_wire_capacity: 1 << 13,
            response_box_slots: DEFAULT_BOX_SLOTS,
            status_mutex_file: std::env::temp_dir()
                .join("shmwire_status.lock")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Server half of one session segment.
pub struct ServerWire {
    seg: Arc<Segment>,
    request: Mutex<RequestWire>,
    response: ResponseWire,
    boxes: ResponseBox,
}

impl ServerWire {
    /// Create the segment and construct every named session object.
    pub fn create(name: &str, config: &WireConfig) -> Result<ServerWire> {
        let seg = Segment::create(name, config.segment_size)?;
        let request = construct_ring(&seg, REQUEST_WIRE_NAME, config.request_wire_capacity)?;
        let response = construct_ring(&seg, RESPONSE_WIRE_NAME, config.response_wire_capacity)?;
        let boxes = construct_response_box(&seg, config.response_box_slots)?;
        construct_status_provider(&seg, &config.status_mutex_file)?;
        info!(name, "server wire segment created");
        Ok(ServerWire {
            request: Mutex::new(RequestWire::new(Arc::clone(&seg), request)),
            response: ResponseWire::new(Arc::clone(&seg), response),
            boxes: ResponseBox::new(Arc::clone(&seg), boxes),
            seg,
        })
    }

    /// Segment accessor for constructing further named objects.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    /// Header of the front request, blocking when `wait` is set.
    pub fn peek_request(&self, wait: bool) -> Result<RequestHeader> {
        self.request.lock().unwrap().peek(wait)
    }

    /// Read and consume the front request. The disconnect sentinel surfaces
    /// as `ClientDisconnected`.
    pub fn read_request(&self) -> Result<(RequestHeader, Vec<u8>)> {
        let mut request = self.request.lock().unwrap();
        let header = request.peek(true)?;
        let payload = request.payload()?.to_vec();
        request.dispose();
        if header.is_disconnect() {
            debug!("request wire: disconnect sentinel read");
            return Err(WireError::ClientDisconnected);
        }
        Ok((header, payload))
    }

    /// Write a framed response through the response wire.
    pub fn respond(&self, idx: u16, msg_type: u16, payload: &[u8]) -> Result<()> {
        self.response
            .write(ResponseHeader::new(idx, msg_type, payload.len() as u32), payload)
    }

    /// Deliver a short response inline through the response box.
    pub fn respond_box(&self, idx: u16, payload: &[u8]) -> Result<()> {
        self.boxes.post(idx, payload)
    }

    /// Flag slot `idx` for query mode and hand it the result-set wire name.
    pub fn respond_box_query(&self, idx: u16, rs_name: &str) -> Result<()> {
        self.boxes.post_query(idx, rs_name.as_bytes())
    }

    /// Construct and register a result-set pool under `name`.
    pub fn create_result_set_pool(
        &self,
        name: &str,
        count: usize,
        wire_size: usize,
    ) -> Result<ResultSetPool> {
        let state = construct_resultset_pool(&self.seg, name, count, wire_size)?;
        Ok(ResultSetPool::new(Arc::clone(&self.seg), state))
    }
}

/// Server half of the connection-queue segment.
pub struct ConnectionAcceptor {
    queue: ConnectionQueue,
}

impl ConnectionAcceptor {
    /// Create the connection segment with `DEFAULT_QUEUE_CAPACITY` tickets.
    pub fn create(name: &str) -> Result<ConnectionAcceptor> {
        Self::create_with_capacity(name, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn create_with_capacity(name: &str, capacity: usize) -> Result<ConnectionAcceptor> {
        let seg = Segment::create(name, 1 << 16)?;
        let state = construct_connection_queue(&seg, capacity)?;
        info!(name, capacity, "connection queue segment created");
        Ok(ConnectionAcceptor {
            queue: ConnectionQueue::new(seg, state),
        })
    }

    /// The queue accessor (listen / accept / confirm_terminated).
    pub fn queue(&self) -> &ConnectionQueue {
        &self.queue
    }

    /// Serve exactly `n` accepts, blocking. Listen candidates are accepted
    /// verbatim; returns early when terminated.
    pub fn accept_n(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            match self.queue.listen()? {
                Some(candidate) => self.queue.accept(candidate)?,
                None => {
                    self.queue.confirm_terminated()?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
