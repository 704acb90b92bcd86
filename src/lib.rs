// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client-side shared-memory session transport for a co-located database
// server. Two processes on one host share a named segment holding ring
// buffers guarded by process-shared mutexes and condition variables;
// length-framed request/response exchanges and streamed result-set
// delivery run on top.

#[cfg(not(unix))]
compile_error!("shmwire requires file-backed shared memory and file locks (unix only)");

mod error;
pub use error::{Result, WireError};

mod header;
pub use header::{HeaderCodec, LengthHeader, RequestHeader, ResponseHeader};

mod sync;
pub use sync::{SharedCondvar, SharedMutex, SharedMutexGuard, SharedSemaphore, SpinLock};

mod segment;
pub use segment::{Segment, NAME_MAX, SEGMENT_ALIGN};

mod ring;
pub use ring::Ring;

mod wire;
pub use wire::{RequestWire, ResponseWire, REQUEST_WIRE_NAME, RESPONSE_WIRE_NAME};

mod response_box;
pub use response_box::{ResponseBox, SlotHandle, DEFAULT_BOX_SLOTS, RESPONSE_BOX_NAME, SLOT_BUFFER};

mod resultset;
pub use resultset::{
    ResultSetHandle, ResultSetPool, ResultSetWriter, DEFAULT_POOL_WIRES, DEFAULT_WIRE_CAPACITY,
};

mod status;
pub use status::{StatusLock, StatusProvider, STATUS_PROVIDER_NAME};

mod session;
pub use session::Session;

mod connection;
pub use connection::{
    ConnectionQueue, CONNECTION_QUEUE_NAME, DEFAULT_QUEUE_CAPACITY, SESSION_ID_ERROR,
};

mod server;
pub use server::{ConnectionAcceptor, ServerWire, WireConfig};

pub mod ffi;
