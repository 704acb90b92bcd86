// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// C ABI for language bindings. Handles are opaque boxed pointers; status
// codes are 0 for success and a negative error kind otherwise, with the
// message of the most recent failure kept per thread.
//
// Timeouts are nanoseconds: negative blocks indefinitely, zero polls.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::time::Duration;

use crate::connection::{ConnectionQueue, SESSION_ID_ERROR};
use crate::error::WireError;
use crate::response_box::SlotHandle;
use crate::resultset::ResultSetHandle;
use crate::session::Session;

/// Error kind codes mirrored to bindings.
pub const SHMWIRE_OK: c_int = 0;
pub const SHMWIRE_ERR_NOT_FOUND: c_int = -1;
pub const SHMWIRE_ERR_CAPACITY: c_int = -2;
pub const SHMWIRE_ERR_TIMEOUT: c_int = -3;
pub const SHMWIRE_ERR_SERVER_DEAD: c_int = -4;
pub const SHMWIRE_ERR_CLIENT_DISCONNECTED: c_int = -5;
pub const SHMWIRE_ERR_PROTOCOL: c_int = -6;
pub const SHMWIRE_ERR_CLOSED: c_int = -7;
pub const SHMWIRE_ERR_FATAL: c_int = -8;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn error_code(e: &WireError) -> c_int {
    match e {
        WireError::NotFound(_) => SHMWIRE_ERR_NOT_FOUND,
        WireError::CapacityExceeded(_) => SHMWIRE_ERR_CAPACITY,
        WireError::Timeout(_) => SHMWIRE_ERR_TIMEOUT,
        WireError::ServerDead => SHMWIRE_ERR_SERVER_DEAD,
        WireError::ClientDisconnected => SHMWIRE_ERR_CLIENT_DISCONNECTED,
        WireError::ProtocolError(_) => SHMWIRE_ERR_PROTOCOL,
        WireError::Closed => SHMWIRE_ERR_CLOSED,
        WireError::Fatal(_) => SHMWIRE_ERR_FATAL,
    }
}

fn set_error(e: &WireError) -> c_int {
    let code = error_code(e);
    let msg = CString::new(e.to_string()).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
    code
}

fn fatal_null() -> c_int {
    set_error(&WireError::Fatal("null handle passed across the C ABI".into()))
}

fn timeout_from_ns(ns: i64) -> Option<Duration> {
    if ns < 0 {
        None
    } else {
        Some(Duration::from_nanos(ns as u64))
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Message of the most recent error on this thread, or null. Valid until
/// the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn shmwire_last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |msg| msg.as_ptr())
    })
}

/// Owned byte buffer crossing the ABI; release with `shmwire_bytes_free`.
#[repr(C)]
pub struct ShmwireBytes {
    pub data: *mut u8,
    pub len: usize,
}

impl ShmwireBytes {
    fn null() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }

    fn from_vec(v: Vec<u8>) -> Self {
        let boxed = v.into_boxed_slice();
        let len = boxed.len();
        Self {
            data: Box::into_raw(boxed) as *mut u8,
            len,
        }
    }
}

#[no_mangle]
pub extern "C" fn shmwire_bytes_free(bytes: ShmwireBytes) {
    if !bytes.data.is_null() {
        unsafe {
            let slice: *mut [u8] = std::slice::from_raw_parts_mut(bytes.data, bytes.len);
            drop(Box::from_raw(slice));
        }
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_open(name: *const c_char) -> *mut Session {
    let Some(name) = str_arg(name) else {
        fatal_null();
        return std::ptr::null_mut();
    };
    match Session::open(name) {
        Ok(session) => Box::into_raw(Box::new(session)),
        Err(e) => {
            set_error(&e);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_close(session: *mut Session) -> c_int {
    let Some(session) = session.as_ref() else {
        return fatal_null();
    };
    match session.disconnect() {
        Ok(()) => SHMWIRE_OK,
        Err(e) => set_error(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_destroy(session: *mut Session) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_is_alive(session: *const Session) -> bool {
    session.as_ref().is_some_and(|s| s.is_alive())
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_get_slot(session: *const Session) -> *mut SlotHandle {
    let Some(session) = session.as_ref() else {
        fatal_null();
        return std::ptr::null_mut();
    };
    match session.get_response_box() {
        Ok(slot) => Box::into_raw(Box::new(slot)),
        Err(e) => {
            set_error(&e);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_send(
    session: *const Session,
    slot: *const SlotHandle,
    data: *const u8,
    len: usize,
) -> c_int {
    let (Some(session), Some(slot)) = (session.as_ref(), slot.as_ref()) else {
        return fatal_null();
    };
    let payload = if data.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    match session.send(slot, payload) {
        Ok(()) => SHMWIRE_OK,
        Err(e) => set_error(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_slot_set_query_mode(slot: *const SlotHandle) -> c_int {
    let Some(slot) = slot.as_ref() else {
        return fatal_null();
    };
    slot.set_query_mode();
    SHMWIRE_OK
}

// ---------------------------------------------------------------------------
// Receiving
// ---------------------------------------------------------------------------

/// Await the next response header; returns its slot index, or -1 with the
/// error kind recorded (`Timeout`, `ServerDead`, `Closed`, ...).
#[no_mangle]
pub unsafe extern "C" fn shmwire_session_await(
    session: *const Session,
    timeout_ns: i64,
) -> c_int {
    let Some(session) = session.as_ref() else {
        fatal_null();
        return -1;
    };
    match session.await_header(timeout_from_ns(timeout_ns)) {
        Ok(header) => header.idx as c_int,
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

/// Message type of the last awaited header.
#[no_mangle]
pub unsafe extern "C" fn shmwire_session_get_info(session: *const Session) -> u16 {
    session.as_ref().map_or(0, |s| s.last_header().msg_type)
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_session_receive(session: *const Session) -> ShmwireBytes {
    let Some(session) = session.as_ref() else {
        fatal_null();
        return ShmwireBytes::null();
    };
    match session.receive() {
        Ok(payload) => ShmwireBytes::from_vec(payload),
        Err(e) => {
            set_error(&e);
            ShmwireBytes::null()
        }
    }
}

// ---------------------------------------------------------------------------
// Response-box slots
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn shmwire_slot_recv(
    slot: *const SlotHandle,
    timeout_ns: i64,
) -> ShmwireBytes {
    let Some(slot) = slot.as_ref() else {
        fatal_null();
        return ShmwireBytes::null();
    };
    match slot.recv(timeout_from_ns(timeout_ns)) {
        Ok(payload) => ShmwireBytes::from_vec(payload),
        Err(e) => {
            set_error(&e);
            ShmwireBytes::null()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_slot_unreceive(slot: *const SlotHandle) -> c_int {
    let Some(slot) = slot.as_ref() else {
        return fatal_null();
    };
    match slot.unreceive() {
        Ok(()) => SHMWIRE_OK,
        Err(e) => set_error(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_slot_dispose(slot: *mut SlotHandle) {
    if !slot.is_null() {
        drop(Box::from_raw(slot)); // Drop runs SlotHandle::dispose
    }
}

// ---------------------------------------------------------------------------
// Result sets
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn shmwire_rs_create(
    session: *const Session,
    name: *const c_char,
) -> *mut ResultSetHandle {
    let (Some(session), Some(name)) = (session.as_ref(), str_arg(name)) else {
        fatal_null();
        return std::ptr::null_mut();
    };
    match session.create_result_set_wire(name) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            set_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Next chunk of record payload. On success writes a view borrowed from the
/// wire (valid until `shmwire_rs_dispose_used` consumes it) and returns 0;
/// end-of-records leaves the view null. Never free the view.
#[no_mangle]
pub unsafe extern "C" fn shmwire_rs_get_chunk(
    rs: *mut ResultSetHandle,
    out_data: *mut *const u8,
    out_len: *mut usize,
) -> c_int {
    let Some(rs) = rs.as_mut() else {
        return fatal_null();
    };
    if out_data.is_null() || out_len.is_null() {
        return fatal_null();
    }
    match rs.get_chunk() {
        Ok(Some(view)) => {
            *out_data = view.as_ptr();
            *out_len = view.len();
            SHMWIRE_OK
        }
        Ok(None) => {
            *out_data = std::ptr::null();
            *out_len = 0;
            SHMWIRE_OK
        }
        Err(e) => set_error(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_rs_dispose_used(rs: *mut ResultSetHandle, n: usize) -> c_int {
    let Some(rs) = rs.as_mut() else {
        return fatal_null();
    };
    rs.dispose_used(n);
    SHMWIRE_OK
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_rs_is_eor(rs: *const ResultSetHandle) -> bool {
    rs.as_ref().is_some_and(|rs| rs.is_eor())
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_rs_close(rs: *mut ResultSetHandle) {
    if !rs.is_null() {
        drop(Box::from_raw(rs)); // Drop runs ResultSetHandle::close
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn shmwire_conn_open(name: *const c_char) -> *mut ConnectionQueue {
    let Some(name) = str_arg(name) else {
        fatal_null();
        return std::ptr::null_mut();
    };
    match ConnectionQueue::open(name) {
        Ok(queue) => Box::into_raw(Box::new(queue)),
        Err(e) => {
            set_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Take a ticket; -1 with `CapacityExceeded` recorded when none is free.
#[no_mangle]
pub unsafe extern "C" fn shmwire_conn_request(conn: *const ConnectionQueue) -> i64 {
    let Some(conn) = conn.as_ref() else {
        fatal_null();
        return -1;
    };
    match conn.request() {
        Ok(ticket) => ticket as i64,
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_conn_check(conn: *const ConnectionQueue, ticket: u64) -> bool {
    conn.as_ref()
        .is_some_and(|c| c.check(ticket).unwrap_or(false))
}

/// Wait for the accept of `ticket`; returns the session id, or
/// `SESSION_ID_ERROR` with the error kind recorded.
#[no_mangle]
pub unsafe extern "C" fn shmwire_conn_wait(
    conn: *const ConnectionQueue,
    ticket: u64,
    timeout_ns: i64,
) -> u64 {
    let Some(conn) = conn.as_ref() else {
        fatal_null();
        return SESSION_ID_ERROR;
    };
    match conn.wait(ticket, timeout_from_ns(timeout_ns)) {
        Ok(session_id) => session_id,
        Err(e) => {
            set_error(&e);
            SESSION_ID_ERROR
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn shmwire_conn_close(conn: *mut ConnectionQueue) {
    if !conn.is_null() {
        drop(Box::from_raw(conn));
    }
}
