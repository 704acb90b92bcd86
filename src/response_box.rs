// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The response box: a fixed array of in-segment slots carrying short
// inline responses. A response frame's `idx` field addresses a slot; the
// slot's counting semaphore makes `recv` block until the server posts.
// Responses too large for the inline buffer arrive in query mode: the slot
// only carries a small handle (a result-set wire name) and the payload is
// streamed through a result-set wire.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Result, WireError};
use crate::segment::Segment;
use crate::sync::SharedSemaphore;

/// Directory name of the response box within a session segment.
pub const RESPONSE_BOX_NAME: &str = "response_box";

/// Default number of slots.
pub const DEFAULT_BOX_SLOTS: usize = 16;

/// Inline payload capacity of one slot.
pub const SLOT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// In-segment layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct SlotState {
    in_use: AtomicBool,
    query_mode: AtomicBool,
    _pad: [u8; 2],
    length: AtomicU32,
    sem: SharedSemaphore,
    buffer: [u8; SLOT_BUFFER],
}

#[repr(C)]
struct BoxState {
    count: u64,
    // [SlotState; count] follows
}

fn slots_offset(state: u64) -> u64 {
    // Slot array starts at the next 64-byte boundary past the header.
    state + ((std::mem::size_of::<BoxState>() as u64 + 63) & !63)
}

/// Construct and register a response box of `count` slots. Server side only.
pub(crate) fn construct_response_box(seg: &Arc<Segment>, count: usize) -> Result<u64> {
    let header = (std::mem::size_of::<BoxState>() + 63) & !63;
    let size = header + count * std::mem::size_of::<SlotState>();
    let state = seg.construct(RESPONSE_BOX_NAME, size)?;
    unsafe {
        (*seg.at::<BoxState>(state)).count = count as u64;
        for idx in 0..count {
            let slot = seg
                .at::<SlotState>(slots_offset(state))
                .add(idx);
            SharedSemaphore::init(std::ptr::addr_of_mut!((*slot).sem))?;
        }
    }
    Ok(state)
}

// ---------------------------------------------------------------------------
// ResponseBox — shared accessor
// ---------------------------------------------------------------------------

/// Accessor for the slot array; used by the client to allocate slots and by
/// the server to post responses.
#[derive(Debug)]
pub struct ResponseBox {
    seg: Arc<Segment>,
    state: u64,
}

impl ResponseBox {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self { seg, state }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        unsafe { (*self.seg.at::<BoxState>(self.state)).count as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, idx: u16) -> Result<&SlotState> {
        if idx as usize >= self.len() {
            return Err(WireError::ProtocolError(format!(
                "slot index {idx} out of range for the response box"
            )));
        }
        Ok(unsafe {
            &*self
                .seg
                .at::<SlotState>(slots_offset(self.state))
                .add(idx as usize)
        })
    }

    /// Claim the first free slot and wrap it in an owning handle.
    pub(crate) fn acquire_handle(&self) -> Result<SlotHandle> {
        let idx = self.acquire()?;
        Ok(SlotHandle::new(Arc::clone(&self.seg), self.state, idx))
    }

    /// Claim the first free slot. Fails with `CapacityExceeded` when every
    /// slot is in use.
    pub fn acquire(&self) -> Result<u16> {
        for idx in 0..self.len() as u16 {
            let slot = self.slot(idx)?;
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                trace!(idx, "response box: slot acquired");
                return Ok(idx);
            }
        }
        Err(WireError::CapacityExceeded("no free response box slot"))
    }

    // -- server side --------------------------------------------------------

    /// Deliver an inline response into slot `idx` and wake its owner.
    pub fn post(&self, idx: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > SLOT_BUFFER {
            return Err(WireError::ProtocolError(format!(
                "inline response of {} bytes exceeds the slot buffer",
                payload.len()
            )));
        }
        let slot = self.slot(idx)?;
        let dst = slot.buffer.as_ptr() as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len()) };
        slot.length.store(payload.len() as u32, Ordering::Release);
        slot.sem.post()
    }

    /// Deliver a query-mode notification: the payload will arrive through a
    /// result-set wire and `handle` (its name) is all the slot carries.
    pub fn post_query(&self, idx: u16, handle: &[u8]) -> Result<()> {
        let slot = self.slot(idx)?;
        slot.query_mode.store(true, Ordering::Release);
        self.post(idx, handle)
    }
}

// ---------------------------------------------------------------------------
// SlotHandle — singleton owner of one in-use slot
// ---------------------------------------------------------------------------

/// Owned handle to an acquired response-box slot. Exactly one thread owns a
/// given slot from `acquire` until `dispose` (or drop).
pub struct SlotHandle {
    seg: Arc<Segment>,
    state: u64,
    idx: u16,
}

impl SlotHandle {
    pub(crate) fn new(seg: Arc<Segment>, state: u64, idx: u16) -> Self {
        Self { seg, state, idx }
    }

    /// Slot index, used as the `idx` field of request frames.
    pub fn index(&self) -> u16 {
        self.idx
    }

    fn slot(&self) -> &SlotState {
        unsafe {
            &*self
                .seg
                .at::<SlotState>(slots_offset(self.state))
                .add(self.idx as usize)
        }
    }

    /// Flag the slot for query-mode delivery before sending the request.
    pub fn set_query_mode(&self) {
        self.slot().query_mode.store(true, Ordering::Release);
    }

    /// Whether the response arrived (or will arrive) via a result-set wire.
    pub fn is_query_mode(&self) -> bool {
        self.slot().query_mode.load(Ordering::Acquire)
    }

    /// Block until the server posts into this slot, then return the inline
    /// payload (in query mode, the result-set wire name).
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let slot = self.slot();
        if !slot.sem.wait(timeout)? {
            return Err(WireError::Timeout("a response"));
        }
        let len = slot.length.load(Ordering::Acquire) as usize;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(slot.buffer.as_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Undo the last `recv`: the payload stays in the slot and the next
    /// `recv` returns it again.
    pub fn unreceive(&self) -> Result<()> {
        self.slot().sem.post()
    }

    /// Release the slot: clears length and query mode, drains stray posts,
    /// and marks the slot free.
    pub fn dispose(&self) {
        let slot = self.slot();
        while let Ok(true) = slot.sem.try_wait() {}
        slot.length.store(0, Ordering::Relaxed);
        slot.query_mode.store(false, Ordering::Relaxed);
        slot.in_use.store(false, Ordering::Release);
        debug!(idx = self.idx, "response box: slot disposed");
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_box(count: usize) -> (Arc<Segment>, u64) {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("box_unit_{}_{n}", std::process::id());
        let seg = Segment::create(&name, 1 << 18).expect("segment");
        let state = construct_response_box(&seg, count).expect("construct");
        (seg, state)
    }

    #[test]
    fn acquire_scans_in_order_and_exhausts() {
        let (seg, state) = test_box(3);
        let rbox = ResponseBox::new(Arc::clone(&seg), state);
        assert_eq!(rbox.acquire().expect("slot 0"), 0);
        assert_eq!(rbox.acquire().expect("slot 1"), 1);
        assert_eq!(rbox.acquire().expect("slot 2"), 2);
        assert!(matches!(
            rbox.acquire(),
            Err(WireError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn dispose_frees_the_slot_for_reuse() {
        let (seg, state) = test_box(2);
        let rbox = ResponseBox::new(Arc::clone(&seg), state);
        let idx = rbox.acquire().expect("acquire");
        let handle = SlotHandle::new(Arc::clone(&seg), state, idx);
        handle.dispose();
        assert_eq!(rbox.acquire().expect("reacquire"), idx);
    }

    #[test]
    fn post_then_recv_round_trip() {
        let (seg, state) = test_box(4);
        let rbox = ResponseBox::new(Arc::clone(&seg), state);
        let idx = rbox.acquire().expect("acquire");
        let handle = SlotHandle::new(Arc::clone(&seg), state, idx);

        rbox.post(idx, b"short response").expect("post");
        let got = handle.recv(Some(Duration::from_millis(200))).expect("recv");
        assert_eq!(got, b"short response");

        handle.unreceive().expect("unreceive");
        let again = handle.recv(Some(Duration::from_millis(200))).expect("recv");
        assert_eq!(again, b"short response");
    }

    #[test]
    fn recv_times_out_without_a_post() {
        let (seg, state) = test_box(1);
        let rbox = ResponseBox::new(Arc::clone(&seg), state);
        let idx = rbox.acquire().expect("acquire");
        let handle = SlotHandle::new(seg, state, idx);
        let err = handle.recv(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn query_mode_flag_travels_with_the_slot() {
        let (seg, state) = test_box(1);
        let rbox = ResponseBox::new(Arc::clone(&seg), state);
        let idx = rbox.acquire().expect("acquire");
        let handle = SlotHandle::new(seg, state, idx);
        assert!(!handle.is_query_mode());
        rbox.post_query(idx, b"rs_stream_1").expect("post_query");
        assert!(handle.is_query_mode());
        let name = handle.recv(Some(Duration::from_millis(200))).expect("recv");
        assert_eq!(name, b"rs_stream_1");
    }

    #[test]
    fn oversize_inline_post_is_rejected() {
        let (seg, state) = test_box(1);
        let rbox = ResponseBox::new(seg, state);
        let big = vec![0u8; SLOT_BUFFER + 1];
        assert!(matches!(
            rbox.post(0, &big),
            Err(WireError::ProtocolError(_))
        ));
    }
}
