// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded byte ring carrying header-framed records through the shared
// segment. One producer process, one consumer process.
//
// In-segment state is `RingState`; all of the read-side scratch (last
// header, dispose debt, wrap-around copy, chunk cursor) lives in the local
// `Ring<H>` accessor so nothing address-dependent ever enters the segment.
//
// Counter protocol: `poped ≤ pushed_valid ≤ pushed` and
// `pushed − poped ≤ capacity` at all times. Readers only observe bytes
// below `pushed_valid`; a writer may run `pushed` ahead of `pushed_valid`
// to reserve a header slot and commit it later (`brand_new` / `flush`).

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, WireError};
use crate::header::HeaderCodec;
use crate::segment::Segment;
use crate::sync::{SharedCondvar, SharedMutex};

/// Largest header size any codec may declare; headers are assembled in a
/// stack buffer of this size when they straddle the wrap boundary.
pub(crate) const MAX_HEADER: usize = 16;

// ---------------------------------------------------------------------------
// RingState — lives inside the shared segment
// ---------------------------------------------------------------------------

/// Shared ring-buffer state. `#[repr(C)]`, offsets only, safe to map at
/// different addresses in each process.
#[repr(C)]
pub struct RingState {
    /// Bytes in the data region; 0 while detached (result-set children).
    pub(crate) capacity: AtomicU64,
    /// Segment offset of the data region; 0 while detached.
    pub(crate) data: AtomicU64,
    /// Monotonic byte count written (may run ahead of `pushed_valid`).
    pub(crate) pushed: AtomicU64,
    /// Monotonic byte count made visible to the reader.
    pub(crate) pushed_valid: AtomicU64,
    /// Monotonic byte count consumed.
    pub(crate) poped: AtomicU64,
    /// Reader is parked on `not_empty` — writers skip futile notifies.
    pub(crate) wait_for_read: AtomicBool,
    /// Writer is parked on `not_full`.
    pub(crate) wait_for_write: AtomicBool,
    /// Set by the consuming side on teardown; blocked writers drop writes.
    pub(crate) closed: AtomicBool,
    /// A record is in progress between `brand_new` and `flush`.
    pub(crate) continued: AtomicBool,
    pub(crate) mutex: SharedMutex,
    pub(crate) not_empty: SharedCondvar,
    pub(crate) not_full: SharedCondvar,
}

impl RingState {
    /// Initialise in place. Creator side only; the memory must be zeroed.
    ///
    /// # Safety
    /// `this` must point into writable segment memory no other process is
    /// using yet.
    pub(crate) unsafe fn init(
        this: *mut RingState,
        data: u64,
        capacity: usize,
    ) -> std::io::Result<()> {
        SharedMutex::init(std::ptr::addr_of_mut!((*this).mutex))?;
        SharedCondvar::init(std::ptr::addr_of_mut!((*this).not_empty))?;
        SharedCondvar::init(std::ptr::addr_of_mut!((*this).not_full))?;
        (*this).data.store(data, Ordering::Relaxed);
        (*this).capacity.store(capacity as u64, Ordering::Release);
        Ok(())
    }

    /// Bind a data region to a detached ring (result-set children).
    pub(crate) fn attach(&self, data: u64, capacity: usize) {
        self.pushed.store(0, Ordering::Relaxed);
        self.pushed_valid.store(0, Ordering::Relaxed);
        self.poped.store(0, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
        self.continued.store(false, Ordering::Relaxed);
        self.data.store(data, Ordering::Relaxed);
        self.capacity.store(capacity as u64, Ordering::Release);
    }

    /// Unbind the data region; the ring reads as detached afterwards.
    pub(crate) fn detach(&self) {
        self.capacity.store(0, Ordering::Release);
        self.data.store(0, Ordering::Relaxed);
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.capacity.load(Ordering::Acquire) != 0
    }

    /// Whether a committed record is waiting to be read.
    pub(crate) fn has_record(&self) -> bool {
        self.is_attached()
            && self.pushed_valid.load(Ordering::Acquire) > self.poped.load(Ordering::Acquire)
    }
}

/// Allocate a data region, then construct and register a named ring.
/// Server side only.
pub(crate) fn construct_ring(seg: &Arc<Segment>, name: &str, capacity: usize) -> Result<u64> {
    let state = seg.construct(name, std::mem::size_of::<RingState>())?;
    let data = seg.alloc(capacity)?;
    unsafe { RingState::init(seg.at::<RingState>(state), data, capacity) }?;
    Ok(state)
}

// ---------------------------------------------------------------------------
// Ring<H> — local accessor
// ---------------------------------------------------------------------------

/// Local handle onto a ring, parameterised by its header codec.
#[derive(Debug)]
pub struct Ring<H: HeaderCodec> {
    seg: Arc<Segment>,
    state: u64,
    header_received: H,
    need_dispose: usize,
    copy_of_payload: Option<Vec<u8>>,
    /// Bytes past `poped` already handed out by `get_chunk`.
    chunk_seen: u64,
}

impl<H: HeaderCodec> Ring<H> {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        debug_assert!(H::SIZE <= MAX_HEADER);
        Self {
            seg,
            state,
            header_received: H::default(),
            need_dispose: 0,
            copy_of_payload: None,
            chunk_seen: 0,
        }
    }

    pub(crate) fn st(&self) -> &RingState {
        unsafe { &*self.seg.at::<RingState>(self.state) }
    }

    fn capacity(&self) -> u64 {
        self.st().capacity.load(Ordering::Acquire)
    }

    fn data_base(&self) -> *mut u8 {
        unsafe { self.seg.at::<u8>(self.st().data.load(Ordering::Acquire)) }
    }

    pub(crate) fn stored(&self) -> usize {
        let st = self.st();
        (st.pushed.load(Ordering::Acquire) - st.poped.load(Ordering::Acquire)) as usize
    }

    pub(crate) fn stored_valid(&self) -> usize {
        let st = self.st();
        let pv = st.pushed_valid.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        (pv - st.poped.load(Ordering::Acquire)) as usize
    }

    pub(crate) fn room(&self) -> usize {
        self.capacity() as usize - self.stored()
    }

    /// Bytes consumed so far (monotonic).
    pub fn read_point(&self) -> u64 {
        self.st().poped.load(Ordering::Acquire)
    }

    /// The most recently peeked/awaited header.
    pub fn last_header(&self) -> H {
        self.header_received
    }

    // -- wrap-aware copies --------------------------------------------------

    /// Copy `src` into the ring at monotonic offset `at`, splitting at the
    /// wrap boundary.
    pub(crate) fn copy_in(&self, at: u64, src: &[u8]) {
        let cap = self.capacity() as usize;
        let base = self.data_base();
        let pos = (at % cap as u64) as usize;
        let first = src.len().min(cap - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(pos), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
            }
        }
    }

    /// Copy out of the ring at monotonic offset `at`, splitting at the wrap
    /// boundary.
    pub(crate) fn copy_out(&self, at: u64, dst: &mut [u8]) {
        let cap = self.capacity() as usize;
        let base = self.data_base();
        let pos = (at % cap as u64) as usize;
        let first = dst.len().min(cap - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(pos), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }

    // -- coordination -------------------------------------------------------

    /// Block until `need` bytes of room are available. Returns `Ok(false)`
    /// when the ring was closed instead — the caller drops its write.
    pub(crate) fn wait_to_write(&self, need: usize) -> Result<bool> {
        let st = self.st();
        let guard = st.mutex.lock()?;
        st.wait_for_write.store(true, Ordering::SeqCst);
        fence(Ordering::AcqRel);
        while self.room() < need && !st.closed.load(Ordering::SeqCst) {
            st.not_full.wait(&guard)?;
        }
        st.wait_for_write.store(false, Ordering::SeqCst);
        drop(guard);
        Ok(!st.closed.load(Ordering::SeqCst))
    }

    /// Wake a parked reader, if any. Returns whether one was woken.
    pub(crate) fn notify_reader(&self) -> bool {
        let st = self.st();
        fence(Ordering::AcqRel);
        if st.wait_for_read.load(Ordering::SeqCst) {
            if let Ok(_guard) = st.mutex.lock() {
                st.not_empty.notify_one();
            }
            true
        } else {
            false
        }
    }

    /// Wake a parked writer, if any.
    pub(crate) fn notify_writer(&self) {
        let st = self.st();
        fence(Ordering::AcqRel);
        if st.wait_for_write.load(Ordering::SeqCst) {
            if let Ok(_guard) = st.mutex.lock() {
                st.not_full.notify_one();
            }
        }
    }

    // -- write side ---------------------------------------------------------

    /// Write `header || payload` as one logical record, blocking on room.
    /// Records larger than the capacity are delivered in capacity-sized
    /// hops, each made visible as it lands. Dropped silently if the ring is
    /// closed while blocked.
    pub fn push(&self, payload: &[u8], header: H) -> Result<()> {
        debug_assert_eq!(header.payload_len(), payload.len());
        let st = self.st();
        let cap = self.capacity() as usize;

        let total = H::SIZE + payload.len();
        let mut msg_len = total.min(cap);
        if msg_len > self.room() && !self.wait_to_write(msg_len)? {
            return Ok(());
        }

        let mut hb = [0u8; MAX_HEADER];
        header.encode(&mut hb[..H::SIZE]);
        let pushed = st.pushed.load(Ordering::Acquire);
        self.copy_in(pushed, &hb[..H::SIZE]);
        if msg_len > H::SIZE {
            self.copy_in(pushed + H::SIZE as u64, &payload[..msg_len - H::SIZE]);
        }
        st.pushed.store(pushed + msg_len as u64, Ordering::Release);
        st.pushed_valid
            .store(pushed + msg_len as u64, Ordering::Release);
        self.notify_reader();

        let mut remaining = total - msg_len;
        let mut offset = msg_len - H::SIZE;
        while remaining > 0 {
            msg_len = remaining.min(cap);
            if msg_len > self.room() && !self.wait_to_write(msg_len)? {
                return Ok(());
            }
            let pushed = st.pushed.load(Ordering::Acquire);
            self.copy_in(pushed, &payload[offset..offset + msg_len]);
            st.pushed.store(pushed + msg_len as u64, Ordering::Release);
            st.pushed_valid
                .store(pushed + msg_len as u64, Ordering::Release);
            self.notify_reader();
            remaining -= msg_len;
            offset += msg_len;
        }
        Ok(())
    }

    /// Reserve a header-sized hole at the current write point without
    /// publishing it. Returns `Ok(false)` when the ring was closed.
    pub fn brand_new(&self) -> Result<bool> {
        let st = self.st();
        if H::SIZE > self.room() && !self.wait_to_write(H::SIZE)? {
            return Ok(false);
        }
        if st.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        st.pushed.fetch_add(H::SIZE as u64, Ordering::AcqRel);
        Ok(true)
    }

    /// Append payload bytes after a `brand_new` reservation. The bytes stay
    /// invisible to the reader until `flush`. `bytes` must not exceed
    /// `capacity − header size`. Returns `Ok(false)` when the write was
    /// dropped because the ring closed.
    pub fn append(&self, bytes: &[u8]) -> Result<bool> {
        let st = self.st();
        if bytes.len() > self.room() && !self.wait_to_write(bytes.len())? {
            return Ok(false);
        }
        if st.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let pushed = st.pushed.load(Ordering::Acquire);
        self.copy_in(pushed, bytes);
        st.pushed.store(pushed + bytes.len() as u64, Ordering::Release);
        self.notify_reader();
        Ok(true)
    }

    /// Commit the record started by `brand_new`: write the header into the
    /// reserved hole and publish everything up to the current write point.
    /// `make` receives the payload length accumulated since the reservation.
    pub fn flush<F>(&self, make: F)
    where
        F: FnOnce(u32) -> H,
    {
        let st = self.st();
        let pushed = st.pushed.load(Ordering::Acquire);
        let pushed_valid = st.pushed_valid.load(Ordering::Acquire);
        let length = pushed - (pushed_valid + H::SIZE as u64);
        let header = make(length as u32);
        let mut hb = [0u8; MAX_HEADER];
        header.encode(&mut hb[..H::SIZE]);
        self.copy_in(pushed_valid, &hb[..H::SIZE]);
        st.pushed_valid.store(pushed, Ordering::Release);
        self.notify_reader();
    }

    // -- read side ----------------------------------------------------------

    fn load_front_header(&mut self) -> H {
        let mut buf = [0u8; MAX_HEADER];
        let poped = self.st().poped.load(Ordering::Acquire);
        self.copy_out(poped, &mut buf[..H::SIZE]);
        let header = H::decode(&buf[..H::SIZE]);
        self.header_received = header;
        header
    }

    /// Read the front record's header without consuming it. With
    /// `wait == false` a zero-filled header means "none ready".
    pub fn peek(&mut self, wait: bool) -> Result<H> {
        loop {
            if self.stored_valid() >= H::SIZE {
                break;
            }
            if !wait {
                return Ok(H::default());
            }
            let st = self.st();
            let guard = st.mutex.lock()?;
            st.wait_for_read.store(true, Ordering::SeqCst);
            fence(Ordering::AcqRel);
            while self.stored_valid() < H::SIZE {
                st.not_empty.wait(&guard)?;
            }
            st.wait_for_read.store(false, Ordering::SeqCst);
        }
        Ok(self.load_front_header())
    }

    /// Block until a header is readable or the deadline elapses. A closed
    /// ring yields a zero-filled header instead of an error; an elapsed
    /// deadline is a `Timeout`.
    pub fn await_header(&mut self, timeout: Option<Duration>) -> Result<H> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.st().closed.load(Ordering::SeqCst) {
                self.header_received = H::default();
                return Ok(H::default());
            }
            if self.stored_valid() >= H::SIZE {
                return Ok(self.load_front_header());
            }
            let st = self.st();
            let guard = st.mutex.lock()?;
            st.wait_for_read.store(true, Ordering::SeqCst);
            fence(Ordering::AcqRel);
            while self.stored_valid() < H::SIZE && !st.closed.load(Ordering::SeqCst) {
                match deadline {
                    None => st.not_empty.wait(&guard)?,
                    Some(dl) => {
                        let remaining = dl.saturating_duration_since(Instant::now());
                        if remaining.is_zero()
                            || !st.not_empty.wait_timeout(&guard, remaining)?
                        {
                            st.wait_for_read.store(false, Ordering::SeqCst);
                            return Err(WireError::Timeout("a response"));
                        }
                    }
                }
            }
            st.wait_for_read.store(false, Ordering::SeqCst);
        }
    }

    /// Contiguous view of the front record's payload. A payload that wraps
    /// is linearised into a local copy owned by the ring until `dispose`.
    pub fn payload(&mut self) -> Result<&[u8]> {
        let length = self.header_received.payload_len();
        let cap = self.capacity();
        let st = self.st();
        let start = st.poped.load(Ordering::Acquire) + H::SIZE as u64;
        let begin = (start % cap) as usize;
        let end = ((start + length as u64) % cap) as usize;
        let fits = ((H::SIZE + length) as u64) <= cap;
        if fits && begin < end {
            self.need_dispose = H::SIZE + length;
            let ptr = unsafe { self.data_base().add(begin) };
            return Ok(unsafe { std::slice::from_raw_parts(ptr, length) });
        }
        // Wrap-around or oversize: fall back to a linear copy, consuming the
        // record (multi-hop for frames longer than the ring).
        let mut copy = vec![0u8; length];
        self.read(&mut copy)?;
        self.copy_of_payload = Some(copy);
        Ok(self.copy_of_payload.as_deref().unwrap_or(&[]))
    }

    /// Copy the front record's payload into `to` and consume it. Records
    /// longer than the capacity arrive in capacity-sized hops.
    pub fn read(&mut self, to: &mut [u8]) -> Result<()> {
        let length = self.header_received.payload_len();
        debug_assert!(to.len() >= length);
        let cap = self.capacity() as usize;
        let max_payload = cap - H::SIZE;

        let st = self.st();
        let mut msg_len = length.min(max_payload);
        let poped = st.poped.load(Ordering::Acquire);
        self.copy_out(poped + H::SIZE as u64, &mut to[..msg_len]);
        st.poped
            .store(poped + (H::SIZE + msg_len) as u64, Ordering::Release);
        self.notify_writer();

        let mut done = msg_len;
        while done < length {
            msg_len = (length - done).min(cap);
            {
                let guard = st.mutex.lock()?;
                st.wait_for_read.store(true, Ordering::SeqCst);
                fence(Ordering::AcqRel);
                while self.stored_valid() < msg_len {
                    st.not_empty.wait(&guard)?;
                }
                st.wait_for_read.store(false, Ordering::SeqCst);
            }
            let poped = st.poped.load(Ordering::Acquire);
            self.copy_out(poped, &mut to[done..done + msg_len]);
            st.poped.store(poped + msg_len as u64, Ordering::Release);
            self.notify_writer();
            done += msg_len;
        }
        Ok(())
    }

    /// Consume the record exposed by the last `payload()` call and release
    /// any wrap-around copy.
    pub fn dispose(&mut self) {
        if self.need_dispose > 0 {
            let st = self.st();
            st.poped
                .fetch_add(self.need_dispose as u64, Ordering::AcqRel);
            self.notify_writer();
            self.need_dispose = 0;
        }
        self.copy_of_payload = None;
    }

    /// The next contiguous unread byte range not yet returned by a previous
    /// `get_chunk`. A readable region that straddles the wrap boundary is
    /// returned as the prefix up to the boundary; the following call yields
    /// the suffix starting at offset 0.
    pub fn get_chunk(&mut self, wait: bool) -> Result<Option<&[u8]>> {
        let cap = self.capacity();
        let (pos, len) = loop {
            let st = self.st();
            let start = st.poped.load(Ordering::Acquire) + self.chunk_seen;
            let pv = st.pushed_valid.load(Ordering::Acquire);
            fence(Ordering::Acquire);
            if pv > start {
                let avail = pv - start;
                let pos = (start % cap) as usize;
                let first = (avail as usize).min(cap as usize - pos);
                self.chunk_seen += first as u64;
                break (pos, first);
            }
            if !wait {
                return Ok(None);
            }
            let guard = st.mutex.lock()?;
            st.wait_for_read.store(true, Ordering::SeqCst);
            fence(Ordering::AcqRel);
            while st.pushed_valid.load(Ordering::Acquire) <= start {
                st.not_empty.wait(&guard)?;
            }
            st.wait_for_read.store(false, Ordering::SeqCst);
        };
        let ptr = unsafe { self.data_base().add(pos) };
        Ok(Some(unsafe { std::slice::from_raw_parts(ptr, len) }))
    }

    /// Consume `n` bytes previously returned by `get_chunk`.
    pub fn dispose_used(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.chunk_seen);
        let st = self.st();
        st.poped.fetch_add(n as u64, Ordering::AcqRel);
        self.chunk_seen = self.chunk_seen.saturating_sub(n as u64);
        self.notify_writer();
    }

    // -- teardown -----------------------------------------------------------

    /// Mark the ring closed and wake everything parked on it.
    pub fn close(&self) {
        let st = self.st();
        st.closed.store(true, Ordering::SeqCst);
        if let Ok(_guard) = st.mutex.lock() {
            st.not_empty.notify_all();
            st.not_full.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.st().closed.load(Ordering::SeqCst)
    }
}
