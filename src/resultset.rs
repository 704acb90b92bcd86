// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The result-set wire pool: a named collection of secondary ring buffers
// streaming length-framed records from the server to the client.
//
// Children are detached ring states whose 64 KiB data regions attach on
// `acquire` and detach on `release`; one spare region is kept pre-allocated
// so the steady state never touches the segment allocator. A reader waiting
// for *any* record parks on the pool's record-arrival condition, not on a
// specific child.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Result, WireError};
use crate::header::{HeaderCodec, LengthHeader};
use crate::ring::{Ring, RingState};
use crate::segment::Segment;
use crate::sync::{SharedCondvar, SharedMutex};

/// Default number of child wires per pool.
pub const DEFAULT_POOL_WIRES: usize = 8;

/// Default data capacity of one child wire (64 KiB).
pub const DEFAULT_WIRE_CAPACITY: usize = 1 << 16;

// ---------------------------------------------------------------------------
// In-segment layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct PoolState {
    count: u64,
    wire_size: u64,
    /// Pre-allocated spare data region (0 = none).
    reserved: AtomicU64,
    /// Bookkeeping below is guarded by `record_mutex`.
    count_using: AtomicU32,
    next_index: AtomicU32,
    only_one_buffer: AtomicBool,
    eor: AtomicBool,
    closed: AtomicBool,
    wait_for_record: AtomicBool,
    record_mutex: SharedMutex,
    record_cond: SharedCondvar,
    // [RingState; count] follows, 64-byte strided
}

const fn child_stride() -> usize {
    (std::mem::size_of::<RingState>() + 63) & !63
}

const fn children_offset() -> usize {
    (std::mem::size_of::<PoolState>() + 63) & !63
}

fn pool_size(count: usize) -> usize {
    children_offset() + count * child_stride()
}

/// Construct and register a result-set pool. Server side only.
pub(crate) fn construct_resultset_pool(
    seg: &Arc<Segment>,
    name: &str,
    count: usize,
    wire_size: usize,
) -> Result<u64> {
    let state = seg.construct(name, pool_size(count))?;
    unsafe {
        let pool = seg.at::<PoolState>(state);
        (*pool).count = count as u64;
        (*pool).wire_size = wire_size as u64;
        SharedMutex::init(std::ptr::addr_of_mut!((*pool).record_mutex))?;
        SharedCondvar::init(std::ptr::addr_of_mut!((*pool).record_cond))?;
        for i in 0..count {
            let child = seg.at::<RingState>(state + (children_offset() + i * child_stride()) as u64);
            RingState::init(child, 0, 0)?;
        }
    }
    let spare = seg.alloc(wire_size)?;
    unsafe { (*seg.at::<PoolState>(state)).reserved.store(spare, Ordering::Release) };
    debug!(name, count, wire_size, "result-set pool constructed");
    Ok(state)
}

// ---------------------------------------------------------------------------
// ResultSetPool — shared accessor
// ---------------------------------------------------------------------------

/// Accessor over a pool in the segment. The server acquires/releases child
/// writers and marks end-of-records; the client scans for active wires and
/// closes the pool.
pub struct ResultSetPool {
    seg: Arc<Segment>,
    state: u64,
}

impl ResultSetPool {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self { seg, state }
    }

    fn st(&self) -> &PoolState {
        unsafe { &*self.seg.at::<PoolState>(self.state) }
    }

    fn child_offset(&self, index: usize) -> u64 {
        self.state + (children_offset() + index * child_stride()) as u64
    }

    fn child(&self, index: usize) -> &RingState {
        unsafe { &*self.seg.at::<RingState>(self.child_offset(index)) }
    }

    fn child_ring(&self, index: usize) -> Ring<LengthHeader> {
        Ring::new(Arc::clone(&self.seg), self.child_offset(index))
    }

    /// Number of child slots.
    pub fn len(&self) -> usize {
        self.st().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data capacity of each child wire.
    pub fn wire_size(&self) -> usize {
        self.st().wire_size as usize
    }

    // -- server side --------------------------------------------------------

    /// Attach a data region to a free child and return its writer.
    ///
    /// The first claim on an idle pool uses the pre-reserved spare; later
    /// claims reuse the spare when present or allocate a fresh region.
    pub fn acquire(&self) -> Result<ResultSetWriter> {
        let st = self.st();
        let wire_size = st.wire_size as usize;
        let _guard = st.record_mutex.lock()?;

        if st.count_using.load(Ordering::Relaxed) == 0 {
            st.count_using.store(1, Ordering::Relaxed);
            st.next_index.store(1, Ordering::Relaxed);
            let buffer = match st.reserved.swap(0, Ordering::AcqRel) {
                0 => self.seg.alloc(wire_size)?,
                b => b,
            };
            self.child(0).attach(buffer, wire_size);
            st.only_one_buffer.store(true, Ordering::Relaxed);
            trace!(index = 0, "result-set pool: first wire acquired");
            return Ok(self.writer(0));
        }

        let buffer = match st.reserved.swap(0, Ordering::AcqRel) {
            0 => self.seg.alloc(wire_size)?,
            b => b,
        };
        let index = match self.search_free_wire(st) {
            Ok(i) => i,
            Err(e) => {
                // Hand the region back before surfacing the error.
                if st.reserved.load(Ordering::Acquire) == 0 {
                    st.reserved.store(buffer, Ordering::Release);
                } else {
                    self.seg.dealloc(buffer, wire_size);
                }
                return Err(e);
            }
        };
        self.child(index).attach(buffer, wire_size);
        st.only_one_buffer.store(false, Ordering::Relaxed);
        trace!(index, "result-set pool: wire acquired");
        Ok(self.writer(index))
    }

    /// Caller holds `record_mutex`.
    fn search_free_wire(&self, st: &PoolState) -> Result<usize> {
        let next = st.next_index.load(Ordering::Relaxed);
        if st.count_using.load(Ordering::Relaxed) == next {
            if next as usize >= st.count as usize {
                return Err(WireError::CapacityExceeded("no free result-set wire"));
            }
            st.count_using.store(st.count_using.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
            st.next_index.store(next + 1, Ordering::Relaxed);
            return Ok(next as usize);
        }
        for index in 0..next as usize {
            if !self.child(index).is_attached() {
                st.count_using
                    .store(st.count_using.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
                return Ok(index);
            }
        }
        Err(WireError::Fatal("result-set pool bookkeeping corrupt".into()))
    }

    /// Detach a writer's data region: promoted to the spare when none is
    /// held, deallocated otherwise.
    pub fn release(&self, writer: ResultSetWriter) -> Result<()> {
        let st = self.st();
        let _guard = st.record_mutex.lock()?;
        let child = self.child(writer.index);
        let buffer = child.data.load(Ordering::Acquire);
        child.detach();
        if st.reserved.load(Ordering::Acquire) == 0 {
            st.reserved.store(buffer, Ordering::Release);
        } else {
            self.seg.dealloc(buffer, st.wire_size as usize);
        }
        st.count_using
            .store(st.count_using.load(Ordering::Relaxed) - 1, Ordering::Relaxed);
        trace!(index = writer.index, "result-set pool: wire released");
        Ok(())
    }

    fn writer(&self, index: usize) -> ResultSetWriter {
        ResultSetWriter {
            ring: self.child_ring(index),
            pool: ResultSetPool::new(Arc::clone(&self.seg), self.state),
            index,
        }
    }

    /// Mark end-of-records and wake a reader parked on the pool.
    pub fn set_eor(&self) {
        let st = self.st();
        st.eor.store(true, Ordering::SeqCst);
        self.notify_record_arrival();
        debug!("result-set pool: end of records");
    }

    pub fn is_eor(&self) -> bool {
        self.st().eor.load(Ordering::SeqCst)
    }

    // -- client side --------------------------------------------------------

    /// Mark the pool closed and wake every stalled child writer so it can
    /// drop its write.
    pub fn set_closed(&self) {
        let st = self.st();
        st.closed.store(true, Ordering::SeqCst);
        for index in 0..self.len() {
            self.child_ring(index).close();
        }
        debug!("result-set pool: closed by client");
    }

    pub fn is_closed(&self) -> bool {
        self.st().closed.load(Ordering::SeqCst)
    }

    pub(crate) fn notify_record_arrival(&self) {
        let st = self.st();
        fence(Ordering::AcqRel);
        if st.wait_for_record.load(Ordering::SeqCst) {
            if let Ok(_guard) = st.record_mutex.lock() {
                st.record_cond.notify_one();
            }
        }
    }

    fn any_record(&self) -> Option<usize> {
        (0..self.len()).find(|&i| self.child(i).has_record())
    }

    /// Index of the first child holding a committed record, scanning in
    /// child order for fairness. Blocks on the record-arrival condition
    /// when none; `Ok(None)` once end-of-records is set and nothing is
    /// left to read.
    pub fn active_wire(&self, timeout: Option<Duration>) -> Result<Option<usize>> {
        let st = self.st();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(index) = self.any_record() {
                return Ok(Some(index));
            }
            if st.eor.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let guard = st.record_mutex.lock()?;
            st.wait_for_record.store(true, Ordering::SeqCst);
            fence(Ordering::AcqRel);
            let woke = loop {
                if let Some(index) = self.any_record() {
                    break Some(index);
                }
                if st.eor.load(Ordering::SeqCst) {
                    break None;
                }
                match deadline {
                    None => st.record_cond.wait(&guard)?,
                    Some(dl) => {
                        let remaining = dl.saturating_duration_since(Instant::now());
                        if remaining.is_zero()
                            || !st.record_cond.wait_timeout(&guard, remaining)?
                        {
                            st.wait_for_record.store(false, Ordering::SeqCst);
                            return Err(WireError::Timeout("a record"));
                        }
                    }
                }
            };
            st.wait_for_record.store(false, Ordering::SeqCst);
            drop(guard);
            if let Some(index) = woke {
                return Ok(Some(index));
            }
            // Fell out on end-of-records; loop re-checks and returns None.
        }
    }

    /// Committed payload length of the front record on child `index`.
    fn child_front_len(&self, index: usize) -> u32 {
        let mut ring = self.child_ring(index);
        match ring.peek(false) {
            Ok(h) => h.length,
            Err(_) => 0,
        }
    }

    /// Consume the front record (header + payload) on child `index`.
    fn child_dispose(&self, index: usize, length: u32) {
        let ring = self.child_ring(index);
        ring.st()
            .poped
            .fetch_add(length as u64 + LengthHeader::SIZE as u64, Ordering::AcqRel);
        ring.notify_writer();
    }
}

// ---------------------------------------------------------------------------
// ResultSetWriter — server-side child writer
// ---------------------------------------------------------------------------

/// Writer over one acquired child wire. Bytes written between record
/// boundaries group into a single length-framed record committed by
/// `flush`.
pub struct ResultSetWriter {
    ring: Ring<LengthHeader>,
    pool: ResultSetPool,
    index: usize,
}

impl ResultSetWriter {
    /// Child slot index within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Append bytes to the record in progress, starting one if needed.
    /// Dropped silently when the client has closed the pool.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let st = self.ring.st();
        if !st.continued.load(Ordering::SeqCst) {
            if !self.ring.brand_new()? {
                return Ok(());
            }
            st.continued.store(true, Ordering::SeqCst);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() > self.ring.room() && !self.ring.wait_to_write(bytes.len())? {
            return Ok(());
        }
        if st.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pushed = st.pushed.load(Ordering::Acquire);
        self.ring.copy_in(pushed, bytes);
        st.pushed.store(pushed + bytes.len() as u64, Ordering::Release);
        if !self.ring.notify_reader() {
            self.pool.notify_record_arrival();
        }
        Ok(())
    }

    /// Commit the record in progress: the length header lands in the
    /// reserved slot and the record becomes visible atomically.
    pub fn flush(&self) {
        let st = self.ring.st();
        if st.continued.load(Ordering::SeqCst) {
            self.ring.flush(LengthHeader::new);
            st.continued.store(false, Ordering::SeqCst);
            self.pool.notify_record_arrival();
        }
    }
}

// ---------------------------------------------------------------------------
// ResultSetHandle — client-side reader
// ---------------------------------------------------------------------------

struct CurrentRecord {
    child: usize,
    len: u64,
    consumed: u64,
}

/// Client handle over one result-set stream.
///
/// `get_chunk` yields successive contiguous views of record payloads (at
/// most two per record when it straddles the wrap boundary);
/// `dispose_used` returns consumed bytes to the wire. Zero-length records
/// are end-of-record markers and are skipped silently.
pub struct ResultSetHandle {
    pool: ResultSetPool,
    current: Option<CurrentRecord>,
    closed: bool,
    tracker: Option<Arc<AtomicUsize>>,
}

impl ResultSetHandle {
    /// Locate the pool registered under `name` in the segment.
    pub(crate) fn connect(
        seg: Arc<Segment>,
        name: &str,
        tracker: Option<Arc<AtomicUsize>>,
    ) -> Result<Self> {
        let state = seg.find(name).map_err(|_| {
            WireError::NotFound(format!("a result-set wire named \"{name}\""))
        })?;
        if let Some(t) = &tracker {
            t.fetch_add(1, Ordering::AcqRel);
        }
        Ok(Self {
            pool: ResultSetPool::new(seg, state),
            current: None,
            closed: false,
            tracker,
        })
    }

    /// Next contiguous view of record payload, blocking until a record
    /// arrives. `Ok(None)` once end-of-records is reached.
    pub fn get_chunk(&mut self) -> Result<Option<&[u8]>> {
        self.get_chunk_with_timeout(None)
    }

    /// As [`Self::get_chunk`] with a deadline on the record wait.
    pub fn get_chunk_with_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<&[u8]>> {
        if self.closed {
            return Err(WireError::Closed);
        }
        loop {
            if self.current.is_none() {
                let index = match self.pool.active_wire(timeout)? {
                    None => return Ok(None),
                    Some(i) => i,
                };
                let len = self.pool.child_front_len(index);
                if len == 0 {
                    // End-of-record marker.
                    self.pool.child_dispose(index, 0);
                    continue;
                }
                self.current = Some(CurrentRecord {
                    child: index,
                    len: len as u64,
                    consumed: 0,
                });
            }

            let (pos, view_len, data) = {
                let cur = self.current.as_ref().expect("record just selected");
                let child = self.pool.child(cur.child);
                let cap = child.capacity.load(Ordering::Acquire);
                let start =
                    child.poped.load(Ordering::Acquire) + LengthHeader::SIZE as u64 + cur.consumed;
                let pos = (start % cap) as usize;
                let view_len = ((cur.len - cur.consumed) as usize).min(cap as usize - pos);
                (pos, view_len, child.data.load(Ordering::Acquire))
            };
            let ptr = unsafe { self.pool.seg.at::<u8>(data).add(pos) };
            return Ok(Some(unsafe { std::slice::from_raw_parts(ptr, view_len) }));
        }
    }

    /// Mark `n` bytes of the current record consumed. Once the whole record
    /// is consumed it is disposed and the reader moves on.
    pub fn dispose_used(&mut self, n: usize) {
        if let Some(cur) = &mut self.current {
            cur.consumed = (cur.consumed + n as u64).min(cur.len);
            if cur.consumed >= cur.len {
                let (child, len) = (cur.child, cur.len);
                self.pool.child_dispose(child, len as u32);
                self.current = None;
            }
        }
    }

    /// Whether the server has marked end-of-records.
    pub fn is_eor(&self) -> bool {
        self.pool.is_eor()
    }

    /// Stop reading: closes every child so stalled writers drop their
    /// writes. Subsequent operations fail with `Closed`.
    pub fn close(&mut self) {
        if !self.closed {
            self.pool.set_closed();
            self.closed = true;
            if let Some(t) = self.tracker.take() {
                t.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Drop for ResultSetHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_pool(count: usize, wire_size: usize) -> (Arc<Segment>, u64) {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("rs_unit_{}_{n}", std::process::id());
        let seg = Segment::create(&name, 1 << 20).expect("segment");
        let state =
            construct_resultset_pool(&seg, "rs_pool", count, wire_size).expect("pool");
        (seg, state)
    }

    #[test]
    fn acquire_release_reacquire_is_idempotent() {
        let (seg, state) = test_pool(4, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);

        let w = pool.acquire().expect("acquire");
        assert_eq!(w.index(), 0);
        pool.release(w).expect("release");

        let w = pool.acquire().expect("reacquire");
        assert_eq!(w.index(), 0);
        w.write(b"still usable").expect("write");
        w.flush();
        assert_eq!(pool.active_wire(Some(Duration::ZERO)).expect("scan"), Some(0));
    }

    #[test]
    fn acquire_prefers_lower_indices() {
        let (seg, state) = test_pool(4, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        let w0 = pool.acquire().expect("w0");
        let w1 = pool.acquire().expect("w1");
        let w2 = pool.acquire().expect("w2");
        assert_eq!((w0.index(), w1.index(), w2.index()), (0, 1, 2));
        pool.release(w1).expect("release w1");
        let w = pool.acquire().expect("reuse");
        assert_eq!(w.index(), 1);
        drop((w0, w2, w));
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let (seg, state) = test_pool(2, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        let _w0 = pool.acquire().expect("w0");
        let _w1 = pool.acquire().expect("w1");
        assert!(matches!(
            pool.acquire(),
            Err(WireError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn set_eor_makes_active_wire_return_none() {
        let (seg, state) = test_pool(2, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        pool.set_eor();
        assert_eq!(pool.active_wire(Some(Duration::from_millis(50))).expect("scan"), None);
    }

    #[test]
    fn records_flow_through_the_handle() {
        let (seg, state) = test_pool(2, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        let writer = pool.acquire().expect("acquire");
        writer.write(b"first record").expect("write");
        writer.flush();
        writer.write(b"second").expect("write");
        writer.flush();
        pool.set_eor();

        let mut handle =
            ResultSetHandle::connect(Arc::clone(&seg), "rs_pool", None).expect("connect");

        let v1 = handle
            .get_chunk_with_timeout(Some(Duration::from_millis(200)))
            .expect("chunk")
            .expect("some")
            .to_vec();
        assert_eq!(v1, b"first record");
        handle.dispose_used(v1.len());

        let v2 = handle
            .get_chunk_with_timeout(Some(Duration::from_millis(200)))
            .expect("chunk")
            .expect("some")
            .to_vec();
        assert_eq!(v2, b"second");
        handle.dispose_used(v2.len());

        assert_eq!(
            handle
                .get_chunk_with_timeout(Some(Duration::from_millis(50)))
                .expect("chunk"),
            None
        );
        assert!(handle.is_eor());
    }

    #[test]
    fn zero_length_marker_is_skipped() {
        let (seg, state) = test_pool(2, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        let writer = pool.acquire().expect("acquire");
        writer.write(&[]).expect("empty record");
        writer.flush();
        pool.set_eor();

        let mut handle = ResultSetHandle::connect(seg, "rs_pool", None).expect("connect");
        assert_eq!(
            handle
                .get_chunk_with_timeout(Some(Duration::from_millis(100)))
                .expect("chunk"),
            None
        );
    }

    #[test]
    fn closed_pool_drops_writes() {
        let (seg, state) = test_pool(1, 1 << 12);
        let pool = ResultSetPool::new(Arc::clone(&seg), state);
        let writer = pool.acquire().expect("acquire");
        pool.set_closed();
        writer.write(b"dropped").expect("write after close is a no-op");
        writer.flush();
        assert!(pool.is_closed());
    }
}
