// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The connection queue: pairs client connection requests with server
// accepts and issues session identifiers.
//
// Two fixed-capacity index rings cycle ticket ids: `free` holds unclaimed
// tickets, `requested` the tickets awaiting an accept. Each ticket has its
// own rendezvous element (mutex + condition + session id) so a waiting
// client wakes only on its own accept, never on a neighbour's.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Result, WireError};
use crate::segment::Segment;
use crate::sync::{SharedCondvar, SharedMutex, SharedSemaphore};

/// Directory name of the connection queue within its segment.
pub const CONNECTION_QUEUE_NAME: &str = "connection_queue";

/// Default number of tickets.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Session id written by the server when an accept fails.
pub const SESSION_ID_ERROR: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// In-segment layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct IndexRingState {
    mutex: SharedMutex,
    cond: SharedCondvar,
    pushed: AtomicU64,
    poped: AtomicU64,
}

#[repr(C)]
struct ElementState {
    mutex: SharedMutex,
    cond: SharedCondvar,
    /// 0 = not accepted yet; session ids start at 1.
    session_id: AtomicU64,
}

#[repr(C)]
struct QueueState {
    capacity: u64,
    terminate: AtomicBool,
    next_session_id: AtomicU64,
    terminated: SharedSemaphore,
    free: IndexRingState,
    requested: IndexRingState,
    // [AtomicU64; capacity] free-ring slots
    // [AtomicU64; capacity] requested-ring slots
    // [ElementState; capacity] rendezvous elements, 64-byte strided
}

const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

const fn element_stride() -> usize {
    align64(std::mem::size_of::<ElementState>())
}

fn free_slots_offset(state: u64) -> u64 {
    state + align64(std::mem::size_of::<QueueState>()) as u64
}

fn requested_slots_offset(state: u64, capacity: u64) -> u64 {
    free_slots_offset(state) + capacity * 8
}

fn elements_offset(state: u64, capacity: u64) -> u64 {
    align64((requested_slots_offset(state, capacity) + capacity * 8) as usize) as u64
}

fn queue_size(capacity: usize) -> usize {
    align64(align64(std::mem::size_of::<QueueState>()) + 2 * capacity * 8)
        + capacity * element_stride()
}

/// Construct and register a connection queue of `capacity` tickets.
/// Server side only.
pub(crate) fn construct_connection_queue(seg: &Arc<Segment>, capacity: usize) -> Result<u64> {
    let state = seg.construct(CONNECTION_QUEUE_NAME, queue_size(capacity))?;
    unsafe {
        let q = seg.at::<QueueState>(state);
        (*q).capacity = capacity as u64;
        SharedSemaphore::init(std::ptr::addr_of_mut!((*q).terminated))?;
        for ring in [
            std::ptr::addr_of_mut!((*q).free),
            std::ptr::addr_of_mut!((*q).requested),
        ] {
            SharedMutex::init(std::ptr::addr_of_mut!((*ring).mutex))?;
            SharedCondvar::init(std::ptr::addr_of_mut!((*ring).cond))?;
        }
        for i in 0..capacity {
            let elem = seg.at::<ElementState>(
                elements_offset(state, capacity as u64) + (i * element_stride()) as u64,
            );
            SharedMutex::init(std::ptr::addr_of_mut!((*elem).mutex))?;
            SharedCondvar::init(std::ptr::addr_of_mut!((*elem).cond))?;
        }
    }
    let queue = ConnectionQueue::new(Arc::clone(seg), state);
    queue.free_ring().fill();
    debug!(capacity, "connection queue constructed");
    Ok(state)
}

// ---------------------------------------------------------------------------
// Index ring accessor
// ---------------------------------------------------------------------------

struct IndexRing<'a> {
    st: &'a IndexRingState,
    slots: *const AtomicU64,
    capacity: u64,
}

impl IndexRing<'_> {
    fn slot(&self, n: u64) -> &AtomicU64 {
        unsafe { &*self.slots.add((n % self.capacity) as usize) }
    }

    fn fill(&self) {
        for i in 0..self.capacity {
            self.slot(i).store(i, Ordering::Relaxed);
        }
        self.st.pushed.store(self.capacity, Ordering::Release);
    }

    fn push(&self, e: u64) -> Result<()> {
        let _guard = self.st.mutex.lock()?;
        let pushed = self.st.pushed.load(Ordering::Acquire);
        self.slot(pushed).store(e, Ordering::Relaxed);
        self.st.pushed.store(pushed + 1, Ordering::Release);
        fence(Ordering::AcqRel);
        self.st.cond.notify_one();
        Ok(())
    }

    /// Pop without blocking; concurrent consumers race on the head with
    /// `compare_exchange`.
    fn try_pop(&self) -> Result<u64> {
        let mut current = self.st.poped.load(Ordering::Acquire);
        loop {
            if self.st.pushed.load(Ordering::Acquire) == current {
                return Err(WireError::CapacityExceeded("no request available"));
            }
            match self.st.poped.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(self.slot(current).load(Ordering::Relaxed)),
                Err(seen) => current = seen,
            }
        }
    }

    /// Block until an entry is queued or `terminate` is raised.
    fn wait(&self, terminate: &AtomicBool) -> Result<()> {
        let guard = self.st.mutex.lock()?;
        fence(Ordering::AcqRel);
        while self.st.pushed.load(Ordering::Acquire) <= self.st.poped.load(Ordering::Acquire)
            && !terminate.load(Ordering::SeqCst)
        {
            self.st.cond.wait(&guard)?;
        }
        drop(guard);
        Ok(())
    }

    /// Pop after a successful `wait`; single consumer.
    fn pop(&self) -> u64 {
        let n = self.st.poped.fetch_add(1, Ordering::AcqRel);
        self.slot(n).load(Ordering::Relaxed)
    }

    fn notify(&self) {
        if let Ok(_guard) = self.st.mutex.lock() {
            self.st.cond.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionQueue
// ---------------------------------------------------------------------------

/// Accessor over the in-segment connection queue. Clients call `request` /
/// `check` / `wait`; the server calls `listen` / `accept` /
/// `confirm_terminated`.
pub struct ConnectionQueue {
    seg: Arc<Segment>,
    state: u64,
}

impl ConnectionQueue {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self { seg, state }
    }

    /// Open the queue inside the named segment.
    pub fn open(segment_name: &str) -> Result<ConnectionQueue> {
        let not_found =
            || WireError::NotFound(format!("a database with the specified name: {segment_name}"));
        let seg = Segment::open(segment_name).map_err(|_| not_found())?;
        let state = seg.find(CONNECTION_QUEUE_NAME).map_err(|_| not_found())?;
        Ok(ConnectionQueue::new(seg, state))
    }

    fn st(&self) -> &QueueState {
        unsafe { &*self.seg.at::<QueueState>(self.state) }
    }

    fn capacity(&self) -> u64 {
        self.st().capacity
    }

    fn free_ring(&self) -> IndexRing<'_> {
        let capacity = self.capacity();
        IndexRing {
            st: &self.st().free,
            slots: unsafe { self.seg.at::<AtomicU64>(free_slots_offset(self.state)) },
            capacity,
        }
    }

    fn requested_ring(&self) -> IndexRing<'_> {
        let capacity = self.capacity();
        IndexRing {
            st: &self.st().requested,
            slots: unsafe {
                self.seg
                    .at::<AtomicU64>(requested_slots_offset(self.state, capacity))
            },
            capacity,
        }
    }

    fn element(&self, ticket: u64) -> Result<&ElementState> {
        if ticket >= self.capacity() {
            return Err(WireError::ProtocolError(format!(
                "ticket {ticket} out of range for the connection queue"
            )));
        }
        Ok(unsafe {
            &*self.seg.at::<ElementState>(
                elements_offset(self.state, self.capacity())
                    + ticket * element_stride() as u64,
            )
        })
    }

    // -- client side --------------------------------------------------------

    /// Take a ticket and queue it for the server. Fails fast with
    /// `CapacityExceeded` when no ticket is free.
    pub fn request(&self) -> Result<u64> {
        let ticket = self.free_ring().try_pop()?;
        self.requested_ring().push(ticket)?;
        trace!(ticket, "connection requested");
        Ok(ticket)
    }

    /// Non-blocking test of whether the ticket has been accepted.
    pub fn check(&self, ticket: u64) -> Result<bool> {
        Ok(self.element(ticket)?.session_id.load(Ordering::Acquire) != 0)
    }

    /// Block until the server accepts this ticket, then recycle it and
    /// return the issued session id.
    ///
    /// On timeout the ticket is deliberately left allocated: a later accept
    /// would still write into it, so the ticket leaks until the queue is
    /// reinitialised. Callers that time out must not reuse the ticket.
    pub fn wait(&self, ticket: u64, timeout: Option<Duration>) -> Result<u64> {
        let elem = self.element(ticket)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let session_id = {
            let guard = elem.mutex.lock()?;
            fence(Ordering::AcqRel);
            loop {
                let id = elem.session_id.load(Ordering::Acquire);
                if id != 0 {
                    break id;
                }
                match deadline {
                    None => elem.cond.wait(&guard)?,
                    Some(dl) => {
                        let remaining = dl.saturating_duration_since(Instant::now());
                        if remaining.is_zero() || !elem.cond.wait_timeout(&guard, remaining)? {
                            return Err(WireError::Timeout("a connection acceptance"));
                        }
                    }
                }
            }
        };
        // Recycle: clear the rendezvous and hand the ticket back.
        elem.session_id.store(0, Ordering::Release);
        self.free_ring().push(ticket)?;
        if session_id == SESSION_ID_ERROR {
            return Err(WireError::Fatal(
                "server failed to accept the connection".into(),
            ));
        }
        debug!(ticket, session_id, "connection accepted");
        Ok(session_id)
    }

    /// Raise the terminate flag, wake the listener, and block until the
    /// server confirms it observed the shutdown.
    pub fn request_terminate(&self) -> Result<()> {
        let st = self.st();
        st.terminate.store(true, Ordering::SeqCst);
        self.requested_ring().notify();
        st.terminated.wait(None)?;
        Ok(())
    }

    // -- server side --------------------------------------------------------

    /// Block until a connection request is queued; returns the candidate
    /// session id for the next `accept`, or `None` when woken by
    /// `request_terminate`.
    pub fn listen(&self) -> Result<Option<u64>> {
        let st = self.st();
        self.requested_ring().wait(&st.terminate)?;
        if st.terminate.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(st.next_session_id.fetch_add(1, Ordering::AcqRel) + 1))
    }

    /// Pop the oldest requested ticket and write `session_id` into its
    /// rendezvous, waking the requesting client. Pass [`SESSION_ID_ERROR`]
    /// to report a failed accept.
    pub fn accept(&self, session_id: u64) -> Result<()> {
        let ticket = self.requested_ring().pop();
        let elem = self.element(ticket)?;
        elem.session_id.store(session_id, Ordering::Release);
        fence(Ordering::AcqRel);
        let _guard = elem.mutex.lock()?;
        elem.cond.notify_one();
        trace!(ticket, session_id, "accept delivered");
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.st().terminate.load(Ordering::SeqCst)
    }

    /// Server acknowledgement of `request_terminate`.
    pub fn confirm_terminated(&self) -> Result<()> {
        self.st().terminated.post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_queue(capacity: usize) -> (Arc<Segment>, ConnectionQueue) {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("conn_unit_{}_{n}", std::process::id());
        let seg = Segment::create(&name, 1 << 18).expect("segment");
        let state = construct_connection_queue(&seg, capacity).expect("queue");
        (Arc::clone(&seg), ConnectionQueue::new(seg, state))
    }

    #[test]
    fn tickets_exhaust_and_fail_fast() {
        let (_seg, queue) = test_queue(2);
        assert_eq!(queue.request().expect("t0"), 0);
        assert_eq!(queue.request().expect("t1"), 1);
        assert!(matches!(
            queue.request(),
            Err(WireError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn check_flips_only_after_accept() {
        let (_seg, queue) = test_queue(4);
        let ticket = queue.request().expect("request");
        assert!(!queue.check(ticket).expect("check"));

        let candidate = queue.listen().expect("listen").expect("not terminated");
        queue.accept(candidate).expect("accept");
        assert!(queue.check(ticket).expect("check"));
        assert_eq!(queue.wait(ticket, None).expect("wait"), candidate);
        assert!(!queue.check(ticket).expect("cleared on reuse"));
    }

    #[test]
    fn session_ids_are_monotonic_and_fifo() {
        let (_seg, queue) = test_queue(4);
        let t0 = queue.request().expect("t0");
        let t1 = queue.request().expect("t1");

        let c0 = queue.listen().expect("listen").expect("candidate");
        queue.accept(c0).expect("accept");
        let c1 = queue.listen().expect("listen").expect("candidate");
        queue.accept(c1).expect("accept");

        assert_eq!(queue.wait(t0, Some(Duration::from_millis(500))).expect("a"), 1);
        assert_eq!(queue.wait(t1, Some(Duration::from_millis(500))).expect("b"), 2);
    }

    #[test]
    fn wait_timeout_leaves_the_ticket_allocated() {
        let (_seg, queue) = test_queue(2);
        let ticket = queue.request().expect("request");
        let err = queue
            .wait(ticket, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(err.is_timeout());
        // The ticket is not recycled: the free ring still has capacity - 1.
        assert_eq!(queue.request().expect("second ticket"), 1);
        assert!(matches!(
            queue.request(),
            Err(WireError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn failed_accept_surfaces_the_error_sentinel() {
        let (_seg, queue) = test_queue(2);
        let ticket = queue.request().expect("request");
        queue.listen().expect("listen").expect("candidate");
        queue.accept(SESSION_ID_ERROR).expect("accept error");
        let err = queue
            .wait(ticket, Some(Duration::from_millis(500)))
            .unwrap_err();
        assert!(matches!(err, WireError::Fatal(_)));
        // The ticket was still recycled: both tickets remain claimable.
        assert_eq!(queue.request().expect("next"), 1);
        assert_eq!(queue.request().expect("recycled"), ticket);
    }

    #[test]
    fn terminate_handshake() {
        let (seg, queue) = test_queue(2);
        let server = ConnectionQueue::new(seg, queue.state);
        let listener = std::thread::spawn(move || {
            let got = server.listen().expect("listen");
            assert_eq!(got, None);
            server.confirm_terminated().expect("confirm");
        });
        std::thread::sleep(Duration::from_millis(30));
        queue.request_terminate().expect("terminate");
        listener.join().unwrap();
    }

    #[test]
    fn cross_thread_handshake() {
        let (seg, queue) = test_queue(4);
        let server = ConnectionQueue::new(Arc::clone(&seg), queue.state);
        let server_thread = std::thread::spawn(move || {
            for _ in 0..2 {
                let candidate = server.listen().expect("listen").expect("candidate");
                server.accept(candidate).expect("accept");
            }
        });

        let t0 = queue.request().expect("t0");
        let a = queue.wait(t0, Some(Duration::from_secs(2))).expect("wait a");
        let t1 = queue.request().expect("t1");
        let b = queue.wait(t1, Some(Duration::from_secs(2))).expect("wait b");
        assert_eq!((a, b), (1, 2));
        server_thread.join().unwrap();
    }
}
