use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Error, Result};

/// Push is refused once this bit is set; the low bits count queued elements.
const PUSH_DISABLED: u64 = 1 << 63;
const LEN_MASK: u64 = PUSH_DISABLED - 1;

/// Outcome of a slot reservation against the admission word.
enum Reservation {
    Granted,
    Full,
    Disabled,
}

/// A bounded multi-producer multi-consumer queue with a push-enabled
/// lifecycle bit.
///
/// Elements are stored in a lock-free ring; admission is controlled by a
/// single atomic word packing `(push_disabled, length)`. Producers reserve a
/// slot by a compare-and-exchange on that word, so the observable length
/// never exceeds the capacity and a disabled queue refuses new elements in
/// the same atomic step. Consumers keep draining a disabled queue; a pop
/// fails only once push is disabled *and* the queue is empty.
///
/// No FIFO order is promised across producers: a pop returns some element
/// that was pushed and not yet popped.
pub struct ThreadSafeQueue<T> {
    ring: ArrayQueue<T>,
    /// Packed `(push_disabled bit 63, length bits 0..63)`.
    state: CachePadded<AtomicU64>,
    capacity: u64,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        Ok(Self {
            ring: ArrayQueue::new(capacity),
            state: CachePadded::new(AtomicU64::new(0)),
            capacity: capacity as u64,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Number of queued elements at the moment of the call.
    pub fn len(&self) -> usize {
        (self.state.load(Ordering::Acquire) & LEN_MASK) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity as usize
    }

    /// Whether producers are currently admitted. Precise only at the moment
    /// of the call.
    pub fn can_push(&self) -> bool {
        self.state.load(Ordering::Acquire) & PUSH_DISABLED == 0
    }

    /// Whether a pop can still produce an element, now or later: push is
    /// enabled, or elements remain to drain.
    pub fn can_pop(&self) -> bool {
        self.state.load(Ordering::Acquire) != PUSH_DISABLED
    }

    /// Re-admit producers.
    pub fn enable_push(&self) {
        self.state.fetch_and(LEN_MASK, Ordering::AcqRel);
    }

    /// Refuse all subsequent pushes. Elements already queued remain
    /// poppable.
    pub fn disable_push(&self) {
        self.state.fetch_or(PUSH_DISABLED, Ordering::AcqRel);
    }

    /// Reserve one slot, or report why the reservation is impossible.
    /// The CAS never publishes a length above `capacity`.
    fn try_reserve(&self) -> Reservation {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & PUSH_DISABLED != 0 {
                return Reservation::Disabled;
            }
            if cur & LEN_MASK >= self.capacity {
                return Reservation::Full;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Reservation::Granted,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Publish a value into the ring under a granted reservation.
    ///
    /// The reservation guarantees the ring has room: pops decrement the
    /// admission word only after the element left the ring, so the ring
    /// population never exceeds the reserved count.
    fn publish(&self, value: T) -> std::result::Result<(), T> {
        match self.ring.push(value) {
            Ok(()) => Ok(()),
            Err(value) => {
                // Reservation rollback; at most once per grant.
                self.state.fetch_sub(1, Ordering::AcqRel);
                Err(value)
            }
        }
    }

    /// Non-blocking push. Returns the value back if the queue is full or no
    /// longer accepting elements.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        match self.try_reserve() {
            Reservation::Granted => self.publish(value),
            Reservation::Full | Reservation::Disabled => Err(value),
        }
    }

    /// Push, waiting while the queue is full. Returns the value back only if
    /// push has been disabled.
    pub fn wait_and_push(&self, value: T) -> std::result::Result<(), T> {
        let backoff = Backoff::new();
        loop {
            match self.try_reserve() {
                Reservation::Granted => return self.publish(value),
                Reservation::Disabled => return Err(value),
                Reservation::Full => backoff.snooze(),
            }
        }
    }

    /// Non-blocking pop. `None` on empty.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.ring.pop()?;
        self.state.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Pop, waiting while the queue is empty but still live. Returns `None`
    /// only once push is disabled and the queue has drained.
    pub fn wait_and_pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            if let Some(value) = self.ring.pop() {
                self.state.fetch_sub(1, Ordering::AcqRel);
                return Some(value);
            }
            if !self.can_pop() {
                return None;
            }
            backoff.snooze();
        }
    }
}

impl<T> std::fmt::Debug for ThreadSafeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("can_push", &self.can_push())
            .finish()
    }
}
