use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Error, Result};

/// Once set in `reserved`, every reservation attempt fails and the committed
/// length is frozen.
const BLOCKED: usize = 1 << (usize::BITS - 1);
const LEN_MASK: usize = BLOCKED - 1;

/// A fixed-capacity byte block that multiple threads may append into
/// concurrently.
///
/// Appends go in two steps, the way a Vyukov ring publishes a slot: reserve a
/// contiguous range by a compare-and-exchange on the `reserved` word, copy
/// the payload into that range, then advance `committed` past it. The
/// reservation word also carries the `blocked` bit, so blocking the buffer
/// and refusing further reservations is a single atomic step and the
/// reserved length can never move afterwards.
///
/// `committed` trails `reserved` and is advanced in reservation order; an
/// acquire load of it observes only fully written bytes. Readers take the
/// committed view through [`Buffer::bytes`], which waits for in-flight
/// copies to land; callers must block the buffer first so the target length
/// is stable.
pub struct Buffer {
    data: Box<[UnsafeCell<u8>]>,
    /// Packed `(blocked bit, reserved length)`.
    reserved: CachePadded<AtomicUsize>,
    /// Length of the fully written prefix; trails `reserved`.
    committed: CachePadded<AtomicUsize>,
}

// Writers touch disjoint reserved ranges and readers synchronize through
// `committed`; see the field docs for the protocol.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate an empty, unblocked buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > LEN_MASK {
            return Err(Error::ZeroCapacity);
        }
        let data = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        Ok(Self {
            data,
            reserved: CachePadded::new(AtomicUsize::new(0)),
            committed: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes whose payload copy has completed.
    pub fn len(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes reserved so far, whether or not their copies have landed.
    fn reserved_len(&self) -> usize {
        self.reserved.load(Ordering::Acquire) & LEN_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.reserved_len() == 0
    }

    /// Approximate: other threads may reserve between the load and the
    /// comparison.
    pub fn is_full(&self) -> bool {
        self.reserved_len() >= self.data.len()
    }

    pub fn is_blocked(&self) -> bool {
        self.reserved.load(Ordering::Acquire) & BLOCKED != 0
    }

    /// Refuse all further appends. The reserved length is frozen from the
    /// moment the bit lands.
    pub fn block(&self) {
        self.reserved.fetch_or(BLOCKED, Ordering::AcqRel);
    }

    /// Reset to empty and unblocked.
    ///
    /// The caller must be the buffer's sole owner at this point (it came off
    /// an in-transit state with no appenders left).
    pub fn clear(&self) {
        self.committed.store(0, Ordering::Release);
        self.reserved.store(0, Ordering::Release);
    }

    /// Append `src` as one contiguous record.
    ///
    /// Returns `true` iff every byte was committed. Returns `false` iff the
    /// buffer is blocked or the record does not fit in the remaining space;
    /// in that case the buffer is unchanged from the caller's point of view.
    pub fn append(&self, src: &[u8]) -> bool {
        let n = src.len();
        if n == 0 {
            return !self.is_blocked();
        }

        let mut cur = self.reserved.load(Ordering::Relaxed);
        let start = loop {
            if cur & BLOCKED != 0 {
                return false;
            }
            let len = cur & LEN_MASK;
            if len + n > self.data.len() {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break len,
                Err(actual) => cur = actual,
            }
        };

        // The range [start, start + n) is exclusively ours.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data[start].get(), n);
        }

        // Publish in reservation order so `committed` only ever covers fully
        // written bytes.
        let backoff = Backoff::new();
        while self.committed.load(Ordering::Acquire) != start {
            backoff.snooze();
        }
        self.committed.store(start + n, Ordering::Release);
        true
    }

    /// The committed bytes.
    ///
    /// The buffer must be blocked before calling this: the reserved length is
    /// then stable, and this waits for any copies reserved before the block
    /// to finish publishing. The returned slice stays valid until `clear`.
    pub fn bytes(&self) -> &[u8] {
        let target = self.reserved_len();
        let backoff = Backoff::new();
        while self.committed.load(Ordering::Acquire) < target {
            backoff.snooze();
        }
        unsafe { std::slice::from_raw_parts(self.data.as_ptr() as *const u8, target) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("committed", &self.len())
            .field("reserved", &self.reserved_len())
            .field("capacity", &self.data.len())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
