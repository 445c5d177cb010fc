use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::error::Result;
use crate::io::Buffer;

/// Index of a buffer inside a [`MessageBuffers`] pool.
pub type BufferId = usize;

/// Active-slot sentinel for "no buffer assigned".
const NO_BUFFER: usize = usize::MAX;

/// A pool of append buffers with one active buffer per destination.
///
/// User threads append into the active buffer for their destination. When
/// that buffer rejects an append, the appender swaps in a spare: it takes a
/// fresh buffer off the free-list and compare-exchanges the destination's
/// active slot from the id it observed to the fresh one. The CAS winner
/// blocks the old buffer and reports its id so the caller can queue it for
/// transmission; losers return their spare and retry against the new active
/// buffer. Released buffers are cleared and go back on the free-list.
///
/// Buffer lifecycle: free → active (swap-in) → blocked in transit
/// (swap-out or [`MessageBuffers::take_active`]) → free
/// ([`MessageBuffers::release`]).
pub struct MessageBuffers {
    pool: Box<[Buffer]>,
    /// Per-destination id of the buffer currently receiving appends.
    active: Box<[CachePadded<AtomicUsize>]>,
    free: Mutex<Vec<BufferId>>,
}

impl MessageBuffers {
    /// Create a pool for `num_dests` destinations with `capacity`-byte
    /// buffers.
    ///
    /// The pool holds `2 * num_dests` buffers: one active per destination
    /// and an equal margin of spares, so the free-list is never empty in
    /// steady state.
    pub fn new(num_dests: usize, capacity: usize) -> Result<Self> {
        let total = 2 * num_dests;
        let pool = (0..total)
            .map(|_| Buffer::new(capacity))
            .collect::<Result<Box<[_]>>>()?;
        let active = (0..num_dests)
            .map(|d| CachePadded::new(AtomicUsize::new(d)))
            .collect();
        let free = Mutex::new((num_dests..total).collect());
        Ok(Self { pool, active, free })
    }

    pub fn num_dests(&self) -> usize {
        self.active.len()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.pool[0].capacity()
    }

    /// Number of buffers currently idle on the free-list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// One append attempt for destination `dst`.
    ///
    /// Returns `(true, None)` when the bytes were committed. On `(false, _)`
    /// the caller must retry; a `Some(id)` alongside carries a swapped-out
    /// buffer that is now blocked and ready for transmission; exactly one
    /// caller receives each swapped-out id.
    pub fn append(&self, data: &[u8], dst: usize) -> (bool, Option<BufferId>) {
        let cur = self.active[dst].load(Ordering::Acquire);
        if cur != NO_BUFFER && self.pool[cur].append(data) {
            return (true, None);
        }

        // Active buffer full, blocked, or absent: swap in a spare.
        let fresh = match self.free.lock().pop() {
            Some(id) => id,
            // Everything is in transit; retry once a release comes back.
            None => return (false, None),
        };
        match self.active[dst].compare_exchange(
            cur,
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if cur == NO_BUFFER {
                    (false, None)
                } else {
                    // Appends that raced in between the swap and this block
                    // still land in `cur` and travel with it; the caller
                    // enqueues the id only after we return.
                    self.pool[cur].block();
                    (false, Some(cur))
                }
            }
            Err(_) => {
                // Another thread swapped first; hand the spare back.
                self.free.lock().push(fresh);
                (false, None)
            }
        }
    }

    /// Read view of the buffer identified by `id`, for the send path.
    pub fn back_buffer(&self, id: BufferId) -> &Buffer {
        &self.pool[id]
    }

    /// Return a drained buffer to the free-list.
    ///
    /// A buffer handed out by a swap or by `take_active` is blocked; a
    /// release of an id that is not blocked is a double release and is
    /// ignored after logging.
    pub fn release(&self, id: BufferId) {
        let buf = &self.pool[id];
        if !buf.is_blocked() {
            log::warn!("release of buffer {id} that is not in transit (double release?)");
            return;
        }
        buf.clear();
        self.free.lock().push(id);
    }

    /// Detach and block the active buffer for `dst`, leaving the slot empty.
    ///
    /// Used at flush time to harvest partially filled buffers. Returns the
    /// buffer's id, or `None` if the destination had no active buffer.
    pub fn take_active(&self, dst: usize) -> Option<BufferId> {
        let cur = self.active[dst].swap(NO_BUFFER, Ordering::AcqRel);
        if cur == NO_BUFFER {
            return None;
        }
        self.pool[cur].block();
        Some(cur)
    }

    /// The currently active buffer id for every destination, indexed by
    /// destination. Precise only at the moment of the call.
    pub fn active_ids(&self) -> Vec<Option<BufferId>> {
        self.active
            .iter()
            .map(|slot| match slot.load(Ordering::Acquire) {
                NO_BUFFER => None,
                id => Some(id),
            })
            .collect()
    }
}

impl std::fmt::Debug for MessageBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffers")
            .field("num_dests", &self.num_dests())
            .field("pool_size", &self.pool.len())
            .field("free", &self.free_len())
            .field("active", &self.active_ids())
            .finish()
    }
}
