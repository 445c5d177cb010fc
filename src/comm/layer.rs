use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::comm::{Rank, ReceivedMessage, SendQueueElement, Tag};
use crate::concurrent::ThreadSafeQueue;
use crate::error::{Error, Result};
use crate::io::{BufferId, MessageBuffers};
use crate::transport::{Envelope, Transport};

type Callback = Arc<dyn Fn(&[u8], Rank) + Send + Sync>;

/// Per-tag bookkeeping, guarded by one coarse mutex (contention is rare:
/// registration is single-threaded, and steady-state sends touch it only to
/// clone the pool handle).
struct Registry {
    /// Per-tag buffer pools, created lazily on first send.
    buffers: HashMap<Tag, Arc<MessageBuffers>>,
    /// User receive callbacks, set once per tag.
    callbacks: HashMap<Tag, Callback>,
    /// Tags currently accepting `send_message`.
    send_accept: HashSet<Tag>,
    /// Senders that have not yet delivered their end-of-stream marker, per
    /// tag; the entry is erased when the count reaches zero.
    recv_remaining: HashMap<Tag, usize>,
    /// Outbound elements enqueued but not yet completed, per tag.
    sends_pending: HashMap<Tag, usize>,
}

struct Shared<T: Transport> {
    transport: T,
    size: usize,
    rank: Rank,
    buffer_capacity: usize,
    send_queue: ThreadSafeQueue<SendQueueElement>,
    recv_queue: ThreadSafeQueue<ReceivedMessage>,
    registry: Mutex<Registry>,
    /// Signaled by the communication thread whenever a send completes or a
    /// tag's remaining-sender count is erased; `finish` waits on it.
    progress: Condvar,
}

/// Join handles of the internal threads, behind a mutex so that starting
/// and stopping work through `&self` (callbacks may hold the layer in an
/// `Arc` and send from inside).
#[derive(Default)]
struct Workers {
    comm: Option<JoinHandle<()>>,
    callbacks: Vec<JoinHandle<()>>,
}

/// Tagged, buffered, many-to-many messaging across the ranks of a job.
///
/// Multiplexes any number of logical streams (one per tag) over a
/// rank-to-rank [`Transport`]. User threads call
/// [`send_message`](CommLayer::send_message) concurrently; payloads are
/// batched into per-`(tag, destination)` buffers and shipped by a single
/// internal communication thread. Received buffers are handed to the tag's
/// registered callback on dedicated callback threads.
///
/// Lifecycle per tag: register a callback, send, then
/// [`flush`](CommLayer::flush) once no more sends are coming and
/// [`finish`](CommLayer::finish) to await global end-of-stream. The internal
/// threads run between [`init_communication`](CommLayer::init_communication)
/// and [`finish_communication`](CommLayer::finish_communication); the latter
/// returns only after every registered tag has been flushed everywhere and
/// all traffic has drained.
pub struct CommLayer<T: Transport> {
    shared: Arc<Shared<T>>,
    callback_thread_count: usize,
    workers: Mutex<Workers>,
}

impl<T: Transport> CommLayer<T> {
    /// Build with default configuration; see [`CommBuilder`] for the knobs.
    ///
    /// [`CommBuilder`]: crate::comm::CommBuilder
    pub fn new(transport: T) -> Result<Self> {
        crate::comm::CommBuilder::new(transport).build()
    }

    pub(crate) fn with_config(
        transport: T,
        buffer_capacity: usize,
        send_queue_depth: usize,
        recv_queue_depth: usize,
        callback_threads: usize,
    ) -> Result<Self> {
        let size = transport.size();
        let rank = transport.rank();
        let shared = Arc::new(Shared {
            transport,
            size,
            rank,
            buffer_capacity,
            send_queue: ThreadSafeQueue::new(send_queue_depth)?,
            recv_queue: ThreadSafeQueue::new(recv_queue_depth)?,
            registry: Mutex::new(Registry {
                buffers: HashMap::new(),
                callbacks: HashMap::new(),
                send_accept: HashSet::new(),
                recv_remaining: HashMap::new(),
                sends_pending: HashMap::new(),
            }),
            progress: Condvar::new(),
        });
        Ok(Self {
            shared,
            callback_thread_count: callback_threads,
            workers: Mutex::new(Workers::default()),
        })
    }

    pub fn comm_size(&self) -> usize {
        self.shared.size
    }

    pub fn comm_rank(&self) -> Rank {
        self.shared.rank
    }

    /// Register the receive callback for `tag` and open the tag for sends.
    ///
    /// Registration-time only: call before `init_communication` and before
    /// any `send_message` for the tag. The callback receives each payload
    /// slice together with its source rank; the final invocation for the tag
    /// carries an empty slice once every rank's end-of-stream marker has
    /// arrived. A tag cannot be re-registered.
    pub fn add_receive_callback<F>(&self, tag: Tag, callback: F) -> Result<()>
    where
        F: Fn(&[u8], Rank) + Send + Sync + 'static,
    {
        let mut reg = self.shared.registry.lock();
        if reg.callbacks.contains_key(&tag) {
            log::error!("a receive callback is already registered for tag {tag}");
            return Err(Error::CallbackExists(tag));
        }
        reg.callbacks.insert(tag, Arc::new(callback));
        reg.recv_remaining.insert(tag, self.shared.size);
        reg.send_accept.insert(tag);
        Ok(())
    }

    /// Buffer `data` for delivery to rank `dst` on `tag`.
    ///
    /// Callable from any thread. Returns once the bytes are committed to a
    /// send buffer; full buffers are handed to the communication thread with
    /// backpressure along the way. Fails if the tag is not accepting sends,
    /// the destination is out of range, or the payload cannot fit one buffer.
    pub fn send_message(&self, data: &[u8], dst: Rank, tag: Tag) -> Result<()> {
        if dst >= self.shared.size {
            log::error!(
                "send_message to rank {dst} in a {}-rank job (tag {tag})",
                self.shared.size
            );
            return Err(Error::InvalidRank {
                dst,
                size: self.shared.size,
            });
        }
        if data.len() > self.shared.buffer_capacity {
            log::error!(
                "send_message of {} bytes exceeds the {}-byte buffer capacity (tag {tag})",
                data.len(),
                self.shared.buffer_capacity
            );
            return Err(Error::MessageTooLarge {
                len: data.len(),
                capacity: self.shared.buffer_capacity,
            });
        }

        let pool = {
            let mut reg = self.shared.registry.lock();
            if !reg.send_accept.contains(&tag) {
                drop(reg);
                log::error!("send_message on tag {tag}, which is not accepting sends");
                return Err(Error::TagClosed(tag));
            }
            match reg.buffers.get(&tag) {
                Some(pool) => Arc::clone(pool),
                None => {
                    let pool = Arc::new(MessageBuffers::new(
                        self.shared.size,
                        self.shared.buffer_capacity,
                    )?);
                    reg.buffers.insert(tag, Arc::clone(&pool));
                    pool
                }
            }
        };

        // Retry until the bytes land; every swapped-out full buffer goes to
        // the communication thread on the way.
        let backoff = Backoff::new();
        loop {
            let (committed, full) = pool.append(data, dst);
            if let Some(id) = full {
                if pool.back_buffer(id).is_empty() {
                    pool.release(id);
                } else {
                    self.shared.enqueue_send(Some(id), tag, dst);
                }
            }
            if committed {
                return Ok(());
            }
            backoff.snooze();
        }
    }

    /// Close `tag` to further sends and enqueue everything still buffered,
    /// followed by one end-of-stream marker per destination.
    ///
    /// Call from a single thread per tag, after every `send_message` for the
    /// tag has returned. Markers go to *every* destination, including self
    /// and ranks never sent to, so that peers which received no data still
    /// observe this rank's end-of-stream. Returns once everything is
    /// enqueued; transmission drains asynchronously (see
    /// [`finish`](CommLayer::finish)).
    pub fn flush(&self, tag: Tag) -> Result<()> {
        let pool = {
            let mut reg = self.shared.registry.lock();
            if !reg.callbacks.contains_key(&tag) {
                drop(reg);
                log::error!("flush of unregistered tag {tag}");
                return Err(Error::UnknownTag(tag));
            }
            if !reg.send_accept.remove(&tag) {
                drop(reg);
                log::warn!("flush of tag {tag}, which was already flushed");
                return Ok(());
            }
            reg.buffers.get(&tag).cloned()
        };

        for dst in 0..self.shared.size {
            if let Some(pool) = &pool {
                if let Some(id) = pool.take_active(dst) {
                    if pool.back_buffer(id).is_empty() {
                        pool.release(id);
                    } else {
                        self.shared.enqueue_send(Some(id), tag, dst);
                    }
                }
            }
            self.shared.enqueue_send(None, tag, dst);
        }
        Ok(())
    }

    /// Block until every send enqueued for `tag` has completed and the
    /// end-of-stream markers of all ranks have been received for it.
    ///
    /// Call after [`flush`](CommLayer::flush); a finish on a tag that was
    /// never registered returns immediately.
    pub fn finish(&self, tag: Tag) {
        let mut reg = self.shared.registry.lock();
        if !reg.callbacks.contains_key(&tag) {
            log::warn!("finish of unregistered tag {tag}");
            return;
        }
        while reg.sends_pending.contains_key(&tag) || reg.recv_remaining.contains_key(&tag) {
            self.shared.progress.wait(&mut reg);
        }
    }

    /// Spawn the communication thread and the callback thread(s).
    ///
    /// Register every tag first: the communication thread stops as soon as
    /// its termination predicate holds, and with nothing registered it holds
    /// immediately.
    pub fn init_communication(&self) {
        let mut workers = self.workers.lock();
        if workers.comm.is_some() {
            log::warn!("init_communication called while communication threads are running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        workers.comm = Some(
            thread::Builder::new()
                .name("kmerbus-comm".into())
                .spawn(move || CommThread::new(shared).run())
                .expect("failed to spawn communication thread"),
        );
        for i in 0..self.callback_thread_count {
            let shared = Arc::clone(&self.shared);
            workers.callbacks.push(
                thread::Builder::new()
                    .name(format!("kmerbus-callback-{i}"))
                    .spawn(move || callback_loop(&shared))
                    .expect("failed to spawn callback thread"),
            );
        }
    }

    /// Join the internal threads.
    ///
    /// Blocks until the communication thread's termination predicate fires:
    /// every registered tag flushed here, all traffic drained, and all peers'
    /// end-of-stream markers received. Flush every tag (on every rank)
    /// before calling this, or it will not return.
    /// Must not be called from a callback thread (it would join itself).
    pub fn finish_communication(&self) {
        let taken = {
            let mut workers = self.workers.lock();
            Workers {
                comm: workers.comm.take(),
                callbacks: std::mem::take(&mut workers.callbacks),
            }
        };
        if let Some(handle) = taken.comm {
            if handle.join().is_err() {
                log::error!("communication thread panicked");
            }
        }
        for handle in taken.callbacks {
            if handle.join().is_err() {
                log::error!("callback thread panicked");
            }
        }
    }
}

impl<T: Transport> Drop for CommLayer<T> {
    fn drop(&mut self) {
        self.finish_communication();
    }
}

impl<T: Transport> std::fmt::Debug for CommLayer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.shared.registry.lock();
        f.debug_struct("CommLayer")
            .field("rank", &self.shared.rank)
            .field("size", &self.shared.size)
            .field("accepting_tags", &reg.send_accept)
            .field("outbound_queued", &self.shared.send_queue.len())
            .field("inbound_queued", &self.shared.recv_queue.len())
            .finish()
    }
}

impl<T: Transport> Shared<T> {
    /// Enqueue an outbound element with backpressure, accounting it against
    /// the tag so `finish` can await its completion.
    fn enqueue_send(&self, buffer: Option<BufferId>, tag: Tag, dst: Rank) {
        {
            let mut reg = self.registry.lock();
            *reg.sends_pending.entry(tag).or_insert(0) += 1;
        }
        let elem = SendQueueElement { buffer, tag, dst };
        if self.send_queue.wait_and_push(elem).is_err() {
            // Only possible if push was disabled, which nothing does while
            // sends are still being produced.
            log::error!("outbound queue refused an element for tag {tag}");
            let mut reg = self.registry.lock();
            retire_pending_send(&mut reg, tag);
            drop(reg);
            self.progress.notify_all();
        }
    }
}

fn retire_pending_send(reg: &mut Registry, tag: Tag) {
    match reg.sends_pending.get_mut(&tag) {
        Some(n) if *n > 1 => *n -= 1,
        Some(_) => {
            reg.sends_pending.remove(&tag);
        }
        None => log::error!("send completion for tag {tag} with none pending"),
    }
}

/// Abort policy for transport failures and protocol anomalies: the job is
/// wedged either way, so log and take the process down.
fn fatal(message: &str) -> ! {
    log::error!("{message}");
    std::process::abort();
}

/// State owned by the communication thread: the oldest-first windows of
/// in-flight transport operations, plus inbound deliveries the bounded
/// queue had no room for.
struct CommThread<T: Transport> {
    shared: Arc<Shared<T>>,
    recv_in_progress: VecDeque<(T::RecvHandle, Envelope)>,
    send_in_progress: VecDeque<(T::SendHandle, SendQueueElement)>,
    overflow: VecDeque<ReceivedMessage>,
}

impl<T: Transport> CommThread<T> {
    fn new(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared,
            recv_in_progress: VecDeque::new(),
            send_in_progress: VecDeque::new(),
            overflow: VecDeque::new(),
        }
    }

    /// The cooperative polling loop. Never blocks: inbound deliveries use
    /// `try_push` with the overflow list as relief, so a slow callback can
    /// never wedge this thread (a callback may itself be sending, and the
    /// outbound queue drains here).
    fn run(mut self) {
        let backoff = Backoff::new();
        loop {
            let mut progressed = self.flush_overflow();
            progressed |= self.finish_receives();
            progressed |= self.finish_sends();
            progressed |= self.try_start_receive();
            progressed |= self.try_start_send();

            if self.done() {
                break;
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        // Callback threads drain what is left and stop.
        self.shared.recv_queue.disable_push();
    }

    /// Termination predicate: nothing accepted, queued, in flight, or
    /// awaiting a remote end-of-stream.
    fn done(&self) -> bool {
        if !self.overflow.is_empty()
            || !self.recv_in_progress.is_empty()
            || !self.send_in_progress.is_empty()
            || !self.shared.send_queue.is_empty()
            || !self.shared.recv_queue.is_empty()
        {
            return false;
        }
        let reg = self.shared.registry.lock();
        reg.send_accept.is_empty() && reg.recv_remaining.is_empty()
    }

    /// Move overflowed deliveries into the inbound queue, oldest first.
    fn flush_overflow(&mut self) -> bool {
        let mut progressed = false;
        while let Some(msg) = self.overflow.pop_front() {
            match self.shared.recv_queue.try_push(msg) {
                Ok(()) => progressed = true,
                Err(msg) => {
                    self.overflow.push_front(msg);
                    break;
                }
            }
        }
        progressed
    }

    /// Poll in-progress receives oldest-first and deliver completions.
    fn finish_receives(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let data = match self.recv_in_progress.front_mut() {
                None => break,
                Some((handle, _)) => match self.shared.transport.test_recv(handle) {
                    Ok(Some(data)) => data,
                    Ok(None) => break,
                    Err(err) => fatal(&format!("transport receive failed: {err}")),
                },
            };
            let (_, env) = self
                .recv_in_progress
                .pop_front()
                .unwrap_or_else(|| fatal("receive window empty after completion"));
            self.deliver(ReceivedMessage {
                data,
                tag: env.tag,
                src: env.src,
            });
            progressed = true;
        }
        progressed
    }

    /// Poll in-progress sends oldest-first; completed buffers go back to
    /// their pool.
    fn finish_sends(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let complete = match self.send_in_progress.front_mut() {
                None => break,
                Some((handle, _)) => match self.shared.transport.test_send(handle) {
                    Ok(complete) => complete,
                    Err(err) => fatal(&format!("transport send failed: {err}")),
                },
            };
            if !complete {
                break;
            }
            let (_, elem) = self
                .send_in_progress
                .pop_front()
                .unwrap_or_else(|| fatal("send window empty after completion"));
            self.complete_send(elem);
            progressed = true;
        }
        progressed
    }

    /// Probe for one incoming message and post its receive.
    fn try_start_receive(&mut self) -> bool {
        if !self.overflow.is_empty() {
            // Admitting more receives while deliveries are backed up would
            // grow the overflow without bound.
            return false;
        }
        let env = match self.shared.transport.probe() {
            Ok(Some(env)) => env,
            Ok(None) => return false,
            Err(err) => fatal(&format!("transport probe failed: {err}")),
        };
        let buf = vec![0u8; env.len];
        match self.shared.transport.post_recv(buf, env.src, env.tag) {
            Ok(handle) => self.recv_in_progress.push_back((handle, env)),
            Err(err) => fatal(&format!("transport post_recv failed: {err}")),
        }
        true
    }

    /// Pop at most one outbound element and start it, short-circuiting
    /// loopback traffic past the transport.
    fn try_start_send(&mut self) -> bool {
        if !self.overflow.is_empty() {
            return false;
        }
        let Some(elem) = self.shared.send_queue.try_pop() else {
            return false;
        };
        let rank = self.shared.rank;

        match elem.buffer {
            None => {
                if elem.dst == rank {
                    // The marker still runs through the remaining-sender
                    // gate, like one arriving from a peer.
                    self.deliver(ReceivedMessage {
                        data: Vec::new(),
                        tag: elem.tag,
                        src: rank,
                    });
                    self.complete_send(elem);
                } else {
                    // End-of-stream travels as a zero-length message on the
                    // same tag, so it stays ordered behind the data.
                    match self.shared.transport.post_send(&[], elem.dst, elem.tag) {
                        Ok(handle) => self.send_in_progress.push_back((handle, elem)),
                        Err(err) => fatal(&format!("transport post_send failed: {err}")),
                    }
                }
            }
            Some(id) => {
                let pool = self.shared.registry.lock().buffers.get(&elem.tag).cloned();
                let Some(pool) = pool else {
                    fatal(&format!("outbound buffer for tag {} with no pool", elem.tag));
                };
                if elem.dst == rank {
                    let data = pool.back_buffer(id).bytes().to_vec();
                    self.deliver(ReceivedMessage {
                        data,
                        tag: elem.tag,
                        src: rank,
                    });
                    self.complete_send(elem);
                } else {
                    let bytes = pool.back_buffer(id).bytes();
                    match self.shared.transport.post_send(bytes, elem.dst, elem.tag) {
                        Ok(handle) => self.send_in_progress.push_back((handle, elem)),
                        Err(err) => fatal(&format!("transport post_send failed: {err}")),
                    }
                }
            }
        }
        true
    }

    /// Retire a completed outbound element: release its buffer and credit
    /// the tag's pending-send count.
    fn complete_send(&self, elem: SendQueueElement) {
        if let Some(id) = elem.buffer {
            let pool = self.shared.registry.lock().buffers.get(&elem.tag).cloned();
            match pool {
                Some(pool) => pool.release(id),
                None => log::error!("completed send for tag {} with no pool", elem.tag),
            }
        }
        let mut reg = self.shared.registry.lock();
        retire_pending_send(&mut reg, elem.tag);
        drop(reg);
        self.shared.progress.notify_all();
    }

    /// Route a received message toward the callback threads. End-of-stream
    /// markers decrement the tag's remaining-sender count and are forwarded
    /// only when it reaches zero, so the callback sees exactly one marker
    /// per tag, after all data.
    fn deliver(&mut self, msg: ReceivedMessage) {
        if msg.is_end_of_stream() {
            let forward = {
                let mut reg = self.shared.registry.lock();
                match reg.recv_remaining.get_mut(&msg.tag) {
                    Some(n) if *n > 1 => {
                        *n -= 1;
                        false
                    }
                    Some(_) => {
                        reg.recv_remaining.remove(&msg.tag);
                        true
                    }
                    None => fatal(&format!(
                        "end-of-stream for tag {} from rank {} with no senders outstanding",
                        msg.tag, msg.src
                    )),
                }
            };
            self.shared.progress.notify_all();
            if !forward {
                return;
            }
        }
        self.push_inbound(msg);
    }

    /// Nonblocking push into the inbound queue, preserving delivery order
    /// through the overflow list.
    fn push_inbound(&mut self, msg: ReceivedMessage) {
        if !self.overflow.is_empty() {
            self.overflow.push_back(msg);
            return;
        }
        if let Err(msg) = self.shared.recv_queue.try_push(msg) {
            self.overflow.push_back(msg);
        }
    }
}

/// Body of each callback thread: drain the inbound queue and hand every
/// message to its tag's callback. Exits once the communication thread
/// disables push and the queue is empty.
fn callback_loop<T: Transport>(shared: &Shared<T>) {
    while let Some(msg) = shared.recv_queue.wait_and_pop() {
        let callback = shared.registry.lock().callbacks.get(&msg.tag).cloned();
        match callback {
            Some(callback) => callback(&msg.data, msg.src),
            None => log::warn!(
                "dropping {}-byte message from rank {} on tag {} with no callback",
                msg.data.len(),
                msg.src,
                msg.tag
            ),
        }
    }
}
