use crate::comm::CommLayer;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Per-destination buffer capacity used when none is configured, matching
/// the batching granularity the send path was tuned for.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Configures and builds a [`CommLayer`] over a transport.
pub struct CommBuilder<T: Transport> {
    transport: T,
    buffer_capacity: usize,
    send_queue_depth: Option<usize>,
    recv_queue_depth: Option<usize>,
    callback_threads: usize,
}

impl<T: Transport> CommBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            send_queue_depth: None,
            recv_queue_depth: None,
            callback_threads: 1,
        }
    }

    /// Capacity in bytes of each per-destination send buffer.
    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    /// Depth of the outbound queue between user threads and the
    /// communication thread. Defaults to `2 ×` the host's available
    /// parallelism.
    pub fn with_send_queue_depth(mut self, depth: usize) -> Self {
        self.send_queue_depth = Some(depth);
        self
    }

    /// Depth of the inbound queue between the communication thread and the
    /// callback threads. Defaults to `2 ×` the rank count.
    pub fn with_recv_queue_depth(mut self, depth: usize) -> Self {
        self.recv_queue_depth = Some(depth);
        self
    }

    /// Number of callback threads invoking receive callbacks. At least one.
    pub fn with_callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }

    pub fn build(self) -> Result<CommLayer<T>> {
        if self.buffer_capacity == 0 || self.callback_threads == 0 {
            return Err(Error::ZeroCapacity);
        }
        let send_depth = self
            .send_queue_depth
            .unwrap_or_else(|| 2 * default_parallelism());
        let recv_depth = self.recv_queue_depth.unwrap_or(2 * self.transport.size());
        CommLayer::with_config(
            self.transport,
            self.buffer_capacity,
            send_depth,
            recv_depth,
            self.callback_threads,
        )
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
