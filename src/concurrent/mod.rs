//! Thread-safe queueing shared by the send and receive paths.

mod queue;

pub use queue::ThreadSafeQueue;
