//! Buffered, tag-multiplexed communication for distributed k-mer indexing.
//!
//! This crate is the messaging core of a distributed k-mer indexing
//! toolkit: an asynchronous, multi-threaded layer that carries arbitrary
//! byte messages between the ranks of a parallel job. Payloads sent to the
//! same `(tag, destination)` pair are packed into fixed-capacity buffers and
//! shipped in batches; each tag is an independent logical stream with its
//! own receive callback, flush, and global end-of-stream detection.
//!
//! The building blocks are exposed directly:
//!
//! - [`ThreadSafeQueue`]: a bounded MPMC queue with a push-enabled
//!   lifecycle bit, bridging user threads and the internal threads.
//! - [`Buffer`]: a fixed-capacity byte block that many threads append into
//!   concurrently.
//! - [`MessageBuffers`]: the per-destination pool that swaps full buffers
//!   out for transmission and recycles them afterwards.
//! - [`CommLayer`]: the communication layer itself, over any rank-to-rank
//!   [`Transport`]; [`LocalFabric`] provides an in-process transport for
//!   single-host runs and tests.
//!
//! ```
//! use kmerbus::{CommBuilder, LocalFabric, Transport};
//!
//! // A two-rank job inside one process, each rank on its own thread.
//! let mut handles = Vec::new();
//! for transport in LocalFabric::create(2) {
//!     handles.push(std::thread::spawn(move || {
//!         let peer = 1 - transport.rank();
//!         let layer = CommBuilder::new(transport).build().unwrap();
//!         layer.add_receive_callback(1, |data, src| {
//!             if !data.is_empty() {
//!                 println!("got {data:?} from rank {src}");
//!             }
//!         }).unwrap();
//!         layer.init_communication();
//!         layer.send_message(b"hello", peer, 1).unwrap();
//!         layer.flush(1).unwrap();
//!         layer.finish(1);
//!         layer.finish_communication();
//!     }));
//! }
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! ```

pub mod comm;
pub mod concurrent;
mod error;
pub mod io;
pub mod transport;

pub use comm::{CommBuilder, CommLayer, Rank, ReceivedMessage, Tag, DEFAULT_TAG};
pub use concurrent::ThreadSafeQueue;
pub use error::{Error, Result};
pub use io::{Buffer, BufferId, MessageBuffers};
pub use transport::{Envelope, LocalFabric, LocalTransport, Transport};
