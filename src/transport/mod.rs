//! The rank-to-rank transport the communication layer runs on.

mod local;

pub use local::{LocalFabric, LocalRecv, LocalTransport};

use crate::comm::{Rank, Tag};
use crate::error::Result;

/// Envelope of a probed incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub src: Rank,
    pub tag: Tag,
    pub len: usize,
}

/// Nonblocking point-to-point messaging between the ranks of a job.
///
/// All calls are made from the single communication thread; implementations
/// still must be `Send + Sync` because the layer owning them is shared.
///
/// A message reported by [`Transport::probe`] is claimed by a matching
/// [`Transport::post_recv`]; messages between a fixed `(src, dst, tag)`
/// triple are delivered in the order they were posted. Zero-length messages
/// are legal and carry their `(src, tag)` envelope.
pub trait Transport: Send + Sync + 'static {
    /// In-flight send; polled with [`Transport::test_send`].
    type SendHandle: Send;
    /// In-flight receive; polled with [`Transport::test_recv`].
    type RecvHandle: Send;

    /// Number of ranks in the job.
    fn size(&self) -> usize;

    /// This rank, in `[0, size)`.
    fn rank(&self) -> Rank;

    /// Nonblocking check for an incoming message from any source on any tag.
    fn probe(&self) -> Result<Option<Envelope>>;

    /// Start a nonblocking send. `data` must stay untouched until
    /// `test_send` reports completion.
    fn post_send(&self, data: &[u8], dst: Rank, tag: Tag) -> Result<Self::SendHandle>;

    /// Start a nonblocking receive into `buf` (sized from the probed
    /// envelope) for a message from `src` on `tag`.
    fn post_recv(&self, buf: Vec<u8>, src: Rank, tag: Tag) -> Result<Self::RecvHandle>;

    /// Poll a send for completion.
    fn test_send(&self, handle: &mut Self::SendHandle) -> Result<bool>;

    /// Poll a receive; `Some(bytes)` hands back the filled buffer once the
    /// message has arrived.
    fn test_recv(&self, handle: &mut Self::RecvHandle) -> Result<Option<Vec<u8>>>;
}
