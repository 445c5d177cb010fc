use thiserror::Error;

use crate::comm::{Rank, Tag};

/// Errors surfaced by the crate.
///
/// Transient conditions (full queues, full buffers) are retried internally
/// and never appear here; what does appear is either construction-time
/// misconfiguration or misuse of the send path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("capacity must be nonzero")]
    ZeroCapacity,

    #[error("no receive callback registered for tag {0}")]
    UnknownTag(Tag),

    #[error("tag {0} is no longer accepting sends")]
    TagClosed(Tag),

    #[error("a receive callback is already registered for tag {0}")]
    CallbackExists(Tag),

    #[error("message of {len} bytes does not fit a {capacity}-byte buffer")]
    MessageTooLarge { len: usize, capacity: usize },

    #[error("destination rank {dst} out of range for a {size}-rank job")]
    InvalidRank { dst: Rank, size: usize },

    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
