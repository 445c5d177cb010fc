use crate::io::BufferId;

/// A logical message stream identifier, multiplexed independently of all
/// other tags.
pub type Tag = u32;

/// A transport-level peer identifier in `[0, size)`.
pub type Rank = usize;

/// Tag used by sends that do not name one.
pub const DEFAULT_TAG: Tag = 0;

/// One element of the outbound queue: a full buffer headed for `(tag, dst)`,
/// or, when `buffer` is `None`, the end-of-stream marker for that pair.
#[derive(Debug)]
pub struct SendQueueElement {
    pub buffer: Option<BufferId>,
    pub tag: Tag,
    pub dst: Rank,
}

impl SendQueueElement {
    pub fn is_end_of_stream(&self) -> bool {
        self.buffer.is_none()
    }
}

/// One element of the inbound queue: an owned payload received from `src` on
/// `tag`. An empty payload is the end-of-stream marker from `src`.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub data: Vec<u8>,
    pub tag: Tag,
    pub src: Rank,
}

impl ReceivedMessage {
    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }
}
