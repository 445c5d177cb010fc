//! The tag-multiplexed communication layer.

mod builder;
mod layer;
mod messages;

pub use builder::{CommBuilder, DEFAULT_BUFFER_CAPACITY};
pub use layer::CommLayer;
pub use messages::{Rank, ReceivedMessage, SendQueueElement, Tag, DEFAULT_TAG};
