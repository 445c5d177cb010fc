use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{Rank, Tag};
use crate::error::{Error, Result};
use crate::transport::{Envelope, Transport};

/// One rank's incoming messages, in arrival order.
struct Mailbox {
    queue: Mutex<VecDeque<(Rank, Tag, Vec<u8>)>>,
}

/// An in-process fabric connecting `p` ranks through shared mailboxes.
///
/// Each rank gets a [`LocalTransport`] endpoint; a send copies the payload
/// into the destination's mailbox and completes immediately. Useful for
/// single-host runs and as the fabric under the end-to-end tests.
pub struct LocalFabric {
    boxes: Box<[Mailbox]>,
}

impl LocalFabric {
    /// Build a fabric of `ranks` endpoints, one per rank.
    pub fn create(ranks: usize) -> Vec<LocalTransport> {
        assert!(ranks > 0, "a fabric needs at least one rank");
        let fabric = Arc::new(LocalFabric {
            boxes: (0..ranks)
                .map(|_| Mailbox {
                    queue: Mutex::new(VecDeque::new()),
                })
                .collect(),
        });
        (0..ranks)
            .map(|rank| LocalTransport {
                fabric: Arc::clone(&fabric),
                rank,
            })
            .collect()
    }
}

/// One rank's endpoint into a [`LocalFabric`].
pub struct LocalTransport {
    fabric: Arc<LocalFabric>,
    rank: Rank,
}

/// A receive claimed from the mailbox, or still pending a match.
pub struct LocalRecv {
    buf: Option<Vec<u8>>,
    claimed: Option<Vec<u8>>,
    src: Rank,
    tag: Tag,
}

impl LocalTransport {
    /// Pop the oldest mailbox entry matching `(src, tag)`.
    fn claim(&self, src: Rank, tag: Tag) -> Option<Vec<u8>> {
        let mut queue = self.fabric.boxes[self.rank].queue.lock();
        let pos = queue.iter().position(|(s, t, _)| *s == src && *t == tag)?;
        queue.remove(pos).map(|(_, _, data)| data)
    }
}

impl Transport for LocalTransport {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn size(&self) -> usize {
        self.fabric.boxes.len()
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn probe(&self) -> Result<Option<Envelope>> {
        let queue = self.fabric.boxes[self.rank].queue.lock();
        Ok(queue.front().map(|(src, tag, data)| Envelope {
            src: *src,
            tag: *tag,
            len: data.len(),
        }))
    }

    fn post_send(&self, data: &[u8], dst: Rank, tag: Tag) -> Result<Self::SendHandle> {
        if dst >= self.size() {
            return Err(Error::Transport(format!(
                "send to rank {dst} in a {}-rank fabric",
                self.size()
            )));
        }
        self.fabric.boxes[dst]
            .queue
            .lock()
            .push_back((self.rank, tag, data.to_vec()));
        Ok(())
    }

    fn post_recv(&self, buf: Vec<u8>, src: Rank, tag: Tag) -> Result<Self::RecvHandle> {
        if src >= self.size() {
            return Err(Error::Transport(format!(
                "receive from rank {src} in a {}-rank fabric",
                self.size()
            )));
        }
        // Claim eagerly so a later probe reports the next message, the way
        // MPI matching consumes a probed message.
        let claimed = self.claim(src, tag);
        Ok(LocalRecv {
            buf: Some(buf),
            claimed,
            src,
            tag,
        })
    }

    fn test_send(&self, _handle: &mut Self::SendHandle) -> Result<bool> {
        // Sends complete at post time; the payload was copied out.
        Ok(true)
    }

    fn test_recv(&self, handle: &mut Self::RecvHandle) -> Result<Option<Vec<u8>>> {
        if handle.claimed.is_none() {
            handle.claimed = self.claim(handle.src, handle.tag);
        }
        let Some(data) = handle.claimed.take() else {
            return Ok(None);
        };
        let mut buf = match handle.buf.take() {
            Some(buf) => buf,
            None => {
                return Err(Error::Transport(
                    "receive handle polled after completion".into(),
                ))
            }
        };
        buf.clear();
        buf.extend_from_slice(&data);
        Ok(Some(buf))
    }
}
