//! Channel links carrying encoded batches
//!
//! Every boundary in the engine (control, timeouts, sources) is a channel of
//! encoded batches. Whatever sits at the far end, a thread or a pipe bridge,
//! only sees bytes.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};

use operant_core::{Event, OperantError, OperantResult};

use crate::encode_batches;

/// Sending half of a batch link
pub trait Outlet: Send {
    /// Send one encoded batch
    fn send(&self, batch: Bytes) -> OperantResult<()>;

    /// Encode and send events as one batch (split only above the batch limit).
    /// Nothing is sent if any event cannot be encoded.
    fn send_events(&self, events: &[Event]) -> OperantResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        for batch in encode_batches(events)? {
            self.send(batch)?;
        }
        Ok(())
    }
}

impl Outlet for Sender<Bytes> {
    fn send(&self, batch: Bytes) -> OperantResult<()> {
        Sender::send(self, batch).map_err(|_| OperantError::LinkClosed)
    }
}

impl<O: Outlet + Sync + ?Sized> Outlet for std::sync::Arc<O> {
    fn send(&self, batch: Bytes) -> OperantResult<()> {
        (**self).send(batch)
    }
}

/// Sending half of a link
pub type LinkSender = Sender<Bytes>;

/// Receiving half of a link
pub type LinkReceiver = Receiver<Bytes>;

/// Create an unbounded batch link
pub fn link() -> (LinkSender, LinkReceiver) {
    channel::unbounded()
}

/// Create a bounded batch link. `send` blocks when it is full; `try_send` does not.
pub fn bounded_link(capacity: usize) -> (LinkSender, LinkReceiver) {
    channel::bounded(capacity)
}
