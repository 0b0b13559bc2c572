use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ReadError, WaitError, WriteError};
use crate::message::Message;

/// Deadline for a blocking readability wait.
///
/// Only non-blocking polls and indefinite waits are supported. A partial
/// timeout is rejected with [`WaitError::DeadlineNotSupported`] rather than
/// silently rounded to one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Check readiness without blocking.
    Immediate,
    /// Block until readable or the peer closes.
    Indefinite,
    /// Unsupported; present so callers state their intent explicitly.
    Timeout(Duration),
}

/// Snapshot of an endpoint's current readiness, queried without blocking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalsState {
    /// At least one message is queued for reading.
    pub readable: bool,
    /// The peer endpoint is gone. Queued messages may still be readable.
    pub peer_closed: bool,
}

/// Identifies a readiness-waker registration on a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakerId(pub(crate) u64);

/// Callback fired when an endpoint becomes readable or its peer closes.
///
/// May be invoked from the thread that wrote the message or closed the
/// peer, so implementations must be cheap and must not call back into the
/// pipe.
pub trait ReadinessWaker: Send + Sync {
    fn wake(&self);
}

/// A bidirectional, message-framed, exclusively-owned communication handle.
///
/// This is the capability the connector layer consumes; implementations
/// are swappable without the consumer knowing concrete types.
pub trait MessagePipe: fmt::Debug + Send + Sync {
    /// Read the next queued message without blocking.
    fn try_read(&self) -> Result<Message, ReadError>;

    /// Write a message without blocking, transferring any attachments.
    fn try_write(&self, message: Message) -> Result<(), WriteError>;

    /// Block until readable, per the deadline.
    fn wait_readable(&self, deadline: Deadline) -> Result<(), WaitError>;

    /// Query current readiness without blocking.
    fn query_signals(&self) -> SignalsState;

    /// Subscribe a waker to readable / peer-closed transitions.
    ///
    /// Wakers registered on an already-closed endpoint never fire; callers
    /// are expected to check [`MessagePipe::query_signals`] after
    /// subscribing.
    fn add_waker(&self, waker: Arc<dyn ReadinessWaker>) -> WakerId;

    /// Remove a previously registered waker. Unknown ids are ignored.
    fn remove_waker(&self, id: WakerId);

    /// Close this end. Idempotent. Wakes the peer's wakers.
    fn close(&self);

    /// Whether this end is still open locally.
    fn is_open(&self) -> bool;
}

impl dyn MessagePipe {
    /// Convenience: whether a message is currently readable.
    pub fn query_readable(&self) -> bool {
        self.query_signals().readable
    }
}
