/// Errors a non-blocking read can report.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// No message is ready right now. Not a failure; try again after a
    /// readiness notification.
    #[error("no message ready")]
    WouldBlock,

    /// The peer endpoint is gone and the inbound queue is drained.
    #[error("peer closed")]
    Closed,

    /// The endpoint itself is unusable (e.g. closed locally).
    #[error("pipe failure: {0}")]
    Fatal(String),
}

/// Errors a non-blocking write can report.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// An attached handle is in a non-transferable state (e.g. currently
    /// watched). Per-message failure; the channel itself remains usable.
    #[error("attached handle is busy and cannot be transferred")]
    Busy,

    /// The message itself was rejected (e.g. a closed handle attached).
    /// Per-message failure; the channel itself remains usable.
    #[error("message rejected: {0}")]
    InvalidMessage(String),

    /// The peer endpoint is gone; the message cannot be delivered.
    #[error("peer closed")]
    Closed,

    /// The endpoint itself is unusable (e.g. closed locally).
    #[error("pipe failure: {0}")]
    Fatal(String),
}

/// Errors a blocking readability wait can report.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Immediate deadline and nothing is readable.
    #[error("no message ready")]
    WouldBlock,

    /// The peer endpoint is gone and the inbound queue is drained.
    #[error("peer closed")]
    Closed,

    /// Partial timeouts are deliberately unsupported; only immediate and
    /// indefinite deadlines exist.
    #[error("partial wait deadlines are not supported")]
    DeadlineNotSupported,

    /// The endpoint itself is unusable (e.g. closed locally).
    #[error("pipe failure: {0}")]
    Fatal(String),
}

pub type Result<T, E = ReadError> = std::result::Result<T, E>;
