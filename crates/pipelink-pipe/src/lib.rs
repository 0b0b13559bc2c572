//! Message-framed pipe handles with readiness notification.
//!
//! This is the handle layer of pipelink. A pipe endpoint moves discrete
//! framed messages (not byte streams) in both directions:
//! - Non-blocking `try_read` / `try_write`
//! - A blocking `wait_readable` primitive (immediate or indefinite only)
//! - Readiness-waker subscription, fired on message arrival and peer close
//!
//! Messages carry an opaque payload plus zero or more attached endpoints,
//! so a pipe can be transferred through another pipe.

pub mod error;
pub mod local;
pub mod message;
pub mod pipe;

pub use error::{ReadError, Result, WaitError, WriteError};
pub use local::{closed_placeholder, pipe_pair, PipeEndpoint};
pub use message::Message;
pub use pipe::{Deadline, MessagePipe, ReadinessWaker, SignalsState, WakerId};
