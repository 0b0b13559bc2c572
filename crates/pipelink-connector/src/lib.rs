//! Asynchronous, bidirectional message-pipe connector.
//!
//! A [`Connector`] binds one message pipe to one optional
//! [`MessageReceiver`] and manages:
//! - Outbound writes via [`Connector::accept`], with peer-gone writes
//!   silently dropped instead of cascading into redundant errors
//! - Inbound dispatch driven by a manually re-armed readiness watcher
//! - A reentrant synchronous wait mode for nested call stacks
//! - A sticky error state with an exactly-once error callback
//!
//! All mutating operations are thread-affine to the constructing thread,
//! enforced at runtime; the sole exception is `accept` in multi-threaded
//! send mode.

pub mod connector;
pub mod epoch;
pub mod error;
pub mod runner;
pub mod sync_wait;
pub mod watcher;

pub use connector::{Connector, ConnectorConfig, MessageReceiver, SendMode};
pub use epoch::EpochCell;
pub use error::{ConnectorError, Result};
pub use runner::TaskRunner;
pub use sync_wait::{StopHandle, SyncWaiter, WaitOutcome};
pub use watcher::{ArmStatus, PipeWatcher, WatchStatus};
