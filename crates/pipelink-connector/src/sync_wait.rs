use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use pipelink_pipe::{MessagePipe, ReadinessWaker, WakerId};
use tracing::trace;

/// How often a blocked wait re-checks its cooperative stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a synchronous wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pipe became readable or the peer closed; reading will reveal
    /// which. The waiter may share the readiness signal with an armed
    /// async watcher, so the caller must tolerate a would-block read if the
    /// other path consumed the message first.
    Signaled,
    /// The cooperative stop flag was raised.
    Stopped,
}

/// Raises a waiter's stop flag from any thread.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<SyncWaitState>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        let _guard = self
            .state
            .signaled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.state.cond.notify_all();
    }
}

/// A secondary, synchronous notification path onto the same readiness
/// signal the async watcher uses.
///
/// Lets a nested call stack block on the pipe while the owning thread is
/// already inside the event loop, without disturbing the watcher's arming
/// discipline.
pub struct SyncWaiter {
    state: Arc<SyncWaitState>,
    pipe: Weak<dyn MessagePipe>,
    waker_id: Option<WakerId>,
}

struct SyncWaitState {
    signaled: Mutex<bool>,
    cond: Condvar,
    stop: AtomicBool,
}

impl ReadinessWaker for SyncWaitState {
    fn wake(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }
}

impl SyncWaiter {
    /// Register a waiter on a pipe. Readiness present before registration
    /// is not lost; `wait` re-checks the pipe's signals directly.
    pub fn new(pipe: &Arc<dyn MessagePipe>) -> Self {
        let state = Arc::new(SyncWaitState {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let waker_id = if pipe.is_open() {
            Some(pipe.add_waker(Arc::clone(&state) as Arc<dyn ReadinessWaker>))
        } else {
            None
        };
        Self {
            state,
            pipe: Arc::downgrade(pipe),
            waker_id,
        }
    }

    /// A handle that can raise the stop flag from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Block until the pipe signals readiness or the stop flag is raised.
    ///
    /// The stop flag is polled cooperatively on a bounded interval, so a
    /// raise is observed even if the notify races with entering the wait.
    pub fn wait(&self) -> WaitOutcome {
        loop {
            if self.state.stop.load(Ordering::SeqCst) {
                trace!("sync wait observed stop flag");
                return WaitOutcome::Stopped;
            }
            // Direct signal check covers readiness that predates our waker
            // registration, and a pipe that disappeared entirely.
            match self.pipe.upgrade() {
                Some(pipe) => {
                    let signals = pipe.query_signals();
                    if signals.readable || signals.peer_closed {
                        return WaitOutcome::Signaled;
                    }
                }
                None => return WaitOutcome::Signaled,
            }

            let mut signaled = self
                .state
                .signaled
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *signaled {
                *signaled = false;
                return WaitOutcome::Signaled;
            }
            let (guard, _timeout) = self
                .state
                .cond
                .wait_timeout(signaled, STOP_POLL_INTERVAL)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            drop(guard);
        }
    }
}

impl Drop for SyncWaiter {
    fn drop(&mut self) {
        if let (Some(pipe), Some(id)) = (self.pipe.upgrade(), self.waker_id) {
            pipe.remove_waker(id);
        }
    }
}

impl std::fmt::Debug for SyncWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWaiter")
            .field("stopped", &self.state.stop.load(Ordering::SeqCst))
            .finish()
    }
}
