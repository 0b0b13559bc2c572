use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pipelink_pipe::{MessagePipe, ReadinessWaker, WakerId};
use tracing::{debug, trace};

use crate::runner::TaskRunner;

/// What a watch notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// The pipe has a readable message (or the peer closed; reading will
    /// reveal which).
    Readable,
    /// The watch could not be established; the handle is unusable.
    Unwatchable,
}

/// Outcome of an arming attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStatus {
    /// Armed; the callback fires on the next readiness transition.
    Armed,
    /// The condition is already satisfiable; nothing was armed.
    AlreadyReadable,
    /// The watcher was cancelled (or its pipe is gone).
    Cancelled,
}

type WatchCallback = Box<dyn Fn(WatchStatus) + Send + Sync>;

/// Bridges "pipe is now readable" to a single callback invocation, with
/// explicit re-arming.
///
/// The watcher delivers one notification per arming; it never auto-repeats.
/// Notifications and watch failures are always delivered through the task
/// runner, never inside the call that established the watch, so
/// state-changing callbacks cannot re-enter their caller's stack.
pub struct PipeWatcher {
    state: Arc<WatcherState>,
}

struct WatcherState {
    runner: TaskRunner,
    armed: AtomicBool,
    cancelled: AtomicBool,
    callback: WatchCallback,
    pipe: Mutex<Option<(Weak<dyn MessagePipe>, WakerId)>>,
}

/// The waker registered with the pipe; holds the shared watcher state so a
/// firing can outlive the `PipeWatcher` handle without dangling.
struct WatcherWake {
    state: Arc<WatcherState>,
}

impl ReadinessWaker for WatcherWake {
    fn wake(&self) {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return;
        }
        // One notification per arming: only the waker invocation that
        // observes the armed flag set gets to post.
        if self.state.armed.swap(false, Ordering::SeqCst) {
            trace!("watcher fired; posting notification");
            let state = Arc::clone(&self.state);
            self.state
                .runner
                .post(move || state.deliver(WatchStatus::Readable));
        }
    }
}

impl WatcherState {
    fn deliver(&self, status: WatchStatus) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        (self.callback)(status);
    }
}

impl PipeWatcher {
    /// Watch a pipe for readability.
    ///
    /// If the pipe is already unusable (closed locally), the failure is
    /// surfaced by a deferred `Unwatchable` callback rather than
    /// synchronously.
    pub fn watch(
        pipe: &Arc<dyn MessagePipe>,
        runner: TaskRunner,
        callback: impl Fn(WatchStatus) + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(WatcherState {
            runner: runner.clone(),
            armed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            callback: Box::new(callback),
            pipe: Mutex::new(None),
        });

        if pipe.is_open() {
            let waker_id = pipe.add_waker(Arc::new(WatcherWake {
                state: Arc::clone(&state),
            }));
            *state
                .pipe
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                Some((Arc::downgrade(pipe), waker_id));
        } else {
            debug!("watch target already closed; deferring failure callback");
            let deferred = Arc::clone(&state);
            runner.post(move || deferred.deliver(WatchStatus::Unwatchable));
        }

        Self { state }
    }

    /// Arm the watcher: the two-phase check-then-arm primitive.
    ///
    /// Returns [`ArmStatus::AlreadyReadable`] when the condition is already
    /// satisfiable, in which case nothing was armed and the caller decides
    /// how to consume the readiness. A readiness transition racing with the
    /// arm resolves toward notification, never a lost wakeup.
    pub fn arm(&self) -> ArmStatus {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return ArmStatus::Cancelled;
        }
        let pipe = {
            let slot = self
                .state
                .pipe
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.as_ref().and_then(|(pipe, _)| pipe.upgrade())
        };
        let Some(pipe) = pipe else {
            return ArmStatus::Cancelled;
        };

        // Arm first, then check: a message arriving between the check and
        // the arm would otherwise be lost. If the check sees readiness we
        // try to take the arming back; losing that race means the waker
        // already claimed it and a notification is on its way.
        self.state.armed.store(true, Ordering::SeqCst);
        let signals = pipe.query_signals();
        if signals.readable || signals.peer_closed {
            if self.state.armed.swap(false, Ordering::SeqCst) {
                ArmStatus::AlreadyReadable
            } else {
                ArmStatus::Armed
            }
        } else {
            ArmStatus::Armed
        }
    }

    /// Arm, or schedule a notification if the condition is already
    /// satisfiable. The notification runs on a fresh runner turn.
    pub fn arm_or_notify(&self) -> ArmStatus {
        let status = self.arm();
        if status == ArmStatus::AlreadyReadable {
            trace!("arm found pipe already readable; posting notification");
            let state = Arc::clone(&self.state);
            self.state
                .runner
                .post(move || state.deliver(WatchStatus::Readable));
        }
        status
    }

    /// Stop watching. Idempotent; pending posted notifications no-op.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.armed.store(false, Ordering::SeqCst);
        let registration = self
            .state
            .pipe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((pipe, waker_id)) = registration {
            if let Some(pipe) = pipe.upgrade() {
                pipe.remove_waker(waker_id);
            }
        }
        debug!("watcher cancelled");
    }
}

impl Drop for PipeWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PipeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWatcher")
            .field("armed", &self.state.armed.load(Ordering::SeqCst))
            .field("cancelled", &self.state.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}
