use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use pipelink_pipe::{
    closed_placeholder, Deadline, Message, MessagePipe, ReadError, WriteError,
};
use tracing::{debug, trace, warn};

use crate::epoch::EpochCell;
use crate::error::{ConnectorError, Result};
use crate::runner::TaskRunner;
use crate::sync_wait::{SyncWaiter, WaitOutcome};
use crate::watcher::{ArmStatus, PipeWatcher, WatchStatus};

/// Consumer of successfully read messages.
///
/// `accept` may re-enter the connector (send, pause, even destroy it);
/// implementations use interior mutability for their own state.
pub trait MessageReceiver: Send + Sync {
    /// Consume one message. Returning `false` rejects it; whether a
    /// rejection escalates to a channel error is governed by
    /// [`ConnectorConfig::enforce_errors_from_receiver`].
    fn accept(&self, message: Message) -> bool;
}

/// Threading discipline for outbound sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// All operations, including `accept`, are restricted to the owning
    /// thread.
    SingleThreaded,
    /// `accept` may be called from any thread; the internal pipe lock
    /// serializes concurrent senders. Every other operation remains
    /// thread-affine.
    MultiThreaded,
}

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub send_mode: SendMode,
    /// Treat a receiver returning `false` as a fatal channel error.
    pub enforce_errors_from_receiver: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            send_mode: SendMode::SingleThreaded,
            enforce_errors_from_receiver: false,
        }
    }
}

/// Runtime thread-affinity guard. The type system cannot express "one
/// designated thread plus a lock-guarded exception", so this is checked at
/// call time.
#[derive(Debug)]
struct ThreadChecker {
    owner: ThreadId,
}

impl ThreadChecker {
    fn new() -> Self {
        Self {
            owner: std::thread::current().id(),
        }
    }

    fn check(&self, operation: &str) {
        assert_eq!(
            std::thread::current().id(),
            self.owner,
            "connector operation `{operation}` called from a non-owning thread"
        );
    }
}

/// Binds one message pipe to one optional receiver and manages the
/// read/write/error/pause state machine.
///
/// Inbound messages are dispatched when the owning thread pumps the
/// [`TaskRunner`] the connector was built with. Outbound messages go
/// through [`Connector::accept`]. Once the peer is known gone, writes are
/// silently swallowed (`drop_writes`) so a backlog of queued sends does
/// not cascade into redundant error handling; failures surface through the
/// error callback instead, exactly once.
pub struct Connector {
    shared: Arc<Shared>,
}

struct Shared {
    runner: TaskRunner,
    affinity: ThreadChecker,
    config: ConnectorConfig,
    epoch: EpochCell,
    paused: AtomicBool,
    error: AtomicBool,
    drop_writes: AtomicBool,
    nested_dispatch: AtomicBool,
    /// `None` once the pipe has been detached via `take_pipe`. The lock
    /// doubles as the multi-threaded send lock.
    pipe: Mutex<Option<Arc<dyn MessagePipe>>>,
    receiver: Mutex<Option<Arc<dyn MessageReceiver>>>,
    error_handler: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    watcher: Mutex<Option<PipeWatcher>>,
}

enum ReadOneOutcome {
    Dispatched,
    WouldBlock,
    Stopped,
}

impl Connector {
    /// Bind a connector to a live pipe with default configuration.
    ///
    /// The initial watcher is registered immediately — before any receiver
    /// is set — so a peer that closes early is detected early.
    pub fn new(pipe: Arc<dyn MessagePipe>, runner: TaskRunner) -> Self {
        Self::with_config(pipe, runner, ConnectorConfig::default())
    }

    /// Bind a connector with explicit configuration.
    pub fn with_config(
        pipe: Arc<dyn MessagePipe>,
        runner: TaskRunner,
        config: ConnectorConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            runner,
            affinity: ThreadChecker::new(),
            config,
            epoch: EpochCell::new(),
            paused: AtomicBool::new(false),
            error: AtomicBool::new(false),
            drop_writes: AtomicBool::new(false),
            nested_dispatch: AtomicBool::new(false),
            pipe: Mutex::new(Some(pipe)),
            receiver: Mutex::new(None),
            error_handler: Mutex::new(None),
            watcher: Mutex::new(None),
        });
        debug!(send_mode = ?shared.config.send_mode, "connector bound to pipe");
        Shared::start_watching(&shared);
        Self { shared }
    }

    /// Attach the receiver that consumes inbound messages. Messages that
    /// arrived while no receiver was set are dispatched on the next runner
    /// turn.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.shared.affinity.check("set_receiver");
        *self.shared.lock_receiver() = Some(receiver);

        // Restart a dispatch that parked for want of a receiver.
        let weak = Arc::downgrade(&self.shared);
        self.shared.runner.post(move || {
            if let Some(shared) = weak.upgrade() {
                if !shared.error.load(Ordering::SeqCst) && !shared.paused.load(Ordering::SeqCst) {
                    Shared::read_all_available(&shared);
                }
            }
        });
    }

    /// Detach the receiver. In-flight dispatch completes; nothing further
    /// is delivered until a receiver is set again.
    pub fn detach_receiver(&self) {
        self.shared.affinity.check("detach_receiver");
        self.shared.lock_receiver().take();
    }

    /// Register the error callback. Invoked at most once per connector
    /// lifetime, on the owning thread.
    pub fn set_error_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.affinity.check("set_error_handler");
        *self.shared.lock_error_handler() = Some(Box::new(handler));
    }

    /// Write a message to the pipe.
    ///
    /// Returns `true` on success *and* when the write was silently dropped
    /// because the peer is known gone — failure is surfaced through the
    /// error callback, not through write return values. Returns `false`
    /// for per-message rejections (busy or malformed attachments) and
    /// after the connector has errored.
    pub fn accept(&self, message: Message) -> bool {
        if self.shared.config.send_mode == SendMode::SingleThreaded {
            self.shared.affinity.check("accept");
        }
        self.shared.accept(message)
    }

    /// Synchronously wait for one inbound message and dispatch it.
    ///
    /// Only [`Deadline::Immediate`] and [`Deadline::Indefinite`] are
    /// supported; partial timeouts are a deliberate error. Auto-resumes a
    /// paused connector. Returns `Ok(true)` once exactly one message has
    /// been dispatched, `Ok(false)` if the connector is (or becomes)
    /// errored, or immediately when polling finds nothing.
    pub fn wait_for_incoming_message(&self, deadline: Deadline) -> Result<bool> {
        self.shared.affinity.check("wait_for_incoming_message");
        let block = match deadline {
            Deadline::Immediate => false,
            Deadline::Indefinite => true,
            Deadline::Timeout(_) => return Err(ConnectorError::DeadlineNotSupported),
        };
        if self.shared.error.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Shared::resume(&self.shared);

        let Some(pipe) = self.shared.current_pipe() else {
            return Ok(false);
        };

        if !block {
            return Ok(matches!(
                Shared::read_one_sync(&self.shared),
                ReadOneOutcome::Dispatched
            ));
        }

        let waiter = SyncWaiter::new(&pipe);
        loop {
            if self.shared.error.load(Ordering::SeqCst) {
                return Ok(false);
            }
            match waiter.wait() {
                WaitOutcome::Stopped => return Ok(false),
                WaitOutcome::Signaled => {}
            }
            match Shared::read_one_sync(&self.shared) {
                ReadOneOutcome::Dispatched => return Ok(true),
                // Lost the race to another reader; wait again.
                ReadOneOutcome::WouldBlock => continue,
                ReadOneOutcome::Stopped => return Ok(false),
            }
        }
    }

    /// Stop reading and arming. Idempotent. The pipe stays open; messages
    /// queue up on the peer side of the pause.
    pub fn pause(&self) {
        self.shared.affinity.check("pause");
        if self.shared.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel_watch();
        debug!("incoming dispatch paused");
    }

    /// Resume reading exactly where dispatch left off. Idempotent.
    pub fn resume(&self) {
        self.shared.affinity.check("resume");
        Shared::resume(&self.shared);
    }

    /// Force the channel into the error state, as if a fatal read error
    /// had been detected. The pipe is reset and the error callback runs
    /// synchronously (deferred only if paused).
    pub fn raise_error(&self) {
        self.shared.affinity.check("raise_error");
        Shared::handle_error(&self.shared, true, false);
    }

    /// Control whether the watcher is re-armed before each message is
    /// dispatched (letting a receiver that pumps the runner observe the
    /// next message mid-callback) or only after the backlog drains.
    pub fn set_nested_dispatch_enabled(&self, enabled: bool) {
        self.shared.affinity.check("set_nested_dispatch_enabled");
        self.shared.nested_dispatch.store(enabled, Ordering::SeqCst);
    }

    /// Detach and return the pipe, cancelling all watches and disarming
    /// dispatch. Subsequent operations on the connector are safe no-ops.
    pub fn take_pipe(&self) -> Option<Arc<dyn MessagePipe>> {
        self.shared.affinity.check("take_pipe");
        self.shared.epoch.invalidate();
        self.shared.cancel_watch();
        debug!("pipe detached from connector");
        self.shared.lock_pipe().take()
    }

    /// Whether the connector has entered the terminal error state.
    pub fn encountered_error(&self) -> bool {
        self.shared.error.load(Ordering::SeqCst)
    }

    /// Whether incoming dispatch is currently paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Whether outbound writes are being silently discarded.
    pub fn drops_writes(&self) -> bool {
        self.shared.drop_writes.load(Ordering::SeqCst)
    }

    /// The send mode this connector was built with.
    pub fn send_mode(&self) -> SendMode {
        self.shared.config.send_mode
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        // Stop any in-flight read loop from touching state after us.
        self.shared.epoch.invalidate();
        // Fast path: an errored connector has no armed watches left.
        if !self.shared.error.load(Ordering::SeqCst) {
            self.shared.cancel_watch();
        }
        let pipe = self.shared.lock_pipe().take();
        self.shared.lock_receiver().take();
        self.shared.lock_error_handler().take();
        if let Some(pipe) = pipe {
            pipe.close();
        }
        debug!("connector destroyed");
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("error", &self.encountered_error())
            .field("paused", &self.is_paused())
            .field("drop_writes", &self.drops_writes())
            .field("send_mode", &self.send_mode())
            .finish()
    }
}

impl Shared {
    fn lock_pipe(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn MessagePipe>>> {
        self.pipe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_receiver(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn MessageReceiver>>> {
        self.receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_error_handler(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<Box<dyn FnOnce() + Send>>> {
        self.error_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<PipeWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_pipe(&self) -> Option<Arc<dyn MessagePipe>> {
        self.lock_pipe().clone()
    }

    fn accept(&self, message: Message) -> bool {
        // Peer-gone writes are swallowed even after the error callback has
        // fired: failure is reported through the error path exactly once,
        // never through write return values.
        if self.drop_writes.load(Ordering::SeqCst) {
            return true;
        }
        if self.error.load(Ordering::SeqCst) {
            return false;
        }

        // Held across the write; this is the multi-threaded send lock.
        let pipe = self.lock_pipe();
        let Some(pipe) = pipe.as_ref() else {
            return true;
        };
        match pipe.try_write(message) {
            Ok(()) => true,
            Err(WriteError::Closed) => {
                // Peer gone. Not an error yet — the read side surfaces it;
                // meanwhile the outbound backlog drains silently.
                self.drop_writes.store(true, Ordering::SeqCst);
                debug!("peer gone on write; dropping subsequent writes");
                true
            }
            Err(err @ (WriteError::Busy | WriteError::InvalidMessage(_))) => {
                warn!(error = %err, "write rejected; channel remains usable");
                false
            }
            Err(WriteError::Fatal(err)) => {
                warn!(error = %err, "write failed");
                false
            }
        }
    }

    /// (Re-)establish the watcher on the current pipe and arm it. Readiness
    /// already present is delivered on a fresh runner turn, never inside
    /// this call.
    fn start_watching(shared: &Arc<Self>) {
        let Some(pipe) = shared.current_pipe() else {
            return;
        };
        let weak = Arc::downgrade(shared);
        let watcher = PipeWatcher::watch(&pipe, shared.runner.clone(), move |status| {
            if let Some(shared) = weak.upgrade() {
                Shared::on_watch_event(&shared, status);
            }
        });
        watcher.arm_or_notify();
        if let Some(previous) = shared.lock_watcher().replace(watcher) {
            previous.cancel();
        }
    }

    fn cancel_watch(&self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.cancel();
        }
    }

    fn resume(shared: &Arc<Self>) {
        if !shared.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if shared.error.load(Ordering::SeqCst) {
            return;
        }
        Shared::start_watching(shared);
        debug!("incoming dispatch resumed");
    }

    fn on_watch_event(shared: &Arc<Self>, status: WatchStatus) {
        if shared.error.load(Ordering::SeqCst) || shared.paused.load(Ordering::SeqCst) {
            return;
        }
        match status {
            WatchStatus::Unwatchable => Shared::handle_error(shared, false, false),
            WatchStatus::Readable => Shared::read_all_available(shared),
        }
    }

    /// Drain the pipe's readable backlog, dispatching each message in
    /// order, then re-arm the watcher. Invoked on the owning thread from a
    /// watcher notification.
    fn read_all_available(shared: &Arc<Self>) {
        loop {
            if shared.error.load(Ordering::SeqCst) || shared.paused.load(Ordering::SeqCst) {
                return;
            }
            let Some(pipe) = shared.current_pipe() else {
                return;
            };

            // Never consume a message no one is there to take: park until
            // set_receiver restarts the drain. Close detection still works
            // because an empty closed pipe reads as Closed below.
            if shared.lock_receiver().is_none() && pipe.query_signals().readable {
                trace!("pipe readable with no receiver; parking dispatch");
                return;
            }

            match pipe.try_read() {
                Ok(message) => {
                    if shared.nested_dispatch.load(Ordering::SeqCst) {
                        // Re-arm before dispatch so a nested runner pump
                        // inside the receiver observes the next message.
                        // One message per notification in this mode.
                        if let Some(watcher) = shared.lock_watcher().as_ref() {
                            watcher.arm_or_notify();
                        }
                        Shared::dispatch(shared, message);
                        return;
                    }
                    if !Shared::dispatch(shared, message) {
                        return;
                    }
                }
                Err(ReadError::WouldBlock) => {
                    // Re-arm. If more data squeezed in between the read and
                    // the arm, keep draining instead of waiting for a
                    // notification that already fired.
                    let status = shared.lock_watcher().as_ref().map(PipeWatcher::arm);
                    match status {
                        Some(ArmStatus::AlreadyReadable) => continue,
                        Some(ArmStatus::Armed) | Some(ArmStatus::Cancelled) | None => return,
                    }
                }
                Err(ReadError::Closed) => {
                    // Peer gone: writes turn into silent drops, reads stop.
                    shared.drop_writes.store(true, Ordering::SeqCst);
                    Shared::handle_error(shared, false, false);
                    return;
                }
                Err(ReadError::Fatal(err)) => {
                    warn!(error = %err, "fatal pipe read error");
                    Shared::handle_error(shared, true, false);
                    return;
                }
            }
        }
    }

    /// Read and dispatch at most one message, for the synchronous wait
    /// path. Errors are resolved within this call.
    fn read_one_sync(shared: &Arc<Self>) -> ReadOneOutcome {
        if shared.error.load(Ordering::SeqCst) {
            return ReadOneOutcome::Stopped;
        }
        let Some(pipe) = shared.current_pipe() else {
            return ReadOneOutcome::Stopped;
        };
        if shared.lock_receiver().is_none() {
            warn!("synchronous wait with no receiver attached");
            return ReadOneOutcome::Stopped;
        }

        match pipe.try_read() {
            Ok(message) => {
                Shared::dispatch(shared, message);
                ReadOneOutcome::Dispatched
            }
            Err(ReadError::WouldBlock) => ReadOneOutcome::WouldBlock,
            Err(ReadError::Closed) => {
                shared.drop_writes.store(true, Ordering::SeqCst);
                Shared::handle_error(shared, false, false);
                ReadOneOutcome::Stopped
            }
            Err(ReadError::Fatal(err)) => {
                warn!(error = %err, "fatal pipe read error");
                Shared::handle_error(shared, true, false);
                ReadOneOutcome::Stopped
            }
        }
    }

    /// Hand one message to the receiver. Returns whether the caller may
    /// keep draining: `false` after cancellation, escalation, or pause.
    fn dispatch(shared: &Arc<Self>, message: Message) -> bool {
        let receiver = { shared.lock_receiver().clone() };
        let Some(receiver) = receiver else {
            warn!("message read with no receiver attached; dropping");
            return false;
        };

        // The receiver may destroy the connector or detach the pipe from
        // inside `accept`; snapshot the epoch so we can tell.
        let snapshot = shared.epoch.snapshot();
        let accepted = receiver.accept(message);
        if !shared.epoch.is_current(snapshot) {
            trace!("connector torn down during dispatch; stopping drain");
            return false;
        }
        if !accepted && shared.config.enforce_errors_from_receiver {
            debug!("receiver rejected message; escalating to channel error");
            Shared::handle_error(shared, true, false);
            return false;
        }
        // A receiver that paused us mid-drain must take effect immediately.
        !shared.paused.load(Ordering::SeqCst) && !shared.error.load(Ordering::SeqCst)
    }

    /// The single error-handling procedure. Fatal conditions funnel here
    /// from every path; the error callback fires exactly once.
    fn handle_error(shared: &Arc<Self>, mut force_pipe_reset: bool, mut force_async: bool) {
        if shared.error.load(Ordering::SeqCst) {
            return;
        }
        if shared.lock_pipe().is_none() {
            return;
        }
        if shared.paused.load(Ordering::SeqCst) {
            // The owner asked not to be interrupted; defer until resumed.
            force_async = true;
        }
        if force_async {
            force_pipe_reset = true;
        }

        shared.cancel_watch();
        if force_pipe_reset {
            let placeholder: Arc<dyn MessagePipe> = Arc::new(closed_placeholder());
            let old = shared.lock_pipe().replace(placeholder);
            if let Some(old) = old {
                old.close();
            }
            debug!("pipe reset to closed placeholder");
        }

        if force_async {
            // Arm the placeholder: its peer is already gone, so the
            // notification arrives on a fresh runner turn and re-enters
            // this procedure without the force flags.
            if !shared.paused.load(Ordering::SeqCst) {
                Shared::start_watching(shared);
            }
            return;
        }

        shared.error.store(true, Ordering::SeqCst);
        debug!("connector entered error state");
        let handler = shared.lock_error_handler().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}
