use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{debug, trace};

use crate::error::{ReadError, WaitError, WriteError};
use crate::message::Message;
use crate::pipe::{Deadline, MessagePipe, ReadinessWaker, SignalsState, WakerId};

/// One end of an in-process message pipe.
///
/// Each endpoint owns its inbound queue; writing goes straight into the
/// peer's queue. FIFO order is preserved per direction. Closing (or
/// dropping) an endpoint marks the peer closed and fires the peer's
/// registered wakers.
pub struct PipeEndpoint {
    state: Arc<EndpointShared>,
    peer: Weak<EndpointShared>,
}

struct EndpointShared {
    inner: Mutex<EndpointInner>,
    readable: Condvar,
}

struct EndpointInner {
    queue: VecDeque<Message>,
    /// This end was closed locally.
    closed: bool,
    /// The peer end is gone.
    peer_closed: bool,
    wakers: Vec<(WakerId, Arc<dyn ReadinessWaker>)>,
    next_waker: u64,
}

/// Create a connected pair of endpoints.
pub fn pipe_pair() -> (PipeEndpoint, PipeEndpoint) {
    let a = Arc::new(EndpointShared::new());
    let b = Arc::new(EndpointShared::new());
    debug!("created in-process pipe pair");
    (
        PipeEndpoint {
            state: Arc::clone(&a),
            peer: Arc::downgrade(&b),
        },
        PipeEndpoint {
            state: b,
            peer: Arc::downgrade(&a),
        },
    )
}

/// A valid endpoint whose peer is already gone.
///
/// Reads report `Closed`, writes report `Closed`, and arming a watcher on
/// it yields an immediate peer-closed condition. Used as the placeholder a
/// connector swaps in after a pipe reset so later operations are safe
/// no-ops instead of undefined behavior.
pub fn closed_placeholder() -> PipeEndpoint {
    let (endpoint, peer) = pipe_pair();
    drop(peer);
    endpoint
}

impl EndpointShared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(EndpointInner {
                queue: VecDeque::new(),
                closed: false,
                peer_closed: false,
                wakers: Vec::new(),
                next_waker: 1,
            }),
            readable: Condvar::new(),
        }
    }

    /// Snapshot the registered wakers so they can be fired without holding
    /// the endpoint lock.
    fn take_waker_snapshot(inner: &EndpointInner) -> Vec<Arc<dyn ReadinessWaker>> {
        inner.wakers.iter().map(|(_, w)| Arc::clone(w)).collect()
    }
}

impl PipeEndpoint {
    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointInner> {
        self.state
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether this endpoint is currently watched. A watched endpoint is
    /// in a non-transferable state and cannot be attached to a message.
    fn in_use(&self) -> bool {
        !self.lock().wakers.is_empty()
    }

    fn close_impl(&self) {
        let own_wakers;
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            own_wakers = EndpointShared::take_waker_snapshot(&inner);
            self.state.readable.notify_all();
        }
        debug!("pipe endpoint closed");

        // Tell the peer we are gone.
        if let Some(peer) = self.peer.upgrade() {
            let peer_wakers;
            {
                let mut peer_inner = peer
                    .inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                peer_inner.peer_closed = true;
                peer_wakers = EndpointShared::take_waker_snapshot(&peer_inner);
                peer.readable.notify_all();
            }
            for waker in peer_wakers {
                waker.wake();
            }
        }

        for waker in own_wakers {
            waker.wake();
        }
    }
}

impl MessagePipe for PipeEndpoint {
    fn try_read(&self) -> Result<Message, ReadError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ReadError::Fatal("endpoint closed locally".into()));
        }
        if let Some(message) = inner.queue.pop_front() {
            trace!(remaining = inner.queue.len(), "dequeued message");
            return Ok(message);
        }
        if inner.peer_closed {
            Err(ReadError::Closed)
        } else {
            Err(ReadError::WouldBlock)
        }
    }

    fn try_write(&self, message: Message) -> Result<(), WriteError> {
        if self.lock().closed {
            return Err(WriteError::Fatal("endpoint closed locally".into()));
        }
        for handle in message.handles() {
            if !handle.is_open() {
                return Err(WriteError::InvalidMessage(
                    "attached handle is closed".into(),
                ));
            }
            if handle.in_use() {
                return Err(WriteError::Busy);
            }
        }

        let Some(peer) = self.peer.upgrade() else {
            return Err(WriteError::Closed);
        };
        let wakers;
        {
            let mut peer_inner = peer
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if peer_inner.closed {
                return Err(WriteError::Closed);
            }
            trace!(
                payload_len = message.payload().len(),
                handles = message.handles().len(),
                "queued message for peer"
            );
            peer_inner.queue.push_back(message);
            wakers = EndpointShared::take_waker_snapshot(&peer_inner);
            peer.readable.notify_all();
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    fn wait_readable(&self, deadline: Deadline) -> Result<(), WaitError> {
        match deadline {
            Deadline::Timeout(_) => return Err(WaitError::DeadlineNotSupported),
            Deadline::Immediate => {
                let inner = self.lock();
                if inner.closed {
                    return Err(WaitError::Fatal("endpoint closed locally".into()));
                }
                if !inner.queue.is_empty() {
                    Ok(())
                } else if inner.peer_closed {
                    Err(WaitError::Closed)
                } else {
                    Err(WaitError::WouldBlock)
                }
            }
            Deadline::Indefinite => {
                let mut inner = self.lock();
                while inner.queue.is_empty() && !inner.peer_closed && !inner.closed {
                    inner = self
                        .state
                        .readable
                        .wait(inner)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if inner.closed {
                    Err(WaitError::Fatal("endpoint closed locally".into()))
                } else if !inner.queue.is_empty() {
                    Ok(())
                } else {
                    Err(WaitError::Closed)
                }
            }
        }
    }

    fn query_signals(&self) -> SignalsState {
        let inner = self.lock();
        SignalsState {
            readable: !inner.queue.is_empty(),
            peer_closed: inner.peer_closed,
        }
    }

    fn add_waker(&self, waker: Arc<dyn ReadinessWaker>) -> WakerId {
        let mut inner = self.lock();
        let id = WakerId(inner.next_waker);
        inner.next_waker += 1;
        if !inner.closed {
            inner.wakers.push((id, waker));
        }
        id
    }

    fn remove_waker(&self, id: WakerId) {
        self.lock().wakers.retain(|(waker_id, _)| *waker_id != id);
    }

    fn close(&self) {
        self.close_impl();
    }

    fn is_open(&self) -> bool {
        !self.lock().closed
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.close_impl();
    }
}

impl fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("PipeEndpoint")
            .field("queued", &inner.queue.len())
            .field("closed", &inner.closed)
            .field("peer_closed", &inner.peer_closed)
            .field("wakers", &inner.wakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountingWaker(AtomicUsize);

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl ReadinessWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn roundtrip_preserves_fifo_order() {
        let (a, b) = pipe_pair();
        a.try_write(Message::new("one")).unwrap();
        a.try_write(Message::new("two")).unwrap();
        a.try_write(Message::new("three")).unwrap();

        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"one");
        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"two");
        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"three");
        assert!(matches!(b.try_read(), Err(ReadError::WouldBlock)));
    }

    #[test]
    fn read_empty_pipe_would_block() {
        let (_a, b) = pipe_pair();
        assert!(matches!(b.try_read(), Err(ReadError::WouldBlock)));
    }

    #[test]
    fn backlog_drains_after_peer_close() {
        let (a, b) = pipe_pair();
        a.try_write(Message::new("last words")).unwrap();
        drop(a);

        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"last words");
        assert!(matches!(b.try_read(), Err(ReadError::Closed)));
    }

    #[test]
    fn write_to_closed_peer_reports_closed() {
        let (a, b) = pipe_pair();
        drop(b);
        let err = a.try_write(Message::new("into the void")).unwrap_err();
        assert!(matches!(err, WriteError::Closed));
    }

    #[test]
    fn write_after_peer_close_local_reports_closed() {
        let (a, b) = pipe_pair();
        b.close();
        let err = a.try_write(Message::new("x")).unwrap_err();
        assert!(matches!(err, WriteError::Closed));
        // b is still alive; the write must not have landed in its queue.
        assert!(!b.query_signals().readable);
    }

    #[test]
    fn busy_attachment_rejected_without_closing_channel() {
        let (a, b) = pipe_pair();
        let (attached, _attached_peer) = pipe_pair();
        let _registration = attached.add_waker(CountingWaker::new());

        let mut msg = Message::new("carrier");
        msg.attach(attached);
        assert!(matches!(a.try_write(msg), Err(WriteError::Busy)));

        // Channel still usable afterwards.
        a.try_write(Message::new("clean")).unwrap();
        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"clean");
    }

    #[test]
    fn closed_attachment_rejected_as_invalid() {
        let (a, _b) = pipe_pair();
        let (attached, _peer) = pipe_pair();
        attached.close();

        let mut msg = Message::new("carrier");
        msg.attach(attached);
        assert!(matches!(
            a.try_write(msg),
            Err(WriteError::InvalidMessage(_))
        ));
    }

    #[test]
    fn attachment_transfers_live_endpoint() {
        let (a, b) = pipe_pair();
        let (left, right) = pipe_pair();
        left.try_write(Message::new("inner")).unwrap();

        a.try_write(Message::with_handles("carrier", vec![right]))
            .unwrap();

        let carrier = b.try_read().unwrap();
        let (_, mut handles) = carrier.into_parts();
        let right = handles.pop().expect("attachment should survive transfer");
        assert_eq!(right.try_read().unwrap().payload().as_ref(), b"inner");
    }

    #[test]
    fn waker_fires_on_arrival_and_close() {
        let (a, b) = pipe_pair();
        let waker = CountingWaker::new();
        b.add_waker(Arc::clone(&waker) as _);

        a.try_write(Message::new("ping")).unwrap();
        assert_eq!(waker.count(), 1);

        drop(a);
        assert_eq!(waker.count(), 2);
    }

    #[test]
    fn removed_waker_does_not_fire() {
        let (a, b) = pipe_pair();
        let waker = CountingWaker::new();
        let id = b.add_waker(Arc::clone(&waker) as _);
        b.remove_waker(id);

        a.try_write(Message::new("ping")).unwrap();
        assert_eq!(waker.count(), 0);
    }

    #[test]
    fn wait_immediate_reflects_signals() {
        let (a, b) = pipe_pair();
        assert!(matches!(
            b.wait_readable(Deadline::Immediate),
            Err(WaitError::WouldBlock)
        ));

        a.try_write(Message::new("now")).unwrap();
        b.wait_readable(Deadline::Immediate).unwrap();

        let _ = b.try_read().unwrap();
        drop(a);
        assert!(matches!(
            b.wait_readable(Deadline::Immediate),
            Err(WaitError::Closed)
        ));
    }

    #[test]
    fn wait_indefinite_wakes_on_cross_thread_write() {
        let (a, b) = pipe_pair();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            a.try_write(Message::new("late arrival")).unwrap();
            // Keep the writer alive until the message lands.
            std::thread::sleep(Duration::from_millis(30));
        });

        b.wait_readable(Deadline::Indefinite).unwrap();
        assert_eq!(b.try_read().unwrap().payload().as_ref(), b"late arrival");
        writer.join().unwrap();
    }

    #[test]
    fn wait_indefinite_wakes_on_peer_close() {
        let (a, b) = pipe_pair();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(a);
        });

        assert!(matches!(
            b.wait_readable(Deadline::Indefinite),
            Err(WaitError::Closed)
        ));
        closer.join().unwrap();
    }

    #[test]
    fn partial_timeout_deadline_rejected() {
        let (_a, b) = pipe_pair();
        assert!(matches!(
            b.wait_readable(Deadline::Timeout(Duration::from_millis(5))),
            Err(WaitError::DeadlineNotSupported)
        ));
    }

    #[test]
    fn closed_placeholder_is_valid_but_peer_closed() {
        let placeholder = closed_placeholder();
        assert!(placeholder.is_open());
        assert!(placeholder.query_signals().peer_closed);
        assert!(matches!(placeholder.try_read(), Err(ReadError::Closed)));
        assert!(matches!(
            placeholder.try_write(Message::new("x")),
            Err(WriteError::Closed)
        ));
    }

    #[test]
    fn operations_on_locally_closed_endpoint_are_fatal() {
        let (a, _b) = pipe_pair();
        a.close();
        assert!(!a.is_open());
        assert!(matches!(a.try_read(), Err(ReadError::Fatal(_))));
        assert!(matches!(
            a.try_write(Message::new("x")),
            Err(WriteError::Fatal(_))
        ));
        assert!(matches!(
            a.wait_readable(Deadline::Immediate),
            Err(WaitError::Fatal(_))
        ));
    }
}
