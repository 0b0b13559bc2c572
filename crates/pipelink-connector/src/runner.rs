use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

/// A FIFO task queue pumped by one owning thread.
///
/// Tasks may be posted from any thread; they only ever run on whichever
/// thread pumps the queue. This is the event-loop seam the connector posts
/// watcher notifications and deferred error callbacks to.
///
/// Pumping is reentrant: a running task may pump the queue again (nested
/// dispatch relies on this).
#[derive(Clone)]
pub struct TaskRunner {
    queue: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Enqueue a task. Callable from any thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(Box::new(task));
        trace!(depth = queue.len(), "task posted");
    }

    /// Run the oldest pending task, if any. Returns whether one ran.
    pub fn run_one(&self) -> bool {
        let task = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.pop_front()
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks posted while
    /// draining. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_tasks_in_post_order() {
        let runner = TaskRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            runner.post(move || order.lock().unwrap().push(i));
        }

        assert_eq!(runner.run_until_idle(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn tasks_posted_while_draining_still_run() {
        let runner = TaskRunner::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_hits = Arc::clone(&hits);
        let inner_runner = runner.clone();
        runner.post(move || {
            inner_hits.fetch_add(1, Ordering::SeqCst);
            let hits = Arc::clone(&inner_hits);
            inner_runner.post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(runner.run_until_idle(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reentrant_pump_from_inside_a_task() {
        let runner = TaskRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let nested_order = Arc::clone(&order);
        let nested_runner = runner.clone();
        runner.post(move || {
            nested_order.lock().unwrap().push("outer-start");
            let order = Arc::clone(&nested_order);
            nested_runner.post(move || order.lock().unwrap().push("inner"));
            nested_runner.run_until_idle();
            nested_order.lock().unwrap().push("outer-end");
        });

        runner.run_until_idle();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-start", "inner", "outer-end"]
        );
    }

    #[test]
    fn cross_thread_post() {
        let runner = TaskRunner::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let worker = {
            let runner = runner.clone();
            let hits = Arc::clone(&hits);
            std::thread::spawn(move || {
                for _ in 0..8 {
                    let hits = Arc::clone(&hits);
                    runner.post(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };
        worker.join().unwrap();

        assert_eq!(runner.run_until_idle(), 8);
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }
}
