use ember::fault::{panic_message, FaultReporter};
use slog::{debug, Logger};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

/// Items executed per queue lock acquisition before giving enqueuers a turn.
const DEQUEUE_GRANULARITY: usize = 25;

/// Idle wait period; a bound on how long shutdown can lag a wakeup miss.
const IDLE_WAIT_MILLIS: u64 = 100;

pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

enum QueueItem {
    Work(WorkItem),
    Stop,
}

struct RunnerShared {
    queue: Mutex<VecDeque<QueueItem>>,
    available: Condvar,
    faults: Arc<dyn FaultReporter>,
    logger: Logger,
}

/// A single logical thread of control executing submitted work items one at a
/// time, in submission order, forever. All message dispatch for all
/// connections funnels through one of these, which is what lets the layers
/// above stay lock free.
///
/// The handle is cheap to clone; all clones feed the same worker.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<RunnerShared>,
    worker_id: ThreadId,
}

impl Runner {
    pub fn new(name: &str, faults: Arc<dyn FaultReporter>, logger: Logger) -> Runner {
        let shared = Arc::new(RunnerShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            faults,
            logger,
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("Failed to spawn runner thread");
        Runner { shared, worker_id: handle.thread().id() }
    }

    /// Submits a work item. Never blocks beyond the queue mutex, which the
    /// worker only ever holds briefly between item executions.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, work: F) {
        let mut queue = self.shared.queue.lock().expect("Runner queue poisoned");
        queue.push_back(QueueItem::Work(Box::new(work)));
        self.shared.available.notify_one();
    }

    /// Requests shutdown after everything enqueued ahead of the request has
    /// run. Items enqueued afterward are never executed.
    pub fn orderly_shutdown(&self) {
        let mut queue = self.shared.queue.lock().expect("Runner queue poisoned");
        queue.push_back(QueueItem::Stop);
        self.shared.available.notify_one();
    }

    /// True when called from the worker thread itself, i.e. from inside a
    /// work item.
    #[inline]
    pub fn is_current_thread_in_runner(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

fn worker_loop(shared: Arc<RunnerShared>) {
    loop {
        // The lock is never held while a work item executes, so an item may
        // freely enqueue more work, including onto its own runner.
        for _ in 0..DEQUEUE_GRANULARITY {
            let item = shared.queue.lock().expect("Runner queue poisoned").pop_front();
            match item {
                Some(QueueItem::Work(work)) => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
                        shared.faults.report("work item", panic_message(&*payload));
                    }
                }
                Some(QueueItem::Stop) => {
                    debug!(shared.logger, "Runner thread stopping");
                    return;
                }
                None => break,
            }
        }
        let queue = shared.queue.lock().expect("Runner queue poisoned");
        if queue.is_empty() {
            let _ = shared
                .available
                .wait_timeout(queue, std::time::Duration::from_millis(IDLE_WAIT_MILLIS))
                .expect("Runner queue poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingReporter {
        count: AtomicUsize,
    }

    impl CountingReporter {
        fn new() -> Arc<CountingReporter> {
            Arc::new(CountingReporter { count: AtomicUsize::new(0) })
        }
    }

    impl FaultReporter for CountingReporter {
        fn report(&self, _context: &str, _detail: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runner(faults: Arc<CountingReporter>) -> Runner {
        Runner::new("test-runner", faults, test_logger())
    }

    #[test]
    fn items_run_in_submission_order() {
        let faults = CountingReporter::new();
        let runner = runner(faults);
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            runner.enqueue(move || tx.send(i).unwrap());
        }
        let received: Vec<i32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(received, (0..100).collect::<Vec<i32>>());
    }

    #[test]
    fn panicking_item_does_not_stop_later_items() {
        let faults = CountingReporter::new();
        let runner = runner(faults.clone());
        let (tx, rx) = mpsc::channel();
        runner.enqueue(|| panic!("deliberate test panic"));
        runner.enqueue(move || tx.send("survived").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "survived");
        assert_eq!(faults.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn work_items_observe_the_runner_thread() {
        let faults = CountingReporter::new();
        let runner = runner(faults);
        assert!(!runner.is_current_thread_in_runner());
        let (tx, rx) = mpsc::channel();
        let handle = runner.clone();
        runner.enqueue(move || tx.send(handle.is_current_thread_in_runner()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn items_may_enqueue_more_items() {
        let faults = CountingReporter::new();
        let runner = runner(faults);
        let (tx, rx) = mpsc::channel();
        let handle = runner.clone();
        runner.enqueue(move || {
            let tx = tx.clone();
            handle.enqueue(move || tx.send("nested").unwrap());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "nested");
    }

    #[test]
    fn shutdown_runs_prior_items_and_drops_later_ones() {
        let faults = CountingReporter::new();
        let runner = runner(faults);
        let (tx, rx) = mpsc::channel();
        let before = tx.clone();
        runner.enqueue(move || before.send("before").unwrap());
        runner.orderly_shutdown();
        runner.enqueue(move || tx.send("after").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "before");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
