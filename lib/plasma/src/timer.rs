use crate::run::Runner;
use ember::fault::{panic_message, FaultReporter};
use ember::time::millis_since;
use slog::{debug, Logger};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A repeating entry behind by more than this many periods jumps straight to
/// the present instead of replaying every missed tick.
const CATCH_UP_PERIODS: u64 = 5;

type TimerTarget = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    id: u64,
    delta_millis: u64,
    repeat: bool,
    runner: Runner,
    target: TimerTarget,
}

struct TimerState {
    /// Pending entries keyed by fire time in milliseconds since service
    /// start. Colliding fire times are nudged forward by a millisecond at
    /// insertion, so keys are unique.
    events: BTreeMap<u64, TimerEntry>,
    next_id: u64,
    running: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    start: Instant,
    faults: Arc<dyn FaultReporter>,
    logger: Logger,
}

/// Deadline-ordered timeout scheduling on a dedicated thread. Fired targets
/// are never executed on the scheduling thread; each is enqueued onto the
/// runner supplied at registration, keeping timer work inside the same
/// serialized execution discipline as message dispatch.
#[derive(Clone)]
pub struct TimerService {
    shared: Arc<TimerShared>,
}

/// Cancellation handle for a scheduled timeout or repeating clock.
pub struct TimerHandle {
    shared: Arc<TimerShared>,
    id: u64,
}

impl TimerHandle {
    /// Cancels the entry. Returns false when it already fired (for one-shot
    /// entries) or was already cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().expect("Timer state poisoned");
        let key = state.events.iter().find(|(_, entry)| entry.id == self.id).map(|(&key, _)| key);
        match key {
            Some(key) => {
                state.events.remove(&key);
                self.shared.wakeup.notify_one();
                true
            }
            None => false,
        }
    }
}

impl TimerService {
    pub fn new(faults: Arc<dyn FaultReporter>, logger: Logger) -> TimerService {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState { events: BTreeMap::new(), next_id: 0, running: true }),
            wakeup: Condvar::new(),
            start: Instant::now(),
            faults,
            logger,
        });
        let scheduler_shared = shared.clone();
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || scheduler_loop(scheduler_shared))
            .expect("Failed to spawn timer thread");
        TimerService { shared }
    }

    /// Schedules `target` to be enqueued on `runner` once, `millis` from now.
    pub fn after<F: Fn() + Send + Sync + 'static>(&self, millis: u64, runner: &Runner, target: F) -> TimerHandle {
        self.insert(millis, false, runner, Arc::new(target))
    }

    /// Schedules `target` to be enqueued on `runner` every `period` millis.
    pub fn every<F: Fn() + Send + Sync + 'static>(&self, period: u64, runner: &Runner, target: F) -> TimerHandle {
        self.insert(period, true, runner, Arc::new(target))
    }

    fn insert(&self, millis: u64, repeat: bool, runner: &Runner, target: TimerTarget) -> TimerHandle {
        let mut state = self.shared.state.lock().expect("Timer state poisoned");
        let id = state.next_id;
        state.next_id += 1;
        let mut when = millis_since(self.shared.start) + millis;
        while state.events.contains_key(&when) {
            when += 1;
        }
        state.events.insert(
            when,
            TimerEntry { id, delta_millis: millis, repeat, runner: runner.clone(), target },
        );
        // Only an entry that becomes the nearest deadline moves the wakeup.
        if state.events.keys().next() == Some(&when) {
            self.shared.wakeup.notify_one();
        }
        TimerHandle { shared: self.shared.clone(), id }
    }

    /// Stops the scheduling thread. Pending entries never fire.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().expect("Timer state poisoned");
        state.running = false;
        self.shared.wakeup.notify_one();
    }
}

fn scheduler_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().expect("Timer state poisoned");
    loop {
        if !state.running {
            debug!(shared.logger, "Timer thread stopping");
            return;
        }
        let now = millis_since(shared.start);
        match state.events.keys().next().copied() {
            None => {
                state = shared.wakeup.wait(state).expect("Timer state poisoned");
                continue;
            }
            Some(next) if next > now => {
                let (guard, _) = shared
                    .wakeup
                    .wait_timeout(state, Duration::from_millis(next - now))
                    .expect("Timer state poisoned");
                state = guard;
                continue;
            }
            Some(_) => {}
        }

        let mut fires: Vec<(Runner, TimerTarget)> = Vec::new();
        loop {
            let due = match state.events.keys().next() {
                Some(&when) if when <= now => when,
                _ => break,
            };
            if let Some(entry) = state.events.remove(&due) {
                fires.push((entry.runner.clone(), entry.target.clone()));
                if entry.repeat {
                    let mut next = due + entry.delta_millis;
                    if next + CATCH_UP_PERIODS * entry.delta_millis < now {
                        next = now + entry.delta_millis;
                    }
                    while state.events.contains_key(&next) {
                        next += 1;
                    }
                    state.events.insert(next, entry);
                }
            }
        }

        // Targets are handed to their runners outside the lock so a target's
        // own scheduling calls cannot deadlock against this thread.
        drop(state);
        for (runner, target) in fires {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| {
                runner.enqueue(move || target());
            })) {
                shared.faults.report("timer dispatch", panic_message(&*payload));
            }
        }
        state = shared.state.lock().expect("Timer state poisoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logger;
    use ember::fault::LogFaultReporter;
    use std::sync::mpsc;

    fn fixture() -> (TimerService, Runner) {
        let faults: Arc<dyn FaultReporter> = Arc::new(LogFaultReporter::new(test_logger()));
        let runner = Runner::new("timer-test-runner", faults.clone(), test_logger());
        (TimerService::new(faults, test_logger()), runner)
    }

    #[test]
    fn one_shot_fires_once() {
        let (timer, runner) = fixture();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer.after(20, &runner, move || {
            tx.lock().unwrap().send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timer.shutdown();
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let (timer, runner) = fixture();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = timer.after(150, &runner, move || {
            tx.lock().unwrap().send(()).unwrap();
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        timer.shutdown();
    }

    #[test]
    fn repeating_clock_fire_times_advance_by_at_least_the_period() {
        const PERIOD_MILLIS: u64 = 40;
        let (timer, runner) = fixture();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let scheduled_at = Instant::now();
        let handle = timer.every(PERIOD_MILLIS, &runner, move || {
            let _ = tx.lock().unwrap().send(Instant::now());
        });
        let mut ticks = Vec::new();
        for _ in 0..3 {
            ticks.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        handle.cancel();
        // Each re-insert advances the deadline by a full period, so tick i
        // cannot run earlier than (i + 1) periods after scheduling; dispatch
        // delays only push it later. Millisecond bookkeeping can round a
        // deadline down by one tick, hence the slack.
        for (i, tick) in ticks.iter().enumerate() {
            let minimum = Duration::from_millis((i as u64 + 1) * PERIOD_MILLIS - 5);
            let elapsed = tick.duration_since(scheduled_at);
            assert!(
                elapsed >= minimum,
                "tick {} ran after {:?}, expected at least {:?}",
                i,
                elapsed,
                minimum
            );
        }
        timer.shutdown();
    }

    #[test]
    fn identical_deadlines_both_fire() {
        let (timer, runner) = fixture();
        let (tx, rx) = mpsc::channel();
        let tx_a = Mutex::new(tx.clone());
        let tx_b = Mutex::new(tx);
        timer.after(30, &runner, move || {
            tx_a.lock().unwrap().send("a").unwrap();
        });
        timer.after(30, &runner, move || {
            tx_b.lock().unwrap().send("b").unwrap();
        });
        let mut fired = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        fired.sort_unstable();
        assert_eq!(fired, vec!["a", "b"]);
        timer.shutdown();
    }

    #[test]
    fn shutdown_stops_pending_entries() {
        let (timer, runner) = fixture();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer.after(100, &runner, move || {
            tx.lock().unwrap().send(()).unwrap();
        });
        timer.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }
}
