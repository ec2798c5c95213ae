//! Timer service used for deferred work such as snapshot auto-release.
//!
//! The container never sleeps itself; it hands delayed tasks to a
//! [`Scheduler`]. Two implementations:
//! - [`TimerScheduler`] (the default): real timers driven by one background
//!   thread shared by the process.
//! - [`TaskQueue`]: a virtual clock that the host advances, which makes
//!   timing deterministic in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::stream::{FuturesUnordered, StreamExt};
use futures_timer::Delay;
use parking_lot::Mutex;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Scheduler backed by real timers.
///
/// Tasks are sent to a background thread that waits on one
/// [`Delay`](futures_timer::Delay) per task and runs the task on that thread
/// once it fires. A panicking task is logged and does not stop the thread.
pub struct TimerScheduler {
    sender: mpsc::UnboundedSender<(Duration, Task)>,
}

impl TimerScheduler {
    /// Start a scheduler with its own timer thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let spawned = thread::Builder::new()
            .name("atom-flow-timer".to_string())
            .spawn(move || block_on(run_timers(receiver)));
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to start timer thread");
        }
        Self { sender }
    }

    /// The process-wide scheduler used by default configurations.
    pub fn shared() -> Arc<TimerScheduler> {
        static SHARED: OnceLock<Arc<TimerScheduler>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(TimerScheduler::new())).clone()
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        if self.sender.unbounded_send((delay, task)).is_err() {
            tracing::warn!("timer thread stopped; dropping deferred task");
        }
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler").finish_non_exhaustive()
    }
}

async fn run_timers(mut incoming: mpsc::UnboundedReceiver<(Duration, Task)>) {
    let mut timers = FuturesUnordered::new();
    loop {
        futures::select! {
            scheduled = incoming.next() => match scheduled {
                Some((delay, task)) => timers.push(async move {
                    Delay::new(delay).await;
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::warn!("deferred task panicked");
                    }
                }),
                None => break,
            },
            () = timers.select_next_some() => {}
        }
    }
    // Every scheduler handle is gone; let the remaining timers fire.
    while timers.next().await.is_some() {}
}

/// Manually driven scheduler with a virtual clock.
///
/// Tasks run in deadline order, ties in scheduling order. Tasks run on the
/// thread that advances the clock and may schedule further tasks.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    now: Duration,
    seq: u64,
    tasks: BTreeMap<(Duration, u64), Task>,
}

impl TaskQueue {
    /// Create an empty queue at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Number of tasks not yet run.
    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Move the clock forward by `by`, running every task that becomes due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = self.inner.lock().now + by;
        let mut ran = 0;
        while let Some(task) = self.pop_due(deadline) {
            task();
            ran += 1;
        }
        self.inner.lock().now = deadline;
        ran
    }

    /// Run tasks until none are left, advancing the clock as needed.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.lock().tasks.keys().next().map(|(at, _)| *at);
            let Some(at) = next else {
                return ran;
            };
            let now = self.now();
            ran += self.advance(at.saturating_sub(now));
        }
    }

    fn pop_due(&self, deadline: Duration) -> Option<Task> {
        let mut inner = self.inner.lock();
        let (&(at, seq), _) = inner.tasks.iter().next()?;
        if at > deadline {
            return None;
        }
        inner.now = inner.now.max(at);
        inner.tasks.remove(&(at, seq))
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut inner = self.inner.lock();
        let at = inner.now + delay;
        let seq = inner.seq;
        inner.seq += 1;
        inner.tasks.insert((at, seq), task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("now", &inner.now)
            .field("pending", &inner.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;

    #[test]
    fn test_timer_runs_tasks_after_their_delay() {
        let scheduler = TimerScheduler::new();
        let (sender, receiver) = std_mpsc::channel();
        let start = Instant::now();
        for (delay, name) in [(30, "late"), (5, "early")] {
            let sender = sender.clone();
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    let _ = sender.send((name, start.elapsed()));
                }),
            );
        }

        let wait = Duration::from_secs(5);
        let mut fired = vec![
            receiver.recv_timeout(wait).unwrap(),
            receiver.recv_timeout(wait).unwrap(),
        ];
        fired.sort();
        assert_eq!(fired[0].0, "early");
        assert!(fired[0].1 >= Duration::from_millis(5));
        assert_eq!(fired[1].0, "late");
        assert!(fired[1].1 >= Duration::from_millis(30));
    }

    #[test]
    fn test_timer_survives_panicking_task() {
        let scheduler = TimerScheduler::new();
        let (sender, receiver) = std_mpsc::channel();
        scheduler.schedule(Duration::ZERO, Box::new(|| panic!("boom")));
        scheduler.schedule(
            Duration::from_millis(1),
            Box::new(move || {
                let _ = sender.send(());
            }),
        );
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (delay, name) in [(20, "b"), (10, "a"), (20, "c")] {
            let log = log.clone();
            queue.schedule(
                Duration::from_millis(delay),
                Box::new(move || log.lock().push(name)),
            );
        }
        assert_eq!(queue.pending(), 3);

        assert_eq!(queue.advance(Duration::from_millis(10)), 1);
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(queue.advance(Duration::from_millis(5)), 0);
        assert_eq!(queue.advance(Duration::from_millis(5)), 2);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(queue.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_run_until_idle_runs_rescheduled_tasks() {
        let queue = Arc::new(TaskQueue::new());
        let count = Arc::new(AtomicU32::new(0));
        let inner_queue = queue.clone();
        let inner_count = count.clone();
        queue.schedule(
            Duration::from_millis(1),
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let c = inner_count.clone();
                inner_queue.schedule(
                    Duration::from_secs(60),
                    Box::new(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        assert_eq!(queue.run_until_idle(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 0);
    }
}
