//! Dual task scheduler: tick-clocked and wall-clocked
//!
//! The [`SyncScheduler`] runs tasks on the game tick. Delay and period are
//! counted in ticks, so a paused or slow tick loop slows the tasks with it.
//! `tick()` is called from exactly one place (the server's tick loop), and a
//! task scheduled with delay 0 runs on the next tick, never within the tick
//! that scheduled it.
//!
//! The [`AsyncScheduler`] runs tasks on wall-clock time, independent of the
//! tick. A single timing task sleeps until the nearest due instant and is
//! re-woken whenever a submission creates an earlier one; due tasks execute
//! on their own spawned task so one slow task never delays the clock.
//!
//! Both sides hand back a [`TaskHandle`]: a cheap clone that reports lifecycle
//! state and cancels the task. Cancellation is cooperative and idempotent; a
//! task already running finishes its current run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Scheduled, waiting for its next run.
    Waiting = 0,
    /// Currently executing.
    Running = 1,
    /// Canceled; will never run again.
    Canceled = 2,
    /// A one-shot that completed its run.
    Done = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> TaskState {
        match value {
            1 => TaskState::Running,
            2 => TaskState::Canceled,
            3 => TaskState::Done,
            _ => TaskState::Waiting,
        }
    }

    /// Whether the task can still run in the future.
    pub fn is_live(self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Running)
    }
}

#[derive(Debug)]
struct TaskCore {
    id: u64,
    name: String,
    owner: String,
    sync: bool,
    /// Tick count or milliseconds between runs; 0 marks a one-shot.
    period: u64,
    state: AtomicU8,
}

/// Shared handle to one scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    fn new(id: u64, name: String, owner: String, sync: bool, period: u64) -> Self {
        Self {
            core: Arc::new(TaskCore {
                id,
                name,
                owner,
                sync,
                period,
                state: AtomicU8::new(TaskState::Waiting as u8),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn owner(&self) -> &str {
        &self.core.owner
    }

    /// Whether this task runs on the tick clock rather than wall time.
    pub fn is_sync(&self) -> bool {
        self.core.sync
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    /// Cancels the task. Idempotent; a no-op once the task is done. A run
    /// already in progress completes, but no further run starts.
    pub fn cancel(&self) {
        loop {
            let current = self.core.state.load(Ordering::Acquire);
            if current == TaskState::Canceled as u8 || current == TaskState::Done as u8 {
                return;
            }
            if self
                .core
                .state
                .compare_exchange(
                    current,
                    TaskState::Canceled as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug!(task = %self.core.name, id = self.core.id, "task canceled");
                return;
            }
        }
    }

    fn mark_running(&self) {
        self.core
            .state
            .store(TaskState::Running as u8, Ordering::Release);
    }

    /// Moves `Running` back to `Waiting` (periodic) or on to `Done`
    /// (one-shot). Loses to a concurrent cancel.
    fn finish_run(&self) {
        let next = if self.core.period == 0 {
            TaskState::Done
        } else {
            TaskState::Waiting
        };
        let _ = self.core.state.compare_exchange(
            TaskState::Running as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

fn matches_query(handle: &TaskHandle, fragment: &str) -> bool {
    handle.name().contains(fragment)
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---- sync (tick-clocked) ------------------------------------------------

struct SyncEntry {
    handle: TaskHandle,
    run: Box<dyn FnMut() + Send>,
    /// Ticks remaining until the next run.
    countdown: u64,
}

/// Tick-driven scheduler. Tasks run inline in [`tick`](Self::tick), in
/// submission order.
pub struct SyncScheduler {
    next_id: AtomicU64,
    current_tick: AtomicU64,
    queue: Mutex<Vec<SyncEntry>>,
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            current_tick: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Ticks completed so far.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    /// Schedules `run` after `delay` ticks, repeating every `period` ticks
    /// (0 = one-shot). A delay of 0 means the next tick.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        owner: impl Into<String>,
        delay: u64,
        period: u64,
        run: impl FnMut() + Send + 'static,
    ) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, name.into(), owner.into(), true, period);
        lock_recover(&self.queue).push(SyncEntry {
            handle: handle.clone(),
            run: Box::new(run),
            countdown: delay,
        });
        handle
    }

    /// Runs every due task once and advances the tick counter. Tasks
    /// scheduled from inside a running task first fire on a later tick.
    pub fn tick(&self) {
        self.current_tick.fetch_add(1, Ordering::AcqRel);

        // Swap the queue out so task bodies can schedule without deadlocking
        // on the queue lock.
        let batch = std::mem::take(&mut *lock_recover(&self.queue));
        let mut keep = Vec::with_capacity(batch.len());

        for mut entry in batch {
            if entry.handle.is_canceled() {
                continue;
            }
            if entry.countdown > 0 {
                entry.countdown -= 1;
                keep.push(entry);
                continue;
            }

            entry.handle.mark_running();
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.run)()));
            if outcome.is_err() {
                error!(
                    task = %entry.handle.name(),
                    id = entry.handle.id(),
                    "sync task panicked; removing it from the schedule"
                );
                entry.handle.cancel();
                continue;
            }
            entry.handle.finish_run();

            if entry.handle.state() == TaskState::Waiting && entry.handle.core.period > 0 {
                // period counts ticks between run starts; one tick already
                // elapses before the countdown is next checked
                entry.countdown = entry.handle.core.period - 1;
                keep.push(entry);
            }
        }

        // Re-queue survivors ahead of anything scheduled during this tick so
        // long-lived tasks keep their relative order.
        let mut queue = lock_recover(&self.queue);
        let added_during_tick = std::mem::take(&mut *queue);
        *queue = keep;
        queue.extend(added_during_tick);
    }

    pub fn find(&self, id: u64) -> Option<TaskHandle> {
        lock_recover(&self.queue)
            .iter()
            .find(|entry| entry.handle.id() == id)
            .map(|entry| entry.handle.clone())
    }

    pub fn tasks_by_owner(&self, owner: &str) -> Vec<TaskHandle> {
        lock_recover(&self.queue)
            .iter()
            .filter(|entry| entry.handle.owner() == owner)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn tasks_matching(&self, fragment: &str) -> Vec<TaskHandle> {
        lock_recover(&self.queue)
            .iter()
            .filter(|entry| matches_query(&entry.handle, fragment))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Cancels every task registered under `owner`.
    pub fn cancel_owner(&self, owner: &str) {
        for handle in self.tasks_by_owner(owner) {
            handle.cancel();
        }
    }
}

// ---- async (wall-clocked) -----------------------------------------------

struct AsyncEntry {
    handle: TaskHandle,
    run: Arc<dyn Fn() + Send + Sync>,
    next_due: Instant,
}

struct AsyncShared {
    next_id: AtomicU64,
    queue: Mutex<Vec<AsyncEntry>>,
    wake: Notify,
}

/// Wall-clock scheduler. A dedicated timing task tracks the nearest due
/// instant; due tasks execute on spawned tasks so the clock never waits on
/// them.
pub struct AsyncScheduler {
    shared: Arc<AsyncShared>,
    driver: JoinHandle<()>,
}

impl AsyncScheduler {
    /// Starts the timing task. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let shared = Arc::new(AsyncShared {
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            wake: Notify::new(),
        });
        let driver = tokio::spawn(drive(Arc::clone(&shared)));
        Self { shared, driver }
    }

    /// Schedules `run` after `delay`, repeating every `period`
    /// ([`Duration::ZERO`] = one-shot). Wakes the timing task if this
    /// submission is now the nearest deadline.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        owner: impl Into<String>,
        delay: Duration,
        period: Duration,
        run: impl Fn() + Send + Sync + 'static,
    ) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(
            id,
            name.into(),
            owner.into(),
            false,
            period.as_millis() as u64,
        );
        lock_recover(&self.shared.queue).push(AsyncEntry {
            handle: handle.clone(),
            run: Arc::new(run),
            next_due: Instant::now() + delay,
        });
        self.shared.wake.notify_one();
        handle
    }

    pub fn find(&self, id: u64) -> Option<TaskHandle> {
        lock_recover(&self.shared.queue)
            .iter()
            .find(|entry| entry.handle.id() == id)
            .map(|entry| entry.handle.clone())
    }

    pub fn tasks_by_owner(&self, owner: &str) -> Vec<TaskHandle> {
        lock_recover(&self.shared.queue)
            .iter()
            .filter(|entry| entry.handle.owner() == owner)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn tasks_matching(&self, fragment: &str) -> Vec<TaskHandle> {
        lock_recover(&self.shared.queue)
            .iter()
            .filter(|entry| matches_query(&entry.handle, fragment))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Cancels every task registered under `owner`.
    pub fn cancel_owner(&self, owner: &str) {
        for handle in self.tasks_by_owner(owner) {
            handle.cancel();
        }
    }

    /// Stops the timing task. Already-spawned runs complete; nothing new
    /// fires afterwards.
    pub fn shutdown(&self) {
        self.driver.abort();
    }
}

async fn drive(shared: Arc<AsyncShared>) {
    loop {
        let now = Instant::now();
        let mut due: Vec<(TaskHandle, Arc<dyn Fn() + Send + Sync>)> = Vec::new();
        let nearest = {
            let mut queue = lock_recover(&shared.queue);
            let mut remaining = Vec::with_capacity(queue.len());
            for mut entry in queue.drain(..) {
                if entry.handle.is_canceled() {
                    continue;
                }
                if entry.next_due <= now {
                    due.push((entry.handle.clone(), Arc::clone(&entry.run)));
                    let period = entry.handle.core.period;
                    if period > 0 {
                        entry.next_due = now + Duration::from_millis(period);
                        remaining.push(entry);
                    }
                    // one-shots leave the queue; their handle finishes the
                    // lifecycle from the execution task
                } else {
                    remaining.push(entry);
                }
            }
            let nearest = remaining.iter().map(|entry| entry.next_due).min();
            *queue = remaining;
            nearest
        };

        for (handle, run) in due {
            tokio::spawn(async move {
                if handle.is_canceled() {
                    return;
                }
                handle.mark_running();
                if catch_unwind(AssertUnwindSafe(|| run())).is_err() {
                    error!(
                        task = %handle.name(),
                        id = handle.id(),
                        "async task panicked; removing it from the schedule"
                    );
                    handle.cancel();
                    return;
                }
                handle.finish_run();
            });
        }

        match nearest {
            Some(instant) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(instant) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_runs_exactly_once_after_delay() {
        let scheduler = SyncScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.schedule("once", "test", 2, 0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.tick();
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), TaskState::Done);

        scheduler.tick();
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_task_runs_every_period_ticks() {
        let scheduler = SyncScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.schedule("pulse", "test", 0, 3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..9 {
            scheduler.tick();
        }
        // ticks 1, 4, 7
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn canceled_task_never_runs_and_cancel_is_idempotent() {
        let scheduler = SyncScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.schedule("doomed", "test", 1, 0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), TaskState::Canceled);

        scheduler.tick();
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // the canceled entry is purged lazily on the next tick
        assert!(scheduler.find(handle.id()).is_none());
    }

    #[test]
    fn task_scheduled_from_a_running_task_waits_for_the_next_tick() {
        let scheduler = Arc::new(SyncScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_runs = Arc::clone(&runs);
        let inner_scheduler = Arc::clone(&scheduler);
        scheduler.schedule("outer", "test", 0, 0, move || {
            let counter = Arc::clone(&inner_runs);
            inner_scheduler.schedule("inner", "test", 0, 0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_is_removed_but_others_survive() {
        let scheduler = SyncScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let bad = scheduler.schedule("bad", "test", 0, 1, || panic!("boom"));
        scheduler.schedule("good", "test", 0, 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.tick();
        scheduler.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(bad.state(), TaskState::Canceled);
    }

    #[test]
    fn queries_by_owner_and_name_fragment() {
        let scheduler = SyncScheduler::new();
        let a = scheduler.schedule("keepalive/7", "session-7", 10, 0, || {});
        let b = scheduler.schedule("keepalive/9", "session-9", 10, 0, || {});
        scheduler.schedule("autosave", "world", 10, 0, || {});

        let keepalives = scheduler.tasks_matching("keepalive");
        assert_eq!(keepalives.len(), 2);

        let owned = scheduler.tasks_by_owner("session-9");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id(), b.id());

        assert_eq!(scheduler.find(a.id()).map(|h| h.id()), Some(a.id()));

        scheduler.cancel_owner("session-7");
        assert!(a.is_canceled());
        assert!(!b.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn async_one_shot_fires_at_its_deadline() {
        let scheduler = AsyncScheduler::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.schedule(
            "flush",
            "test",
            Duration::from_millis(100),
            Duration::ZERO,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), TaskState::Done);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn later_submission_with_shorter_delay_preempts_the_pending_sleep() {
        let scheduler = AsyncScheduler::start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow_order = Arc::clone(&order);
        scheduler.schedule(
            "slow",
            "test",
            Duration::from_secs(60),
            Duration::ZERO,
            move || slow_order.lock().unwrap().push("slow"),
        );
        // let the driver go to sleep on the 60s deadline
        tokio::task::yield_now().await;

        let fast_order = Arc::clone(&order);
        scheduler.schedule(
            "fast",
            "test",
            Duration::from_millis(10),
            Duration::ZERO,
            move || fast_order.lock().unwrap().push("fast"),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().unwrap(), vec!["fast"]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn async_periodic_repeats_until_canceled() {
        let scheduler = AsyncScheduler::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.schedule(
            "heartbeat",
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(175)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        scheduler.shutdown();
    }
}
