//! Deferred and recurring callbacks.
//!
//! A [`TimedSignalQueue`] keeps tasks ordered by their next fire time and
//! checks them on a periodic tick. Due tasks are never run on the ticking
//! task itself: each one is posted as a [`Job`] into the [`Mailbox`] of its
//! target, and the matching [`Inbox`] runs it in the target's own context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default tick granularity
pub const DEFAULT_PRECISION_MS: u64 = 1000;

/// Identifier returned on scheduling, used to cancel or reschedule
pub type TaskId = Uuid;

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// One occurrence of a scheduled callback, delivered to a mailbox.
pub struct Job {
    name: Arc<str>,
    callback: Callback,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(self) {
        (self.callback)()
    }
}

/// Sending side of a target's execution context.
#[derive(Clone)]
pub struct Mailbox {
    name: Arc<str>,
    tx: flume::Sender<Job>,
}

impl Mailbox {
    /// Create a mailbox and the inbox that drains it.
    pub fn new(name: &str) -> (Self, Inbox) {
        let (tx, rx) = flume::unbounded();
        let name: Arc<str> = Arc::from(name);
        (Self { name: name.clone(), tx }, Inbox { name, rx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target identity: two handles are the same target if they feed the same inbox.
    pub fn same_target(&self, other: &Mailbox) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Returns false once the inbox is gone.
    fn deliver(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("name", &self.name).finish()
    }
}

/// Receiving side of a mailbox; runs jobs one after another.
pub struct Inbox {
    name: Arc<str>,
    rx: flume::Receiver<Job>,
}

impl Inbox {
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                job = self.rx.recv_async() => {
                    match job {
                        Ok(job) => {
                            tracing::trace!("{}: running {}", self.name, job.name());
                            job.run();
                        }
                        Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::debug!("Inbox {} shutting down", self.name);
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct TimerTask {
    id: TaskId,
    target: Mailbox,
    name: Arc<str>,
    callback: Callback,
    /// Milliseconds since the queue's monotonic base
    fire_at_ms: u64,
    interval_ms: u64,
    multi_shot: bool,
}

impl TimerTask {
    fn reset_time(&mut self, now_ms: u64) {
        self.fire_at_ms = now_ms.saturating_add(self.interval_ms);
    }

    fn matches(&self, target: &Mailbox, name: &str) -> bool {
        self.target.same_target(target) && &*self.name == name
    }

    fn dispatch(&self) -> bool {
        self.target.deliver(Job {
            name: self.name.clone(),
            callback: self.callback.clone(),
        })
    }
}

struct QueueState {
    /// Keyed by (fire time, insertion sequence) so equal fire times keep insertion order
    tasks: BTreeMap<(u64, u64), TimerTask>,
    next_seq: u64,
    precision: Duration,
}

impl QueueState {
    fn insert(&mut self, task: TimerTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert((task.fire_at_ms, seq), task);
    }

    fn remove_by_id(&mut self, id: TaskId) -> Option<TimerTask> {
        let key = self
            .tasks
            .iter()
            .find(|(_, task)| task.id == id)
            .map(|(key, _)| *key)?;
        self.tasks.remove(&key)
    }
}

struct Inner {
    base: Instant,
    state: Mutex<QueueState>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        duration_ms(self.base.elapsed())
    }

    fn check_schedule(&self) {
        let now = self.now_ms();
        let mut state = self.state.lock();
        let mut rearm = Vec::new();

        while let Some(entry) = state.tasks.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let mut task = entry.remove();
            if task.dispatch() {
                if task.multi_shot {
                    task.reset_time(now);
                    rearm.push(task);
                }
            } else {
                tracing::debug!(
                    "Dropping task {} for closed mailbox {}",
                    task.name,
                    task.target.name()
                );
            }
        }

        // Re-armed after the scan so a zero interval cannot fire twice in one tick
        for task in rearm {
            state.insert(task);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.ticker.get_mut().take() {
            token.cancel();
        }
    }
}

/// Handle to a timed signal queue. Clones share the same queue.
#[derive(Clone)]
pub struct TimedSignalQueue {
    inner: Arc<Inner>,
}

impl TimedSignalQueue {
    /// Create a stopped queue ticking every `precision_ms` once started.
    pub fn new(precision_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                base: Instant::now(),
                state: Mutex::new(QueueState {
                    tasks: BTreeMap::new(),
                    next_seq: 0,
                    precision: Duration::from_millis(precision_ms.max(1)),
                }),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Start (or restart) the periodic tick. Must be called within a tokio runtime.
    pub fn start(&self) {
        let precision = self.precision();
        let token = CancellationToken::new();

        if let Some(previous) = self.inner.ticker.lock().replace(token.clone()) {
            previous.cancel();
        }

        tokio::spawn(run_ticker(Arc::downgrade(&self.inner), precision, token));
        tracing::debug!("Signal queue ticking every {:?}", precision);
    }

    pub fn stop(&self) {
        if let Some(token) = self.inner.ticker.lock().take() {
            token.cancel();
            tracing::debug!("Signal queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.ticker.lock().is_some()
    }

    pub fn precision(&self) -> Duration {
        self.inner.state.lock().precision
    }

    /// Change the tick granularity. Zero is ignored.
    pub fn set_precision(&self, precision_ms: u64) {
        if precision_ms == 0 {
            return;
        }

        self.inner.state.lock().precision = Duration::from_millis(precision_ms);

        if self.is_running() {
            self.start();
        }
    }

    /// Drop every pending task.
    pub fn clear(&self) {
        self.inner.state.lock().tasks.clear();
    }

    /// Schedule `callback` to be posted to `target` after `delay`, and again
    /// every `delay` if `multi_shot` is set.
    pub fn schedule<F>(
        &self,
        target: &Mailbox,
        name: &str,
        delay: Duration,
        multi_shot: bool,
        callback: F,
    ) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval_ms = duration_ms(delay);
        self.push(target, name, interval_ms, interval_ms, multi_shot, Arc::new(callback))
    }

    /// Schedule a one-shot callback at a wall-clock time. The time is
    /// converted once to the monotonic base; past times fire on the next tick.
    pub fn schedule_at<F>(&self, target: &Mailbox, name: &str, at: DateTime<Utc>, callback: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let delay_ms = (at - Utc::now()).num_milliseconds().max(0) as u64;
        self.push(target, name, delay_ms, 0, false, Arc::new(callback))
    }

    fn push(
        &self,
        target: &Mailbox,
        name: &str,
        delay_ms: u64,
        interval_ms: u64,
        multi_shot: bool,
        callback: Callback,
    ) -> TaskId {
        let id = Uuid::new_v4();
        let task = TimerTask {
            id,
            target: target.clone(),
            name: Arc::from(name),
            callback,
            fire_at_ms: self.inner.now_ms().saturating_add(delay_ms),
            interval_ms,
            multi_shot,
        };

        self.inner.state.lock().insert(task);
        tracing::trace!("Scheduled {} on {} in {}ms", name, target.name(), delay_ms);
        id
    }

    /// Remove all tasks for `name` on `target`. Returns whether any was found.
    pub fn cancel_target(&self, target: &Mailbox, name: &str) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.matches(target, name));
        state.tasks.len() != before
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.state.lock().remove_by_id(id).is_some()
    }

    /// Replace the interval of a task and re-arm it from now.
    pub fn reschedule(&self, id: TaskId, interval: Duration) -> bool {
        let now = self.inner.now_ms();
        let mut state = self.inner.state.lock();

        match state.remove_by_id(id) {
            Some(mut task) => {
                task.interval_ms = duration_ms(interval);
                task.reset_time(now);
                state.insert(task);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.state.lock().tasks.values().any(|task| task.id == id)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimedSignalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION_MS)
    }
}

async fn run_ticker(inner: Weak<Inner>, precision: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(precision);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_schedule();
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drain(inbox: &Inbox) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(job) = inbox.rx.try_recv() {
            names.push(job.name().to_string());
        }
        names
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let queue = TimedSignalQueue::new(10);
        queue.start();
        let (mailbox, inbox) = Mailbox::new("test");
        let _inbox = inbox.spawn(CancellationToken::new());

        let (count, callback) = counter();
        let id = queue.schedule(&mailbox, "once", Duration::from_millis(50), false, callback);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!queue.cancel(id), "Fired one-shot task should be gone");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_shot_repeats_until_cancelled() {
        let queue = TimedSignalQueue::new(10);
        queue.start();
        let (mailbox, inbox) = Mailbox::new("test");
        let _inbox = inbox.spawn(CancellationToken::new());

        let (count, callback) = counter();
        let id = queue.schedule(&mailbox, "repeat", Duration::from_millis(20), true, callback);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!((4..=6).contains(&fired), "Expected about 5 firings, got {}", fired);

        assert!(queue.cancel(id));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let snapshot = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_tasks_fire_in_time_order() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        queue.schedule(&mailbox, "third", Duration::from_millis(30), false, || {});
        queue.schedule(&mailbox, "first", Duration::from_millis(10), false, || {});
        queue.schedule(&mailbox, "second", Duration::from_millis(20), false, || {});
        queue.schedule(&mailbox, "later", Duration::from_millis(500), false, || {});

        tokio::time::advance(Duration::from_millis(40)).await;
        queue.inner.check_schedule();

        assert_eq!(drain(&inbox), vec!["first", "second", "third"]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_fire_times_keep_insertion_order() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        for name in ["a", "b", "c"] {
            queue.schedule(&mailbox, name, Duration::from_millis(5), false, || {});
        }

        tokio::time::advance(Duration::from_millis(5)).await;
        queue.inner.check_schedule();

        assert_eq!(drain(&inbox), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_target_and_name() {
        let queue = TimedSignalQueue::new(1000);
        let (first, _first_inbox) = Mailbox::new("first");
        let (second, _second_inbox) = Mailbox::new("second");

        queue.schedule(&first, "ping", Duration::from_secs(1), true, || {});
        queue.schedule(&first.clone(), "ping", Duration::from_secs(2), false, || {});
        queue.schedule(&second, "ping", Duration::from_secs(1), true, || {});
        queue.schedule(&first, "save", Duration::from_secs(1), true, || {});

        assert!(queue.cancel_target(&first, "ping"));
        assert_eq!(queue.len(), 2);
        assert!(!queue.cancel_target(&first, "ping"));
        assert!(!queue.cancel_target(&second, "unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_rearms_from_now() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        let id = queue.schedule(&mailbox, "slow", Duration::from_secs(60), true, || {});
        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(queue.reschedule(id, Duration::from_millis(10)));
        assert!(queue.contains(id));

        tokio::time::advance(Duration::from_millis(10)).await;
        queue.inner.check_schedule();
        assert_eq!(drain(&inbox), vec!["slow"]);
        assert!(queue.contains(id), "Multi-shot task should be re-armed");

        assert!(!queue.reschedule(Uuid::new_v4(), Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delays_saturate() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        let far = queue.schedule(&mailbox, "far", Duration::from_secs(18_446_744_073_709_552), true, || {});
        let near = queue.schedule(&mailbox, "near", Duration::from_millis(10), false, || {});
        assert!(queue.reschedule(near, Duration::MAX));

        tokio::time::advance(Duration::from_secs(1)).await;
        queue.inner.check_schedule();

        assert!(drain(&inbox).is_empty());
        assert!(queue.contains(far));
        assert!(queue.contains(near));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_mailbox_drops_task() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("gone");
        drop(inbox);

        let id = queue.schedule(&mailbox, "repeat", Duration::from_millis(10), true, || {});
        tokio::time::advance(Duration::from_millis(10)).await;
        queue.inner.check_schedule();

        assert!(!queue.contains(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_fires_once_per_tick() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        queue.schedule(&mailbox, "busy", Duration::ZERO, true, || {});
        queue.inner.check_schedule();

        assert_eq!(drain(&inbox).len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_at_past_time_is_due() {
        let queue = TimedSignalQueue::new(1000);
        let (mailbox, inbox) = Mailbox::new("test");

        queue.schedule_at(&mailbox, "overdue", Utc::now() - chrono::Duration::hours(1), || {});
        queue.schedule_at(&mailbox, "future", Utc::now() + chrono::Duration::hours(1), || {});
        queue.inner.check_schedule();

        assert_eq!(drain(&inbox), vec!["overdue"]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precision_and_lifecycle() {
        let queue = TimedSignalQueue::default();
        assert_eq!(queue.precision(), Duration::from_millis(DEFAULT_PRECISION_MS));

        queue.set_precision(0);
        assert_eq!(queue.precision(), Duration::from_millis(DEFAULT_PRECISION_MS));

        queue.start();
        queue.set_precision(250);
        assert!(queue.is_running());
        assert_eq!(queue.precision(), Duration::from_millis(250));

        let (mailbox, _inbox) = Mailbox::new("test");
        queue.schedule(&mailbox, "a", Duration::from_secs(1), false, || {});
        queue.clear();
        assert!(queue.is_empty());

        queue.stop();
        assert!(!queue.is_running());
    }
}
