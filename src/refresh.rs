//! # Bucket Refresh Timers
//!
//! Each bucket owns one [`RefreshTimer`]. Every mutation of the bucket pushes
//! its deadline out to `now + interval` (jittered by ±`jitter` so buckets
//! created together do not all go stale together). If the deadline passes
//! without activity, the timer task sends a [`RefreshEvent`] to the owner's
//! channel and then re-arms itself with a fresh deadline.
//!
//! ## Cancellation
//!
//! Deadline and generation live behind one lock shared with the task. Every
//! (re)arm or stop bumps the generation; a task that wakes up under a stale
//! generation exits without emitting. Stopping an idle timer is a no-op.
//!
//! ## Runtime
//!
//! Timers are tokio tasks. Outside a runtime the deadline is still tracked
//! (and exported) but no task is spawned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::peer::now_ms;

/// Base interval after which an idle bucket is considered stale (1 hour).
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Relative jitter applied to [`REFRESH_INTERVAL`] (±10%).
pub const REFRESH_JITTER: f64 = 0.1;

/// Shortest interval a policy is allowed to use.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Largest accepted jitter; keeps every deadline strictly in the future.
const MAX_REFRESH_JITTER: f64 = 0.99;

/// Process-unique handle naming a bucket across splits and range changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u64);

impl BucketId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bucket#{}", self.0)
    }
}

/// "This bucket is stale, perform a refresh lookup."
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshEvent {
    pub bucket: BucketId,
    /// The deadline (unix ms) that expired.
    pub deadline: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefreshPolicy {
    pub interval: Duration,
    /// Relative jitter in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: REFRESH_INTERVAL,
            jitter: REFRESH_JITTER,
        }
    }
}

impl RefreshPolicy {
    /// Interval floored at [`MIN_REFRESH_INTERVAL`]; NaN, infinite or
    /// negative jitter becomes 0, the rest is capped below 1.
    pub fn normalized(self) -> Self {
        let jitter = if self.jitter.is_finite() && self.jitter > 0.0 {
            self.jitter.min(MAX_REFRESH_JITTER)
        } else {
            0.0
        };
        Self {
            interval: self.interval.max(MIN_REFRESH_INTERVAL),
            jitter,
        }
    }

    /// Deadline `now_ms + interval * (1 ± jitter)`, on the normalized policy.
    pub fn next_deadline(&self, now_ms: u64) -> u64 {
        let policy = self.normalized();
        let factor = if policy.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-policy.jitter..=policy.jitter)
        } else {
            1.0
        };
        let wait = (policy.interval.as_millis() as f64 * factor).floor() as u64;
        now_ms.saturating_add(wait)
    }
}

#[derive(Debug)]
struct TimerState {
    deadline: u64,
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct RefreshTimer {
    bucket: BucketId,
    policy: RefreshPolicy,
    events: mpsc::Sender<RefreshEvent>,
    state: Arc<Mutex<TimerState>>,
    task: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshTimer {
    /// A stopped timer with an initial deadline computed from `policy`.
    pub fn new(bucket: BucketId, policy: RefreshPolicy, events: mpsc::Sender<RefreshEvent>) -> Self {
        Self {
            bucket,
            policy,
            events,
            state: Arc::new(Mutex::new(TimerState {
                deadline: policy.next_deadline(now_ms()),
                generation: 0,
            })),
            task: None,
        }
    }

    pub fn events(&self) -> &mpsc::Sender<RefreshEvent> {
        &self.events
    }

    pub fn deadline(&self) -> u64 {
        lock(&self.state).deadline
    }

    /// Overwrite the deadline without touching the task.
    pub fn set_deadline(&mut self, deadline: u64) {
        lock(&self.state).deadline = deadline;
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Push the deadline out by one jittered interval and restart the timer.
    pub fn touch(&mut self) {
        let deadline = self.policy.next_deadline(now_ms());
        self.set_deadline(deadline);
        self.stop();
        self.arm();
    }

    /// Schedule the notification for the current deadline.
    pub fn arm(&mut self) {
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.generation
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!(bucket = %self.bucket, "no tokio runtime, refresh timer not armed");
            return;
        };

        trace!(bucket = %self.bucket, deadline = self.deadline(), "refresh timer armed");
        self.task = Some(runtime.spawn(run_timer(
            self.bucket,
            self.policy,
            self.events.clone(),
            self.state.clone(),
            generation,
        )));
    }

    /// Cancel any pending notification. Idempotent.
    pub fn stop(&mut self) {
        lock(&self.state).generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    bucket: BucketId,
    policy: RefreshPolicy,
    events: mpsc::Sender<RefreshEvent>,
    state: Arc<Mutex<TimerState>>,
    generation: u64,
) {
    loop {
        let deadline = {
            let guard = lock(&state);
            if guard.generation != generation {
                return;
            }
            guard.deadline
        };
        tokio::time::sleep(Duration::from_millis(deadline.saturating_sub(now_ms()))).await;

        if !fire(bucket, &policy, &events, &state, generation) {
            return;
        }
    }
}

/// Emit the stale notification and roll the deadline forward.
/// Returns `false` once the timer has been superseded or its owner is gone.
fn fire(
    bucket: BucketId,
    policy: &RefreshPolicy,
    events: &mpsc::Sender<RefreshEvent>,
    state: &Mutex<TimerState>,
    generation: u64,
) -> bool {
    let mut guard = lock(state);
    if guard.generation != generation {
        return false;
    }

    match events.try_send(RefreshEvent { bucket, deadline: guard.deadline }) {
        Ok(()) => {
            trace!(%bucket, deadline = guard.deadline, "bucket stale, refresh requested");
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%bucket, "refresh channel full, dropping notification");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(%bucket, "refresh channel closed, stopping timer");
            return false;
        }
    }

    guard.deadline = policy.next_deadline(now_ms());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(secs: u64) -> RefreshPolicy {
        RefreshPolicy {
            interval: Duration::from_secs(secs),
            jitter: REFRESH_JITTER,
        }
    }

    #[test]
    fn deadline_is_jittered_within_window() {
        let policy = RefreshPolicy::default();
        let now = 1_000_000;
        let base = REFRESH_INTERVAL.as_millis() as u64;
        for _ in 0..256 {
            let deadline = policy.next_deadline(now);
            assert!(deadline >= now + base * 9 / 10, "deadline too early: {deadline}");
            assert!(deadline <= now + base * 11 / 10, "deadline too late: {deadline}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RefreshPolicy {
            interval: Duration::from_millis(500),
            jitter: 0.0,
        };
        assert_eq!(policy.next_deadline(10), 510);
    }

    #[test]
    fn degenerate_policy_is_normalized() {
        let nan = RefreshPolicy {
            interval: Duration::from_secs(1),
            jitter: f64::NAN,
        };
        assert_eq!(nan.normalized().jitter, 0.0);
        assert_eq!(nan.next_deadline(10), 1_010);

        let negative = RefreshPolicy {
            interval: Duration::from_secs(2),
            jitter: -0.5,
        };
        assert_eq!(negative.next_deadline(0), 2_000);

        let wild = RefreshPolicy {
            interval: Duration::from_secs(10),
            jitter: f64::INFINITY,
        };
        assert_eq!(wild.normalized().jitter, 0.0);
        let capped = RefreshPolicy { jitter: 5.0, ..wild };
        assert_eq!(capped.normalized().jitter, MAX_REFRESH_JITTER);
        assert!(capped.next_deadline(0) > 0);

        let zero = RefreshPolicy {
            interval: Duration::ZERO,
            jitter: 0.0,
        };
        assert_eq!(zero.normalized().interval, MIN_REFRESH_INTERVAL);
        assert_eq!(zero.next_deadline(0), MIN_REFRESH_INTERVAL.as_millis() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_does_not_spin() {
        let (tx, mut rx) = mpsc::channel(64);
        let zero = RefreshPolicy {
            interval: Duration::ZERO,
            jitter: 0.0,
        };
        let mut timer = RefreshTimer::new(BucketId::next(), zero, tx);
        timer.touch();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn arm_without_runtime_keeps_deadline() {
        let (tx, _rx) = mpsc::channel(4);
        let mut timer = RefreshTimer::new(BucketId::next(), policy(60), tx);
        timer.touch();
        assert!(!timer.is_active());
        assert!(timer.deadline() > now_ms());
        timer.stop();
        timer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_deadline_and_rearms() {
        let (tx, mut rx) = mpsc::channel(4);
        let id = BucketId::next();
        let mut timer = RefreshTimer::new(id, policy(60), tx);
        timer.touch();
        assert!(timer.is_active());

        let first = rx.recv().await.expect("first refresh");
        assert_eq!(first.bucket, id);

        let second = rx.recv().await.expect("second refresh");
        assert_eq!(second.bucket, id);
        assert!(timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_notification() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = RefreshTimer::new(BucketId::next(), policy(60), tx);
        timer.touch();
        timer.stop();
        assert!(!timer.is_active());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_fires_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = RefreshTimer::new(BucketId::next(), policy(3600), tx);
        timer.set_deadline(now_ms().saturating_sub(5_000));
        timer.arm();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("refresh before timeout")
            .expect("channel open");
        assert!(event.deadline < now_ms());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_timer_cancels_task() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = RefreshTimer::new(BucketId::next(), policy(60), tx);
        timer.touch();
        drop(timer);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
