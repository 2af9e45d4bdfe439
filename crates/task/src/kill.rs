//! Walltime enforcement.
//!
//! [`KillTask`] is a one-shot deadline timer. When it fires it kills its
//! target while holding the timer lock, so a concurrent [`KillTask::cancel`]
//! either disarms the timer first or observes that the kill already ran.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tasklaunch_core::{Error, TaskId};

/// Why an executable is being killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The walltime timer fired
    Walltime,
    /// The scheduler terminated the launcher abnormally
    Aborted,
}

impl KillReason {
    /// Error reported for a task killed for this reason
    #[must_use]
    pub fn into_error(self, task: &TaskId, walltime: Option<Duration>) -> Error {
        match self {
            KillReason::Walltime => {
                Error::walltime_exceeded(task.value(), walltime.unwrap_or_default())
            }
            KillReason::Aborted => Error::task_aborted(task.value()),
        }
    }
}

/// Anything a walltime timer or an abort can stop
pub trait Killable: Send + Sync {
    /// Stop the executable. Must be idempotent and must not block.
    fn kill(&self, reason: KillReason);
}

/// Cancellation flag shared between a running task and whoever may kill it
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    inner: Arc<SwitchInner>,
}

#[derive(Debug, Default)]
struct SwitchInner {
    token: CancellationToken,
    reason: OnceCell<KillReason>,
}

impl KillSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The first reason the switch was flipped for
    #[must_use]
    pub fn reason(&self) -> Option<KillReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the switch is flipped
    pub async fn killed(&self) -> KillReason {
        self.inner.token.cancelled().await;
        self.reason().unwrap_or(KillReason::Aborted)
    }
}

impl Killable for KillSwitch {
    fn kill(&self, reason: KillReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }
}

/// Result of [`KillTask::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The timer was armed and will not fire
    Disarmed,
    /// The timer fired before it could be disarmed
    AlreadyFired,
    /// Nothing was armed
    NotArmed,
}

enum TimerState {
    Idle,
    Armed { generation: u64, handle: JoinHandle<()> },
    Fired,
    Cancelled,
}

struct TimerInner {
    state: TimerState,
    generation: u64,
}

/// One-shot walltime timer bound to a killable target
pub struct KillTask {
    target: Arc<dyn Killable>,
    walltime: Duration,
    inner: Arc<Mutex<TimerInner>>,
}

impl KillTask {
    pub fn new(target: Arc<dyn Killable>, walltime: Duration) -> Self {
        Self {
            target,
            walltime,
            inner: Arc::new(Mutex::new(TimerInner {
                state: TimerState::Idle,
                generation: 0,
            })),
        }
    }

    #[must_use]
    pub fn walltime(&self) -> Duration {
        self.walltime
    }

    /// Arm the timer. Must be called from within a tokio runtime.
    ///
    /// Callers are expected to cancel before re-scheduling; a timer that is
    /// still armed is replaced and a warning is logged.
    pub fn schedule(&self) {
        let mut inner = self.inner.lock();
        if let TimerState::Armed { handle, .. } = &inner.state {
            tracing::warn!("walltime timer re-scheduled while armed, replacing it");
            handle.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;

        let timer = Arc::clone(&self.inner);
        let target = Arc::clone(&self.target);
        let walltime = self.walltime;
        // The spawned task cannot observe the timer before we release the lock.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(walltime).await;
            let mut inner = timer.lock();
            let current = matches!(
                inner.state,
                TimerState::Armed { generation: g, .. } if g == generation
            );
            if current {
                inner.state = TimerState::Fired;
                tracing::info!(
                    walltime_ms = u64::try_from(walltime.as_millis()).unwrap_or(u64::MAX),
                    "walltime reached, killing task"
                );
                target.kill(KillReason::Walltime);
            }
        });
        inner.state = TimerState::Armed { generation, handle };
    }

    /// Disarm the timer. Safe to call in any state.
    pub fn cancel(&self) -> CancelOutcome {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.state, TimerState::Cancelled) {
            TimerState::Armed { handle, .. } => {
                handle.abort();
                CancelOutcome::Disarmed
            }
            TimerState::Fired => {
                inner.state = TimerState::Fired;
                CancelOutcome::AlreadyFired
            }
            previous @ (TimerState::Idle | TimerState::Cancelled) => {
                inner.state = previous;
                CancelOutcome::NotArmed
            }
        }
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        matches!(self.inner.lock().state, TimerState::Fired)
    }
}

impl Drop for KillTask {
    fn drop(&mut self) {
        if let TimerState::Armed { handle, .. } = &self.inner.lock().state {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        kills: AtomicUsize,
    }

    impl Killable for CountingTarget {
        fn kill(&self, _reason: KillReason) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timer(ms: u64) -> (Arc<CountingTarget>, KillTask) {
        let target = Arc::new(CountingTarget::default());
        let task = KillTask::new(target.clone(), Duration::from_millis(ms));
        (target, task)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_never_kills() {
        let (target, task) = timer(50);
        task.schedule();
        assert_eq!(task.cancel(), CancelOutcome::Disarmed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 0);
        assert_eq!(task.cancel(), CancelOutcome::NotArmed);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_after_deadline() {
        let (target, task) = timer(50);
        task.schedule();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 1);
        assert!(task.has_fired());
        assert_eq!(task.cancel(), CancelOutcome::AlreadyFired);
        assert_eq!(task.cancel(), CancelOutcome::AlreadyFired);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_previous_timer() {
        let (target, task) = timer(50);
        task.schedule();
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.schedule();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_disarms() {
        let (target, task) = timer(10);
        task.schedule();
        drop(task);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn switch_records_first_reason() {
        let switch = KillSwitch::new();
        assert!(!switch.is_killed());
        switch.kill(KillReason::Walltime);
        switch.kill(KillReason::Aborted);
        assert!(switch.is_killed());
        assert_eq!(switch.killed().await, KillReason::Walltime);
    }
}
