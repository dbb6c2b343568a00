//! Daily trigger scheduler.
//!
//! Armed with a time of day, the scheduler sleeps until the next occurrence,
//! fires its [`Trigger`], then immediately re-arms for the following day.
//! The sleep is the only suspension point and is cancelled by [`DailyScheduler::disarm`].
//! It is taken in short steps against the wall clock, so suspend or clock
//! corrections never push a fire past its time by more than one step.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::core::events::CycleEvent;
use crate::core::schedule::{TimeOfDay, duration_until, next_fire_at};
use crate::sink::{Emitter, EventSink};

/// Longest single sleep before the wall clock is consulted again.
const MAX_SLEEP_STEP: Duration = Duration::from_secs(60);

/// Source of "now" and of the zone the time of day is interpreted in.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// First occurrence of `at` strictly after `after`, in this clock's zone.
    fn next_after(&self, after: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc>;
}

/// Wall clock in the machine's local zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn next_after(&self, after: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc> {
        next_fire_at(&after.with_timezone(&Local), at).with_timezone(&Utc)
    }
}

/// What the scheduler invokes when the time of day arrives.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn fire(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    Armed { next_fire_at: DateTime<Utc> },
}

struct Inner {
    state: ScheduleState,
    task: Option<JoinHandle<()>>,
    /// Bumped on every arm and disarm; a timer task only writes state while
    /// its own generation is current.
    generation: u64,
}

pub struct DailyScheduler {
    clock: Arc<dyn Clock>,
    emitter: Arc<Emitter>,
    inner: Arc<Mutex<Inner>>,
}

impl DailyScheduler {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            clock,
            emitter: Arc::new(Emitter::detached(sink)),
            inner: Arc::new(Mutex::new(Inner {
                state: ScheduleState::Idle,
                task: None,
                generation: 0,
            })),
        }
    }

    pub fn state(&self) -> ScheduleState {
        lock(&self.inner).state
    }

    /// Next fire instant for `at` as seen from now, without arming.
    pub fn preview(&self, at: TimeOfDay) -> DateTime<Utc> {
        self.clock.next_after(self.clock.now(), at)
    }

    /// Arm (or re-arm) for `at`. Replaces any pending timer.
    #[instrument(skip_all, fields(at = %at))]
    pub fn arm(&self, at: TimeOfDay, trigger: Arc<dyn Trigger>) -> DateTime<Utc> {
        let mut inner = lock(&self.inner);
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        let next = self.clock.next_after(self.clock.now(), at);
        inner.state = ScheduleState::Armed { next_fire_at: next };
        self.emitter.emit(CycleEvent::ScheduleChanged {
            next_fire_at: Some(next),
        });
        info!(next_fire_at = %next, "schedule armed");

        let clock = self.clock.clone();
        let emitter = self.emitter.clone();
        let shared = self.inner.clone();
        inner.task = Some(tokio::spawn(async move {
            let mut target = next;
            loop {
                sleep_until(clock.as_ref(), target).await;
                info!(fired_for = %target, "scheduled trigger firing");
                trigger.fire().await;

                let after = clock.now().max(target);
                target = clock.next_after(after, at);
                {
                    let mut inner = lock(&shared);
                    if inner.generation != generation {
                        debug!("schedule changed during fire; timer retiring");
                        return;
                    }
                    inner.state = ScheduleState::Armed {
                        next_fire_at: target,
                    };
                }
                emitter.emit(CycleEvent::ScheduleChanged {
                    next_fire_at: Some(target),
                });
            }
        }));
        next
    }

    /// Cancel the pending timer. No-op while idle. Never touches a running cycle.
    pub fn disarm(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == ScheduleState::Idle {
            return false;
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = ScheduleState::Idle;
        self.emitter
            .emit(CycleEvent::ScheduleChanged { next_fire_at: None });
        info!("schedule disarmed");
        true
    }
}

/// Sleep until the wall clock reaches `target`.
async fn sleep_until(clock: &dyn Clock, target: DateTime<Utc>) {
    let wait = duration_until(&clock.now(), &target);
    debug!(wait_secs = wait.as_secs(), "sleeping until next fire");
    loop {
        let wait = duration_until(&clock.now(), &target);
        if wait.is_zero() {
            return;
        }
        tokio::time::sleep(wait.min(MAX_SLEEP_STEP)).await;
    }
}

impl Drop for DailyScheduler {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner).task.take() {
            task.abort();
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
