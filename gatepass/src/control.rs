//! Control surface shared by the CLI daemon and the dashboard.
//!
//! The [`Controller`] owns the retry engine, the daily scheduler and the
//! passcode inbox. Settings and the form profile are read from `.gatepass/`
//! at every trigger, so a saved change applies to the next cycle.
//!
//! Credentials handed to [`Controller::arm_schedule`] stay in memory only for
//! as long as the schedule is armed. Credentials handed to
//! [`Controller::fire_now`] move into the cycle and are dropped with it.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::core::events::CycleEvent;
use crate::core::types::{FinalOutcome, TriggerKind};
use crate::credentials::Credentials;
use crate::io::config::{ScheduleConfig, Settings, load_settings};
use crate::io::form_profile::{FormProfile, load_form_profile};
use crate::io::init::GatepassPaths;
use crate::io::passcode::PasscodeInbox;
use crate::io::port::PortFactory;
use crate::retry::{CycleRequest, RetryEngine, SlotBusy};
use crate::scheduler::{Clock, DailyScheduler, ScheduleState, Trigger};
use crate::sink::{Emitter, EventSink};

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControllerStatus {
    Idle,
    Armed { next_fire_at: DateTime<Utc> },
    Running { attempt_index: u32 },
}

/// Summary of the most recent finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub trigger: TriggerKind,
    pub finished_at: DateTime<Utc>,
    pub outcome: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunRecord {
    fn from_outcome(trigger: TriggerKind, outcome: &FinalOutcome) -> Self {
        let message = match outcome {
            FinalOutcome::Success { .. } => None,
            FinalOutcome::Fatal { error, .. } => Some(error.clone()),
            other => other
                .last_failure()
                .map(|(kind, diagnostics)| format!("{kind}: {}", diagnostics.message)),
        };
        Self {
            trigger,
            finished_at: Utc::now(),
            outcome: outcome.label(),
            attempts: outcome.attempts().len() as u32,
            message,
        }
    }
}

/// Dashboard status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: ControllerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub awaiting_passcode: bool,
    pub holds_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunRecord>,
}

struct Armed {
    schedule: ScheduleConfig,
    credentials: Credentials,
}

struct Shared {
    paths: GatepassPaths,
    engine: Arc<RetryEngine>,
    inbox: Arc<PasscodeInbox>,
    detached: Emitter,
    armed: Mutex<Option<Armed>>,
    last_run: Mutex<Option<RunRecord>>,
}

pub struct Controller {
    shared: Arc<Shared>,
    scheduler: DailyScheduler,
}

impl Controller {
    pub fn new(
        root: &Path,
        factory: Arc<dyn PortFactory>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inbox = Arc::new(PasscodeInbox::new());
        let engine = Arc::new(RetryEngine::new(factory, inbox.clone(), sink.clone()));
        Self {
            shared: Arc::new(Shared {
                paths: GatepassPaths::new(root),
                engine,
                inbox,
                detached: Emitter::detached(sink.clone()),
                armed: Mutex::new(None),
                last_run: Mutex::new(None),
            }),
            scheduler: DailyScheduler::new(clock, sink),
        }
    }

    pub fn paths(&self) -> &GatepassPaths {
        &self.shared.paths
    }

    /// Arm the daily schedule. Invalid input is rejected with a
    /// [`crate::core::errors::ConfigError`] before anything changes.
    #[instrument(skip_all, fields(at = %schedule.time_of_day))]
    pub fn arm_schedule(
        &self,
        schedule: ScheduleConfig,
        credentials: Credentials,
    ) -> Result<DateTime<Utc>> {
        schedule.validate()?;
        credentials.validate()?;
        let at = schedule.time_of_day;
        *lock(&self.shared.armed) = Some(Armed {
            schedule,
            credentials,
        });
        let trigger: Arc<dyn Trigger> = Arc::new(ScheduledTrigger(Arc::downgrade(&self.shared)));
        Ok(self.scheduler.arm(at, trigger))
    }

    /// Cancel future scheduled triggers and forget their credentials. A cycle
    /// already running is left to finish.
    pub fn disarm_schedule(&self) -> bool {
        let was_armed = self.scheduler.disarm();
        let dropped = lock(&self.shared.armed).take().is_some();
        was_armed || dropped
    }

    /// Run a cycle now with the given credentials. Never touches the schedule.
    /// Rejected with [`SlotBusy`] while another cycle runs.
    pub fn fire_now(&self, credentials: Credentials) -> Result<JoinHandle<FinalOutcome>> {
        credentials.validate()?;
        self.shared.start(TriggerKind::Manual, credentials, None)
    }

    /// Hand the operator's passcode to the attempt waiting for it.
    pub fn submit_passcode(&self, code: &str) -> Result<()> {
        self.shared.inbox.submit(code)
    }

    /// Halt everything: disarm the schedule and stop the running cycle after
    /// its current attempt.
    pub fn stop(&self) {
        info!("stop requested");
        self.disarm_schedule();
        self.shared.engine.request_stop();
    }

    pub fn current_status(&self) -> ControllerStatus {
        if let Some(attempt_index) = self.shared.engine.running_attempt() {
            return ControllerStatus::Running { attempt_index };
        }
        match self.scheduler.state() {
            ScheduleState::Idle => ControllerStatus::Idle,
            ScheduleState::Armed { next_fire_at } => ControllerStatus::Armed { next_fire_at },
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let next_fire_at = match self.scheduler.state() {
            ScheduleState::Armed { next_fire_at } => Some(next_fire_at),
            ScheduleState::Idle => None,
        };
        StatusSnapshot {
            status: self.current_status(),
            next_fire_at,
            awaiting_passcode: self.shared.inbox.is_waiting(),
            holds_credentials: self.holds_credentials(),
            last_run: lock(&self.shared.last_run).clone(),
        }
    }

    /// True while an armed schedule keeps credentials in memory.
    pub fn holds_credentials(&self) -> bool {
        lock(&self.shared.armed).is_some()
    }
}

impl Shared {
    /// Load the stores, take the slot and spawn the cycle.
    fn start(
        self: &Arc<Self>,
        trigger: TriggerKind,
        credentials: Credentials,
        schedule: Option<ScheduleConfig>,
    ) -> Result<JoinHandle<FinalOutcome>> {
        let (settings, profile) = match self.load(schedule) {
            Ok(loaded) => loaded,
            Err(err) => {
                // A manual caller gets the error back directly.
                if trigger == TriggerKind::Scheduled {
                    self.skip(trigger, format!("{err:#}"));
                }
                return Err(err);
            }
        };
        let guard = match self.engine.try_acquire() {
            Ok(guard) => guard,
            Err(busy) => {
                self.skip(trigger, busy.to_string());
                return Err(busy.into());
            }
        };
        let request = CycleRequest {
            trigger,
            credentials,
            profile,
            settings,
        };
        let shared = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = shared.engine.execute(guard, request).await;
            info!(outcome = outcome.label(), "cycle finished");
            *lock(&shared.last_run) = Some(RunRecord::from_outcome(trigger, &outcome));
            outcome
        }))
    }

    fn load(&self, schedule: Option<ScheduleConfig>) -> Result<(Settings, FormProfile)> {
        let mut settings = load_settings(&self.paths.settings_path)?;
        if let Some(schedule) = schedule {
            settings.schedule = schedule;
        }
        settings.validate().context("validate settings for this cycle")?;
        settings.screenshot_dir = self.paths.screenshot_dir(&settings);
        let profile = load_form_profile(&self.paths.form_profile_path)?;
        Ok((settings, profile))
    }

    fn skip(&self, trigger: TriggerKind, reason: String) {
        warn!(%trigger, %reason, "trigger skipped");
        self.detached.emit(CycleEvent::TriggerSkipped {
            trigger_kind: trigger,
            reason,
        });
    }

    fn fire_scheduled(self: &Arc<Self>) {
        let armed = lock(&self.armed)
            .as_ref()
            .map(|armed| (armed.credentials.clone(), armed.schedule.clone()));
        let Some((credentials, schedule)) = armed else {
            self.skip(TriggerKind::Scheduled, "no credentials armed".to_string());
            return;
        };
        if let Err(err) = self.start(TriggerKind::Scheduled, credentials, Some(schedule)) {
            if err.downcast_ref::<SlotBusy>().is_none() {
                warn!(error = %format!("{err:#}"), "scheduled cycle did not start");
            }
        }
    }
}

struct ScheduledTrigger(Weak<Shared>);

#[async_trait]
impl Trigger for ScheduledTrigger {
    async fn fire(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.fire_scheduled();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::errors::ConfigError;
    use crate::core::types::SessionState;
    use crate::io::config::write_settings;
    use crate::test_support::{
        RecordingSink, ScriptedPort, ScriptedPortFactory, TestClock, temp_project,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        controller: Controller,
        recorder: Arc<RecordingSink>,
    }

    fn fixture(factory: ScriptedPortFactory, now: &str) -> Fixture {
        let (temp, paths) = temp_project().expect("project");
        let recorder = Arc::new(RecordingSink::default());
        let controller = Controller::new(
            &paths.root,
            Arc::new(factory),
            recorder.clone(),
            Arc::new(TestClock::at(now)),
        );
        Fixture {
            _temp: temp,
            controller,
            recorder,
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("operator", "secret")
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_is_rejected_without_side_effects() {
        let f = fixture(ScriptedPortFactory::healthy(), "2026-03-10T06:00:00+05:30");
        let schedule = ScheduleConfig {
            max_attempts: 0,
            ..ScheduleConfig::default()
        };

        let err = f
            .controller
            .arm_schedule(schedule, credentials())
            .expect_err("must reject");

        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MaxAttempts(0))
        );
        assert_eq!(f.controller.current_status(), ControllerStatus::Idle);
        assert!(!f.controller.holds_credentials());
        assert!(f.recorder.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fire_is_skipped_not_queued() {
        let factory = ScriptedPortFactory::healthy().with_open_delay(Duration::from_secs(2));
        let f = fixture(factory, "2026-03-10T06:00:00+05:30");

        let first = f.controller.fire_now(credentials()).expect("first fire");
        let err = f
            .controller
            .fire_now(credentials())
            .expect_err("second fire rejected");
        assert!(err.downcast_ref::<SlotBusy>().is_some());

        let outcome = first.await.expect("join");
        assert_eq!(outcome.label(), "exhausted");
        let names = f.recorder.names();
        assert_eq!(names.iter().filter(|n| **n == "cycle_started").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "trigger_skipped").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dashboard_passcode_completes_the_challenge() {
        let f = fixture(ScriptedPortFactory::healthy(), "2026-03-10T06:00:00+05:30");
        let running = f.controller.fire_now(credentials()).expect("fire");

        while !f.controller.snapshot().awaiting_passcode {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            f.controller.current_status(),
            ControllerStatus::Running { attempt_index: 1 }
        );
        f.controller.submit_passcode("482913").expect("submit");

        let outcome = running.await.expect("join");
        assert!(matches!(outcome, FinalOutcome::Success { attempt_index: 1, .. }));
        assert!(f.recorder.events().iter().any(|event| matches!(
            event,
            CycleEvent::StateChanged {
                to: SessionState::Succeeded,
                ..
            }
        )));
        let snapshot = f.controller.snapshot();
        assert_eq!(snapshot.status, ControllerStatus::Idle);
        assert_eq!(snapshot.last_run.map(|run| run.outcome), Some("success"));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_fire_uses_armed_credentials_and_rearms() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().without_passcode_challenge()));
        let f = fixture(factory, "2026-03-10T06:59:50+05:30");
        let next = f
            .controller
            .arm_schedule(ScheduleConfig::default(), credentials())
            .expect("arm");
        assert_eq!(
            f.controller.current_status(),
            ControllerStatus::Armed { next_fire_at: next }
        );

        tokio::time::timeout(Duration::from_secs(600), f.recorder.wait_for("cycle_succeeded"))
            .await
            .expect("scheduled cycle ran");
        let started = f.recorder.events().into_iter().find_map(|event| match event {
            CycleEvent::CycleStarted { trigger_kind, .. } => Some(trigger_kind),
            _ => None,
        });
        assert_eq!(started, Some(TriggerKind::Scheduled));
        assert!(f.controller.holds_credentials());
        assert!(matches!(
            f.controller.snapshot().next_fire_at,
            Some(at) if at > next
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_forgets_credentials() {
        let f = fixture(ScriptedPortFactory::healthy(), "2026-03-10T06:00:00+05:30");
        f.controller
            .arm_schedule(ScheduleConfig::default(), credentials())
            .expect("arm");
        assert!(f.controller.holds_credentials());

        assert!(f.controller.disarm_schedule());
        assert!(!f.controller.holds_credentials());
        assert_eq!(f.controller.current_status(), ControllerStatus::Idle);
        assert!(!f.controller.disarm_schedule());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_stored_settings_fail_a_manual_fire_without_events() {
        let f = fixture(ScriptedPortFactory::healthy(), "2026-03-10T06:00:00+05:30");
        std::fs::write(
            &f.controller.paths().settings_path,
            "[schedule]\nmax_attempts = 42\n",
        )
        .expect("write settings");

        let err = f.controller.fire_now(credentials()).expect_err("invalid settings");
        assert!(format!("{err:#}").contains("max_attempts"));
        assert!(f.recorder.names().is_empty());
        assert_eq!(f.controller.current_status(), ControllerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_stored_settings_skip_a_scheduled_trigger() {
        let f = fixture(ScriptedPortFactory::healthy(), "2026-03-10T06:59:50+05:30");
        f.controller
            .arm_schedule(ScheduleConfig::default(), credentials())
            .expect("arm");
        std::fs::write(
            &f.controller.paths().settings_path,
            "[schedule]\nmax_attempts = 42\n",
        )
        .expect("write settings");

        tokio::time::timeout(Duration::from_secs(60), f.recorder.wait_for("trigger_skipped"))
            .await
            .expect("trigger skipped");
        let names = f.recorder.names();
        assert!(!names.contains(&"cycle_started"));
        assert!(f.controller.holds_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_lets_the_running_cycle_use_every_attempt() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().rejecting_passcode()));
        let f = fixture(factory, "2026-03-10T06:00:00+05:30");
        f.controller
            .arm_schedule(ScheduleConfig::default(), credentials())
            .expect("arm");
        let mut settings = Settings::default();
        settings.schedule.max_attempts = 3;
        write_settings(&f.controller.paths().settings_path, &settings).expect("write settings");

        let running = f.controller.fire_now(credentials()).expect("fire");
        tokio::time::timeout(Duration::from_secs(3600), f.recorder.wait_for("attempt_failed"))
            .await
            .expect("first attempt failed");
        assert!(f.controller.disarm_schedule());

        let outcome = running.await.expect("join");
        assert_eq!(outcome.label(), "exhausted");
        assert_eq!(outcome.attempts().len(), 3);
        assert!(!f.controller.holds_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_also_disarms_the_schedule() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().without_passcode_challenge()));
        let f = fixture(factory, "2026-03-10T06:59:50+05:30");
        f.controller
            .arm_schedule(ScheduleConfig::default(), credentials())
            .expect("arm");

        f.controller.stop();

        assert_eq!(f.controller.current_status(), ControllerStatus::Idle);
        assert!(!f.controller.holds_credentials());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!f.recorder.names().contains(&"cycle_started"));
    }
}
