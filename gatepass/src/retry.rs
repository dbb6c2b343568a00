//! Attempt retry engine: runs one cycle of up to `max_attempts` attempts.
//!
//! Only one cycle runs per process. The [`ExecutionSlot`] is a capacity-1
//! semaphore acquired before attempt 1 and held by a [`SlotGuard`] until the
//! final attempt returns. Contention rejects; it never queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::events::CycleEvent;
use crate::core::types::{Attempt, CycleResult, Diagnostics, FailureKind, FinalOutcome, TriggerKind};
use crate::credentials::Credentials;
use crate::io::config::Settings;
use crate::io::form_profile::FormProfile;
use crate::io::passcode::PasscodeSource;
use crate::io::port::{PortFactory, PortLease, PortRequest};
use crate::session::{CycleContext, SessionMachine};
use crate::sink::{Emitter, EventSink};

/// Returned when a trigger arrives while another cycle holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("another cycle is already running")]
pub struct SlotBusy;

/// Process-wide, capacity-1 execution slot.
#[derive(Debug, Clone)]
pub struct ExecutionSlot {
    semaphore: Arc<Semaphore>,
}

impl ExecutionSlot {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the slot. The guard subscribes to `stop` at once, so a stop
    /// requested before the cycle task is first polled still applies.
    pub fn try_acquire(&self, stop: &StopSignal) -> Result<SlotGuard, SlotBusy> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(|permit| SlotGuard {
                _permit: permit,
                stop: stop.subscribe(),
            })
            .map_err(|_| SlotBusy)
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for ExecutionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the slot; dropping it frees the slot on every exit path.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    stop: watch::Receiver<u64>,
}

/// Broadcast stop requests as a generation counter, so a request made while
/// nobody is sleeping is still seen by the next inter-attempt sleep.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn request_stop(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one cycle consumes. Credentials are dropped with it.
#[derive(Debug)]
pub struct CycleRequest {
    pub trigger: TriggerKind,
    pub credentials: Credentials,
    pub profile: FormProfile,
    pub settings: Settings,
}

pub struct RetryEngine {
    factory: Arc<dyn PortFactory>,
    passcodes: Arc<dyn PasscodeSource>,
    sink: Arc<dyn EventSink>,
    slot: ExecutionSlot,
    stop: StopSignal,
    running_attempt: AtomicU32,
    next_cycle_id: AtomicU64,
}

impl RetryEngine {
    pub fn new(
        factory: Arc<dyn PortFactory>,
        passcodes: Arc<dyn PasscodeSource>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            factory,
            passcodes,
            sink,
            slot: ExecutionSlot::new(),
            stop: StopSignal::new(),
            running_attempt: AtomicU32::new(0),
            next_cycle_id: AtomicU64::new(0),
        }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn try_acquire(&self) -> Result<SlotGuard, SlotBusy> {
        self.slot.try_acquire(&self.stop)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    /// Index of the latest attempt of the running cycle, if a cycle is running.
    pub fn running_attempt(&self) -> Option<u32> {
        match self.running_attempt.load(Ordering::SeqCst) {
            0 => None,
            index => Some(index),
        }
    }

    /// Cancel the inter-attempt sleep of the running cycle, if any. An attempt
    /// already driving the port is left to finish.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Acquire the slot and run a cycle.
    pub async fn run(&self, request: CycleRequest) -> Result<FinalOutcome, SlotBusy> {
        let guard = self.try_acquire()?;
        Ok(self.execute(guard, request).await)
    }

    /// Run one cycle while holding `guard`. The slot is released and the
    /// credentials dropped before this returns.
    #[instrument(skip_all, fields(trigger = %request.trigger))]
    pub async fn execute(&self, mut guard: SlotGuard, request: CycleRequest) -> FinalOutcome {
        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::SeqCst) + 1;
        let emitter = Emitter::for_cycle(self.sink.clone(), cycle_id);
        let outcome = self
            .cycle(cycle_id, &request, &emitter, &mut guard.stop)
            .await;
        self.running_attempt.store(0, Ordering::SeqCst);
        drop(request);
        drop(guard);
        outcome
    }

    async fn cycle(
        &self,
        cycle_id: u64,
        request: &CycleRequest,
        emitter: &Emitter,
        stop: &mut watch::Receiver<u64>,
    ) -> FinalOutcome {
        let policy = request.settings.schedule.policy();
        emitter.emit(CycleEvent::CycleStarted {
            trigger_kind: request.trigger,
            max_attempts: policy.max_attempts,
        });
        if let Err(err) = request.settings.validate() {
            let error = format!("invalid settings: {err}");
            emitter.emit(CycleEvent::CycleFatal {
                error: error.clone(),
            });
            return FinalOutcome::Fatal {
                error,
                attempts: Vec::new(),
            };
        }
        info!(cycle_id, max_attempts = policy.max_attempts, "cycle started");

        let mut attempts: Vec<Attempt> = Vec::new();
        for index in 1..=policy.max_attempts {
            emitter.emit(CycleEvent::AttemptStarted {
                index,
                max: policy.max_attempts,
            });
            self.running_attempt.store(index, Ordering::SeqCst);
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = self.attempt(index, request, emitter).await;
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &outcome {
                CycleResult::Succeeded(confirmation) => {
                    emitter.emit(CycleEvent::CycleSucceeded {
                        attempt_index: index,
                        marker: confirmation.marker.clone(),
                    });
                    info!(cycle_id, attempt = index, "cycle succeeded");
                }
                CycleResult::Failed { kind, diagnostics } => {
                    emitter.emit(CycleEvent::AttemptFailed {
                        index,
                        reason: *kind,
                        message: diagnostics.message.clone(),
                        screenshot: diagnostics.screenshot.clone(),
                        last_url: diagnostics.last_url.clone(),
                    });
                }
            }
            let succeeded = outcome.is_success();
            attempts.push(Attempt {
                index,
                started_at,
                duration_ms,
                outcome,
            });
            if succeeded {
                return FinalOutcome::Success {
                    attempt_index: index,
                    attempts,
                };
            }

            if index < policy.max_attempts {
                debug!(
                    retry_in_secs = policy.retry_interval.as_secs(),
                    "waiting before next attempt"
                );
                if !wait_or_stop(policy.retry_interval, stop).await {
                    warn!(cycle_id, after_attempt = index, "cycle cancelled");
                    emitter.emit(CycleEvent::CycleFatal {
                        error: "cancelled".to_string(),
                    });
                    return FinalOutcome::Cancelled { attempts };
                }
            }
        }

        let outcome = conclude(attempts);
        match &outcome {
            FinalOutcome::Fatal { error, .. } => emitter.emit(CycleEvent::CycleFatal {
                error: error.clone(),
            }),
            other => {
                let (last_reason, last) = other
                    .last_failure()
                    .map(|(kind, diagnostics)| (kind, diagnostics.clone()))
                    .unwrap_or((FailureKind::Infrastructure, Diagnostics::default()));
                emitter.emit(CycleEvent::CycleExhausted {
                    attempts: other.attempts().len() as u32,
                    last_reason,
                    last_message: last.message,
                    screenshot: last.screenshot,
                });
            }
        }
        outcome
    }

    async fn attempt(&self, index: u32, request: &CycleRequest, emitter: &Emitter) -> CycleResult {
        let port_request = PortRequest::from_settings(&request.settings, index);
        let port = match self.factory.open(&port_request).await {
            Ok(port) => port,
            Err(err) => {
                warn!(attempt = index, error = %format!("{err:#}"), "could not open port");
                return CycleResult::failed(
                    FailureKind::Infrastructure,
                    Diagnostics::message(format!("{err:#}")),
                );
            }
        };
        let machine = SessionMachine::new(CycleContext {
            attempt: index,
            credentials: &request.credentials,
            profile: &request.profile,
            settings: &request.settings,
            passcodes: self.passcodes.as_ref(),
            emitter,
        });
        machine.run_cycle(PortLease::new(port)).await
    }
}

/// Sleep for `interval` unless a stop arrives first. Returns false on stop.
async fn wait_or_stop(interval: Duration, stop: &mut watch::Receiver<u64>) -> bool {
    if stop.has_changed().unwrap_or(false) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        Ok(()) = stop.changed() => false,
    }
}

/// Outcome after every attempt failed.
fn conclude(attempts: Vec<Attempt>) -> FinalOutcome {
    let all_infrastructure = !attempts.is_empty()
        && attempts
            .iter()
            .all(|a| a.outcome.failure_kind() == Some(FailureKind::Infrastructure));
    if all_infrastructure {
        let error = attempts
            .last()
            .and_then(|a| match &a.outcome {
                CycleResult::Failed { diagnostics, .. } => Some(diagnostics.message.clone()),
                CycleResult::Succeeded(_) => None,
            })
            .unwrap_or_else(|| "automation environment unavailable".to_string());
        return FinalOutcome::Fatal { error, attempts };
    }
    FinalOutcome::Exhausted { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    use crate::test_support::{
        RecordingSink, ScriptedPasscodes, ScriptedPort, ScriptedPortFactory, portal_settings,
    };

    fn engine(
        factory: ScriptedPortFactory,
        passcodes: ScriptedPasscodes,
    ) -> (Arc<RetryEngine>, Arc<RecordingSink>) {
        let recorder = Arc::new(RecordingSink::default());
        let engine = RetryEngine::new(Arc::new(factory), Arc::new(passcodes), recorder.clone());
        (Arc::new(engine), recorder)
    }

    fn request(max_attempts: u32) -> CycleRequest {
        let mut settings = portal_settings();
        settings.schedule.max_attempts = max_attempts;
        settings.schedule.retry_interval_secs = 10;
        CycleRequest {
            trigger: TriggerKind::Manual,
            credentials: Credentials::new("operator", "secret"),
            profile: FormProfile::default(),
            settings,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_cycle_runs_exactly_max_attempts() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().rejecting_passcode()));
        let (engine, recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        let outcome = engine.run(request(4)).await.expect("slot free");

        let FinalOutcome::Exhausted { attempts } = &outcome else {
            panic!("expected exhausted, got {}", outcome.label());
        };
        assert_eq!(attempts.len(), 4);
        let names = recorder.names();
        assert_eq!(names.iter().filter(|n| **n == "attempt_started").count(), 4);
        assert_eq!(names.last(), Some(&"cycle_exhausted"));
        assert!(!engine.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn success_stops_further_attempts() {
        let factory = ScriptedPortFactory::new(|attempt| {
            Ok(if attempt < 2 {
                ScriptedPort::portal().rejecting_passcode()
            } else {
                ScriptedPort::portal()
            })
        });
        let (engine, recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        let outcome = engine.run(request(5)).await.expect("slot free");

        assert!(matches!(outcome, FinalOutcome::Success { attempt_index: 2, .. }));
        assert_eq!(outcome.attempts().len(), 2);
        assert_eq!(recorder.names().last(), Some(&"cycle_succeeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_failing_to_open_is_fatal() {
        let factory = ScriptedPortFactory::new(|_| Err(anyhow!("chrome not installed")));
        let (engine, recorder) = engine(factory, ScriptedPasscodes::never());

        let outcome = engine.run(request(3)).await.expect("slot free");

        let FinalOutcome::Fatal { error, attempts } = &outcome else {
            panic!("expected fatal, got {}", outcome.label());
        };
        assert!(error.contains("chrome not installed"));
        assert_eq!(attempts.len(), 3);
        assert!(recorder.events().iter().any(|e| matches!(
            e,
            CycleEvent::AttemptFailed {
                reason: FailureKind::Infrastructure,
                ..
            }
        )));
        assert_eq!(recorder.names().last(), Some(&"cycle_fatal"));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_crashing_mid_session_every_time_is_fatal() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().failing_on("click")));
        let (engine, _recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        let outcome = engine.run(request(2)).await.expect("slot free");

        let FinalOutcome::Fatal { error, attempts } = &outcome else {
            panic!("expected fatal, got {}", outcome.label());
        };
        assert_eq!(attempts.len(), 2);
        assert!(error.contains("scripted driver failure during click"));
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_infrastructure_and_portal_failures_exhaust() {
        let factory = ScriptedPortFactory::new(|attempt| {
            if attempt == 1 {
                Err(anyhow!("browser crashed"))
            } else {
                Ok(ScriptedPort::portal().rejecting_passcode())
            }
        });
        let (engine, _recorder) = engine(factory, ScriptedPasscodes::always("123456"));
        let outcome = engine.run(request(2)).await.expect("slot free");
        assert_eq!(outcome.label(), "exhausted");
        assert_eq!(
            outcome.last_failure().map(|(kind, _)| kind),
            Some(FailureKind::Passcode)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_sleep_cancels_before_next_attempt() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().rejecting_passcode()));
        let (engine, recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(request(3)).await })
        };
        recorder.wait_for("attempt_failed").await;
        engine.request_stop();

        let outcome = running.await.expect("join").expect("slot free");
        assert_eq!(outcome.label(), "cancelled");
        assert_eq!(outcome.attempts().len(), 1);
        assert_eq!(
            recorder.events().last(),
            Some(&CycleEvent::CycleFatal {
                error: "cancelled".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_between_acquire_and_start_is_not_lost() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().rejecting_passcode()));
        let (engine, _recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        let guard = engine.try_acquire().expect("slot free");
        engine.request_stop();
        let outcome = engine.execute(guard, request(3)).await;

        assert_eq!(outcome.label(), "cancelled");
        assert_eq!(outcome.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_does_not_cancel_the_next_cycle() {
        let factory = ScriptedPortFactory::new(|_| Ok(ScriptedPort::portal().rejecting_passcode()));
        let (engine, _recorder) = engine(factory, ScriptedPasscodes::always("123456"));

        engine.request_stop();
        let outcome = engine.run(request(2)).await.expect("slot free");

        assert_eq!(outcome.label(), "exhausted");
        assert_eq!(outcome.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_cycle_is_rejected_while_slot_is_held() {
        let (engine, _recorder) = engine(
            ScriptedPortFactory::healthy(),
            ScriptedPasscodes::always("123456"),
        );
        let guard = engine.try_acquire().expect("first acquire");
        assert_eq!(engine.run(request(1)).await.err(), Some(SlotBusy));
        drop(guard);
        assert!(engine.run(request(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_gets_a_fresh_port_that_is_closed() {
        let factory = Arc::new(ScriptedPortFactory::new(|_| {
            Ok(ScriptedPort::portal().rejecting_passcode())
        }));
        let recorder = Arc::new(RecordingSink::default());
        let engine = RetryEngine::new(
            factory.clone(),
            Arc::new(ScriptedPasscodes::always("123456")),
            recorder,
        );
        engine.run(request(3)).await.expect("slot free");
        let logs = factory.logs();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|log| log.close_count() == 1));
        let attempts: Vec<u32> = factory.opens().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }
}
