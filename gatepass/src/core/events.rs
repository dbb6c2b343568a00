//! Lifecycle events pushed to observers.
//!
//! Events serialize with a `type` tag in snake_case. Every event of a cycle
//! carries that cycle's id and a per-cycle sequence number, so consumers can
//! drop duplicates when a terminal event is replayed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{FailureKind, SessionState, TriggerKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    CycleStarted {
        trigger_kind: TriggerKind,
        max_attempts: u32,
    },
    AttemptStarted {
        index: u32,
        max: u32,
    },
    StateChanged {
        attempt: u32,
        from: SessionState,
        to: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    AttemptFailed {
        index: u32,
        reason: FailureKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_url: Option<String>,
    },
    CycleSucceeded {
        attempt_index: u32,
        marker: String,
    },
    CycleExhausted {
        attempts: u32,
        last_reason: FailureKind,
        last_message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    CycleFatal {
        error: String,
    },
    TriggerSkipped {
        trigger_kind: TriggerKind,
        reason: String,
    },
    ScheduleChanged {
        /// `None` when the schedule was disarmed.
        next_fire_at: Option<DateTime<Utc>>,
    },
}

impl CycleEvent {
    /// Final event of a cycle. The dashboard replays the latest one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleEvent::CycleSucceeded { .. }
                | CycleEvent::CycleExhausted { .. }
                | CycleEvent::CycleFatal { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CycleEvent::CycleStarted { .. } => "cycle_started",
            CycleEvent::AttemptStarted { .. } => "attempt_started",
            CycleEvent::StateChanged { .. } => "state_changed",
            CycleEvent::AttemptFailed { .. } => "attempt_failed",
            CycleEvent::CycleSucceeded { .. } => "cycle_succeeded",
            CycleEvent::CycleExhausted { .. } => "cycle_exhausted",
            CycleEvent::CycleFatal { .. } => "cycle_fatal",
            CycleEvent::TriggerSkipped { .. } => "trigger_skipped",
            CycleEvent::ScheduleChanged { .. } => "schedule_changed",
        }
    }
}

/// An event as delivered to sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEnvelope {
    /// Cycle the event belongs to; `None` for scheduler-level events.
    pub cycle_id: Option<u64>,
    /// Position within the cycle (or within the scheduler stream), from 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CycleEvent,
}

impl EventEnvelope {
    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_the_tagged_event() {
        let envelope = EventEnvelope {
            cycle_id: Some(4),
            seq: 2,
            at: DateTime::parse_from_rfc3339("2026-03-10T07:00:01Z")
                .expect("instant")
                .with_timezone(&Utc),
            event: CycleEvent::AttemptFailed {
                index: 1,
                reason: FailureKind::Passcode,
                message: "passcode rejected".to_string(),
                screenshot: None,
                last_url: None,
            },
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "attempt_failed");
        assert_eq!(value["reason"], "otp");
        assert_eq!(value["cycle_id"], 4);
        assert!(value.get("screenshot").is_none());
    }

    #[test]
    fn state_changes_name_both_ends() {
        let event = CycleEvent::StateChanged {
            attempt: 1,
            from: SessionState::Unauthenticated,
            to: SessionState::Failed(FailureKind::Auth),
            message: None,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["from"], "unauthenticated");
        assert_eq!(value["to"]["failed"], "auth");
        assert!(!event.is_terminal());
    }

    #[test]
    fn only_cycle_endings_are_terminal() {
        assert!(CycleEvent::CycleFatal {
            error: "cancelled".to_string()
        }
        .is_terminal());
        assert!(!CycleEvent::TriggerSkipped {
            trigger_kind: TriggerKind::Manual,
            reason: "busy".to_string()
        }
        .is_terminal());
    }
}
