//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the session machine, the retry
//! engine, the scheduler and event consumers. They carry no I/O handles and
//! serialize to the shapes pushed to dashboard clients.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an attempt ended in `Failed`.
///
/// The first three are portal-side failures consumed as retry fuel.
/// `Infrastructure` means the local automation environment is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "otp")]
    Passcode,
    #[serde(rename = "submit")]
    Submit,
    #[serde(rename = "infrastructure")]
    Infrastructure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::Passcode => "otp",
            FailureKind::Submit => "submit",
            FailureKind::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication/submission progress of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    AwaitingPasscode,
    Authenticated,
    SubmissionInFlight,
    Succeeded,
    Failed(FailureKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed(_))
    }

    /// Position along the forward path. `Failed` has no rank of its own.
    pub(crate) fn rank(self) -> Option<u8> {
        match self {
            SessionState::Unauthenticated => Some(0),
            SessionState::AwaitingPasscode => Some(1),
            SessionState::Authenticated => Some(2),
            SessionState::SubmissionInFlight => Some(3),
            SessionState::Succeeded => Some(4),
            SessionState::Failed(_) => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unauthenticated => f.write_str("unauthenticated"),
            SessionState::AwaitingPasscode => f.write_str("awaiting_passcode"),
            SessionState::Authenticated => f.write_str("authenticated"),
            SessionState::SubmissionInFlight => f.write_str("submission_in_flight"),
            SessionState::Succeeded => f.write_str("succeeded"),
            SessionState::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => f.write_str("scheduled"),
            TriggerKind::Manual => f.write_str("manual"),
        }
    }
}

/// Evidence collected when an attempt fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Human-readable reason.
    pub message: String,
    /// Last URL the port reported before the failure.
    pub last_url: Option<String>,
    /// Reference returned by the port's screenshot capability.
    pub screenshot: Option<String>,
    /// Texts of blocking dialogs dismissed during the attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dialogs: Vec<String>,
}

impl Diagnostics {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Proof that the portal accepted the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Indicator that decided success (page text match or fallback marker).
    pub marker: String,
    pub url: Option<String>,
    pub screenshot: Option<String>,
    /// Values read back from the form before submission. Token-like values are
    /// truncated before they land here.
    pub extracted: BTreeMap<String, String>,
}

/// Result of one pass through the session machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleResult {
    Succeeded(Confirmation),
    Failed {
        kind: FailureKind,
        diagnostics: Diagnostics,
    },
}

impl CycleResult {
    pub fn failed(kind: FailureKind, diagnostics: Diagnostics) -> Self {
        CycleResult::Failed { kind, diagnostics }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CycleResult::Succeeded(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            CycleResult::Succeeded(_) => None,
            CycleResult::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// One recorded try within a cycle. Never mutated after it is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// 1-based index within the cycle.
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: CycleResult,
}

/// Final result of a cycle after the retry policy has run its course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalOutcome {
    /// Attempt `attempt_index` succeeded; later attempts never ran.
    Success {
        attempt_index: u32,
        attempts: Vec<Attempt>,
    },
    /// Every attempt failed and at least one reached the portal.
    Exhausted { attempts: Vec<Attempt> },
    /// Every attempt failed because the automation environment could not start.
    Fatal { error: String, attempts: Vec<Attempt> },
    /// A stop request ended the cycle between attempts.
    Cancelled { attempts: Vec<Attempt> },
}

impl FinalOutcome {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            FinalOutcome::Success { attempts, .. }
            | FinalOutcome::Exhausted { attempts }
            | FinalOutcome::Fatal { attempts, .. }
            | FinalOutcome::Cancelled { attempts } => attempts,
        }
    }

    /// Diagnostics of the last failed attempt, if any.
    pub fn last_failure(&self) -> Option<(FailureKind, &Diagnostics)> {
        self.attempts().iter().rev().find_map(|a| match &a.outcome {
            CycleResult::Failed { kind, diagnostics } => Some((*kind, diagnostics)),
            CycleResult::Succeeded(_) => None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FinalOutcome::Success { .. } => "success",
            FinalOutcome::Exhausted { .. } => "exhausted",
            FinalOutcome::Fatal { .. } => "fatal",
            FinalOutcome::Cancelled { .. } => "cancelled",
        }
    }
}
