//! Legal session state transitions.
//!
//! Forward moves follow the path `Unauthenticated -> AwaitingPasscode ->
//! Authenticated -> SubmissionInFlight -> Succeeded`, where the passcode step
//! may be skipped and only the in-flight step may be skipped on the way to
//! success. Every failure is terminal and must carry the reason that matches
//! the phase it left, or `infrastructure`, which any phase may fail with.

use super::types::{FailureKind, SessionState};

/// Return an error message when `from -> to` is not a legal transition.
pub fn check_transition(from: SessionState, to: SessionState) -> Result<(), String> {
    if from.is_terminal() {
        return Err(format!("{from} is terminal; cannot move to {to}"));
    }
    if let SessionState::Failed(kind) = to {
        let expected = failure_for(from);
        if kind != expected && kind != FailureKind::Infrastructure {
            return Err(format!(
                "leaving {from} must fail with {expected}, not {kind}"
            ));
        }
        return Ok(());
    }
    let legal = matches!(
        (from, to),
        (
            SessionState::Unauthenticated,
            SessionState::AwaitingPasscode | SessionState::Authenticated
        ) | (SessionState::AwaitingPasscode, SessionState::Authenticated)
            | (
                SessionState::Authenticated,
                SessionState::SubmissionInFlight | SessionState::Succeeded
            )
            | (SessionState::SubmissionInFlight, SessionState::Succeeded)
    );
    if legal {
        Ok(())
    } else {
        Err(format!("illegal transition {from} -> {to}"))
    }
}

/// The failure reason a non-terminal state produces when it fails.
pub fn failure_for(state: SessionState) -> FailureKind {
    match state {
        SessionState::Unauthenticated => FailureKind::Auth,
        SessionState::AwaitingPasscode => FailureKind::Passcode,
        SessionState::Authenticated
        | SessionState::SubmissionInFlight
        | SessionState::Succeeded => FailureKind::Submit,
        SessionState::Failed(kind) => kind,
    }
}

/// True when every forward step in `path` increases the rank.
pub fn is_monotonic(path: &[SessionState]) -> bool {
    path.windows(2).all(|pair| match (pair[0].rank(), pair[1].rank()) {
        (Some(a), Some(b)) => b > a,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_path_is_legal() {
        let path = [
            SessionState::Unauthenticated,
            SessionState::AwaitingPasscode,
            SessionState::Authenticated,
            SessionState::SubmissionInFlight,
            SessionState::Succeeded,
        ];
        for pair in path.windows(2) {
            check_transition(pair[0], pair[1]).expect("legal");
        }
        assert!(is_monotonic(&path));
    }

    #[test]
    fn passcode_can_be_skipped() {
        check_transition(SessionState::Unauthenticated, SessionState::Authenticated)
            .expect("rare path");
    }

    #[test]
    fn backward_moves_are_rejected() {
        let err = check_transition(SessionState::Authenticated, SessionState::AwaitingPasscode)
            .unwrap_err();
        assert!(err.contains("illegal transition"));
        assert!(!is_monotonic(&[
            SessionState::Authenticated,
            SessionState::Unauthenticated
        ]));
    }

    #[test]
    fn failure_reason_must_match_phase() {
        check_transition(
            SessionState::AwaitingPasscode,
            SessionState::Failed(FailureKind::Passcode),
        )
        .expect("otp failure");
        check_transition(
            SessionState::SubmissionInFlight,
            SessionState::Failed(FailureKind::Submit),
        )
        .expect("submit failure");
        let err = check_transition(
            SessionState::Unauthenticated,
            SessionState::Failed(FailureKind::Submit),
        )
        .unwrap_err();
        assert!(err.contains("must fail with auth"));
    }

    #[test]
    fn infrastructure_failure_is_legal_from_any_live_state() {
        for from in [
            SessionState::Unauthenticated,
            SessionState::AwaitingPasscode,
            SessionState::Authenticated,
            SessionState::SubmissionInFlight,
        ] {
            check_transition(from, SessionState::Failed(FailureKind::Infrastructure))
                .expect("driver fault");
        }
        assert!(
            check_transition(
                SessionState::Succeeded,
                SessionState::Failed(FailureKind::Infrastructure)
            )
            .is_err()
        );
    }

    #[test]
    fn terminal_states_do_not_move() {
        let failed = SessionState::Failed(FailureKind::Auth);
        assert!(check_transition(failed, SessionState::Authenticated).is_err());
        assert!(check_transition(SessionState::Succeeded, failed).is_err());
    }
}
