//! Session state machine: one login + submit pass through the portal.
//!
//! A [`SessionMachine`] is built fresh for every attempt, drives the port
//! exactly once through the transition graph and never retries internally.
//! Each transition is emitted as `state_changed`. Any error raised while in a
//! phase fails the attempt with that phase's reason (auth, otp or submit),
//! except driver faults, which fail it as infrastructure from any phase.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::BudgetExhausted;
use crate::core::events::CycleEvent;
use crate::core::transitions::{check_transition, failure_for};
use crate::core::types::{Confirmation, CycleResult, Diagnostics, FailureKind, SessionState};
use crate::credentials::Credentials;
use crate::io::config::Settings;
use crate::io::form_profile::{Control, FormProfile, Presence};
use crate::io::passcode::PasscodeSource;
use crate::io::port::{Locator, PortLease, is_driver_fault};
use crate::protocol::{IndicatorScan, Interactor, WaitTier, first_match};
use crate::sink::Emitter;

/// Element ids on the sign-in page.
mod login {
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const GENERATE_PASSCODE: &str = "generateOtpBtn";
    pub const PASSCODE_SECTION: &str = "otpSection";
    pub const PASSCODE_INPUT: &str = "otp_code";
    pub const VERIFY_PASSCODE: &str = "verifyOtpBtn";
    pub const SIGN_IN: &str = "signInBtn";
    pub const PASSCODE_STATUS: &str = "otpStatus";
}

/// `name` of the gatepass form's submit button.
const SUBMIT_BUTTON: &str = "generate_flyash_gatepass";
const PASSCODE_REJECTED: [&str; 2] = ["invalid", "expired"];

/// Everything one attempt needs, borrowed from the retry engine.
pub struct CycleContext<'a> {
    pub attempt: u32,
    pub credentials: &'a Credentials,
    pub profile: &'a FormProfile,
    pub settings: &'a Settings,
    pub passcodes: &'a dyn PasscodeSource,
    pub emitter: &'a Emitter,
}

pub struct SessionMachine<'a> {
    ctx: CycleContext<'a>,
    state: SessionState,
}

impl<'a> SessionMachine<'a> {
    pub fn new(ctx: CycleContext<'a>) -> Self {
        Self {
            ctx,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the port through one pass and release it on every exit path.
    #[instrument(skip_all, fields(attempt = self.ctx.attempt, user = self.ctx.credentials.username()))]
    pub async fn run_cycle(mut self, mut lease: PortLease) -> CycleResult {
        let result = {
            let mut io = Interactor::new(lease.port(), &self.ctx.settings.timeouts);
            self.drive(&mut io).await
        };
        if let Err(err) = lease.release().await {
            warn!(error = %format!("{err:#}"), "failed to release port");
        }
        result
    }

    async fn drive(&mut self, io: &mut Interactor<'_>) -> CycleResult {
        if let Err(err) = self.authenticate(io).await {
            return self.fail(io, err).await;
        }
        match self.submit(io).await {
            Ok(confirmation) => CycleResult::Succeeded(confirmation),
            Err(err) => self.fail(io, err).await,
        }
    }

    fn transition(&mut self, to: SessionState, message: Option<String>) -> Result<()> {
        check_transition(self.state, to).map_err(|reason| anyhow!(reason))?;
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "session transition");
        self.ctx.emitter.emit(CycleEvent::StateChanged {
            attempt: self.ctx.attempt,
            from,
            to,
            message,
        });
        Ok(())
    }

    async fn fail(&mut self, io: &mut Interactor<'_>, err: anyhow::Error) -> CycleResult {
        let kind = if is_driver_fault(&err) {
            FailureKind::Infrastructure
        } else {
            failure_for(self.state)
        };
        let message = format!("{err:#}");
        if err.downcast_ref::<BudgetExhausted>().is_some() {
            warn!(state = %self.state, "attempt budget exhausted");
        }
        let screenshot = io.screenshot(&format!("failed_{}", kind.as_str())).await;
        let last_url = io.current_url().await.ok().filter(|url| !url.is_empty());
        let diagnostics = Diagnostics {
            message: message.clone(),
            last_url,
            screenshot,
            dialogs: io.take_dialogs(),
        };
        if let Err(reason) = self.transition(SessionState::Failed(kind), Some(message)) {
            warn!(error = %reason, "could not record failure transition");
        }
        CycleResult::failed(kind, diagnostics)
    }

    async fn authenticate(&mut self, io: &mut Interactor<'_>) -> Result<()> {
        let settings = self.ctx.settings;
        let portal = &settings.portal;
        io.navigate(&portal.login_url())
            .await
            .context("open sign-in page")?;

        let username = io
            .require(&Locator::id(login::USERNAME), WaitTier::Short, "username field")
            .await?;
        io.fill(&username, self.ctx.credentials.username()).await?;
        let password = io
            .require(&Locator::id(login::PASSWORD), WaitTier::Short, "password field")
            .await?;
        io.fill(&password, self.ctx.credentials.password()).await?;

        let generate = io
            .require(
                &Locator::id(login::GENERATE_PASSCODE),
                WaitTier::Short,
                "generate passcode button",
            )
            .await?;
        io.click(&generate).await?;

        // Passcode issuance takes the portal ~20 s.
        if io
            .wait_for(&Locator::id(login::PASSCODE_SECTION), WaitTier::Long)
            .await?
            .is_some()
        {
            self.transition(
                SessionState::AwaitingPasscode,
                Some("passcode sent".to_string()),
            )?;
            return self.verify_passcode(io).await;
        }

        let url = io.current_url().await?;
        if first_match(&url.to_lowercase(), &portal.success_url_markers).is_some() {
            info!(url = %url, "signed in without a passcode challenge");
            return self.transition(
                SessionState::Authenticated,
                Some("signed in without passcode".to_string()),
            );
        }
        let status = self.passcode_status(io).await?;
        match status {
            Some(text) if !text.is_empty() => bail!("sign-in refused: {text}"),
            _ => bail!("passcode challenge did not appear; check the credentials"),
        }
    }

    async fn verify_passcode(&mut self, io: &mut Interactor<'_>) -> Result<()> {
        let settings = self.ctx.settings;
        let portal = &settings.portal;
        let (wait, clamped) = io.clamp(settings.timeouts.passcode_wait())?;
        let code = self.ctx.passcodes.request(self.ctx.attempt, wait).await;
        let Some(code) = code else {
            if clamped {
                return Err(anyhow!(BudgetExhausted).context("waiting for passcode"));
            }
            bail!("no passcode received within {}s", wait.as_secs());
        };

        let field = io
            .require(&Locator::id(login::PASSCODE_INPUT), WaitTier::Short, "passcode field")
            .await?;
        io.fill(&field, &code).await?;
        let verify = io
            .require(
                &Locator::id(login::VERIFY_PASSCODE),
                WaitTier::Short,
                "verify passcode button",
            )
            .await?;
        if let Some(dialog) = io.click(&verify).await?
            && let Some(word) = first_match(&dialog.to_lowercase(), &rejection_words())
        {
            bail!("passcode rejected ({word}): {dialog}");
        }

        if let Some(url) = io
            .wait_for_url(&portal.success_url_markers, WaitTier::Short)
            .await?
        {
            return self.transition(
                SessionState::Authenticated,
                Some(format!("passcode accepted; landed on {url}")),
            );
        }

        let url = io.current_url().await?;
        if !portal.signin_url_marker.is_empty() && url.contains(portal.signin_url_marker.as_str())
            && let Some(sign_in) = io
                .wait_for(&Locator::id(login::SIGN_IN), WaitTier::Short)
                .await?
        {
            info!("still on sign-in page after verification; confirming sign-in");
            io.click(&sign_in).await?;
            if let Some(url) = io
                .wait_for_url(&portal.success_url_markers, WaitTier::Short)
                .await?
            {
                return self.transition(
                    SessionState::Authenticated,
                    Some(format!("signed in; landed on {url}")),
                );
            }
        }

        if let Some(status) = self.passcode_status(io).await? {
            let lowered = status.to_lowercase();
            if let Some(word) = first_match(&lowered, &rejection_words()) {
                bail!("passcode rejected ({word}): {status}");
            }
            debug!(status = %status, "passcode status");
        }
        // The portal does not always redirect or report; absence of a
        // rejection counts as acceptance.
        self.transition(
            SessionState::Authenticated,
            Some("passcode verification completed".to_string()),
        )
    }

    async fn passcode_status(&self, io: &mut Interactor<'_>) -> Result<Option<String>> {
        match io.probe(&Locator::id(login::PASSCODE_STATUS)).await? {
            Some(element) => Ok(Some(io.read_text(&element).await?.trim().to_string())),
            None => Ok(None),
        }
    }

    async fn submit(&mut self, io: &mut Interactor<'_>) -> Result<Confirmation> {
        let settings = self.ctx.settings;
        let portal = &settings.portal;
        let dialog = io
            .navigate(&portal.gatepass_url())
            .await
            .context("open gatepass form")?;
        if let Some(text) = &dialog
            && !portal.invalid_session_text.is_empty()
            && text
                .to_lowercase()
                .contains(&portal.invalid_session_text.to_lowercase())
        {
            bail!("portal dropped the session: {text}");
        }
        let url = io.current_url().await?;
        if !url.contains(portal.gatepass_url_marker.as_str()) {
            bail!("unexpected page after opening the gatepass form: {url}");
        }

        let extracted = self.read_back(io).await?;
        self.populate(io).await?;

        let submit = io
            .require(&Locator::name(SUBMIT_BUTTON), WaitTier::Short, "submit button")
            .await?;
        let before = io.screenshot("before_submission").await;
        self.transition(SessionState::SubmissionInFlight, None)?;
        if let Some(dialog) = io.click(&submit).await?
            && let Some(word) = first_match(&dialog.to_lowercase(), &portal.error_indicators)
        {
            bail!("portal refused the submission ({word}): {dialog}");
        }

        let verdict = io
            .scan_indicators(
                &portal.success_indicators,
                &portal.error_indicators,
                WaitTier::Short,
            )
            .await?;
        let after = io.screenshot("after_submission").await;
        let marker = match verdict {
            IndicatorScan::Error(word) => {
                bail!("page reports {word:?} after submission")
            }
            IndicatorScan::Success(word) => word,
            IndicatorScan::Nothing => {
                info!("no outcome indicator on the page; treating submission as accepted");
                "no error indicator".to_string()
            }
        };
        let url = io.current_url().await.ok().filter(|u| !u.is_empty());
        self.transition(SessionState::Succeeded, Some(marker.clone()))?;
        Ok(Confirmation {
            marker,
            url,
            screenshot: after.or(before),
            extracted,
        })
    }

    /// Copy dynamic values off the form, applying defaults for empty inputs.
    async fn read_back(&self, io: &mut Interactor<'_>) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for field in &self.ctx.profile.read_back {
            let Some(element) = io.probe(&Locator::name(&field.name)).await? else {
                if field.required {
                    bail!("required field {} is missing from the gatepass form", field.name);
                }
                debug!(field = %field.name, "read-back field absent");
                continue;
            };
            let mut value = io.read_value(&element).await?.trim().to_string();
            if value.is_empty()
                && let Some(default) = &field.default
            {
                value = default.clone();
            }
            if value.is_empty() {
                if field.required {
                    bail!("required field {} is empty", field.name);
                }
                continue;
            }
            info!(field = %field.name, value = %preview(&field.name, &value), "read back");
            values.insert(field.name.clone(), preview(&field.name, &value));
        }
        Ok(values)
    }

    async fn populate(&self, io: &mut Interactor<'_>) -> Result<()> {
        for entry in self.ctx.profile.entries() {
            if entry.value.trim().is_empty() {
                continue;
            }
            let locator = Locator::name(entry.field);
            let element = match entry.presence {
                Presence::Expected => io.wait_for(&locator, WaitTier::Short).await?,
                Presence::Probed => io.probe(&locator).await?,
            };
            let Some(element) = element else {
                match entry.presence {
                    Presence::Expected => warn!(field = entry.field, "form field not found; skipped"),
                    Presence::Probed => debug!(field = entry.field, "optional form field absent"),
                }
                continue;
            };
            let outcome = match entry.control {
                Control::Select => io.select(&element, entry.value).await.map(|_| ()),
                Control::Text => io.fill(&element, entry.value).await,
            };
            match outcome {
                Ok(()) => debug!(field = entry.field, "form field set"),
                Err(err) if err.downcast_ref::<BudgetExhausted>().is_some() => return Err(err),
                Err(err) => warn!(field = entry.field, error = %err, "could not set form field"),
            }
        }
        Ok(())
    }
}

fn rejection_words() -> Vec<String> {
    PASSCODE_REJECTED.iter().map(|w| (*w).to_string()).collect()
}

/// Token-like values are shortened before they reach logs or events.
fn preview(name: &str, value: &str) -> String {
    if name.contains("token") && value.chars().count() > 12 {
        let head: String = value.chars().take(12).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::test_support::{RecordingSink, ScriptedPasscodes, ScriptedPort, portal_settings};

    struct Harness {
        credentials: Credentials,
        profile: FormProfile,
        settings: Settings,
        passcodes: ScriptedPasscodes,
        recorder: Arc<RecordingSink>,
        emitter: Emitter,
    }

    impl Harness {
        fn new(passcodes: ScriptedPasscodes) -> Self {
            let recorder = Arc::new(RecordingSink::default());
            Self {
                credentials: Credentials::new("operator", "secret"),
                profile: FormProfile::default(),
                settings: portal_settings(),
                passcodes,
                emitter: Emitter::for_cycle(recorder.clone(), 1),
                recorder,
            }
        }

        async fn run(&self, port: ScriptedPort) -> CycleResult {
            let machine = SessionMachine::new(CycleContext {
                attempt: 1,
                credentials: &self.credentials,
                profile: &self.profile,
                settings: &self.settings,
                passcodes: &self.passcodes,
                emitter: &self.emitter,
            });
            machine.run_cycle(PortLease::new(Box::new(port))).await
        }

        fn transitions(&self) -> Vec<(SessionState, SessionState)> {
            self.recorder
                .events()
                .into_iter()
                .filter_map(|event| match event {
                    CycleEvent::StateChanged { from, to, .. } => Some((from, to)),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_walks_every_state_and_releases_the_port() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal();
        let log = port.log();

        let result = harness.run(port).await;

        let CycleResult::Succeeded(confirmation) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(confirmation.marker, "generated");
        assert_eq!(confirmation.extracted.get("ash_price").map(String::as_str), Some("150"));
        assert_eq!(
            confirmation.extracted.get("gatepass_token").map(String::as_str),
            Some("tok-abcdefgh...")
        );
        assert_eq!(
            harness.transitions(),
            vec![
                (SessionState::Unauthenticated, SessionState::AwaitingPasscode),
                (SessionState::AwaitingPasscode, SessionState::Authenticated),
                (SessionState::Authenticated, SessionState::SubmissionInFlight),
                (SessionState::SubmissionInFlight, SessionState::Succeeded),
            ]
        );
        assert_eq!(log.close_count(), 1);
        assert_eq!(log.filled("otp_code").as_deref(), Some("123456"));
        assert_eq!(log.filled("vehicle_no1").as_deref(), Some("KA28AB2222"));
        assert_eq!(log.selected("pickup_time").as_deref(), Some("10.00AM - 11.00AM"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_passcode_fails_with_otp_reason() {
        let harness = Harness::new(ScriptedPasscodes::always("000000"));
        let port = ScriptedPort::portal().rejecting_passcode();
        let log = port.log();

        let result = harness.run(port).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Passcode));
        let CycleResult::Failed { diagnostics, .. } = result else {
            panic!("expected failure");
        };
        assert!(diagnostics.message.contains("passcode rejected"));
        assert!(diagnostics.screenshot.is_some());
        assert!(diagnostics.last_url.is_some());
        assert_eq!(
            harness.transitions().last(),
            Some(&(
                SessionState::AwaitingPasscode,
                SessionState::Failed(FailureKind::Passcode)
            ))
        );
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_passcode_times_out_as_otp_failure() {
        let harness = Harness::new(ScriptedPasscodes::never());
        let result = harness.run(ScriptedPort::portal()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Passcode));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_login_form_is_an_auth_failure() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::new();
        let log = port.log();
        let result = harness.run(port).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Auth));
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_challenge_on_dashboard_skips_the_passcode() {
        let harness = Harness::new(ScriptedPasscodes::never());
        let port = ScriptedPort::portal().without_passcode_challenge();
        let result = harness.run(port).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(
            harness.transitions()[0],
            (SessionState::Unauthenticated, SessionState::Authenticated)
        );
        assert_eq!(harness.passcodes.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_button_completes_login_when_portal_stays_put() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal().requiring_sign_in_click();
        let log = port.log();
        let result = harness.run(port).await;
        assert!(result.is_success(), "{result:?}");
        assert!(log.clicked("signInBtn"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_dialog_fails_the_submit() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal().dropping_session_on_form();
        let result = harness.run(port).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Submit));
        let CycleResult::Failed { diagnostics, .. } = result else {
            panic!("expected failure");
        };
        assert!(diagnostics.dialogs.iter().any(|d| d.contains("Invalid Session")));
    }

    #[tokio::test(start_paused = true)]
    async fn error_text_after_submit_fails_from_in_flight() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal().with_result_text("Quota exhausted for today");
        let result = harness.run(port).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Submit));
        assert_eq!(
            harness.transitions().last(),
            Some(&(
                SessionState::SubmissionInFlight,
                SessionState::Failed(FailureKind::Submit)
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_token_fails_before_submitting() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal().without_element("gatepass_token");
        let log = port.log();
        let result = harness.run(port).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Submit));
        assert!(!log.clicked(SUBMIT_BUTTON));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_fault_during_submit_is_an_infrastructure_failure() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let port = ScriptedPort::portal().failing_on("select");
        let log = port.log();

        let result = harness.run(port).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Infrastructure));
        assert_eq!(
            harness.transitions().last(),
            Some(&(
                SessionState::Authenticated,
                SessionState::Failed(FailureKind::Infrastructure)
            ))
        );
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_fault_on_first_page_is_not_an_auth_failure() {
        let harness = Harness::new(ScriptedPasscodes::always("123456"));
        let result = harness.run(ScriptedPort::portal().failing_on("navigate")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Infrastructure));
        let CycleResult::Failed { diagnostics, .. } = result else {
            panic!("expected failure");
        };
        assert!(diagnostics.message.contains("browser driver fault"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn cycle_future_can_move_across_threads() {
        let harness = Harness::new(ScriptedPasscodes::never());
        let machine = SessionMachine::new(CycleContext {
            attempt: 1,
            credentials: &harness.credentials,
            profile: &harness.profile,
            settings: &harness.settings,
            passcodes: &harness.passcodes,
            emitter: &harness.emitter,
        });
        let cycle = machine.run_cycle(PortLease::new(Box::new(ScriptedPort::portal())));
        assert_send(&cycle);
    }

    #[test]
    fn token_previews_are_truncated() {
        assert_eq!(preview("gatepass_token", "abcdefghijklmnop"), "abcdefghijkl...");
        assert_eq!(preview("ash_price", "150"), "150");
    }
}
