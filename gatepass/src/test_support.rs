//! Test-only doubles: a scripted portal, passcode sources and an event recorder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use tokio::time::Instant;

use crate::core::events::{CycleEvent, EventEnvelope};
use crate::core::schedule::{TimeOfDay, next_fire_at};
use crate::io::config::Settings;
use crate::io::init::{GatepassPaths, InitOptions, init_project};
use crate::io::passcode::PasscodeSource;
use crate::io::port::{DriverFault, Element, InteractionPort, Locator, PortFactory, PortRequest};
use crate::scheduler::Clock;
use crate::sink::EventSink;

const DASHBOARD_URL: &str = "https://kpcl-ams.com/user/dashboard.php";
const FORM_FIELDS: [&str; 10] = [
    "ash_utilization",
    "pickup_time",
    "vehicle_type",
    "quantity_limit",
    "vehicle_classification",
    "vehicle_no1",
    "dl_no",
    "driver_mob_no1",
    "authorised_person",
    "generate_flyash_gatepass",
];

/// Settings the scripted portal is written against.
pub fn portal_settings() -> Settings {
    Settings::default()
}

/// Fresh project root with default `.gatepass/` files. The directory lives
/// as long as the returned guard.
pub fn temp_project() -> Result<(tempfile::TempDir, GatepassPaths)> {
    let temp = tempfile::tempdir()?;
    let paths = init_project(temp.path(), &InitOptions { force: false })?;
    Ok((temp, paths))
}

/// Something the scripted page does in response to an action.
#[derive(Debug, Clone)]
pub enum Reaction {
    Reveal(String),
    Hide(String),
    SetUrl(String),
    Dialog(String),
    PageText(String),
    SetValue(String, String),
    SetText(String, String),
}

fn reveal(key: &str) -> Reaction {
    Reaction::Reveal(key.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Navigate(String),
    Fill(String, String),
    Select(String, String),
    Click(String),
    Screenshot(String),
}

#[derive(Debug, Default)]
struct LogInner {
    actions: Vec<Action>,
    closes: usize,
    dismisses: usize,
}

/// Shared view of what a [`ScriptedPort`] was asked to do. Survives the port.
#[derive(Debug, Clone, Default)]
pub struct PortLog(Arc<Mutex<LogInner>>);

impl PortLog {
    fn with<T>(&self, f: impl FnOnce(&mut LogInner) -> T) -> T {
        let mut inner = self.0.lock().expect("port log lock");
        f(&mut inner)
    }

    pub fn actions(&self) -> Vec<Action> {
        self.with(|inner| inner.actions.clone())
    }

    pub fn close_count(&self) -> usize {
        self.with(|inner| inner.closes)
    }

    pub fn dismiss_calls(&self) -> usize {
        self.with(|inner| inner.dismisses)
    }

    /// Last text typed into `key`.
    pub fn filled(&self, key: &str) -> Option<String> {
        self.actions().into_iter().rev().find_map(|action| match action {
            Action::Fill(k, text) if k == key => Some(text),
            _ => None,
        })
    }

    /// Last option picked in `key`.
    pub fn selected(&self, key: &str) -> Option<String> {
        self.actions().into_iter().rev().find_map(|action| match action {
            Action::Select(k, text) if k == key => Some(text),
            _ => None,
        })
    }

    pub fn clicked(&self, key: &str) -> bool {
        self.actions()
            .iter()
            .any(|action| matches!(action, Action::Click(k) if k == key))
    }

    pub fn screenshots(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Screenshot(label) => Some(label),
                _ => None,
            })
            .collect()
    }

    fn record(&self, action: Action) {
        self.with(|inner| inner.actions.push(action));
    }
}

/// In-memory portal. Elements are keyed by id or name (one namespace).
/// Missing elements make waits run their full timeout, as a real page would.
#[derive(Debug, Default)]
pub struct ScriptedPort {
    present: HashSet<String>,
    suppressed: HashSet<String>,
    values: HashMap<String, String>,
    texts: HashMap<String, String>,
    urls: VecDeque<String>,
    page_text: String,
    dialogs: VecDeque<String>,
    on_click: HashMap<String, Vec<Reaction>>,
    on_navigate: Vec<(String, Vec<Reaction>)>,
    fail_on: Option<&'static str>,
    next_token: u64,
    log: PortLog,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Login page, passcode challenge, dashboard redirect and the gatepass
    /// form, wired the way the live portal behaves on a good day.
    pub fn portal() -> Self {
        let mut form: Vec<Reaction> = FORM_FIELDS.iter().map(|key| reveal(key)).collect();
        form.extend([
            reveal("ash_price"),
            Reaction::SetValue("ash_price".into(), String::new()),
            reveal("balance_amount"),
            Reaction::SetValue("balance_amount".into(), "0".into()),
            reveal("gatepass_token"),
            Reaction::SetValue("gatepass_token".into(), "tok-abcdefghijklmnop".into()),
            Reaction::PageText("Flyash pickup request".into()),
        ]);
        Self::new()
            .on_navigate(
                "signin_page.php",
                vec![reveal("username"), reveal("password"), reveal("generateOtpBtn")],
            )
            .on_click(
                "generateOtpBtn",
                vec![reveal("otpSection"), reveal("otp_code"), reveal("verifyOtpBtn")],
            )
            .on_click("verifyOtpBtn", vec![Reaction::SetUrl(DASHBOARD_URL.into())])
            .on_navigate("gatepass.php", form)
            .on_click(
                "generate_flyash_gatepass",
                vec![Reaction::PageText("Your pass has been generated.".into())],
            )
    }

    /// Verification leaves the browser on the sign-in page with a status line.
    pub fn rejecting_passcode(self) -> Self {
        self.on_click(
            "verifyOtpBtn",
            vec![
                reveal("otpStatus"),
                Reaction::SetText("otpStatus".into(), "Invalid OTP. Please try again".into()),
            ],
        )
    }

    /// The portal signs the user straight in without a passcode.
    pub fn without_passcode_challenge(self) -> Self {
        self.on_click("generateOtpBtn", vec![Reaction::SetUrl(DASHBOARD_URL.into())])
    }

    /// Verification succeeds but needs an explicit Sign In click.
    pub fn requiring_sign_in_click(self) -> Self {
        self.on_click("verifyOtpBtn", vec![reveal("signInBtn")])
            .on_click("signInBtn", vec![Reaction::SetUrl(DASHBOARD_URL.into())])
    }

    /// Opening the form raises the portal's session-expired alert.
    pub fn dropping_session_on_form(mut self) -> Self {
        self.on_navigate.push((
            "gatepass.php".into(),
            vec![Reaction::Dialog("Invalid Session. Please login again".into())],
        ));
        self
    }

    /// Page text shown after the submit click.
    pub fn with_result_text(self, text: &str) -> Self {
        self.on_click(
            "generate_flyash_gatepass",
            vec![Reaction::PageText(text.to_string())],
        )
    }

    /// Keep `key` from ever appearing.
    pub fn without_element(mut self, key: &str) -> Self {
        self.present.remove(key);
        self.suppressed.insert(key.to_string());
        self
    }

    /// Every call to `action` (e.g. "navigate", "click") fails like a crashed driver.
    pub fn failing_on(mut self, action: &'static str) -> Self {
        self.fail_on = Some(action);
        self
    }

    pub fn with_element(mut self, key: &str) -> Self {
        self.present.insert(key.to_string());
        self
    }

    /// Replace the reactions for clicking `key`.
    pub fn on_click(mut self, key: &str, reactions: Vec<Reaction>) -> Self {
        self.on_click.insert(key.to_string(), reactions);
        self
    }

    /// Add reactions for navigating to a URL containing `fragment`.
    pub fn on_navigate(mut self, fragment: &str, reactions: Vec<Reaction>) -> Self {
        self.on_navigate.push((fragment.to_string(), reactions));
        self
    }

    pub fn queue_dialog(&mut self, text: &str) {
        self.dialogs.push_back(text.to_string());
    }

    /// Queue a URL; reads walk the queue and then stick on the last entry.
    pub fn push_url(&mut self, url: &str) {
        self.urls.push_back(url.to_string());
    }

    pub fn set_page_text(&mut self, text: &str) {
        self.page_text = text.to_string();
    }

    pub fn log(&self) -> PortLog {
        self.log.clone()
    }

    fn key(locator: &Locator) -> &str {
        match locator {
            Locator::Id(key) | Locator::Name(key) | Locator::Css(key) => key,
        }
    }

    fn check(&self, action: &'static str) -> Result<()> {
        match self.fail_on {
            Some(failing) if failing == action => {
                Err(anyhow!("scripted driver failure during {action}").context(DriverFault))
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, reactions: Vec<Reaction>) {
        for reaction in reactions {
            match reaction {
                Reaction::Reveal(key) => {
                    if !self.suppressed.contains(&key) {
                        self.present.insert(key);
                    }
                }
                Reaction::Hide(key) => {
                    self.present.remove(&key);
                }
                Reaction::SetUrl(url) => {
                    self.urls.clear();
                    self.urls.push_back(url);
                }
                Reaction::Dialog(text) => self.dialogs.push_back(text),
                Reaction::PageText(text) => self.page_text = text,
                Reaction::SetValue(key, value) => {
                    self.values.insert(key, value);
                }
                Reaction::SetText(key, text) => {
                    self.texts.insert(key, text);
                }
            }
        }
    }

    fn handle_key<'e>(&self, element: &'e Element) -> Result<&'e str> {
        let key = Self::key(&element.locator);
        if self.present.contains(key) {
            Ok(key)
        } else {
            Err(anyhow!("element {} is no longer attached", element.locator))
        }
    }
}

#[async_trait]
impl InteractionPort for ScriptedPort {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.check("navigate")?;
        self.log.record(Action::Navigate(url.to_string()));
        self.present.clear();
        self.values.clear();
        self.texts.clear();
        self.urls.clear();
        self.urls.push_back(url.to_string());
        let reactions: Vec<Reaction> = self
            .on_navigate
            .iter()
            .filter(|(fragment, _)| url.contains(fragment.as_str()))
            .flat_map(|(_, reactions)| reactions.clone())
            .collect();
        self.apply(reactions);
        Ok(())
    }

    async fn wait_for_element(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        self.check("wait")?;
        if self.present.contains(Self::key(locator)) {
            self.next_token += 1;
            return Ok(Some(Element {
                locator: locator.clone(),
                token: self.next_token,
            }));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn fill(&mut self, element: &Element, text: &str) -> Result<()> {
        self.check("fill")?;
        let key = self.handle_key(element)?.to_string();
        self.log.record(Action::Fill(key.clone(), text.to_string()));
        self.values.insert(key, text.to_string());
        Ok(())
    }

    async fn select_option(&mut self, element: &Element, visible_text: &str) -> Result<()> {
        self.check("select")?;
        let key = self.handle_key(element)?.to_string();
        self.log
            .record(Action::Select(key.clone(), visible_text.to_string()));
        self.values.insert(key, visible_text.to_string());
        Ok(())
    }

    async fn click(&mut self, element: &Element) -> Result<()> {
        self.check("click")?;
        let key = self.handle_key(element)?.to_string();
        self.log.record(Action::Click(key.clone()));
        if let Some(reactions) = self.on_click.get(&key).cloned() {
            self.apply(reactions);
        }
        Ok(())
    }

    async fn read_value(&mut self, element: &Element) -> Result<String> {
        let key = self.handle_key(element)?;
        Ok(self.values.get(key).cloned().unwrap_or_default())
    }

    async fn read_text(&mut self, element: &Element) -> Result<String> {
        let key = self.handle_key(element)?;
        Ok(self.texts.get(key).cloned().unwrap_or_default())
    }

    async fn page_text(&mut self) -> Result<String> {
        Ok(self.page_text.clone())
    }

    async fn current_url(&mut self) -> Result<String> {
        if self.urls.len() > 1 {
            return Ok(self.urls.pop_front().unwrap_or_default());
        }
        Ok(self.urls.front().cloned().unwrap_or_default())
    }

    async fn dismiss_blocking_dialog(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.log.with(|inner| inner.dismisses += 1);
        if let Some(text) = self.dialogs.pop_front() {
            return Ok(Some(text));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn screenshot(&mut self, label: &str) -> Result<String> {
        self.check("screenshot")?;
        self.log.record(Action::Screenshot(label.to_string()));
        Ok(format!("memory://{label}.png"))
    }

    async fn close(&mut self) -> Result<()> {
        self.log.with(|inner| inner.closes += 1);
        Ok(())
    }
}

type PortScript = dyn Fn(u32) -> Result<ScriptedPort> + Send + Sync;

/// Builds one [`ScriptedPort`] per attempt from a closure over the attempt index.
pub struct ScriptedPortFactory {
    script: Box<PortScript>,
    open_delay: Duration,
    opens: Mutex<Vec<PortRequest>>,
    logs: Mutex<Vec<PortLog>>,
}

impl ScriptedPortFactory {
    pub fn new(script: impl Fn(u32) -> Result<ScriptedPort> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            open_delay: Duration::ZERO,
            opens: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt gets a healthy portal.
    pub fn healthy() -> Self {
        Self::new(|_| Ok(ScriptedPort::portal()))
    }

    /// Simulated browser start-up time.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn opens(&self) -> Vec<PortRequest> {
        self.opens.lock().expect("opens lock").clone()
    }

    /// Logs of every port handed out, in attempt order.
    pub fn logs(&self) -> Vec<PortLog> {
        self.logs.lock().expect("logs lock").clone()
    }
}

#[async_trait]
impl PortFactory for ScriptedPortFactory {
    async fn open(&self, request: &PortRequest) -> Result<Box<dyn InteractionPort>> {
        self.opens.lock().expect("opens lock").push(request.clone());
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let port = (self.script)(request.attempt)?;
        self.logs.lock().expect("logs lock").push(port.log());
        Ok(Box::new(port))
    }
}

enum PasscodeMode {
    Always(String),
    Never,
    Queue(Mutex<VecDeque<Option<String>>>),
}

/// Passcode source with canned answers. `None` answers wait out the timeout.
pub struct ScriptedPasscodes {
    mode: PasscodeMode,
    requests: AtomicU32,
}

impl ScriptedPasscodes {
    pub fn always(code: &str) -> Self {
        Self::with_mode(PasscodeMode::Always(code.to_string()))
    }

    pub fn never() -> Self {
        Self::with_mode(PasscodeMode::Never)
    }

    /// One answer per request; once exhausted, requests time out.
    pub fn sequence(answers: Vec<Option<&str>>) -> Self {
        let queue = answers
            .into_iter()
            .map(|answer| answer.map(str::to_string))
            .collect();
        Self::with_mode(PasscodeMode::Queue(Mutex::new(queue)))
    }

    fn with_mode(mode: PasscodeMode) -> Self {
        Self {
            mode,
            requests: AtomicU32::new(0),
        }
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PasscodeSource for ScriptedPasscodes {
    async fn request(&self, _attempt: u32, timeout: Duration) -> Option<String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let answer = match &self.mode {
            PasscodeMode::Always(code) => Some(code.clone()),
            PasscodeMode::Never => None,
            PasscodeMode::Queue(queue) => queue
                .lock()
                .expect("passcode queue lock")
                .pop_front()
                .flatten(),
        };
        if answer.is_none() {
            tokio::time::sleep(timeout).await;
        }
        answer
    }
}

/// Keeps every envelope it sees.
#[derive(Debug, Default)]
pub struct RecordingSink {
    envelopes: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSink {
    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.envelopes.lock().expect("recording lock").clone()
    }

    pub fn events(&self) -> Vec<CycleEvent> {
        self.envelopes().into_iter().map(|e| e.event).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.envelopes().iter().map(|e| e.event.name()).collect()
    }

    /// Poll until an event named `name` has been recorded.
    pub async fn wait_for(&self, name: &str) {
        while !self.names().contains(&name) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.envelopes
            .lock()
            .expect("recording lock")
            .push(envelope.clone());
    }
}

/// Clock pinned to a fixed-offset instant that advances with tokio's
/// (pausable) clock.
#[derive(Debug)]
pub struct TestClock {
    base: DateTime<FixedOffset>,
    started: Instant,
    skew: Mutex<TimeDelta>,
}

impl TestClock {
    /// `now` is RFC 3339, e.g. `2026-03-10T07:00:02+05:30`.
    pub fn at(now: &str) -> Self {
        Self {
            base: DateTime::parse_from_rfc3339(now).expect("rfc3339 instant"),
            started: Instant::now(),
            skew: Mutex::new(TimeDelta::zero()),
        }
    }

    /// Move the wall clock without moving tokio's clock, like a host resuming
    /// from suspend or an NTP correction.
    pub fn jump(&self, by: TimeDelta) {
        *self.skew.lock().expect("skew lock") += by;
    }

    pub fn parse(&self, instant: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(instant)
            .expect("rfc3339 instant")
            .with_timezone(&Utc)
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).expect("elapsed fits");
        let skew = *self.skew.lock().expect("skew lock");
        (self.base + elapsed + skew).with_timezone(&Utc)
    }

    fn next_after(&self, after: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc> {
        next_fire_at(&after.with_timezone(self.base.offset()), at).with_timezone(&Utc)
    }
}
