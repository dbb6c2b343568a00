//! Settings stored under `.gatepass/settings.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::errors::ConfigError;
use crate::core::schedule::TimeOfDay;

pub const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
pub const RETRY_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 5..=300;

/// Full settings file (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub schedule: ScheduleConfig,
    pub timeouts: TimeoutConfig,
    pub portal: PortalConfig,
    /// Where the browser adapter writes screenshots. Relative paths resolve
    /// against `.gatepass/`.
    pub screenshot_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Firefox,
}

/// When and how often a cycle runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub time_of_day: TimeOfDay,
    pub max_attempts: u32,
    pub retry_interval_secs: u64,
    pub headless: bool,
    pub browser: BrowserKind,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time_of_day: TimeOfDay::default(),
            max_attempts: 3,
            retry_interval_secs: 10,
            headless: true,
            browser: BrowserKind::Chrome,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !MAX_ATTEMPTS_RANGE.contains(&self.max_attempts) {
            return Err(ConfigError::MaxAttempts(self.max_attempts));
        }
        if !RETRY_INTERVAL_RANGE.contains(&self.retry_interval_secs) {
            return Err(ConfigError::RetryInterval(self.retry_interval_secs));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }
}

/// Bounded retry policy derived from [`ScheduleConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

/// Wait tiers used by the interaction protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bounded dismissal window after a dialog-prone action.
    pub dialog_ms: u64,
    /// Elements expected right after a prior action.
    pub short_secs: u64,
    /// Elements gated by server-side processing (passcode issuance).
    pub long_secs: u64,
    /// Hard ceiling for one whole attempt; every wait is clamped to it.
    pub attempt_secs: u64,
    /// How long to wait for the operator to supply a passcode.
    pub passcode_wait_secs: u64,
    /// Poll period for element, URL and page-text conditions.
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dialog_ms: 1_500,
            short_secs: 15,
            long_secs: 45,
            attempt_secs: 5 * 60,
            passcode_wait_secs: 3 * 60,
            poll_interval_ms: 250,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Timeouts(msg.to_string()))
        };
        if !(100..=5_000).contains(&self.dialog_ms) {
            return bad("dialog_ms must be between 100 and 5000");
        }
        if self.short_secs == 0 {
            return bad("short_secs must be > 0");
        }
        if self.long_secs < self.short_secs {
            return bad("long_secs must be >= short_secs");
        }
        if self.attempt_secs < self.long_secs {
            return bad("attempt_secs must be >= long_secs");
        }
        if self.passcode_wait_secs == 0 {
            return bad("passcode_wait_secs must be > 0");
        }
        if self.poll_interval_ms == 0 {
            return bad("poll_interval_ms must be > 0");
        }
        Ok(())
    }

    pub fn dialog(&self) -> Duration {
        Duration::from_millis(self.dialog_ms)
    }

    pub fn short(&self) -> Duration {
        Duration::from_secs(self.short_secs)
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.long_secs)
    }

    pub fn attempt(&self) -> Duration {
        Duration::from_secs(self.attempt_secs)
    }

    pub fn passcode_wait(&self) -> Duration {
        Duration::from_secs(self.passcode_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Where the portal lives and how its pages announce outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    pub gatepass_path: String,
    /// URL fragments that mean "signed in".
    pub success_url_markers: Vec<String>,
    /// URL fragment of the sign-in page. Still matching after passcode
    /// verification means the portal wants an extra "Sign In" click.
    pub signin_url_marker: String,
    /// URL fragment that proves the gatepass form page loaded.
    pub gatepass_url_marker: String,
    /// Dialog text the portal raises when the login session was dropped.
    pub invalid_session_text: String,
    /// Page-text fragments that mean the submission went through.
    pub success_indicators: Vec<String>,
    /// Page-text fragments that mean the submission was refused. Checked first.
    pub error_indicators: Vec<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> {
            items.iter().map(|s| (*s).to_string()).collect()
        };
        Self {
            base_url: "https://kpcl-ams.com".to_string(),
            login_path: "/signin_page.php".to_string(),
            gatepass_path: "/user/gatepass.php".to_string(),
            success_url_markers: strings(&["dashboard", "user"]),
            signin_url_marker: "signin".to_string(),
            gatepass_url_marker: "gatepass".to_string(),
            invalid_session_text: "invalid session".to_string(),
            success_indicators: strings(&[
                "success",
                "generated",
                "gatepass",
                "complete",
                "submitted",
            ]),
            error_indicators: strings(&[
                "invalid session",
                "exhausted",
                "failed",
                "error",
                "expired",
            ]),
        }
    }
}

impl PortalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url.trim();
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(ConfigError::Portal(
                "base_url must start with http:// or https://".to_string(),
            ));
        }
        for (name, path) in [
            ("login_path", &self.login_path),
            ("gatepass_path", &self.gatepass_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Portal(format!("{name} must start with '/'")));
            }
        }
        if self.success_url_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::Portal(
                "success_url_markers must contain a non-empty marker".to_string(),
            ));
        }
        Ok(())
    }

    pub fn login_url(&self) -> String {
        self.join(&self.login_path)
    }

    pub fn gatepass_url(&self) -> String {
        self.join(&self.gatepass_path)
    }

    fn join(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            timeouts: TimeoutConfig::default(),
            portal: PortalConfig::default(),
            screenshot_dir: PathBuf::from("screenshots"),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.validate()?;
        self.timeouts.validate()?;
        self.portal.validate()?;
        Ok(())
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(settings)
}

/// Validate, then atomically write settings to disk.
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
