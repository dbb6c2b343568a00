//! Defensive interaction protocol over an [`InteractionPort`].
//!
//! The portal raises blocking dialogs at unpredictable moments and renders
//! some elements only after server-side work. [`Interactor`] wraps the raw
//! port so that:
//!
//! - dialog-prone actions (page loads, button clicks, dropdown changes) are
//!   followed by a bounded dialog dismissal; inert text fills are not;
//! - every wait uses a named tier (dialog, short, long) and is logged;
//! - every wait is clamped to the attempt budget, and a wait that runs into
//!   the budget fails with [`BudgetExhausted`] instead of overrunning it.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::budget::{AttemptBudget, BudgetExhausted};
use crate::io::config::TimeoutConfig;
use crate::io::port::{Element, InteractionPort, Locator};

/// Named wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTier {
    /// Bounded window for dialogs and optional elements.
    Dialog,
    /// Elements expected right after a prior action.
    Short,
    /// Elements gated by server-side processing.
    Long,
}

impl WaitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitTier::Dialog => "dialog",
            WaitTier::Short => "short",
            WaitTier::Long => "long",
        }
    }
}

/// Outcome of scanning page text for outcome indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorScan {
    Error(String),
    Success(String),
    Nothing,
}

pub struct Interactor<'p> {
    port: &'p mut dyn InteractionPort,
    timeouts: TimeoutConfig,
    budget: AttemptBudget,
    dialogs: Vec<String>,
}

impl<'p> Interactor<'p> {
    pub fn new(port: &'p mut dyn InteractionPort, timeouts: &TimeoutConfig) -> Self {
        Self {
            port,
            timeouts: timeouts.clone(),
            budget: AttemptBudget::starting_now(timeouts.attempt()),
            dialogs: Vec::new(),
        }
    }

    pub fn tier(&self, tier: WaitTier) -> Duration {
        match tier {
            WaitTier::Dialog => self.timeouts.dialog(),
            WaitTier::Short => self.timeouts.short(),
            WaitTier::Long => self.timeouts.long(),
        }
    }

    /// Clamp an arbitrary wait (e.g. the passcode wait) to the budget.
    pub fn clamp(&self, requested: Duration) -> Result<(Duration, bool)> {
        self.budget.clamp(requested)
    }

    /// Dialog texts dismissed so far in this attempt.
    pub fn take_dialogs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dialogs)
    }

    /// Wait for an element with the given tier. `None` means it never showed.
    pub async fn wait_for(&mut self, locator: &Locator, tier: WaitTier) -> Result<Option<Element>> {
        let (wait, clamped) = self.budget.clamp(self.tier(tier))?;
        debug!(
            tier = tier.as_str(),
            wait_ms = wait.as_millis() as u64,
            clamped,
            %locator,
            "waiting for element"
        );
        let found = self.port.wait_for_element(locator, wait).await?;
        if found.is_none() && clamped {
            return Err(anyhow!(BudgetExhausted).context(format!(
                "waiting for {locator} ({} tier)",
                tier.as_str()
            )));
        }
        Ok(found)
    }

    /// Like [`Self::wait_for`] but a missing element is an error naming `what`.
    pub async fn require(
        &mut self,
        locator: &Locator,
        tier: WaitTier,
        what: &str,
    ) -> Result<Element> {
        self.wait_for(locator, tier)
            .await?
            .ok_or_else(|| anyhow!("{what} not found ({locator}, {} tier)", tier.as_str()))
    }

    /// Brief look for an element that may legitimately be absent.
    pub async fn probe(&mut self, locator: &Locator) -> Result<Option<Element>> {
        self.wait_for(locator, WaitTier::Dialog).await
    }

    /// Dialog-prone: load a page.
    pub async fn navigate(&mut self, url: &str) -> Result<Option<String>> {
        info!(url, "navigating");
        self.port.navigate(url).await?;
        self.settle_dialog().await
    }

    /// Dialog-prone: click a button or link.
    pub async fn click(&mut self, element: &Element) -> Result<Option<String>> {
        debug!(locator = %element.locator, "clicking");
        self.port.click(element).await?;
        self.settle_dialog().await
    }

    /// Dialog-prone: change a dropdown, which fires page scripts.
    pub async fn select(&mut self, element: &Element, visible_text: &str) -> Result<Option<String>> {
        self.port.select_option(element, visible_text).await?;
        self.settle_dialog().await
    }

    /// Inert: type into a text field.
    pub async fn fill(&mut self, element: &Element, text: &str) -> Result<()> {
        self.port.fill(element, text).await
    }

    pub async fn read_value(&mut self, element: &Element) -> Result<String> {
        self.port.read_value(element).await
    }

    pub async fn read_text(&mut self, element: &Element) -> Result<String> {
        self.port.read_text(element).await
    }

    pub async fn current_url(&mut self) -> Result<String> {
        self.port.current_url().await
    }

    /// Poll the URL until it contains one of `markers`. Returns the matching URL.
    pub async fn wait_for_url(&mut self, markers: &[String], tier: WaitTier) -> Result<Option<String>> {
        let (wait, _) = self.budget.clamp(self.tier(tier))?;
        debug!(tier = tier.as_str(), wait_ms = wait.as_millis() as u64, "waiting for url");
        let deadline = Instant::now() + wait;
        loop {
            let url = self.port.current_url().await?;
            if markers
                .iter()
                .any(|marker| !marker.is_empty() && url.contains(marker.as_str()))
            {
                return Ok(Some(url));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pause(deadline).await;
        }
    }

    /// Poll page text until an indicator appears or the tier runs out.
    /// Error indicators win over success indicators on the same page.
    pub async fn scan_indicators(
        &mut self,
        success: &[String],
        errors: &[String],
        tier: WaitTier,
    ) -> Result<IndicatorScan> {
        let (wait, _) = self.budget.clamp(self.tier(tier))?;
        debug!(tier = tier.as_str(), wait_ms = wait.as_millis() as u64, "scanning page text");
        let deadline = Instant::now() + wait;
        loop {
            let text = self.port.page_text().await?.to_lowercase();
            if let Some(found) = first_match(&text, errors) {
                return Ok(IndicatorScan::Error(found));
            }
            if let Some(found) = first_match(&text, success) {
                return Ok(IndicatorScan::Success(found));
            }
            if Instant::now() >= deadline {
                return Ok(IndicatorScan::Nothing);
            }
            self.pause(deadline).await;
        }
    }

    /// Capture a screenshot. Failures are logged, never raised.
    pub async fn screenshot(&mut self, label: &str) -> Option<String> {
        match self.port.screenshot(label).await {
            Ok(reference) => {
                debug!(label, reference = %reference, "screenshot saved");
                Some(reference)
            }
            Err(err) => {
                warn!(label, error = %err, "screenshot failed");
                None
            }
        }
    }

    async fn settle_dialog(&mut self) -> Result<Option<String>> {
        let (wait, _) = self.budget.clamp(self.timeouts.dialog())?;
        debug!(tier = "dialog", wait_ms = wait.as_millis() as u64, "checking for dialog");
        let text = self.port.dismiss_blocking_dialog(wait).await?;
        if let Some(text) = &text {
            info!(dialog = %text, "dismissed blocking dialog");
            self.dialogs.push(text.clone());
        }
        Ok(text)
    }

    /// One poll step, never past `deadline`. Returned unawaited: a future
    /// holding `&self` is not `Send` because the port reference is not `Sync`.
    fn pause(&self, deadline: Instant) -> tokio::time::Sleep {
        let step = self
            .timeouts
            .poll_interval()
            .min(deadline.saturating_duration_since(Instant::now()));
        tokio::time::sleep(step)
    }
}

/// First needle (case-insensitive) found in already-lowercased `haystack`.
pub fn first_match(haystack: &str, needles: &[String]) -> Option<String> {
    needles
        .iter()
        .map(|needle| needle.trim().to_lowercase())
        .find(|needle| !needle.is_empty() && haystack.contains(needle.as_str()))
}
