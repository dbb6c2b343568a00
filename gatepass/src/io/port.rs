//! Interaction port: the capability the session machine uses to drive the
//! portal UI.
//!
//! The [`InteractionPort`] trait decouples the session machine from the
//! concrete browser driver. Production builds with the `browser` feature use
//! the CDP adapter in [`super::cdp`]; tests use the scripted port from
//! `test_support`, which never touches a real browser.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{BrowserKind, Settings};

/// How to find an element on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Id(String),
    Name(String),
    Css(String),
}

impl Locator {
    pub fn id(id: &str) -> Self {
        Locator::Id(id.to_string())
    }

    pub fn name(name: &str) -> Self {
        Locator::Name(name.to_string())
    }

    pub fn css(selector: &str) -> Self {
        Locator::Css(selector.to_string())
    }

    /// Equivalent CSS selector, for drivers that only speak CSS.
    pub fn css_selector(&self) -> String {
        match self {
            Locator::Id(id) => format!("[id=\"{}\"]", escape_attr(id)),
            Locator::Name(name) => format!("[name=\"{}\"]", escape_attr(name)),
            Locator::Css(selector) => selector.clone(),
        }
    }
}

fn escape_attr(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Id(id) => write!(f, "#{id}"),
            Locator::Name(name) => write!(f, "name={name}"),
            Locator::Css(selector) => f.write_str(selector),
        }
    }
}

/// Opaque handle to an element found by [`InteractionPort::wait_for_element`].
///
/// Handles are only meaningful to the port that issued them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub locator: Locator,
    pub token: u64,
}

/// Marks an error as coming from the automation driver itself rather than
/// from the portal. Attach it as context: `err.context(DriverFault)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("browser driver fault")]
pub struct DriverFault;

/// True when `err` carries a [`DriverFault`] anywhere in its chain.
pub fn is_driver_fault(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DriverFault>().is_some()
}

/// Abstraction over a live, exclusively owned UI session.
///
/// Driver-level failures (driver crashed, connection lost) are tagged with
/// [`DriverFault`]. "Not found" is not an error: waits return `None`.
#[async_trait]
pub trait InteractionPort: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Wait until a visible element matches `locator`, up to `timeout`.
    async fn wait_for_element(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<Element>>;

    async fn fill(&mut self, element: &Element, text: &str) -> Result<()>;

    /// Pick the `<option>` whose visible text equals `visible_text`.
    async fn select_option(&mut self, element: &Element, visible_text: &str) -> Result<()>;

    async fn click(&mut self, element: &Element) -> Result<()>;

    /// The element's `value` property.
    async fn read_value(&mut self, element: &Element) -> Result<String>;

    /// The element's rendered text.
    async fn read_text(&mut self, element: &Element) -> Result<String>;

    /// Rendered text of the whole document body.
    async fn page_text(&mut self) -> Result<String>;

    async fn current_url(&mut self) -> Result<String>;

    /// Accept a blocking dialog if one is open or opens within `timeout`.
    /// Returns the dialog's message.
    async fn dismiss_blocking_dialog(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Capture the page and return a reference to the stored image.
    async fn screenshot(&mut self, label: &str) -> Result<String>;

    async fn close(&mut self) -> Result<()>;
}

/// Parameters for opening a fresh port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub headless: bool,
    pub browser: BrowserKind,
    pub screenshot_dir: PathBuf,
    /// Attempt index, used to keep screenshot names apart.
    pub attempt: u32,
}

impl PortRequest {
    pub fn from_settings(settings: &Settings, attempt: u32) -> Self {
        Self {
            headless: settings.schedule.headless,
            browser: settings.schedule.browser,
            screenshot_dir: settings.screenshot_dir.clone(),
            attempt,
        }
    }
}

/// Opens one fresh port per attempt. A failure here is an infrastructure
/// failure: the portal was never reached.
#[async_trait]
pub trait PortFactory: Send + Sync {
    async fn open(&self, request: &PortRequest) -> Result<Box<dyn InteractionPort>>;
}

/// Factory used when the crate is built without a browser driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailablePortFactory;

#[async_trait]
impl PortFactory for UnavailablePortFactory {
    async fn open(&self, _request: &PortRequest) -> Result<Box<dyn InteractionPort>> {
        Err(anyhow!(
            "gatepass was built without browser support (enable the `browser` feature)"
        ))
    }
}

/// The port factory this build ships with.
pub fn default_port_factory() -> Arc<dyn PortFactory> {
    #[cfg(feature = "browser")]
    {
        Arc::new(super::cdp::CdpPortFactory)
    }
    #[cfg(not(feature = "browser"))]
    {
        Arc::new(UnavailablePortFactory)
    }
}

/// Exclusive, scoped ownership of a port for one attempt.
///
/// Call [`PortLease::release`] on every exit path. If a lease is dropped
/// without being released (panic, cancelled future) the port is closed on a
/// background task instead.
pub struct PortLease {
    port: Box<dyn InteractionPort>,
    released: bool,
}

impl PortLease {
    pub fn new(port: Box<dyn InteractionPort>) -> Self {
        Self {
            port,
            released: false,
        }
    }

    pub fn port(&mut self) -> &mut dyn InteractionPort {
        self.port.as_mut()
    }

    /// Close the port and consume the lease.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let mut port = std::mem::replace(&mut self.port, Box::new(ClosedPort));
        port.close().await
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut port = std::mem::replace(&mut self.port, Box::new(ClosedPort));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("port lease dropped without release; closing in background");
                handle.spawn(async move {
                    if let Err(err) = port.close().await {
                        warn!(error = %err, "failed to close abandoned port");
                    }
                });
            }
            Err(_) => warn!("port lease dropped outside a runtime; port not closed"),
        }
    }
}

/// Placeholder left behind once a lease gave up its port.
struct ClosedPort;

#[async_trait]
impl InteractionPort for ClosedPort {
    async fn navigate(&mut self, _url: &str) -> Result<()> {
        Err(closed())
    }

    async fn wait_for_element(
        &mut self,
        _locator: &Locator,
        _timeout: Duration,
    ) -> Result<Option<Element>> {
        Err(closed())
    }

    async fn fill(&mut self, _element: &Element, _text: &str) -> Result<()> {
        Err(closed())
    }

    async fn select_option(&mut self, _element: &Element, _visible_text: &str) -> Result<()> {
        Err(closed())
    }

    async fn click(&mut self, _element: &Element) -> Result<()> {
        Err(closed())
    }

    async fn read_value(&mut self, _element: &Element) -> Result<String> {
        Err(closed())
    }

    async fn read_text(&mut self, _element: &Element) -> Result<String> {
        Err(closed())
    }

    async fn page_text(&mut self) -> Result<String> {
        Err(closed())
    }

    async fn current_url(&mut self) -> Result<String> {
        Err(closed())
    }

    async fn dismiss_blocking_dialog(&mut self, _timeout: Duration) -> Result<Option<String>> {
        Err(closed())
    }

    async fn screenshot(&mut self, _label: &str) -> Result<String> {
        Err(closed())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn closed() -> anyhow::Error {
    anyhow!("port already released").context(DriverFault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedPort;

    #[test]
    fn locators_render_as_css() {
        assert_eq!(Locator::id("otp_code").css_selector(), "[id=\"otp_code\"]");
        assert_eq!(
            Locator::name("vehicle_no1").css_selector(),
            "[name=\"vehicle_no1\"]"
        );
        assert_eq!(Locator::css("body").css_selector(), "body");
        assert_eq!(Locator::name("dl_no").to_string(), "name=dl_no");
    }

    #[tokio::test]
    async fn release_closes_the_port_once() {
        let port = ScriptedPort::new();
        let log = port.log();
        let lease = PortLease::new(Box::new(port));
        lease.release().await.expect("release");
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_closes_in_background() {
        let port = ScriptedPort::new();
        let log = port.log();
        drop(PortLease::new(Box::new(port)));
        tokio::task::yield_now().await;
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_factory_reports_missing_driver() {
        let request = PortRequest::from_settings(&Settings::default(), 1);
        let err = UnavailablePortFactory
            .open(&request)
            .await
            .err()
            .expect("open must fail");
        assert!(err.to_string().contains("browser support"));
    }

    #[tokio::test]
    async fn released_port_reports_a_driver_fault() {
        let mut port = ClosedPort;
        let err = port.navigate("https://portal.test").await.expect_err("closed");
        assert!(is_driver_fault(&err));
        assert!(format!("{err:#}").contains("port already released"));

        let plain = anyhow!("element vanished");
        assert!(!is_driver_fault(&plain));
    }
}
