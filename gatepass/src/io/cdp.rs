//! Chrome DevTools Protocol implementation of [`InteractionPort`].
//!
//! Each port launches its own browser process, so attempts never share
//! cookies or page state. JavaScript dialogs are captured from
//! `Page.javascriptDialogOpening` events on a background task and accepted on
//! demand through `Page.handleJavaScriptDialog`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::element::Element as CdpElement;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::config::BrowserKind;
use super::port::{DriverFault, Element, InteractionPort, Locator, PortFactory, PortRequest};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const IS_VISIBLE_JS: &str =
    "function() { return !!(this.offsetWidth || this.offsetHeight || this.getClientRects().length); }";
const CLEAR_VALUE_JS: &str = "function() { this.value = ''; }";
const READ_VALUE_JS: &str = "function() { return this.value == null ? '' : String(this.value); }";

/// Launches a fresh Chrome per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct CdpPortFactory;

#[async_trait]
impl PortFactory for CdpPortFactory {
    #[instrument(skip_all, fields(attempt = request.attempt, headless = request.headless))]
    async fn open(&self, request: &PortRequest) -> Result<Box<dyn InteractionPort>> {
        if request.browser == BrowserKind::Firefox {
            bail!("browser \"firefox\" is not supported by the CDP driver; use \"chrome\"");
        }
        let mut builder = BrowserConfig::builder().no_sandbox().window_size(1920, 1080);
        if !request.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|err| anyhow!("browser config: {err}"))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launch chrome")?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler_task.abort();
                return Err(err).context("open browser tab");
            }
        };
        let mut dialog_events = page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .context("subscribe to dialog events")?;
        let (dialog_tx, dialog_rx) = mpsc::unbounded_channel();
        let dialog_task = tokio::spawn(async move {
            while let Some(event) = dialog_events.next().await {
                if dialog_tx.send(event.message.clone()).is_err() {
                    break;
                }
            }
        });
        info!("browser session opened");

        Ok(Box::new(CdpPort {
            browser,
            page,
            handler_task,
            dialog_task,
            dialogs: dialog_rx,
            elements: HashMap::new(),
            next_token: 1,
            screenshot_dir: request.screenshot_dir.clone(),
            attempt: request.attempt,
            shots: 0,
        }))
    }
}

struct CdpPort {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    dialog_task: JoinHandle<()>,
    dialogs: mpsc::UnboundedReceiver<String>,
    elements: HashMap<u64, CdpElement>,
    next_token: u64,
    screenshot_dir: PathBuf,
    attempt: u32,
    shots: u32,
}

impl CdpPort {
    /// Tag `err` as a driver fault once the CDP connection has gone away.
    fn fault(&self, err: anyhow::Error) -> anyhow::Error {
        if self.handler_task.is_finished() {
            err.context(DriverFault)
        } else {
            err
        }
    }

    fn element(&self, handle: &Element) -> Result<&CdpElement> {
        self.elements
            .get(&handle.token)
            .ok_or_else(|| anyhow!("stale element handle for {}", handle.locator))
    }

    async fn is_visible(element: &CdpElement) -> bool {
        match element.call_js_fn(IS_VISIBLE_JS, false).await {
            Ok(ret) => ret
                .result
                .value
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl InteractionPort for CdpPort {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.elements.clear();
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigate to {url}"))
            .map_err(|err| self.fault(err))?;
        Ok(())
    }

    async fn wait_for_element(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        let selector = locator.css_selector();
        let deadline = Instant::now() + timeout;
        loop {
            if self.handler_task.is_finished() {
                return Err(anyhow!("browser connection lost waiting for {locator}")
                    .context(DriverFault));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let found = tokio::time::timeout(remaining, self.page.find_element(selector.as_str()))
                .await
                .ok()
                .and_then(Result::ok);
            if let Some(element) = found
                && Self::is_visible(&element).await
            {
                let token = self.next_token;
                self.next_token += 1;
                self.elements.insert(token, element);
                return Ok(Some(Element {
                    locator: locator.clone(),
                    token,
                }));
            }
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn fill(&mut self, handle: &Element, text: &str) -> Result<()> {
        let element = self.element(handle)?;
        element
            .call_js_fn(CLEAR_VALUE_JS, false)
            .await
            .with_context(|| format!("clear {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        element
            .focus()
            .await
            .with_context(|| format!("focus {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        element
            .type_str(text)
            .await
            .with_context(|| format!("type into {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        Ok(())
    }

    async fn select_option(&mut self, handle: &Element, visible_text: &str) -> Result<()> {
        let wanted = serde_json::to_string(visible_text).context("encode option text")?;
        let script = format!(
            "function() {{ const want = {wanted}; \
             const opt = Array.from(this.options || []).find(o => o.text.trim() === want); \
             if (!opt) {{ return false; }} \
             this.value = opt.value; \
             this.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true; }}"
        );
        let element = self.element(handle)?;
        let ret = element
            .call_js_fn(script, false)
            .await
            .with_context(|| format!("select in {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        if ret.result.value.and_then(|v| v.as_bool()) != Some(true) {
            bail!("{} has no option {visible_text:?}", handle.locator);
        }
        Ok(())
    }

    async fn click(&mut self, handle: &Element) -> Result<()> {
        let element = self.element(handle)?;
        element
            .scroll_into_view()
            .await
            .with_context(|| format!("scroll to {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        element
            .click()
            .await
            .with_context(|| format!("click {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        Ok(())
    }

    async fn read_value(&mut self, handle: &Element) -> Result<String> {
        let element = self.element(handle)?;
        let ret = element
            .call_js_fn(READ_VALUE_JS, false)
            .await
            .with_context(|| format!("read value of {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        Ok(ret
            .result
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default())
    }

    async fn read_text(&mut self, handle: &Element) -> Result<String> {
        let element = self.element(handle)?;
        let text = element
            .inner_text()
            .await
            .with_context(|| format!("read text of {}", handle.locator))
            .map_err(|err| self.fault(err))?;
        Ok(text.unwrap_or_default())
    }

    async fn page_text(&mut self) -> Result<String> {
        let text: String = self
            .page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .context("read page text")
            .map_err(|err| self.fault(err))?
            .into_value()
            .context("decode page text")?;
        Ok(text)
    }

    async fn current_url(&mut self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("read current url")
            .map_err(|err| self.fault(err))?;
        Ok(url.unwrap_or_default())
    }

    async fn dismiss_blocking_dialog(&mut self, timeout: Duration) -> Result<Option<String>> {
        let message = match tokio::time::timeout(timeout, self.dialogs.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => return Ok(None),
        };
        self.page
            .execute(HandleJavaScriptDialogParams::new(true))
            .await
            .context("accept dialog")
            .map_err(|err| self.fault(err))?;
        debug!(message = %message, "dialog accepted");
        Ok(Some(message))
    }

    async fn screenshot(&mut self, label: &str) -> Result<String> {
        self.shots += 1;
        std::fs::create_dir_all(&self.screenshot_dir)
            .with_context(|| format!("create directory {}", self.screenshot_dir.display()))?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let path = self.screenshot_dir.join(format!(
            "{stamp}-a{}-{:02}-{label}.png",
            self.attempt, self.shots
        ));
        self.page
            .save_screenshot(ScreenshotParams::builder().full_page(true).build(), &path)
            .await
            .with_context(|| format!("save screenshot {}", path.display()))
            .map_err(|err| self.fault(err))?;
        Ok(path.display().to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.elements.clear();
        self.dialog_task.abort();
        let closed = self.browser.close().await;
        if let Err(err) = self.browser.wait().await {
            warn!(error = %err, "browser process did not exit cleanly");
        }
        self.handler_task.abort();
        closed.context("close browser")?;
        info!("browser session closed");
        Ok(())
    }
}
