//! Operator-facing half of the passcode challenge.
//!
//! The portal sends a one-time passcode to the operator's phone. The session
//! machine asks a [`PasscodeSource`] for it and waits a bounded time; the
//! operator supplies it through the dashboard ([`PasscodeInbox`]) or the
//! terminal ([`StdinPasscode`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

#[async_trait]
pub trait PasscodeSource: Send + Sync {
    /// Wait up to `timeout` for a passcode. `None` means none arrived.
    async fn request(&self, attempt: u32, timeout: Duration) -> Option<String>;
}

/// Check the shape of an operator-supplied passcode.
pub fn normalize_passcode(raw: &str) -> Result<String> {
    let code = raw.trim();
    if !(4..=8).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_digit()) {
        bail!("passcode must be 4 to 8 digits");
    }
    Ok(code.to_string())
}

/// Passcodes pushed in from the dashboard.
pub struct PasscodeInbox {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
    waiting: AtomicBool,
}

impl PasscodeInbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(4);
        Self {
            tx,
            rx: Mutex::new(rx),
            waiting: AtomicBool::new(false),
        }
    }

    /// Deliver a passcode to the attempt currently waiting for one. Codes
    /// sent before a challenge starts are discarded as stale when it does.
    pub fn submit(&self, raw: &str) -> Result<()> {
        let code = normalize_passcode(raw)?;
        if self.tx.try_send(code).is_err() {
            bail!("passcode inbox is full; wait for the current challenge");
        }
        debug!(waiting = self.is_waiting(), "passcode queued");
        Ok(())
    }

    /// True while an attempt is blocked on a passcode.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl Default for PasscodeInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasscodeSource for PasscodeInbox {
    async fn request(&self, attempt: u32, timeout: Duration) -> Option<String> {
        let mut rx = self.rx.lock().await;
        // Codes left over from an earlier challenge are already expired.
        let mut stale = 0usize;
        while rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "discarded stale passcodes");
        }
        self.waiting.store(true, Ordering::SeqCst);
        info!(
            attempt,
            timeout_secs = timeout.as_secs(),
            "waiting for passcode"
        );
        let received = tokio::time::timeout(timeout, rx.recv()).await;
        self.waiting.store(false, Ordering::SeqCst);
        received.ok().flatten()
    }
}

/// Reads the passcode from the terminal, one line per challenge.
pub struct StdinPasscode {
    reader: Mutex<BufReader<Stdin>>,
}

impl StdinPasscode {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for StdinPasscode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasscodeSource for StdinPasscode {
    async fn request(&self, attempt: u32, timeout: Duration) -> Option<String> {
        let mut reader = self.reader.lock().await;
        eprintln!(
            "attempt {attempt}: enter the passcode sent to your phone (within {}s):",
            timeout.as_secs()
        );
        let mut line = String::new();
        match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
            Ok(Ok(read)) if read > 0 => normalize_passcode(&line).ok(),
            _ => None,
        }
    }
}
