//! Shared application state for the dashboard server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use gatepass::control::Controller;
use gatepass::core::events::EventEnvelope;
use gatepass::io::init::GatepassPaths;
use gatepass::io::port::PortFactory;
use gatepass::scheduler::Clock;
use gatepass::sink::{EventSink, FanoutSink, TracingSink};
use tokio::sync::broadcast;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A lifecycle event from the orchestrator.
    Lifecycle(EventEnvelope),
    SettingsChanged,
    FormProfileChanged,
}

/// Forwards lifecycle events to SSE clients and remembers the latest
/// terminal one for replay to late subscribers.
pub struct UiSink {
    event_tx: Arc<broadcast::Sender<ChangeEvent>>,
    last_terminal: Arc<Mutex<Option<EventEnvelope>>>,
}

impl EventSink for UiSink {
    fn emit(&self, envelope: &EventEnvelope) {
        if envelope.is_terminal() {
            let mut last = self
                .last_terminal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *last = Some(envelope.clone());
        }
        // No subscribers is fine; the status endpoint still has the state.
        let _ = self.event_tx.send(ChangeEvent::Lifecycle(envelope.clone()));
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Canonical `.gatepass/` paths under the project directory.
    pub paths: GatepassPaths,
    pub controller: Arc<Controller>,
    /// Broadcast sender for lifecycle and file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
    last_terminal: Arc<Mutex<Option<EventEnvelope>>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf, factory: Arc<dyn PortFactory>, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let event_tx = Arc::new(event_tx);
        let last_terminal = Arc::new(Mutex::new(None));
        let ui_sink = UiSink {
            event_tx: event_tx.clone(),
            last_terminal: last_terminal.clone(),
        };
        let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![
            Arc::new(ui_sink),
            Arc::new(TracingSink),
        ]));
        let controller = Arc::new(Controller::new(&project_dir, factory, sink, clock));
        Self {
            paths: GatepassPaths::new(project_dir),
            controller,
            event_tx,
            last_terminal,
        }
    }

    /// Most recent succeeded/exhausted/fatal event, if any cycle has ended.
    pub fn last_terminal(&self) -> Option<EventEnvelope> {
        self.last_terminal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
