//! Server-Sent Events stream and settings file watcher.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use gatepass::core::events::EventEnvelope;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct FileChangePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
}

/// Render one broadcast item as an SSE frame.
///
/// Lifecycle events go out as `lifecycle` frames carrying the envelope;
/// file edits go out as `change` frames.
fn to_sse_event(event: &ChangeEvent) -> Option<Event> {
    match event {
        ChangeEvent::Lifecycle(envelope) => lifecycle_event(envelope),
        ChangeEvent::SettingsChanged => change_event("settings_changed"),
        ChangeEvent::FormProfileChanged => change_event("form_profile_changed"),
    }
}

fn lifecycle_event(envelope: &EventEnvelope) -> Option<Event> {
    let json = serde_json::to_string(envelope).ok()?;
    Some(Event::default().event("lifecycle").data(json))
}

fn change_event(event_type: &'static str) -> Option<Event> {
    let json = serde_json::to_string(&FileChangePayload { event_type }).ok()?;
    Some(Event::default().event("change").data(json))
}

/// SSE endpoint handler.
///
/// A client connecting between cycles first receives the last terminal
/// event so it can show how the previous cycle ended.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    let replay = state.last_terminal();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        if let Some(event) = replay.as_ref().and_then(lifecycle_event) {
            yield Ok(event);
        }

        loop {
            match rx.recv().await {
                Ok(change) => {
                    if let Some(event) = to_sse_event(&change) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the settings watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    let dir = &state.paths.gatepass_dir;
    if !dir.exists() {
        info!(path = %dir.display(), "settings directory missing, not watching");
        return Ok(());
    }
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!(path = %dir.display(), "watching settings directory");

    // Editors write in bursts; collapse them into one notification per tick.
    let mut pending: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending.push(event);
            }
            _ = flush_tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                process_events(&state, &pending);
                pending.clear();
            }
        }
    }
}

fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let mut settings_changed = false;
    let mut profile_changed = false;

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == &state.paths.settings_path {
                settings_changed = true;
            } else if path == &state.paths.form_profile_path {
                profile_changed = true;
            }
        }
    }

    if settings_changed {
        debug!("broadcasting settings change");
        let _ = state.event_tx.send(ChangeEvent::SettingsChanged);
    }
    if profile_changed {
        debug!("broadcasting form profile change");
        let _ = state.event_tx.send(ChangeEvent::FormProfileChanged);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use gatepass::test_support::{ScriptedPortFactory, TestClock, temp_project};

    use super::*;

    fn state() -> (tempfile::TempDir, AppState) {
        let (temp, paths) = temp_project().expect("project");
        let state = AppState::new(
            paths.root,
            Arc::new(ScriptedPortFactory::healthy()),
            Arc::new(TestClock::at("2026-03-10T06:00:00+05:30")),
        );
        (temp, state)
    }

    fn event(kind: EventKind, path: PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind,
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    fn modify_event(path: PathBuf) -> NotifyEvent {
        event(EventKind::Modify(notify::event::ModifyKind::Any), path)
    }

    fn drain(rx: &mut broadcast::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn repeated_settings_writes_collapse_into_one_change() {
        let (_temp, state) = state();
        let mut rx = state.event_tx.subscribe();
        let path = state.paths.settings_path.clone();

        process_events(&state, &[modify_event(path.clone()), modify_event(path)]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChangeEvent::SettingsChanged));
    }

    #[tokio::test]
    async fn form_profile_and_settings_are_reported_separately() {
        let (_temp, state) = state();
        let mut rx = state.event_tx.subscribe();

        process_events(
            &state,
            &[
                modify_event(state.paths.form_profile_path.clone()),
                event(
                    EventKind::Create(notify::event::CreateKind::File),
                    state.paths.settings_path.clone(),
                ),
            ],
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChangeEvent::SettingsChanged));
        assert!(matches!(events[1], ChangeEvent::FormProfileChanged));
    }

    #[tokio::test]
    async fn removals_and_unrelated_files_are_ignored() {
        let (_temp, state) = state();
        let mut rx = state.event_tx.subscribe();

        process_events(
            &state,
            &[
                event(
                    EventKind::Remove(notify::event::RemoveKind::File),
                    state.paths.settings_path.clone(),
                ),
                modify_event(state.paths.gatepass_dir.join("settings.toml.tmp")),
            ],
        );

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn change_frames_carry_a_type_tag() {
        let json = serde_json::to_string(&FileChangePayload {
            event_type: "settings_changed",
        })
        .expect("json");
        assert_eq!(json, r#"{"type":"settings_changed"}"#);
    }
}
