//! Event delivery to observers.
//!
//! Sinks are synchronous and cheap: emitting happens inline at each
//! transition, which keeps events in program order within a cycle and keeps
//! cycles from interleaving (only one cycle runs at a time).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use crate::core::events::{CycleEvent, EventEnvelope};

pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Mirrors lifecycle events into the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        let cycle = envelope.cycle_id.unwrap_or_default();
        match &envelope.event {
            CycleEvent::AttemptFailed {
                index,
                reason,
                message,
                ..
            } => warn!(cycle, attempt = index, %reason, %message, "attempt failed"),
            CycleEvent::CycleExhausted {
                attempts,
                last_reason,
                ..
            } => warn!(cycle, attempts, %last_reason, "cycle exhausted"),
            CycleEvent::CycleFatal { error } => warn!(cycle, %error, "cycle fatal"),
            CycleEvent::TriggerSkipped {
                trigger_kind,
                reason,
            } => warn!(%trigger_kind, %reason, "trigger skipped"),
            CycleEvent::StateChanged {
                attempt, from, to, ..
            } => info!(cycle, attempt, %from, %to, "state changed"),
            other => info!(cycle, seq = envelope.seq, event = other.name(), "lifecycle event"),
        }
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, envelope: &EventEnvelope) {
        for sink in &self.sinks {
            sink.emit(envelope);
        }
    }
}

/// Stamps events with a stream id, sequence number and timestamp.
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    cycle_id: Option<u64>,
    seq: AtomicU64,
}

impl Emitter {
    pub fn for_cycle(sink: Arc<dyn EventSink>, cycle_id: u64) -> Self {
        Self {
            sink,
            cycle_id: Some(cycle_id),
            seq: AtomicU64::new(0),
        }
    }

    /// Emitter for events that belong to no cycle (scheduling, skips).
    pub fn detached(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            cycle_id: None,
            seq: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event: CycleEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope {
            cycle_id: self.cycle_id,
            seq,
            at: Utc::now(),
            event,
        };
        self.sink.emit(&envelope);
    }
}
