//! Scheduled portal submission orchestrator.
//!
//! Once a day (or on demand) the crate signs in to the flyash portal, clears
//! the passcode challenge with the operator's help, fills the gatepass form
//! and submits it, retrying whole attempts under a bounded policy. The layout
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, transition rules, time of
//!   day math, attempt budget, events). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (config stores, the interaction
//!   port and its browser adapter, passcode intake). Isolated behind traits so
//!   tests can substitute scripted doubles.
//!
//! Orchestration modules ([`protocol`], [`session`], [`retry`], [`scheduler`],
//! [`control`]) compose core logic with I/O; [`sink`] delivers lifecycle
//! events to observers.

pub mod control;
pub mod core;
pub mod credentials;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sink;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
