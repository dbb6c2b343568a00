//! Side-effecting collaborators: config files, the UI port, passcode intake.

#[cfg(feature = "browser")]
pub mod cdp;
pub mod config;
pub mod form_profile;
pub mod init;
pub mod passcode;
pub mod port;
