//! Typed configuration rejections.
//!
//! Configuration errors are never retried. They surface synchronously from
//! `arm_schedule`, `fire_now` and settings writes, and callers downcast an
//! `anyhow::Error` to [`ConfigError`] when they need to tell them apart from
//! I/O failures.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_attempts must be between 1 and 10 (got {0})")]
    MaxAttempts(u32),

    #[error("retry_interval_secs must be between 5 and 300 (got {0})")]
    RetryInterval(u64),

    #[error("invalid time_of_day {value:?}: expected HH:MM or HH:MM:SS")]
    TimeOfDay { value: String },

    #[error("invalid timeouts: {0}")]
    Timeouts(String),

    #[error("invalid portal settings: {0}")]
    Portal(String),

    #[error("invalid form profile field {field}: {reason}")]
    FormProfile { field: &'static str, reason: String },

    #[error("credentials require a non-empty {0}")]
    Credentials(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        assert_eq!(
            ConfigError::MaxAttempts(0).to_string(),
            "max_attempts must be between 1 and 10 (got 0)"
        );
        let err = ConfigError::TimeOfDay {
            value: "25:00".to_string(),
        };
        assert!(err.to_string().contains("\"25:00\""));
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = ConfigError::RetryInterval(2).into();
        let err = err.context("arm schedule");
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::RetryInterval(2))
        );
    }
}
