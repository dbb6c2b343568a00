//! Portal login credentials.
//!
//! Credentials only ever live in memory. They are not `Serialize`, their
//! `Debug` output is redacted, and dropping them overwrites the password
//! buffer before it is freed.

use std::fmt;

use crate::core::errors::ConfigError;

pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Credentials("username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Credentials("password"));
        }
        Ok(())
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.username.clone(), self.password.clone())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.password).into_bytes();
        bytes.fill(0);
        std::hint::black_box(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_the_password() {
        let creds = Credentials::new("operator", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn blank_fields_are_configuration_errors() {
        assert_eq!(
            Credentials::new(" ", "pw").validate(),
            Err(ConfigError::Credentials("username"))
        );
        assert_eq!(
            Credentials::new("op", "").validate(),
            Err(ConfigError::Credentials("password"))
        );
        Credentials::new("op", "pw").validate().expect("valid");
    }
}
