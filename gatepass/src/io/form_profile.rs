//! Form profile stored under `.gatepass/form_profile.json`.
//!
//! The profile is the static half of the gatepass form plus the list of values
//! that must be read back from the live page before submitting. It is loaded
//! once per cycle and never changes while the cycle runs.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::write_atomic;
use crate::core::errors::ConfigError;

/// Indian registration plate, e.g. `KA28AB2222`.
static VEHICLE_NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{2}[0-9]{1,2}[A-Z]{0,3}[0-9]{4}$").expect("vehicle number regex")
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FormProfile {
    pub ash_utilization: String,
    pub pickup_time: String,
    pub vehicle_type: String,
    pub quantity_limit: String,
    pub vehicle_classification: String,
    pub authorised_person: String,
    pub vehicle_no: String,
    pub dl_no: String,
    pub driver_mob_no: String,
    /// Inputs whose `value` is copied off the page before submission.
    pub read_back: Vec<ReadBackField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadBackField {
    /// `name` attribute of the input.
    pub name: String,
    /// Used when the input is present but empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// A required field missing from the page fails the submission.
    #[serde(default)]
    pub required: bool,
}

impl ReadBackField {
    fn optional(name: &str, default: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            default: default.map(str::to_string),
            required: false,
        }
    }
}

impl Default for FormProfile {
    fn default() -> Self {
        Self {
            ash_utilization: "Ash_based_Products".to_string(),
            pickup_time: "10.00AM - 11.00AM".to_string(),
            vehicle_type: "Bluker 16 Wheeler".to_string(),
            quantity_limit: "36".to_string(),
            vehicle_classification: "Hired".to_string(),
            authorised_person: "POTHALINGAPPA C".to_string(),
            vehicle_no: "KA28AB2222".to_string(),
            dl_no: "7634".to_string(),
            driver_mob_no: "9768453423".to_string(),
            read_back: vec![
                ReadBackField::optional("ash_price", Some("150")),
                ReadBackField::optional("balance_amount", Some("0")),
                ReadBackField {
                    name: "gatepass_token".to_string(),
                    default: None,
                    required: true,
                },
                ReadBackField::optional("total_extra", None),
                ReadBackField::optional("full_flyash", None),
                ReadBackField::optional("extra_flyash", None),
            ],
        }
    }
}

/// How a profile value reaches the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// `<select>` matched by visible option text.
    Select,
    /// Text input, cleared then typed.
    Text,
}

/// How long to look for a field before skipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Always rendered by the portal; waited for with the short tier.
    Expected,
    /// Only rendered for some accounts; probed briefly.
    Probed,
}

/// One value to place on the gatepass form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormEntry<'a> {
    /// `name` attribute on the page.
    pub field: &'static str,
    pub value: &'a str,
    pub control: Control,
    pub presence: Presence,
}

fn entry<'a>(
    field: &'static str,
    value: &'a str,
    control: Control,
    presence: Presence,
) -> FormEntry<'a> {
    FormEntry {
        field,
        value,
        control,
        presence,
    }
}

impl FormProfile {
    /// Entries in the order the portal expects them filled. Selecting the
    /// utilization and slot first lets the page recompute dependent inputs.
    pub fn entries(&self) -> Vec<FormEntry<'_>> {
        use Control::{Select, Text};
        use Presence::{Expected, Probed};
        vec![
            entry("ash_utilization", self.ash_utilization.as_str(), Select, Expected),
            entry("pickup_time", self.pickup_time.as_str(), Select, Expected),
            entry("vehicle_type", self.vehicle_type.as_str(), Select, Probed),
            entry("quantity_limit", self.quantity_limit.as_str(), Text, Probed),
            entry(
                "vehicle_classification",
                self.vehicle_classification.as_str(),
                Select,
                Probed,
            ),
            entry("vehicle_no1", self.vehicle_no.as_str(), Text, Expected),
            entry("dl_no", self.dl_no.as_str(), Text, Expected),
            entry("driver_mob_no1", self.driver_mob_no.as_str(), Text, Expected),
            entry(
                "authorised_person",
                self.authorised_person.as_str(),
                Select,
                Expected,
            ),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("ash_utilization", &self.ash_utilization),
            ("pickup_time", &self.pickup_time),
            ("authorised_person", &self.authorised_person),
            ("vehicle_no", &self.vehicle_no),
            ("dl_no", &self.dl_no),
            ("driver_mob_no", &self.driver_mob_no),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::FormProfile {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if !VEHICLE_NO_RE.is_match(&self.vehicle_no) {
            return Err(ConfigError::FormProfile {
                field: "vehicle_no",
                reason: format!("{:?} is not a registration number", self.vehicle_no),
            });
        }
        if self.driver_mob_no.len() != 10 || !self.driver_mob_no.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ConfigError::FormProfile {
                field: "driver_mob_no",
                reason: "must be 10 digits".to_string(),
            });
        }
        if !self.quantity_limit.is_empty() && self.quantity_limit.parse::<u32>().is_err() {
            return Err(ConfigError::FormProfile {
                field: "quantity_limit",
                reason: "must be a whole number".to_string(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for field in &self.read_back {
            if field.name.trim().is_empty() {
                return Err(ConfigError::FormProfile {
                    field: "read_back",
                    reason: "field names must not be empty".to_string(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::FormProfile {
                    field: "read_back",
                    reason: format!("duplicate field {}", field.name),
                });
            }
        }
        Ok(())
    }
}

/// Load the profile from JSON. A missing file yields the default profile.
pub fn load_form_profile(path: &Path) -> Result<FormProfile> {
    if !path.exists() {
        return Ok(FormProfile::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let profile: FormProfile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    profile
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(profile)
}

/// Validate, then atomically write the profile as pretty JSON.
pub fn write_form_profile(path: &Path, profile: &FormProfile) -> Result<()> {
    profile.validate()?;
    let mut buf = serde_json::to_string_pretty(profile).context("serialize form profile")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_valid() {
        FormProfile::default().validate().expect("valid");
    }

    #[test]
    fn entries_map_profile_keys_to_page_names() {
        let profile = FormProfile::default();
        let entries = profile.entries();
        let vehicle = entries
            .iter()
            .find(|e| e.field == "vehicle_no1")
            .expect("vehicle entry");
        assert_eq!(vehicle.value, "KA28AB2222");
        assert_eq!(vehicle.control, Control::Text);
        assert_eq!(entries[0].field, "ash_utilization");
        assert_eq!(entries.last().map(|e| e.field), Some("authorised_person"));
    }

    #[test]
    fn rejects_malformed_vehicle_number() {
        let profile = FormProfile {
            vehicle_no: "ka 28 ab".to_string(),
            ..FormProfile::default()
        };
        let err = profile.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::FormProfile {
                field: "vehicle_no",
                ..
            }
        ));
    }

    #[test]
    fn rejects_short_mobile_number() {
        let profile = FormProfile {
            driver_mob_no: "97684".to_string(),
            ..FormProfile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_read_back_fields() {
        let mut profile = FormProfile::default();
        profile
            .read_back
            .push(ReadBackField::optional("ash_price", None));
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate field ash_price"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("form_profile.json");
        let profile = FormProfile {
            pickup_time: "11.00AM - 12.00PM".to_string(),
            ..FormProfile::default()
        };
        write_form_profile(&path, &profile).expect("write");
        assert_eq!(load_form_profile(&path).expect("load"), profile);
    }

    #[test]
    fn partial_json_keeps_default_read_backs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("form_profile.json");
        fs::write(&path, r#"{"vehicle_no":"KA01MN1234"}"#).expect("write");
        let profile = load_form_profile(&path).expect("load");
        assert_eq!(profile.vehicle_no, "KA01MN1234");
        assert_eq!(profile.read_back.len(), 6);
        assert!(
            profile
                .read_back
                .iter()
                .any(|f| f.name == "gatepass_token" && f.required)
        );
    }
}
