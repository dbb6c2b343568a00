//! Initialization helpers for `.gatepass/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{Settings, write_settings};
use super::form_profile::{FormProfile, write_form_profile};

/// All canonical paths within `.gatepass/` for a project root.
#[derive(Debug, Clone)]
pub struct GatepassPaths {
    pub root: PathBuf,
    pub gatepass_dir: PathBuf,
    pub settings_path: PathBuf,
    pub form_profile_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl GatepassPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let gatepass_dir = root.join(".gatepass");
        Self {
            root: root.clone(),
            gatepass_dir: gatepass_dir.clone(),
            settings_path: gatepass_dir.join("settings.toml"),
            form_profile_path: gatepass_dir.join("form_profile.json"),
            gitignore_path: gatepass_dir.join(".gitignore"),
        }
    }

    /// Screenshot directory from `settings`, resolved against the root.
    pub fn screenshot_dir(&self, settings: &Settings) -> PathBuf {
        if settings.screenshot_dir.is_absolute() {
            settings.screenshot_dir.clone()
        } else {
            self.gatepass_dir.join(&settings.screenshot_dir)
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing files with defaults.
    pub force: bool,
}

/// Create `.gatepass/` with default settings and form profile.
///
/// Fails if `.gatepass/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<GatepassPaths> {
    let paths = GatepassPaths::new(root);
    if paths.gatepass_dir.exists() && !paths.gatepass_dir.is_dir() {
        return Err(anyhow!(
            "gatepass init: .gatepass exists but is not a directory"
        ));
    }
    if paths.gatepass_dir.exists() && !options.force {
        return Err(anyhow!(
            "gatepass init: .gatepass already exists (use --force to overwrite)"
        ));
    }
    fs::create_dir_all(&paths.gatepass_dir)
        .with_context(|| format!("create directory {}", paths.gatepass_dir.display()))?;
    write_settings(&paths.settings_path, &Settings::default())?;
    write_form_profile(&paths.form_profile_path, &FormProfile::default())?;
    fs::write(&paths.gitignore_path, GATEPASS_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    Ok(paths)
}

/// Write defaults for whichever of the two files is missing. Used on
/// dashboard start so a fresh checkout is immediately usable.
pub fn ensure_defaults(root: &Path) -> Result<GatepassPaths> {
    let paths = GatepassPaths::new(root);
    if !paths.settings_path.exists() {
        write_settings(&paths.settings_path, &Settings::default())?;
    }
    if !paths.form_profile_path.exists() {
        write_form_profile(&paths.form_profile_path, &FormProfile::default())?;
    }
    Ok(paths)
}

const GATEPASS_GITIGNORE: &str = "screenshots/\n";
