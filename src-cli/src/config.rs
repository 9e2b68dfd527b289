use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nested_set::Settings;

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("threadtree"))
}

pub fn get_settings_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("settings.json"))
}

/// Settings from `explicit` when given (the file must exist), otherwise from
/// the user config directory, otherwise the defaults.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        return Settings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()));
    }
    match get_settings_path() {
        Some(path) => Settings::load_or_default(&path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => {
            log::debug!("no config directory on this platform, using default settings");
            Ok(Settings::default())
        }
    }
}
