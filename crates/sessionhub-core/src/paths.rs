//! Default on-disk locations.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Directory name under the home directory holding all SessionHub state.
pub const DATA_DIR_NAME: &str = ".sessionhub";

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<String, String> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(home);
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(profile);
        }
    }

    Err("Home directory not set".to_string())
}

/// `~/.sessionhub`
pub fn default_data_dir() -> Result<PathBuf, String> {
    get_home_dir().map(|home| Path::new(&home).join(DATA_DIR_NAME))
}

/// `<data_dir>/registries/<surface>.json`
///
/// The surface name becomes a file name, so it must be a single normal path
/// component.
pub fn registry_file(data_dir: &Path, surface: &str) -> Result<PathBuf, String> {
    validate_path_component(surface)?;
    Ok(data_dir.join("registries").join(format!("{surface}.json")))
}

fn validate_path_component(component: &str) -> Result<(), String> {
    if component.is_empty() {
        return Err("Path component cannot be empty".to_string());
    }

    let mut components = Path::new(component).components();
    match components.next() {
        Some(Component::Normal(_)) if components.next().is_none() => Ok(()),
        _ => Err(format!("Invalid path component: {component}")),
    }
}
