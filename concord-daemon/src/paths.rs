use std::path::{Path, PathBuf};

use crate::error::DaemonError;

pub const CONFIG_FILE: &str = "config.yaml";

/// `<home>/.concord`
pub fn concord_root(home: &Path) -> PathBuf {
    home.join(".concord")
}

pub fn config_path(home: &Path) -> PathBuf {
    concord_root(home).join(CONFIG_FILE)
}

/// Default file-store root; records live in `<root>/records/`.
pub fn default_store_root(home: &Path) -> PathBuf {
    concord_root(home)
}

pub fn home_dir() -> Result<PathBuf, DaemonError> {
    dirs::home_dir().ok_or(DaemonError::NoHome)
}
