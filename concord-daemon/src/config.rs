//! Host configuration, read from `<home>/.concord/config.yaml`.
//!
//! Every field is optional; a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_sync::EngineConfig;

use crate::error::{io_err, DaemonError};
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Upper bound on concurrent reconcile passes.
    pub workers: usize,
    /// Full resync period; 0 disables the periodic resync.
    pub resync_interval_secs: u64,
    /// Requeue delay after a pass fails on a store error.
    pub error_requeue_secs: u64,
    pub json_logs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_root: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval_secs: 600,
            error_requeue_secs: 30,
            json_logs: false,
            store_root: None,
            engine: EngineConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = paths::config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| DaemonError::Parse { path, source })
    }

    pub fn load() -> Result<Self, DaemonError> {
        Self::load_at(&paths::home_dir()?)
    }

    pub fn store_root(&self, home: &Path) -> PathBuf {
        self.store_root
            .clone()
            .unwrap_or_else(|| paths::default_store_root(home))
    }

    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(home: &TempDir, contents: &str) {
        let path = paths::config_path(home.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("home");
        let config = HostConfig::load_at(home.path()).expect("load");
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(600)));
        assert_eq!(config.store_root(home.path()), home.path().join(".concord"));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let home = TempDir::new().expect("home");
        write_config(
            &home,
            "workers: 8\nresync_interval_secs: 0\nengine:\n  debounce_ms: 250\n  backoff:\n    max_retries: 2\n",
        );
        let config = HostConfig::load_at(home.path()).expect("load");
        assert_eq!(config.workers(), 8);
        assert_eq!(config.resync_interval(), None);
        assert_eq!(config.error_requeue(), Duration::from_secs(30));
        assert_eq!(config.engine.debounce(), Duration::from_millis(250));
        assert_eq!(config.engine.backoff.max_retries, 2);
        assert_eq!(config.engine.backoff.base_delay_secs, 10);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let home = TempDir::new().expect("home");
        write_config(&home, "\n");
        assert_eq!(HostConfig::load_at(home.path()).unwrap(), HostConfig::default());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let home = TempDir::new().expect("home");
        write_config(&home, "workers: [not a number\n");
        let err = HostConfig::load_at(home.path()).unwrap_err();
        assert!(matches!(err, DaemonError::Parse { .. }), "got {err}");
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn store_root_override() {
        let home = TempDir::new().expect("home");
        write_config(&home, "store_root: /srv/concord\nworkers: 0\n");
        let config = HostConfig::load_at(home.path()).unwrap();
        assert_eq!(config.store_root(home.path()), PathBuf::from("/srv/concord"));
        assert_eq!(config.workers(), 1);
    }
}
