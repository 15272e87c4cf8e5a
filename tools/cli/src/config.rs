//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fitsync_background::{JobClass, JobPolicy};
use fitsync_common::EntityType;
use fitsync_sync::SyncConfig;

const APP_DIR: &str = "fitsync";
const CONFIG_FILE: &str = "config.json";

/// Entity types tracked when the config file names none.
const DEFAULT_ENTITY_TYPES: [&str; 3] = ["goal", "workout", "meal"];

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where the local database and status file live.
    pub data_dir: Option<PathBuf>,
    /// Directory used as the remote store.
    pub remote_dir: Option<PathBuf>,
    pub sync: SyncConfig,
    /// Per-class overrides of the default job policies.
    pub jobs: BTreeMap<JobClass, JobPolicy>,
}

impl Default for CliConfig {
    fn default() -> Self {
        let entity_types = DEFAULT_ENTITY_TYPES
            .into_iter()
            .filter_map(|name| EntityType::new(name).ok());
        Self {
            data_dir: None,
            remote_dir: None,
            sync: SyncConfig::default().with_entity_types(entity_types),
            jobs: BTreeMap::new(),
        }
    }
}

impl CliConfig {
    /// Load `path`, or the default location if `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: CliConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if config.sync.entity_types.is_empty() {
            config.sync.entity_types = Self::default().sync.entity_types;
        }
        Ok(config)
    }

    /// Data directory, from the config or the platform default.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .context("No data directory on this platform; set data_dir in the config"),
        }
    }

    /// Remote directory, defaulting to `remote/` under the data directory.
    pub fn remote_dir(&self) -> Result<PathBuf> {
        match &self.remote_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("remote")),
        }
    }

    pub fn policy_for(&self, class: JobClass) -> JobPolicy {
        self.jobs
            .get(&class)
            .cloned()
            .unwrap_or_else(|| class.default_policy())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_track_app_entities() {
        let config = CliConfig::default();
        let names: Vec<&str> = config.sync.entity_types.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["goal", "workout", "meal"]);
        assert_eq!(config.policy_for(JobClass::Sync), JobClass::Sync.default_policy());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/tmp/fitsync-data",
                "sync": { "periodic_interval": 60000 },
                "jobs": {
                    "maintenance": {
                        "cadence": 3600000,
                        "requires_network": false,
                        "requires_power": false,
                        "budget": 10000
                    }
                }
            }"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/fitsync-data"));
        assert_eq!(
            config.remote_dir().unwrap(),
            PathBuf::from("/tmp/fitsync-data/remote")
        );
        assert_eq!(config.sync.periodic_interval, Duration::from_secs(60));
        assert_eq!(config.sync.entity_types.len(), 3);

        let maintenance = config.policy_for(JobClass::Maintenance);
        assert_eq!(maintenance.cadence, Duration::from_secs(3600));
        assert!(!maintenance.requires_power);
        assert_eq!(config.policy_for(JobClass::DataSync), JobClass::DataSync.default_policy());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
