//! Kernel configuration loading and management.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifacts::TimestampMode;
use crate::availability::ConfigError;

/// Location of the kernel config relative to a project root.
pub const CONFIG_FILE: &str = ".taskgate/config.yaml";

/// Main kernel configuration, loaded from .taskgate/config.yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Config version
    pub version: Option<String>,

    /// Runs directory; each packet gets `<runs_dir>/<packet id>/`
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,

    /// Availability config (YAML, or JSON by extension)
    #[serde(default = "default_availability_path")]
    pub availability_path: PathBuf,

    /// Time fields in artifacts
    pub timestamp_mode: TimestampMode,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from(".taskgate/runs")
}

fn default_availability_path() -> PathBuf {
    PathBuf::from(".taskgate/availability.yaml")
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            version: Some("1".to_string()),
            runs_dir: default_runs_dir(),
            availability_path: default_availability_path(),
            timestamp_mode: TimestampMode::Deterministic,
        }
    }
}

impl KernelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Malformed {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Load from project root (looks for .taskgate/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self, ConfigError> {
        let config_path = project_root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.runs_dir = project_root.join(&self.runs_dir);
        self.availability_path = project_root.join(&self.availability_path);
    }

    /// Run-scoped output directory for a packet.
    pub fn run_dir(&self, packet_id: &str) -> PathBuf {
        self.runs_dir.join(packet_id)
    }

    /// Write this config to `<root>/.taskgate/config.yaml` unless one exists.
    pub fn ensure_default(project_root: &Path) -> crate::error::Result<bool> {
        let path = project_root.join(CONFIG_FILE);
        if path.exists() {
            return Ok(false);
        }
        let yaml = serde_yaml::to_string(&Self::default()).map_err(|e| ConfigError::Malformed {
            message: e.to_string(),
        })?;
        crate::artifacts::write_atomic(&path, yaml.as_bytes())?;
        tracing::info!(path = %path.display(), "Wrote default kernel config");
        Ok(true)
    }
}
