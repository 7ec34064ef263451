// config.rs — Engine configuration
//
// A JSON file with metadata lifetimes per repository and role, signing
// thresholds and the resign window. A missing file means defaults.

use std::fs;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tuf::model::RoleType;

pub const DEFAULT_SPEC_VERSION: &str = "1.0.0";

/// Metadata lifetimes in days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleTtls {
    pub root: i64,
    pub targets: i64,
    pub snapshot: i64,
    pub timestamp: i64,
}

impl Default for RoleTtls {
    fn default() -> Self {
        RoleTtls {
            root: 365,
            targets: 7,
            snapshot: 7,
            timestamp: 1,
        }
    }
}

impl RoleTtls {
    pub fn days(&self, role: RoleType) -> i64 {
        match role {
            RoleType::Root => self.root,
            RoleType::Targets => self.targets,
            RoleType::Snapshot => self.snapshot,
            RoleType::Timestamp => self.timestamp,
        }
    }
}

/// Signing threshold per role written into new Roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleThresholds {
    pub root: u64,
    pub targets: u64,
    pub snapshot: u64,
    pub timestamp: u64,
}

impl Default for RoleThresholds {
    fn default() -> Self {
        RoleThresholds {
            root: 1,
            targets: 1,
            snapshot: 1,
            timestamp: 1,
        }
    }
}

impl RoleThresholds {
    pub fn get(&self, role: RoleType) -> u64 {
        match role {
            RoleType::Root => self.root,
            RoleType::Targets => self.targets,
            RoleType::Snapshot => self.snapshot,
            RoleType::Timestamp => self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub spec_version: String,
    pub image_ttl_days: RoleTtls,
    pub director_ttl_days: RoleTtls,
    pub thresholds: RoleThresholds,
    /// Roles expiring within this many hours are re-signed by the resigner.
    pub resign_window_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            spec_version: DEFAULT_SPEC_VERSION.to_string(),
            image_ttl_days: RoleTtls::default(),
            director_ttl_days: RoleTtls::default(),
            thresholds: RoleThresholds::default(),
            resign_window_hours: 24,
        }
    }
}

impl EngineConfig {
    /// Read `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(EngineConfig::default());
        };
        if !path.exists() {
            debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(EngineConfig::default());
        }
        let contents = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::json(path.display().to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.spec_version.is_empty() {
            return Err(Error::Config("spec_version must not be empty".into()));
        }
        for (repo, ttls) in [("image", &self.image_ttl_days), ("director", &self.director_ttl_days)] {
            for role in RoleType::ALL {
                if ttls.days(role) <= 0 {
                    return Err(Error::Config(format!(
                        "{repo} {role} lifetime must be at least one day"
                    )));
                }
            }
        }
        for role in RoleType::ALL {
            if self.thresholds.get(role) == 0 {
                return Err(Error::Config(format!("{role} threshold must be at least 1")));
            }
        }
        if self.resign_window_hours < 0 {
            return Err(Error::Config("resign_window_hours must not be negative".into()));
        }
        Ok(())
    }

    pub fn resign_window(&self) -> Duration {
        Duration::hours(self.resign_window_hours)
    }
}
