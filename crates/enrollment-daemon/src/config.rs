//! Daemon configuration file.
//!
//! Stored as `enrollment.json` in the config directory. A missing file is
//! replaced by a two-process DIF and written back so it can be edited.

use anyhow::{Context, Result, bail};
use enrollment_core::EnrollmentConfig;
use enrollment_core::security::AUTH_NONE;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE: &str = "enrollment.json";

/// Addresses a process may hand out when it enrolls others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub first: u64,
    pub last: u64,
}

impl Default for AddressRange {
    fn default() -> Self {
        Self {
            first: 1,
            last: 4095,
        }
    }
}

/// One simulated IPC process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub name: String,
    pub dif_name: String,
    #[serde(default)]
    pub supporting_difs: Vec<String>,
    /// Initial address. 0 makes the process a new member.
    #[serde(default)]
    pub address: u64,
    #[serde(default)]
    pub address_range: AddressRange,
    #[serde(default = "default_auth_policy")]
    pub auth_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Processes to enroll to at startup
    #[serde(default)]
    pub neighbors: Vec<String>,
}

fn default_auth_policy() -> String {
    AUTH_NONE.to_string()
}

impl ProcessConfig {
    /// Bootstrap members start with an address and the DIF's static objects.
    pub fn is_bootstrap(&self) -> bool {
        self.address != 0
    }

    /// Supporting DIF used to reach neighbors.
    pub fn supporting_dif(&self) -> &str {
        self.supporting_difs
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    pub processes: Vec<ProcessConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let shim = vec!["shim.DIF".to_string()];
        Self {
            enrollment: EnrollmentConfig::default(),
            processes: vec![
                ProcessConfig {
                    name: "bootstrap".to_string(),
                    dif_name: "normal.DIF".to_string(),
                    supporting_difs: shim.clone(),
                    address: 1,
                    address_range: AddressRange::default(),
                    auth_policy: default_auth_policy(),
                    password: None,
                    neighbors: Vec::new(),
                },
                ProcessConfig {
                    name: "joiner".to_string(),
                    dif_name: "normal.DIF".to_string(),
                    supporting_difs: shim,
                    address: 0,
                    address_range: AddressRange::default(),
                    auth_policy: default_auth_policy(),
                    password: None,
                    neighbors: vec!["bootstrap".to_string()],
                },
            ],
        }
    }
}

impl DaemonConfig {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    /// Load the config from `dir`, writing the defaults there if absent.
    pub fn load_or_init(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        if !path.exists() {
            let config = Self::default();
            config.save(dir)?;
            info!("No config found, wrote defaults to {:?}", path);
            return Ok(config);
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = Self::path_in(dir);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.enrollment.validate()?;
        if self.processes.is_empty() {
            bail!("No processes configured");
        }

        let mut names = HashSet::new();
        for process in &self.processes {
            if process.name.is_empty() {
                bail!("Process with an empty name");
            }
            if !names.insert(process.name.as_str()) {
                bail!("Duplicate process name {}", process.name);
            }
        }
        for process in &self.processes {
            if let Some(unknown) = process.neighbors.iter().find(|n| !names.contains(n.as_str())) {
                bail!("{} lists unknown neighbor {}", process.name, unknown);
            }
        }
        Ok(())
    }

    pub fn process(&self, name: &str) -> Option<&ProcessConfig> {
        self.processes.iter().find(|p| p.name == name)
    }
}
