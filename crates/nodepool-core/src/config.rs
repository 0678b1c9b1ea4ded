//! nodepool.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MachineHint, ResourceHint, VolumeHint};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing [{0}] section in config")]
    MissingSection(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodepoolConfig {
    /// Base URL of the lock service, e.g. `http://paddles:8080`.
    pub lock_server: String,
    /// Base URL of the results service holding run/job state.
    pub results_server: String,
    /// DNS suffix appended to short node names.
    #[serde(default)]
    pub lab_domain: String,
    pub openstack: Option<OpenStackConfig>,
    /// Node type → cloud driver and connection parameters.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStackConfig {
    /// User-data template path; may contain `{os_type}` and `{os_version}`.
    pub user_data: String,
    /// Address of this host, stamped as `ownedby` on everything we create.
    pub ip: String,
    #[serde(default = "default_nameserver")]
    pub nameserver: String,
    #[serde(default = "default_username")]
    pub username: String,
    pub network: Option<String>,
    #[serde(default = "default_keypair")]
    pub keypair: String,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    /// Extra arguments spliced into `server create`.
    #[serde(default)]
    pub server_create: String,
    /// Extra arguments spliced into `volume create`.
    #[serde(default)]
    pub volume_create: String,
    #[serde(default = "default_arch")]
    pub default_arch: String,
    /// Host-wide lock file serializing `server create`.
    #[serde(default = "default_create_lock")]
    pub create_lock: PathBuf,
    #[serde(default = "default_create_lock_timeout")]
    pub create_lock_timeout_secs: u64,
    #[serde(default = "default_machine")]
    pub machine: MachineHint,
    #[serde(default = "default_volumes")]
    pub volumes: VolumeHint,
}

/// Connection parameters for one node type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConf {
    /// Driver name, e.g. `openstack`.
    pub driver: String,
    /// Named cloud from clouds.yaml (exported as `OS_CLOUD`).
    #[serde(default)]
    pub cloud: Option<String>,
    /// Extra environment for every backend invocation.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_nameserver() -> String {
    "8.8.8.8".to_string()
}

fn default_username() -> String {
    "ubuntu".to_string()
}

fn default_keypair() -> String {
    "teuthology".to_string()
}

fn default_worker_group() -> String {
    "teuthology-worker".to_string()
}

fn default_arch() -> String {
    "x86_64".to_string()
}

fn default_create_lock() -> PathBuf {
    PathBuf::from("/tmp/nodepool-server-create.lock")
}

fn default_create_lock_timeout() -> u64 {
    8 * 60 * 60
}

fn default_machine() -> MachineHint {
    MachineHint {
        disk: 20,
        ram: 8000,
        cpus: 1,
    }
}

fn default_volumes() -> VolumeHint {
    VolumeHint { count: 0, size: 1 }
}

impl NodepoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The `[openstack]` section, required by the OpenStack driver.
    pub fn openstack(&self) -> Result<&OpenStackConfig, ConfigError> {
        self.openstack
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSection("openstack".to_string()))
    }
}

impl OpenStackConfig {
    /// Default machine and volume shape before caller hints are applied.
    pub fn resource_defaults(&self) -> ResourceHint {
        ResourceHint {
            machine: self.machine,
            volumes: self.volumes,
        }
    }

    /// Template path for a given OS.
    pub fn user_data_path(&self, os_type: &str, os_version: &str) -> PathBuf {
        PathBuf::from(
            self.user_data
                .replace("{os_type}", os_type)
                .replace("{os_version}", os_version),
        )
    }
}
