//! Node type → driver lookup.
//!
//! Each `[providers.<node_type>]` table names a driver. The set of drivers
//! is closed: adding a backend means adding a [`Driver`] variant.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use nodepool_core::{NodepoolConfig, ProviderConf};

use crate::backend::ComputeBackend;
use crate::error::{ProvisionError, ProvisionResult};
use crate::openstack::OpenStackCli;
use crate::probe::SshProbe;
use crate::provisioner::{PoolProvisioner, Provisioner};

static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

/// Parsed from `ProviderConf::driver`, case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    OpenStack,
}

impl Driver {
    pub fn as_str(self) -> &'static str {
        match self {
            Driver::OpenStack => "openstack",
        }
    }
}

impl FromStr for Driver {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openstack" => Ok(Driver::OpenStack),
            _ => Err(ProvisionError::UnsupportedDriver(s.to_string())),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured node type with its parsed driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub node_type: String,
    pub driver: Driver,
    pub conf: ProviderConf,
}

#[derive(Debug, Clone)]
pub struct DriverRegistry {
    config: NodepoolConfig,
    providers: BTreeMap<String, Provider>,
}

impl DriverRegistry {
    /// Resolve every configured provider. An unknown driver name fails
    /// the whole registry.
    pub fn from_config(config: &NodepoolConfig) -> ProvisionResult<Self> {
        let mut providers = BTreeMap::new();
        for (node_type, conf) in &config.providers {
            let driver: Driver = conf.driver.parse()?;
            debug!(%node_type, %driver, "registered provider");
            providers.insert(
                node_type.clone(),
                Provider {
                    node_type: node_type.clone(),
                    driver,
                    conf: conf.clone(),
                },
            );
        }
        Ok(Self {
            config: config.clone(),
            providers,
        })
    }

    /// Make this the process-wide registry.
    ///
    /// The first install wins; later calls get the installed registry back.
    pub fn install(self) -> &'static DriverRegistry {
        REGISTRY.get_or_init(|| self)
    }

    pub fn global() -> Option<&'static DriverRegistry> {
        REGISTRY.get()
    }

    /// Configured node types, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn provider(&self, node_type: &str) -> ProvisionResult<&Provider> {
        self.providers
            .get(node_type)
            .ok_or_else(|| ProvisionError::UnknownNodeType(node_type.to_string()))
    }

    pub fn provider_conf(&self, node_type: &str) -> ProvisionResult<&ProviderConf> {
        Ok(&self.provider(node_type)?.conf)
    }

    /// Backend for a node type.
    pub fn backend(&self, node_type: &str) -> ProvisionResult<Arc<dyn ComputeBackend>> {
        let provider = self.provider(node_type)?;
        match provider.driver {
            Driver::OpenStack => {
                let settings = self.config.openstack()?;
                Ok(Arc::new(OpenStackCli::new(&provider.conf, settings)))
            }
        }
    }

    /// Provisioner for a node type.
    pub fn provisioner(&self, node_type: &str) -> ProvisionResult<Arc<dyn Provisioner>> {
        let provider = self.provider(node_type)?;
        match provider.driver {
            Driver::OpenStack => {
                let settings = self.config.openstack()?;
                let backend = self.backend(node_type)?;
                let probe = Arc::new(SshProbe::new(settings.username.clone()));
                Ok(Arc::new(PoolProvisioner::new(
                    node_type,
                    backend,
                    probe,
                    settings.clone(),
                    self.config.lab_domain.clone(),
                )))
            }
        }
    }
}
