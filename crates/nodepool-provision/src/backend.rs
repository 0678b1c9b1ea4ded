//! The compute backend seam.
//!
//! Everything the provisioner needs from a cloud: images, flavors,
//! servers, and block volumes. The OpenStack CLI driver implements it
//! for real clouds; tests implement it in memory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use nodepool_core::{MachineHint, VolumeStatus};

use crate::error::ProvisionResult;

/// One `server create` call for a whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCreateRequest {
    /// Name given at creation; replaced per instance once its IP is known.
    pub base_name: String,
    pub image: String,
    pub flavor: String,
    pub keypair: String,
    pub security_group: String,
    pub network_id: Option<String>,
    pub user_data: PathBuf,
    pub count: u32,
    pub properties: BTreeMap<String, String>,
}

/// A server as seen in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Image id for `teuthology-{os_type}-{os_version}-{arch}`.
    async fn image(&self, os_type: &str, os_version: &str, arch: &str) -> ProvisionResult<String>;

    /// Smallest flavor at least as large as `machine`.
    async fn flavor(&self, machine: &MachineHint, arch: &str) -> ProvisionResult<String>;

    async fn network_id(&self, network: &str) -> ProvisionResult<String>;

    /// Create `request.count` servers and wait for them to go active.
    async fn create_servers(&self, request: &ServerCreateRequest) -> ProvisionResult<()>;

    /// Every server visible to the account, including other callers'.
    async fn list_servers(&self) -> ProvisionResult<Vec<ServerSummary>>;

    /// First IPv4 address, on `network` if given.
    async fn server_ip(&self, id: &str, network: Option<&str>) -> ProvisionResult<String>;

    async fn rename_server(&self, id: &str, name: &str) -> ProvisionResult<()>;

    async fn console_log(&self, id: &str) -> ProvisionResult<String>;

    /// Delete a server by name or id. A server that does not exist is
    /// already deleted.
    async fn delete_server(&self, name_or_id: &str) -> ProvisionResult<()>;

    /// Volume id by name, `None` if there is no such volume.
    async fn find_volume(&self, name: &str) -> ProvisionResult<Option<String>>;

    /// Ask for a new volume; `None` if the backend returned no id.
    async fn create_volume(&self, name: &str, size: u32, owner: &str)
    -> ProvisionResult<Option<String>>;

    async fn volume_status(&self, id: &str) -> ProvisionResult<VolumeStatus>;

    async fn attach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()>;

    async fn detach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()>;

    async fn delete_volume(&self, volume_id: &str) -> ProvisionResult<()>;
}
