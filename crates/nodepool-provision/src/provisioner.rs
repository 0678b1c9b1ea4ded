//! Batch instance provisioning.
//!
//! One [`CreateRequest`] becomes one tagged `server create` for `num`
//! instances, followed by strictly sequential per-instance setup:
//!
//! ```text
//!   Booting ──► Named ──► SshReachable ──► InitComplete ──► VolumesAttached
//!      │          │            │                │
//!      └──────────┴────────────┴────────────────┴──► Destroying ──► Gone
//! ```
//!
//! Any failure replays the batch's [`Rollback`] before the error reaches
//! the caller: either every instance is ready or none is left running.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use nodepool_core::{
    Attempt, BatchTag, HintOverlay, Instance, InstancePhase, OpenStackConfig, RetryPolicy,
    VolumeHint, retry,
};

use crate::backend::{ComputeBackend, ServerCreateRequest, ServerSummary};
use crate::error::{ProvisionError, ProvisionResult, is_quota_error};
use crate::probe::{ReadinessProbe, UP_MARKER};
use crate::rollback::{Rollback, UndoAction};
use crate::userdata::write_user_data;
use crate::volume::{VolumeManager, VolumeTimings};

/// Name every instance is created under before it is renamed.
pub const BASE_NAME: &str = "target";

/// Property carrying the [`BatchTag`].
pub const BATCH_TAG_PROPERTY: &str = "teuthology";

/// Property carrying the address of the host that created a resource.
pub const OWNER_PROPERTY: &str = "ownedby";

/// Serializes backend create calls within this process.
static CREATE_LOCK: Mutex<()> = Mutex::const_new(());

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.(\d+)\.(\d+)\.(\d+)").unwrap_or_else(|e| panic!("invalid IPv4 regex: {e}"))
});

/// `prefix` followed by each octet of the first IPv4 address in `ip`,
/// zero-padded to three digits.
pub fn ip_to_name(prefix: &str, ip: &str) -> ProvisionResult<String> {
    let invalid = || ProvisionError::InvalidIp(ip.to_string());
    let caps = IPV4.captures(ip).ok_or_else(invalid)?;

    let mut name = prefix.to_string();
    for group in 1..=4 {
        let octet: u8 = caps[group].parse().map_err(|_| invalid())?;
        name.push_str(&format!("{octet:03}"));
    }
    Ok(name)
}

/// What to provision.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub num: u32,
    pub os_type: String,
    pub os_version: String,
    /// Falls back to the backend's default architecture.
    pub arch: Option<String>,
    /// Applied over the configured defaults with max-merge.
    pub hints: Vec<HintOverlay>,
}

/// The capability every driver offers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create `request.num` ready instances and return their fqdns.
    async fn create(&self, request: &CreateRequest) -> ProvisionResult<Vec<String>>;

    /// Delete an instance. Deleting a missing instance succeeds.
    async fn destroy(&self, name_or_id: &str) -> ProvisionResult<()>;

    /// Create and attach volumes to an existing instance.
    async fn attach_volumes(&self, server: &str, volumes: &VolumeHint)
    -> ProvisionResult<Vec<String>>;
}

/// Retry budgets for instance setup.
#[derive(Debug, Clone)]
pub struct ProvisionTimings {
    /// Idempotent backend reads (listing, address lookup).
    pub backend: RetryPolicy,
    /// Waiting for SSH host keys.
    pub ssh: RetryPolicy,
    /// Waiting for the boot payload to finish.
    pub boot: RetryPolicy,
    /// Pause between SSH coming up and the first boot check.
    pub settle: Duration,
    /// Bound on waiting for the create lock.
    pub create_lock: Duration,
    pub volumes: VolumeTimings,
}

impl ProvisionTimings {
    pub fn from_settings(settings: &OpenStackConfig) -> Self {
        Self {
            backend: RetryPolicy::new(Duration::from_secs(5)).tries(10),
            ssh: RetryPolicy::new(Duration::from_secs(6)).tries(100),
            boot: RetryPolicy::new(Duration::from_secs(30)).tries(30),
            settle: Duration::from_secs(15),
            create_lock: Duration::from_secs(settings.create_lock_timeout_secs),
            volumes: VolumeTimings::default(),
        }
    }
}

/// Provisions instances of one node type on one backend.
pub struct PoolProvisioner {
    node_type: String,
    backend: Arc<dyn ComputeBackend>,
    probe: Arc<dyn ReadinessProbe>,
    volumes: VolumeManager,
    settings: OpenStackConfig,
    lab_domain: String,
    timings: ProvisionTimings,
}

impl PoolProvisioner {
    pub fn new(
        node_type: impl Into<String>,
        backend: Arc<dyn ComputeBackend>,
        probe: Arc<dyn ReadinessProbe>,
        settings: OpenStackConfig,
        lab_domain: impl Into<String>,
    ) -> Self {
        let timings = ProvisionTimings::from_settings(&settings);
        let volumes = VolumeManager::new(backend.clone(), settings.ip.clone())
            .with_timings(timings.volumes.clone());
        Self {
            node_type: node_type.into(),
            backend,
            probe,
            volumes,
            settings,
            lab_domain: lab_domain.into(),
            timings,
        }
    }

    pub fn with_timings(mut self, timings: ProvisionTimings) -> Self {
        self.volumes = self.volumes.with_timings(timings.volumes.clone());
        self.timings = timings;
        self
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn volume_manager(&self) -> &VolumeManager {
        &self.volumes
    }

    fn fqdn(&self, name: &str) -> String {
        if self.lab_domain.is_empty() {
            name.to_string()
        } else {
            format!("{name}.{}", self.lab_domain)
        }
    }

    /// Run the batch create under the process-wide lock.
    async fn create_serialized(&self, request: &ServerCreateRequest) -> ProvisionResult<()> {
        let _guard = tokio::time::timeout(self.timings.create_lock, CREATE_LOCK.lock())
            .await
            .map_err(|_| ProvisionError::CreateLockTimeout(self.timings.create_lock))?;

        info!(
            node_type = %self.node_type,
            count = request.count,
            flavor = %request.flavor,
            image = %request.image,
            "creating instances"
        );

        self.backend.create_servers(request).await.map_err(|e| match e {
            ProvisionError::Backend { message, .. } if is_quota_error(&message) => {
                ProvisionError::QuotaExceeded(message)
            }
            other => other,
        })
    }

    /// This batch's instances, and nobody else's.
    async fn tagged_instances(&self, tag: &BatchTag) -> ProvisionResult<Vec<Instance>> {
        let backend = &self.backend;
        let servers: Vec<ServerSummary> = retry(&self.timings.backend, "list instances", || async move {
            backend.list_servers().await.map_err(Attempt::Retry)
        })
        .await
        .into_result()?;

        Ok(servers
            .into_iter()
            .filter(|server| {
                server.properties.get(BATCH_TAG_PROPERTY).map(String::as_str) == Some(tag.as_str())
            })
            .map(|server| Instance::booting(server.id, server.properties))
            .collect())
    }

    /// Take one booted instance to `VolumesAttached`.
    async fn prepare(
        &self,
        instance: &mut Instance,
        volumes: &VolumeHint,
        rollback: &mut Rollback,
    ) -> ProvisionResult<String> {
        let id = instance.id.clone();
        let id = id.as_str();
        let network = self.settings.network.as_deref();
        let backend = &self.backend;

        let ip = retry(&self.timings.backend, &format!("address of {id}"), || async move {
            backend.server_ip(id, network).await.map_err(Attempt::Retry)
        })
        .await
        .into_result()?;

        let name = ip_to_name(BASE_NAME, &ip)?;
        let new_name = name.as_str();
        retry(&self.timings.backend, &format!("rename {id}"), || async move {
            backend.rename_server(id, new_name).await.map_err(Attempt::Retry)
        })
        .await
        .into_result()?;
        let fqdn = self.fqdn(&name);
        instance.ip = Some(ip);
        instance.name = Some(name.clone());
        instance.fqdn = Some(fqdn.clone());
        instance.phase = InstancePhase::Named;
        debug!(instance = %id, %fqdn, "named instance");

        if !self.wait_for_ssh(&fqdn).await {
            let console = self
                .backend
                .console_log(id)
                .await
                .unwrap_or_else(|e| format!("<console log unavailable: {e}>"));
            error!(%fqdn, %console, "instance never answered on ssh");
            return Err(ProvisionError::Readiness {
                fqdn,
                reason: "ssh-keyscan never succeeded".to_string(),
            });
        }
        instance.phase = InstancePhase::SshReachable;

        tokio::time::sleep(self.timings.settle).await;

        if !self.wait_for_boot(&fqdn).await {
            return Err(ProvisionError::Readiness {
                fqdn,
                reason: "boot payload never reported completion".to_string(),
            });
        }
        instance.phase = InstancePhase::InitComplete;

        let attached = self.volumes.attach_volumes(&name, volumes).await?;
        for volume in attached {
            rollback.push(UndoAction::ReleaseVolume {
                server: name.clone(),
                id: volume,
            });
        }
        instance.phase = InstancePhase::VolumesAttached;
        info!(%fqdn, "instance ready");

        Ok(fqdn)
    }

    async fn wait_for_ssh(&self, fqdn: &str) -> bool {
        let probe = &self.probe;
        retry(&self.timings.ssh, &format!("ssh-keyscan {fqdn}"), || async move {
            if probe.ssh_reachable(fqdn).await {
                Ok(())
            } else {
                Err(Attempt::Retry("no host key"))
            }
        })
        .await
        .is_success()
    }

    async fn wait_for_boot(&self, fqdn: &str) -> bool {
        let probe = &self.probe;
        retry(&self.timings.boot, &format!("boot of {fqdn}"), || async move {
            if probe.boot_complete(fqdn, UP_MARKER).await {
                Ok(())
            } else {
                Err(Attempt::Retry("marker not logged yet"))
            }
        })
        .await
        .is_success()
    }

    /// Best-effort teardown of every instance carrying `tag`, for when the
    /// batch failed before its instances were known.
    async fn sweep(&self, tag: &BatchTag) {
        match self.tagged_instances(tag).await {
            Ok(mut instances) => {
                let mut rollback = Rollback::new();
                for instance in &instances {
                    rollback.push(UndoAction::DestroyInstance {
                        id: instance.id.clone(),
                    });
                }
                self.roll_back(&mut instances, rollback).await;
            }
            Err(e) => {
                warn!(%tag, error = %e, "cannot list instances, any tagged with this batch are leaked");
            }
        }
    }

    async fn roll_back(&self, instances: &mut [Instance], rollback: Rollback) {
        for instance in instances.iter_mut() {
            instance.phase = InstancePhase::Destroying;
        }
        let report = rollback.run(self.backend.as_ref(), &self.volumes).await;
        for instance in instances.iter_mut() {
            let leaked = report.failed.iter().any(
                |action| matches!(action, UndoAction::DestroyInstance { id } if *id == instance.id),
            );
            if !leaked {
                instance.phase = InstancePhase::Gone;
            }
        }
        debug!(undone = report.undone, leaked = report.failed.len(), "rollback finished");
    }
}

#[async_trait]
impl Provisioner for PoolProvisioner {
    async fn create(&self, request: &CreateRequest) -> ProvisionResult<Vec<String>> {
        debug!(node_type = %self.node_type, num = request.num, "create");

        let arch = request
            .arch
            .clone()
            .unwrap_or_else(|| self.settings.default_arch.clone());
        let resources = self.settings.resource_defaults().merged(&request.hints);
        let user_data = write_user_data(
            &self.settings,
            &self.lab_domain,
            &request.os_type,
            &request.os_version,
        )?;

        let image = self
            .backend
            .image(&request.os_type, &request.os_version, &arch)
            .await?;
        let network_id = match &self.settings.network {
            Some(network) => Some(self.backend.network_id(network).await?),
            None => None,
        };
        let flavor = self.backend.flavor(&resources.machine, &arch).await?;

        let tag = BatchTag::generate();
        let server_request = ServerCreateRequest {
            base_name: BASE_NAME.to_string(),
            image,
            flavor,
            keypair: self.settings.keypair.clone(),
            security_group: self.settings.worker_group.clone(),
            network_id,
            user_data: user_data.path().to_path_buf(),
            count: request.num,
            properties: BTreeMap::from([
                (BATCH_TAG_PROPERTY.to_string(), tag.to_string()),
                (OWNER_PROPERTY.to_string(), self.settings.ip.clone()),
            ]),
        };
        if let Err(e) = self.create_serialized(&server_request).await {
            // Nothing was started if the lock was never acquired.
            if !matches!(e, ProvisionError::CreateLockTimeout(_)) {
                error!(%tag, error = %e, "server create failed, removing what it built");
                self.sweep(&tag).await;
            }
            return Err(e);
        }

        let mut instances = match self.tagged_instances(&tag).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(%tag, error = %e, "cannot list the new batch, removing it");
                self.sweep(&tag).await;
                return Err(e);
            }
        };
        let mut rollback = Rollback::new();
        for instance in &instances {
            rollback.push(UndoAction::DestroyInstance {
                id: instance.id.clone(),
            });
        }

        if instances.len() != request.num as usize {
            let err = ProvisionError::BatchMismatch {
                tag: tag.to_string(),
                expected: request.num,
                found: instances.len(),
            };
            error!(error = %err, "backend returned the wrong number of instances");
            self.roll_back(&mut instances, rollback).await;
            return Err(err);
        }

        let mut fqdns = Vec::with_capacity(instances.len());
        for index in 0..instances.len() {
            match self
                .prepare(&mut instances[index], &resources.volumes, &mut rollback)
                .await
            {
                Ok(fqdn) => fqdns.push(fqdn),
                Err(e) => {
                    error!(
                        instance = %instances[index].label(),
                        %tag,
                        error = %e,
                        "instance setup failed, destroying the whole batch"
                    );
                    self.roll_back(&mut instances, rollback).await;
                    return Err(e);
                }
            }
        }

        let kept = rollback.commit();
        info!(node_type = %self.node_type, %tag, instances = fqdns.len(), resources = kept, "batch ready");
        Ok(fqdns)
    }

    async fn destroy(&self, name_or_id: &str) -> ProvisionResult<()> {
        debug!(node_type = %self.node_type, instance = %name_or_id, "destroy");
        self.backend.delete_server(name_or_id).await?;
        info!(instance = %name_or_id, "destroyed");
        Ok(())
    }

    async fn attach_volumes(
        &self,
        server: &str,
        volumes: &VolumeHint,
    ) -> ProvisionResult<Vec<String>> {
        self.volumes.attach_volumes(server, volumes).await
    }
}

impl std::fmt::Debug for PoolProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolProvisioner")
            .field("node_type", &self.node_type)
            .field("lab_domain", &self.lab_domain)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}
