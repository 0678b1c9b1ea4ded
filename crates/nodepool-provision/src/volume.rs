//! Block volume lifecycle: create, wait, attach, release.
//!
//! ```text
//!   attach_volumes(server, {count, size})
//!     for i in 0..count                      ── per-volume RetryLoop
//!       create_volume("{server}-{i}")        (reuses an existing name)
//!       await_volume_status(available)       ── status RetryLoop
//!       attach_volume                        ── attach RetryLoop
//!         await_volume_status(in-use)
//!       on error: delete the volume, retry
//! ```
//!
//! A volume that exhausts its retry budget fails the whole call, and
//! volumes attached earlier in the same call are released first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use nodepool_core::{Attempt, RetryPolicy, VolumeHint, VolumeStatus, retry};

use crate::backend::ComputeBackend;
use crate::error::{ProvisionError, ProvisionResult};

/// Retry budgets for volume operations.
#[derive(Debug, Clone)]
pub struct VolumeTimings {
    /// Polling a volume until it reaches a status.
    pub status: RetryPolicy,
    /// Issuing `attach` until the backend accepts it.
    pub attach: RetryPolicy,
    /// The whole create→await→attach unit for one volume.
    pub per_volume: RetryPolicy,
    /// Waiting for a detached volume to become deletable.
    pub release: RetryPolicy,
}

impl Default for VolumeTimings {
    fn default() -> Self {
        Self {
            status: RetryPolicy::new(Duration::from_secs(4)).tries(50),
            attach: RetryPolicy::new(Duration::from_secs(20))
                .increment(Duration::from_secs(20))
                .tries(3),
            per_volume: RetryPolicy::new(Duration::from_secs(10)).tries(3),
            release: RetryPolicy::new(Duration::from_secs(4)).tries(15),
        }
    }
}

#[derive(Clone)]
pub struct VolumeManager {
    backend: Arc<dyn ComputeBackend>,
    owner: String,
    timings: VolumeTimings,
}

impl VolumeManager {
    /// `owner` is stamped as the `ownedby` property on new volumes.
    pub fn new(backend: Arc<dyn ComputeBackend>, owner: impl Into<String>) -> Self {
        Self {
            backend,
            owner: owner.into(),
            timings: VolumeTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: VolumeTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn timings(&self) -> &VolumeTimings {
        &self.timings
    }

    /// Create a volume, or reuse the one already carrying `name`.
    pub async fn create_volume(&self, name: &str, size: u32) -> ProvisionResult<String> {
        if let Some(id) = self.backend.find_volume(name).await? {
            warn!(volume = %name, %id, "volume already exists, reusing it");
            return Ok(id);
        }

        let id = self
            .backend
            .create_volume(name, size, &self.owner)
            .await?
            .ok_or_else(|| ProvisionError::VolumeCreate(name.to_string()))?;
        info!(volume = %name, %id, size, "created volume");
        Ok(id)
    }

    /// Poll until the volume reports `status`.
    pub async fn await_volume_status(
        &self,
        id: &str,
        status: VolumeStatus,
        policy: &RetryPolicy,
    ) -> ProvisionResult<()> {
        let target = &status;
        let outcome = retry(policy, &format!("volume {id} {status}"), || async move {
            match self.backend.volume_status(id).await {
                Ok(current) if current == *target => Ok(()),
                Ok(current) => {
                    debug!(volume = %id, %current, wanted = %target, "volume not there yet");
                    Err(Attempt::Retry(format!("status is {current}")))
                }
                Err(e) => {
                    warn!(volume = %id, error = %e, "volume has no status yet");
                    Err(Attempt::Retry(e.to_string()))
                }
            }
        })
        .await;

        outcome
            .into_result()
            .map_err(|_| ProvisionError::VolumeTimeout {
                id: id.to_string(),
                status: status.to_string(),
            })
    }

    /// Attach an available volume and wait for it to show `in-use`.
    pub async fn attach_volume(&self, id: &str, server: &str) -> ProvisionResult<()> {
        retry(&self.timings.attach, &format!("add volume {id}"), || async move {
            self.backend.attach_volume(server, id).await.map_err(|e| {
                warn!(volume = %id, %server, error = %e, "attach failed, retrying");
                Attempt::Retry(e)
            })
        })
        .await
        .into_result()?;

        self.await_volume_status(id, VolumeStatus::InUse, &self.timings.status)
            .await
    }

    /// Create and attach `volumes.count` volumes named `{server}-{i}`.
    ///
    /// Returns the attached volume ids in order. On failure nothing this
    /// call attached stays behind.
    pub async fn attach_volumes(
        &self,
        server: &str,
        volumes: &VolumeHint,
    ) -> ProvisionResult<Vec<String>> {
        let mut attached: Vec<String> = Vec::with_capacity(volumes.count as usize);

        for index in 0..volumes.count {
            let name = format!("{server}-{index}");
            let name = &name;
            let size = volumes.size;

            let outcome = retry(&self.timings.per_volume, &format!("volume {name}"), || async move {
                self.provision_volume(server, name, size)
                    .await
                    .map_err(Attempt::Retry)
            })
            .await;

            match outcome.into_result() {
                Ok(id) => attached.push(id),
                Err(e) => {
                    warn!(%server, volume = %name, error = %e, "giving up on volume");
                    for id in attached.iter().rev() {
                        self.release_volume(server, id).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(attached)
    }

    /// Best-effort detach and delete. Failures are logged; returns whether
    /// the volume was deleted.
    pub async fn release_volume(&self, server: &str, id: &str) -> bool {
        if let Err(e) = self.backend.detach_volume(server, id).await {
            warn!(volume = %id, %server, error = %e, "detach failed");
        }
        if let Err(e) = self
            .await_volume_status(id, VolumeStatus::Available, &self.timings.release)
            .await
        {
            warn!(volume = %id, error = %e, "volume still attached, deleting anyway");
        }
        match self.backend.delete_volume(id).await {
            Ok(()) => {
                info!(volume = %id, "released volume");
                true
            }
            Err(e) => {
                warn!(volume = %id, error = %e, "failed to delete volume");
                false
            }
        }
    }

    /// One attempt at a single volume; cleans up after itself on failure.
    async fn provision_volume(&self, server: &str, name: &str, size: u32) -> ProvisionResult<String> {
        let id = self.create_volume(name, size).await?;

        let result = async {
            self.await_volume_status(&id, VolumeStatus::Available, &self.timings.status)
                .await?;
            self.attach_volume(&id, server).await
        }
        .await;

        if let Err(e) = result {
            warn!(volume = %name, %id, error = %e, "volume setup failed, deleting it");
            if let Err(delete_err) = self.backend.delete_volume(&id).await {
                warn!(volume = %name, %id, error = %delete_err, "could not delete volume");
            }
            return Err(e);
        }
        Ok(id)
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("owner", &self.owner)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}
