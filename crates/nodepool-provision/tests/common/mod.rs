//! In-memory backend and probe shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use nodepool_core::{MachineHint, OpenStackConfig, RetryPolicy, VolumeStatus};
use nodepool_provision::{
    BATCH_TAG_PROPERTY, ComputeBackend, ProvisionError, ProvisionResult, ProvisionTimings,
    ReadinessProbe, ServerCreateRequest, ServerSummary, VolumeTimings,
};

pub const LAB_DOMAIN: &str = "front.example.com";

#[derive(Debug, Clone)]
pub struct FakeServer {
    pub summary: ServerSummary,
    pub ip: String,
}

#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub name: String,
    pub status: VolumeStatus,
    pub server: Option<String>,
}

#[derive(Debug, Default)]
pub struct State {
    pub servers: Vec<FakeServer>,
    pub volumes: BTreeMap<String, FakeVolume>,
    pub next_server: u32,
    pub next_volume: u32,
    pub create_requests: Vec<ServerCreateRequest>,
    pub user_data_seen: Vec<String>,
    pub image_requests: Vec<(String, String, String)>,
    pub flavor_hints: Vec<MachineHint>,
    pub renames: Vec<(String, String)>,
    pub console_requests: Vec<String>,
    pub deleted_servers: Vec<String>,
    pub deleted_volumes: Vec<String>,
    pub volume_creates: Vec<String>,
    pub list_calls: u32,
    pub rename_calls: u32,
    /// Every mutating call in order, e.g. `delete-server srv-0`.
    pub events: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    pub(crate) state: Mutex<State>,
    pub create_error: Option<String>,
    /// With `create_error`, build the servers before failing.
    pub build_before_failing: bool,
    /// The first this many listings fail.
    pub list_failures: u32,
    /// The first this many renames fail.
    pub rename_failures: u32,
    /// Create this many fewer servers than asked for.
    pub create_shortfall: u32,
    pub attach_always_fails: bool,
    /// Volume names whose attach always fails.
    pub failing_attach: Vec<String>,
    /// New volumes never leave `creating`.
    pub stuck_volumes: bool,
    pub volume_create_returns_none: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// A server some other caller created, carrying its own batch tag.
    pub fn with_foreign_server(self, id: &str, tag: &str) -> Self {
        self.state().servers.push(FakeServer {
            summary: ServerSummary {
                id: id.to_string(),
                name: "target".to_string(),
                properties: BTreeMap::from([(BATCH_TAG_PROPERTY.to_string(), tag.to_string())]),
            },
            ip: "10.9.9.9".to_string(),
        });
        self
    }

    /// Add an attached volume directly.
    pub fn seed_volume(&self, id: &str, name: &str, status: VolumeStatus) {
        self.state().volumes.insert(
            id.to_string(),
            FakeVolume {
                name: name.to_string(),
                status,
                server: None,
            },
        );
    }
}

fn missing(what: &str, id: &str) -> ProvisionError {
    ProvisionError::backend(format!("{what} show {id}"), format!("No {what} with a name or ID of '{id}' exists."))
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn image(&self, os_type: &str, os_version: &str, arch: &str) -> ProvisionResult<String> {
        self.state().image_requests.push((
            os_type.to_string(),
            os_version.to_string(),
            arch.to_string(),
        ));
        Ok(format!("image-{os_type}-{os_version}-{arch}"))
    }

    async fn flavor(&self, machine: &MachineHint, _arch: &str) -> ProvisionResult<String> {
        self.state().flavor_hints.push(*machine);
        Ok("m1.medium".to_string())
    }

    async fn network_id(&self, network: &str) -> ProvisionResult<String> {
        Ok(format!("net-{network}"))
    }

    async fn create_servers(&self, request: &ServerCreateRequest) -> ProvisionResult<()> {
        let mut state = self.state();
        state.create_requests.push(request.clone());
        state
            .user_data_seen
            .push(std::fs::read_to_string(&request.user_data).unwrap_or_default());

        if let Some(message) = &self.create_error {
            if !self.build_before_failing {
                return Err(ProvisionError::backend("openstack server create", message.clone()));
            }
        }

        for _ in 0..request.count.saturating_sub(self.create_shortfall) {
            let n = state.next_server;
            state.next_server += 1;
            state.servers.push(FakeServer {
                summary: ServerSummary {
                    id: format!("srv-{n}"),
                    name: request.base_name.clone(),
                    properties: request.properties.clone(),
                },
                ip: format!("10.0.0.{}", n + 1),
            });
        }
        match &self.create_error {
            Some(message) => Err(ProvisionError::backend("openstack server create", message.clone())),
            None => Ok(()),
        }
    }

    async fn list_servers(&self) -> ProvisionResult<Vec<ServerSummary>> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.list_calls <= self.list_failures {
            return Err(ProvisionError::backend("openstack server list", "Service Unavailable (HTTP 503)"));
        }
        Ok(state
            .servers
            .iter()
            .map(|s| s.summary.clone())
            .collect())
    }

    async fn server_ip(&self, id: &str, _network: Option<&str>) -> ProvisionResult<String> {
        self.state()
            .servers
            .iter()
            .find(|s| s.summary.id == id)
            .map(|s| s.ip.clone())
            .ok_or_else(|| missing("server", id))
    }

    async fn rename_server(&self, id: &str, name: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        state.rename_calls += 1;
        if state.rename_calls <= self.rename_failures {
            return Err(ProvisionError::backend("openstack server set", "Gateway Timeout (HTTP 504)"));
        }
        state.renames.push((id.to_string(), name.to_string()));
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.summary.id == id)
            .ok_or_else(|| missing("server", id))?;
        server.summary.name = name.to_string();
        Ok(())
    }

    async fn console_log(&self, id: &str) -> ProvisionResult<String> {
        self.state().console_requests.push(id.to_string());
        Ok(format!("console of {id}"))
    }

    async fn delete_server(&self, name_or_id: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        let position = state
            .servers
            .iter()
            .position(|s| s.summary.id == name_or_id || s.summary.name == name_or_id);
        if let Some(position) = position {
            let server = state.servers.remove(position);
            state.deleted_servers.push(server.summary.id.clone());
            state.events.push(format!("delete-server {}", server.summary.id));
        }
        Ok(())
    }

    async fn find_volume(&self, name: &str) -> ProvisionResult<Option<String>> {
        Ok(self
            .state()
            .volumes
            .iter()
            .find(|(_, v)| v.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_volume(
        &self,
        name: &str,
        _size: u32,
        _owner: &str,
    ) -> ProvisionResult<Option<String>> {
        let mut state = self.state();
        state.volume_creates.push(name.to_string());
        if self.volume_create_returns_none {
            return Ok(None);
        }
        let id = format!("vol-{}", state.next_volume);
        state.next_volume += 1;
        let status = if self.stuck_volumes {
            VolumeStatus::Creating
        } else {
            VolumeStatus::Available
        };
        state.volumes.insert(
            id.clone(),
            FakeVolume {
                name: name.to_string(),
                status,
                server: None,
            },
        );
        state.events.push(format!("create-volume {id}"));
        Ok(Some(id))
    }

    async fn volume_status(&self, id: &str) -> ProvisionResult<VolumeStatus> {
        self.state()
            .volumes
            .get(id)
            .map(|v| v.status.clone())
            .ok_or_else(|| missing("volume", id))
    }

    async fn attach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| missing("volume", volume_id))?;
        if self.attach_always_fails || self.failing_attach.contains(&volume.name) {
            return Err(ProvisionError::backend(
                format!("openstack server add volume {server} {volume_id}"),
                "Invalid volume: volume is busy",
            ));
        }
        volume.status = VolumeStatus::InUse;
        volume.server = Some(server.to_string());
        Ok(())
    }

    async fn detach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| missing("volume", volume_id))?;
        if volume.server.as_deref() == Some(server) {
            volume.server = None;
            volume.status = VolumeStatus::Available;
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        if state.volumes.remove(volume_id).is_some() {
            state.deleted_volumes.push(volume_id.to_string());
            state.events.push(format!("delete-volume {volume_id}"));
        }
        Ok(())
    }
}

/// Probe that answers from fixed lists of broken hosts.
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub unreachable: Vec<String>,
    pub never_boots: Vec<String>,
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn ssh_reachable(&self, fqdn: &str) -> bool {
        !self.unreachable.iter().any(|h| h == fqdn)
    }

    async fn boot_complete(&self, fqdn: &str, _marker: &str) -> bool {
        !self.never_boots.iter().any(|h| h == fqdn)
    }
}

pub fn fast(tries: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1)).tries(tries)
}

pub fn fast_volume_timings() -> VolumeTimings {
    VolumeTimings {
        status: fast(3),
        attach: fast(2),
        per_volume: fast(3),
        release: fast(2),
    }
}

pub fn fast_timings() -> ProvisionTimings {
    ProvisionTimings {
        backend: fast(3),
        ssh: fast(3),
        boot: fast(3),
        settle: Duration::ZERO,
        create_lock: Duration::from_secs(10),
        volumes: fast_volume_timings(),
    }
}

/// OpenStack settings backed by a real user-data template on disk.
pub fn settings() -> (TempDir, OpenStackConfig) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("user-data-ubuntu-22.04.txt"),
        "#!/bin/bash\necho nameserver {nameserver} > /etc/resolv.conf\necho '{up}'\n",
    )
    .unwrap();
    let settings: OpenStackConfig = toml::from_str(&format!(
        r#"
user_data = "{}/user-data-{{os_type}}-{{os_version}}.txt"
ip = "192.168.0.10"
"#,
        dir.path().display()
    ))
    .unwrap();
    (dir, settings)
}

/// fqdn the provisioner gives the instance at `10.0.0.{n}`.
pub fn fqdn_for(n: u32) -> String {
    format!("target010000000{n:03}.{LAB_DOMAIN}")
}
