//! OpenStack backend driven through the `openstack` command line client.
//!
//! Every call shells out with `-f json` where the subcommand supports it.
//! The client authenticates from the environment: `OS_CLOUD` from the
//! provider's `cloud` plus any `env` entries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use nodepool_core::{MachineHint, OpenStackConfig, ProviderConf, VolumeStatus};

use crate::backend::{ComputeBackend, ServerCreateRequest, ServerSummary};
use crate::error::{ProvisionError, ProvisionResult};

const NO_SERVER: &str = "No server with a name or ID";
const NO_VOLUME: &str = "No volume with a name or ID";

/// Upper bound on any single non-create command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct OpenStackCli {
    env: BTreeMap<String, String>,
    server_create_args: Vec<String>,
    volume_create_args: Vec<String>,
    create_lock: PathBuf,
    create_lock_timeout: Duration,
}

impl OpenStackCli {
    pub fn new(provider: &ProviderConf, settings: &OpenStackConfig) -> Self {
        let mut env = provider.env.clone();
        if let Some(cloud) = &provider.cloud {
            env.insert("OS_CLOUD".to_string(), cloud.clone());
        }
        Self {
            env,
            server_create_args: split_args(&settings.server_create),
            volume_create_args: split_args(&settings.volume_create),
            create_lock: settings.create_lock.clone(),
            create_lock_timeout: Duration::from_secs(settings.create_lock_timeout_secs),
        }
    }

    /// Run `openstack <args>` and return stdout.
    async fn run(&self, args: &[String]) -> ProvisionResult<String> {
        let mut cmd = Command::new("openstack");
        cmd.args(args).envs(&self.env);
        self.execute(cmd, &format!("openstack {}", args.join(" ")), COMMAND_TIMEOUT)
            .await
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[String]) -> ProvisionResult<T> {
        let mut args = args.to_vec();
        args.extend(["-f".to_string(), "json".to_string()]);
        let command = format!("openstack {}", args.join(" "));
        let stdout = self.run(&args).await?;
        serde_json::from_str(&stdout).map_err(|e| ProvisionError::BackendOutput {
            command,
            message: e.to_string(),
        })
    }

    async fn execute(
        &self,
        mut cmd: Command,
        description: &str,
        timeout: Duration,
    ) -> ProvisionResult<String> {
        debug!(command = %description, "running");
        cmd.kill_on_drop(true);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                ProvisionError::backend(description, format!("timed out after {timeout:?}"))
            })?
            .map_err(|e| ProvisionError::backend(description, format!("failed to execute: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProvisionError::backend(
                description,
                format!("{}{}", stderr.trim(), stdout.trim()),
            ))
        }
    }

    async fn show_field(&self, args: &[&str], field: &str) -> ProvisionResult<Value> {
        let args = self::args(args);
        let mut record: BTreeMap<String, Value> = self.run_json(&args).await?;
        record
            .remove(field)
            .ok_or_else(|| ProvisionError::BackendOutput {
                command: format!("openstack {}", args.join(" ")),
                message: format!("missing field {field}"),
            })
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn split_args(extra: &str) -> Vec<String> {
    extra.split_whitespace().map(str::to_string).collect()
}

fn is_missing(err: &ProvisionError, marker: &str) -> bool {
    matches!(err, ProvisionError::Backend { message, .. } if message.contains(marker))
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Output parsing ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub(crate) struct FlavorRow {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RAM")]
    pub ram: u32,
    #[serde(rename = "Disk")]
    pub disk: u32,
    #[serde(rename = "VCPUs")]
    pub vcpus: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties", default)]
    properties: Value,
}

/// Smallest flavor, ordered by (VCPUs, RAM, Disk), that covers `hint`.
pub(crate) fn pick_flavor<'a>(flavors: &'a [FlavorRow], hint: &MachineHint) -> Option<&'a FlavorRow> {
    flavors
        .iter()
        .filter(|f| f.vcpus >= hint.cpus && f.ram >= hint.ram && f.disk >= hint.disk)
        .min_by_key(|f| (f.vcpus, f.ram, f.disk))
}

/// Server properties as printed by the client: either a JSON object or
/// the `key='value', key2='value2'` string older clients emit.
pub(crate) fn parse_properties(value: &Value) -> BTreeMap<String, String> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_as_string(v)))
            .collect(),
        Value::String(s) => s
            .split(", ")
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| {
                (
                    k.trim().to_string(),
                    v.trim().trim_matches('\'').to_string(),
                )
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// First IPv4 address from `server show` addresses, on `network` if given.
///
/// Accepts `{"net": ["10.0.0.5", "fe80::1"]}` and `net=10.0.0.5, fe80::1; other=...`.
pub(crate) fn parse_addresses(value: &Value, network: Option<&str>) -> Option<String> {
    let networks: Vec<(String, Vec<String>)> = match value {
        Value::Object(map) => map
            .iter()
            .map(|(net, ips)| {
                let ips = match ips {
                    Value::Array(items) => items.iter().map(value_as_string).collect(),
                    other => vec![value_as_string(other)],
                };
                (net.clone(), ips)
            })
            .collect(),
        Value::String(s) => s
            .split(';')
            .filter_map(|segment| segment.split_once('='))
            .map(|(net, ips)| {
                (
                    net.trim().to_string(),
                    ips.split(',').map(|ip| ip.trim().to_string()).collect(),
                )
            })
            .collect(),
        _ => Vec::new(),
    };

    networks
        .into_iter()
        .filter(|(net, _)| network.is_none_or(|wanted| net == wanted))
        .flat_map(|(_, ips)| ips)
        .find(|ip| ip.parse::<std::net::Ipv4Addr>().is_ok())
}

// ── ComputeBackend ────────────────────────────────────────────────

#[async_trait]
impl ComputeBackend for OpenStackCli {
    async fn image(&self, os_type: &str, os_version: &str, arch: &str) -> ProvisionResult<String> {
        let wanted = format!("teuthology-{os_type}-{os_version}-{arch}");
        let images: Vec<ImageRow> = self.run_json(&args(&["image", "list"])).await?;
        images
            .into_iter()
            .find(|image| image.name == wanted)
            .map(|image| image.id)
            .ok_or(ProvisionError::ImageNotFound(wanted))
    }

    async fn flavor(&self, machine: &MachineHint, arch: &str) -> ProvisionResult<String> {
        let flavors: Vec<FlavorRow> = self.run_json(&args(&["flavor", "list"])).await?;
        pick_flavor(&flavors, machine)
            .map(|f| f.name.clone())
            .ok_or_else(|| {
                ProvisionError::FlavorNotFound(format!(
                    "{} cpus, {}MB ram, {}GB disk ({arch})",
                    machine.cpus, machine.ram, machine.disk
                ))
            })
    }

    async fn network_id(&self, network: &str) -> ProvisionResult<String> {
        let id = self.show_field(&["network", "show", network], "id").await?;
        Ok(value_as_string(&id))
    }

    async fn create_servers(&self, request: &ServerCreateRequest) -> ProvisionResult<()> {
        let mut args: Vec<String> = vec!["server".into(), "create".into()];
        args.extend(self.server_create_args.iter().cloned());
        args.extend([
            "--image".into(),
            request.image.clone(),
            "--flavor".into(),
            request.flavor.clone(),
            "--key-name".into(),
            request.keypair.clone(),
            "--user-data".into(),
            request.user_data.display().to_string(),
        ]);
        if let Some(net_id) = &request.network_id {
            args.extend(["--nic".into(), format!("net-id={net_id}")]);
        }
        args.extend([
            "--min".into(),
            request.count.to_string(),
            "--max".into(),
            request.count.to_string(),
            "--security-group".into(),
            request.security_group.clone(),
        ]);
        for (key, value) in &request.properties {
            args.extend(["--property".into(), format!("{key}={value}")]);
        }
        args.extend([
            "--wait".into(),
            request.base_name.clone(),
            "-f".into(),
            "json".into(),
        ]);

        let lock_secs = self.create_lock_timeout.as_secs().to_string();
        let mut cmd = Command::new("flock");
        cmd.arg("--close")
            .arg("--timeout")
            .arg(&lock_secs)
            .arg(&self.create_lock)
            .arg("openstack")
            .args(&args)
            .envs(&self.env);

        let description = format!("openstack {}", args.join(" "));
        // Waiting for the host lock counts against the budget too.
        let budget = self.create_lock_timeout + COMMAND_TIMEOUT;
        self.execute(cmd, &description, budget).await.map(|_| ())
    }

    async fn list_servers(&self) -> ProvisionResult<Vec<ServerSummary>> {
        let rows: Vec<ServerRow> = self.run_json(&args(&["server", "list", "--long"])).await?;
        Ok(rows
            .into_iter()
            .map(|row| ServerSummary {
                properties: parse_properties(&row.properties),
                id: row.id,
                name: row.name,
            })
            .collect())
    }

    async fn server_ip(&self, id: &str, network: Option<&str>) -> ProvisionResult<String> {
        let addresses = self.show_field(&["server", "show", id], "addresses").await?;
        parse_addresses(&addresses, network).ok_or_else(|| ProvisionError::NoAddress(id.to_string()))
    }

    async fn rename_server(&self, id: &str, name: &str) -> ProvisionResult<()> {
        self.run(&args(&["server", "set", "--name", name, id]))
            .await
            .map(|_| ())
    }

    async fn console_log(&self, id: &str) -> ProvisionResult<String> {
        self.run(&args(&["console", "log", "show", id])).await
    }

    async fn delete_server(&self, name_or_id: &str) -> ProvisionResult<()> {
        match self
            .run(&args(&["server", "delete", "--wait", name_or_id]))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e, NO_SERVER) => {
                debug!(server = %name_or_id, "already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find_volume(&self, name: &str) -> ProvisionResult<Option<String>> {
        match self.show_field(&["volume", "show", name], "id").await {
            Ok(id) => Ok(Some(value_as_string(&id))),
            Err(e) if is_missing(&e, NO_VOLUME) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        size: u32,
        owner: &str,
    ) -> ProvisionResult<Option<String>> {
        let mut args: Vec<String> = vec!["volume".into(), "create".into()];
        args.extend(self.volume_create_args.iter().cloned());
        args.extend([
            "--property".into(),
            format!("ownedby={owner}"),
            "--size".into(),
            size.to_string(),
            name.into(),
        ]);
        let mut record: BTreeMap<String, Value> = self.run_json(&args).await?;
        Ok(record
            .remove("id")
            .map(|id| value_as_string(&id))
            .filter(|id| !id.is_empty()))
    }

    async fn volume_status(&self, id: &str) -> ProvisionResult<VolumeStatus> {
        let status = self.show_field(&["volume", "show", id], "status").await?;
        let Ok(status) = value_as_string(&status).parse::<VolumeStatus>();
        Ok(status)
    }

    async fn attach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()> {
        self.run(&args(&["server", "add", "volume", server, volume_id]))
        .await
        .map(|_| ())
    }

    async fn detach_volume(&self, server: &str, volume_id: &str) -> ProvisionResult<()> {
        self.run(&args(&["server", "remove", "volume", server, volume_id]))
        .await
        .map(|_| ())
    }

    async fn delete_volume(&self, volume_id: &str) -> ProvisionResult<()> {
        match self
            .run(&args(&["volume", "delete", volume_id]))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e, NO_VOLUME) => {
                warn!(volume = %volume_id, "volume already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
