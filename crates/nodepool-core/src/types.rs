//! Domain types shared by the lock and provisioning crates.
//!
//! `NodeStatus` mirrors the lock service's JSON verbatim. The remaining
//! types describe compute instances and block volumes as the provisioner
//! sees them while driving a batch.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

// ── Lock service ──────────────────────────────────────────────────

/// One node as reported by the lock service.
///
/// A snapshot: re-fetch rather than hold on to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub locked: bool,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_vm: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub machine_type: String,
    /// Every other field the server sent (os_type, mac_address, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeStatus {
    /// A bare unlocked record, mostly useful for tests and fixtures.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: false,
            locked_by: None,
            description: None,
            is_vm: false,
            machine_type: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ── Resource hints ────────────────────────────────────────────────

/// Desired machine shape: disk in GB, ram in MB, virtual CPUs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MachineHint {
    pub disk: u32,
    pub ram: u32,
    pub cpus: u32,
}

/// Extra block volumes per instance: how many, and size in GB each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VolumeHint {
    pub count: u32,
    pub size: u32,
}

/// Fully resolved resource requirements for one provisioning call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceHint {
    pub machine: MachineHint,
    pub volumes: VolumeHint,
}

/// A caller-supplied partial hint, as found in job YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HintOverlay {
    #[serde(default)]
    pub machine: Option<MachineOverlay>,
    #[serde(default)]
    pub volumes: Option<VolumeOverlay>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MachineOverlay {
    pub disk: Option<u32>,
    pub ram: Option<u32>,
    pub cpus: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VolumeOverlay {
    pub count: Option<u32>,
    pub size: Option<u32>,
}

impl ResourceHint {
    /// Merge overlays over these defaults.
    ///
    /// Every field ends up as the maximum of the default and each overlay
    /// that sets it, so a hint can only ever ask for more.
    pub fn merged(&self, overlays: &[HintOverlay]) -> ResourceHint {
        let mut result = *self;
        for overlay in overlays {
            if let Some(m) = &overlay.machine {
                raise(&mut result.machine.disk, m.disk);
                raise(&mut result.machine.ram, m.ram);
                raise(&mut result.machine.cpus, m.cpus);
            }
            if let Some(v) = &overlay.volumes {
                raise(&mut result.volumes.count, v.count);
                raise(&mut result.volumes.size, v.size);
            }
        }
        result
    }
}

fn raise(current: &mut u32, candidate: Option<u32>) {
    if let Some(value) = candidate {
        *current = (*current).max(value);
    }
}

// ── Compute instances ─────────────────────────────────────────────

/// Where an instance is in its provisioning lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Requested,
    Booting,
    Named,
    SshReachable,
    InitComplete,
    VolumesAttached,
    Destroying,
    Gone,
}

impl InstancePhase {
    /// Ready for the caller (`VolumesAttached`) or torn down (`Gone`).
    pub fn is_terminal(self) -> bool {
        matches!(self, InstancePhase::VolumesAttached | InstancePhase::Gone)
    }
}

/// One compute node created by a provisioning batch.
///
/// `name`, `ip`, and `fqdn` stay `None` until the backend reports the
/// instance active and it has been renamed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub fqdn: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub phase: InstancePhase,
}

impl Instance {
    /// An instance the backend has just returned from a batch create.
    pub fn booting(id: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            ip: None,
            fqdn: None,
            properties,
            phase: InstancePhase::Booting,
        }
    }

    /// Name if assigned, id otherwise.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ── Block volumes ─────────────────────────────────────────────────

/// Lifecycle status of a block volume as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Deleting,
    Error,
    #[serde(untagged)]
    Other(String),
}

impl VolumeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Error => "error",
            VolumeStatus::Other(s) => s,
        }
    }
}

impl FromStr for VolumeStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "creating" => VolumeStatus::Creating,
            "available" => VolumeStatus::Available,
            "attaching" => VolumeStatus::Attaching,
            "in-use" => VolumeStatus::InUse,
            "detaching" => VolumeStatus::Detaching,
            "deleting" => VolumeStatus::Deleting,
            "error" => VolumeStatus::Error,
            other => VolumeStatus::Other(other.to_string()),
        })
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block volume owned by the volume manager until attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub status: VolumeStatus,
    pub size: u32,
}

// ── Batch tag ─────────────────────────────────────────────────────

/// Random 128-bit token stamped on every instance of one create call.
///
/// Instances listed back from a shared backend account are matched on
/// this tag alone, so it must never be reused across calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchTag(String);

impl BatchTag {
    /// Draw a fresh tag.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
