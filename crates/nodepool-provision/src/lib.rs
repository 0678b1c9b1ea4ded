//! nodepool-provision — batch creation of test nodes on a cloud backend.
//!
//! # Architecture
//!
//! ```text
//!  DriverRegistry ── node type ──► Driver::OpenStack
//!        │
//!        ▼
//!  PoolProvisioner ──────────────► ComputeBackend (OpenStackCli)
//!   │  create lock, batch tag         image / flavor / servers / volumes
//!   │  per-instance setup
//!   ├──► ReadinessProbe (SshProbe)    ssh-keyscan, boot marker
//!   ├──► VolumeManager                create → available → attach → in-use
//!   └──► Rollback                     undo log replayed on failure
//! ```
//!
//! Every remote step runs inside a [`nodepool_core::RetryLoop`]. A batch
//! either returns `num` ready fqdns or fails having destroyed everything
//! it created.

pub mod backend;
pub mod error;
pub mod openstack;
pub mod probe;
pub mod provisioner;
pub mod registry;
pub mod rollback;
pub mod userdata;
pub mod volume;

pub use backend::{ComputeBackend, ServerCreateRequest, ServerSummary};
pub use error::{ProvisionError, ProvisionResult, is_quota_error};
pub use openstack::OpenStackCli;
pub use probe::{ReadinessProbe, SshProbe, UP_MARKER};
pub use provisioner::{
    BASE_NAME, BATCH_TAG_PROPERTY, CreateRequest, OWNER_PROPERTY, PoolProvisioner,
    ProvisionTimings, Provisioner, ip_to_name,
};
pub use registry::{Driver, DriverRegistry, Provider};
pub use rollback::{Rollback, RollbackReport, UndoAction};
pub use userdata::{render_template, write_user_data};
pub use volume::{VolumeManager, VolumeTimings};
