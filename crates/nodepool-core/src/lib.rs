//! nodepool-core — shared building blocks for test-node lifecycle tooling.
//!
//! Holds the pieces every other nodepool crate leans on:
//!
//! - [`retry`]: the bounded, linearly backing-off retry loop wrapped around
//!   every remote call
//! - [`types`]: lock-service node snapshots, resource hints, instances,
//!   volumes, and batch tags
//! - [`hostname`]: canonical lab hostnames
//! - [`config`]: the `nodepool.toml` configuration file

pub mod config;
pub mod hostname;
pub mod retry;
pub mod types;

pub use config::{ConfigError, NodepoolConfig, OpenStackConfig, ProviderConf};
pub use hostname::canonicalize_hostname;
pub use retry::{Attempt, RetryLoop, RetryOutcome, RetryPolicy, retry};
pub use types::*;
