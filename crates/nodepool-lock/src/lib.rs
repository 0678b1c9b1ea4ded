//! nodepool-lock — lock service queries and stale lock detection.
//!
//! Talks JSON over HTTP to two external authorities: the lock service
//! (which node is held by whom) and the results service (which jobs are
//! still running). Neither is cached beyond a single scan.
//!
//! # Architecture
//!
//! ```text
//! StaleLockScanner
//!   ├── LockClient ──────── GET {lock_server}/nodes/?locked=1
//!   │                       GET {lock_server}/nodes/{name}/
//!   └── ResultsClient ───── GET {results_server}/runs/{run}/jobs/{job}/
//!         (both via HttpFetcher, every call wrapped in a RetryLoop)
//! ```
//!
//! An unknown node or an unreachable server is an ordinary outcome here:
//! lookups come back empty and log, they do not fail.

pub mod error;
pub mod http;
pub mod lock;
pub mod query;
pub mod results;
pub mod stale;

pub use error::{LockError, LockResult};
pub use http::HttpFetcher;
pub use lock::LockClient;
pub use query::LockQuery;
pub use results::{JobInfo, ResultsClient};
pub use stale::{StaleLockScanner, job_ref, might_be_stale};
