//! Results service client: run/job status lookups.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use nodepool_core::{Attempt, NodepoolConfig, RetryPolicy, retry};

use crate::http::{HttpFetcher, join_url};

/// The subset of a job record we care about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobInfo {
    /// `running` and `waiting` jobs still own their nodes.
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "running" | "waiting")
    }
}

/// Client for `{results_server}/runs/{run}/jobs/{job}/`.
#[derive(Clone, Debug)]
pub struct ResultsClient {
    base: String,
    http: HttpFetcher,
    retry: RetryPolicy,
}

impl ResultsClient {
    pub fn new(results_server: impl Into<String>) -> Self {
        Self {
            base: results_server.into(),
            http: HttpFetcher::default(),
            retry: RetryPolicy::new(Duration::from_secs(1)).increment(Duration::from_millis(500)),
        }
    }

    pub fn from_config(config: &NodepoolConfig) -> Self {
        Self::new(config.results_server.clone())
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_http(mut self, http: HttpFetcher) -> Self {
        self.http = http;
        self
    }

    /// Look a job up; `None` if no attempt got a successful response.
    pub async fn job_info(&self, run_name: &str, job_id: &str) -> Option<JobInfo> {
        let uri = join_url(&self.base, &["runs", run_name, "jobs", job_id]);
        let uri = &uri;

        let outcome = retry(&self.retry, "node_is_active", || async move {
            self.http
                .get_json::<JobInfo>(uri)
                .await
                .map_err(Attempt::Retry)
        })
        .await;

        match outcome.into_result() {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(run = %run_name, job = %job_id, error = %e, "could not look up job");
                None
            }
        }
    }
}
