//! Lock service client.
//!
//! Read-only queries against the lock registry. Every request runs in a
//! [`RetryLoop`](nodepool_core::RetryLoop); when the budget runs out the
//! caller gets an empty result and a log line, never an error.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, warn};

use nodepool_core::{
    Attempt, NodeStatus, NodepoolConfig, RetryOutcome, RetryPolicy, canonicalize_hostname, retry,
};

use crate::error::{LockError, LockResult};
use crate::http::{HttpFetcher, join_url};
use crate::query::LockQuery;

/// Client for `{lock_server}/nodes/`.
#[derive(Clone, Debug)]
pub struct LockClient {
    base: String,
    lab_domain: String,
    http: HttpFetcher,
    retry: RetryPolicy,
}

impl LockClient {
    /// Create a client for `lock_server`, qualifying names with `lab_domain`.
    pub fn new(lock_server: impl Into<String>, lab_domain: impl Into<String>) -> Self {
        Self {
            base: lock_server.into(),
            lab_domain: lab_domain.into(),
            http: HttpFetcher::default(),
            retry: default_retry(),
        }
    }

    pub fn from_config(config: &NodepoolConfig) -> Self {
        Self::new(config.lock_server.clone(), config.lab_domain.clone())
    }

    /// Override the retry policy used for every request.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Override the HTTP client (e.g. a different timeout).
    pub fn with_http(mut self, http: HttpFetcher) -> Self {
        self.http = http;
        self
    }

    pub fn lab_domain(&self) -> &str {
        &self.lab_domain
    }

    /// Fetch one node's status.
    ///
    /// `None` means the server never answered successfully within the
    /// retry budget, which includes nodes it does not know about.
    pub async fn get_status(&self, name: &str) -> Option<NodeStatus> {
        let name = canonicalize_hostname(name, &self.lab_domain);
        let uri = join_url(&self.base, &["nodes", &name]);
        let uri = &uri;

        let outcome = retry(&self.retry, &format!("get_status {name}"), || async move {
            self.http
                .get_json::<NodeStatus>(uri)
                .await
                .map_err(Attempt::Retry)
        })
        .await;

        match outcome {
            RetryOutcome::Success(status) => Some(status),
            _ => {
                warn!(%name, "failed to query lock server for node status");
                None
            }
        }
    }

    /// Fetch several nodes, or the whole inventory when `names` is empty.
    ///
    /// Names the lock server does not know are skipped.
    pub async fn get_statuses<S: AsRef<str>>(&self, names: &[S]) -> Vec<NodeStatus> {
        if names.is_empty() {
            return self.list_locks(&LockQuery::default()).await;
        }

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let name = canonicalize_hostname(name.as_ref(), &self.lab_domain);
            match self.get_status(&name).await {
                Some(status) => statuses.push(status),
                None => error!(%name, "lock server doesn't know about machine"),
            }
        }
        statuses
    }

    /// List nodes matching `query`.
    ///
    /// Connection failures are retried; an HTTP error status ends the
    /// attempt loop. Either way an empty list comes back on failure.
    pub async fn list_locks(&self, query: &LockQuery) -> Vec<NodeStatus> {
        let uri = self.list_uri(query);
        let uri = &uri;

        let outcome = retry(&self.retry, "list_locks", || async move {
            self.http
                .get_json::<Vec<NodeStatus>>(uri)
                .await
                .map_err(|e| {
                    if e.is_connection() {
                        error!(lock_server = %self.base, error = %e, "could not contact lock server, retrying");
                        Attempt::Retry(e)
                    } else {
                        Attempt::Abort(e)
                    }
                })
        })
        .await;

        match outcome {
            RetryOutcome::Success(nodes) => {
                debug!(count = nodes.len(), "listed nodes");
                nodes
            }
            RetryOutcome::Exhausted { last, .. } | RetryOutcome::Aborted(last) => {
                warn!(%uri, error = %last, "failed to list nodes from lock server");
                Vec::new()
            }
        }
    }

    /// Like [`LockClient::list_locks`], keyed by node name.
    ///
    /// If the server repeats a name, the last record wins.
    pub async fn list_locks_by_name(&self, query: &LockQuery) -> BTreeMap<String, NodeStatus> {
        self.list_locks(query)
            .await
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect()
    }

    /// Whether a node is a virtual machine.
    ///
    /// Uses `status` when given, otherwise looks `name` up. A node the
    /// lock server cannot describe counts as not a VM.
    pub async fn is_vm(&self, name: Option<&str>, status: Option<&NodeStatus>) -> LockResult<bool> {
        if let Some(status) = status {
            return Ok(status.is_vm);
        }
        let name = name.ok_or_else(|| {
            LockError::InvalidArgument("must provide either name or status, or both".to_string())
        })?;
        Ok(self.get_status(name).await.is_some_and(|s| s.is_vm))
    }

    fn list_uri(&self, query: &LockQuery) -> String {
        let mut uri = join_url(&self.base, &["nodes"]);
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.to_query_string());
        }
        uri
    }
}

fn default_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_secs(1)).increment(Duration::from_millis(500))
}
