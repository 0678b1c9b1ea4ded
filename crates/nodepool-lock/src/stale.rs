//! Stale lock detection.
//!
//! A node locked by the scheduler for a job carries a description of the
//! form `/<run-name>/<job-id>` (possibly with a longer path prefix). If
//! that job is no longer running or waiting, the lock is stale and the
//! node can be reclaimed. Manual locks carry free text and are never
//! touched.
//!
//! The classification is a string heuristic on the description, not a
//! schema. Keep it exactly as is: the description format belongs to the
//! scheduler, not to us.

use std::collections::HashSet;

use tracing::{debug, info};

use nodepool_core::{NodeStatus, NodepoolConfig};

use crate::lock::LockClient;
use crate::query::LockQuery;
use crate::results::ResultsClient;

/// Could this node be locked on behalf of a job?
///
/// True iff it is locked and its description starts with `/` and
/// contains more than one `/`.
pub fn might_be_stale(node: &NodeStatus) -> bool {
    match node.description.as_deref() {
        Some(desc) => node.locked && desc.starts_with('/') && desc.matches('/').count() > 1,
        None => false,
    }
}

/// `(run_name, job_id)` from the last two `/`-separated segments.
pub fn job_ref(description: &str) -> Option<(&str, &str)> {
    let mut segments = description.rsplit('/');
    let job_id = segments.next()?;
    let run_name = segments.next()?;
    Some((run_name, job_id))
}

/// Finds locked nodes whose owning job has finished.
#[derive(Clone, Debug)]
pub struct StaleLockScanner {
    locks: LockClient,
    results: ResultsClient,
}

impl StaleLockScanner {
    pub fn new(locks: LockClient, results: ResultsClient) -> Self {
        Self { locks, results }
    }

    pub fn from_config(config: &NodepoolConfig) -> Self {
        Self::new(LockClient::from_config(config), ResultsClient::from_config(config))
    }

    /// Locked nodes (optionally only those held by `owner`) whose job is
    /// neither running nor waiting.
    ///
    /// A job that cannot be looked up counts as finished: reclaiming a
    /// node too eagerly is recoverable, keeping a dead lock forever is not.
    pub async fn find_stale_locks(&self, owner: Option<&str>) -> Vec<NodeStatus> {
        let nodes = self.locks.list_locks(&LockQuery::new().locked(true)).await;

        let candidates: Vec<NodeStatus> = nodes
            .into_iter()
            .filter(|node| owner.is_none_or(|o| node.locked_by.as_deref() == Some(o)))
            .filter(might_be_stale)
            .collect();

        debug!(candidates = candidates.len(), "checking job-locked nodes");

        // Descriptions already confirmed active during this scan.
        let mut active: HashSet<String> = HashSet::new();
        let mut stale = Vec::new();

        for node in candidates {
            if self.job_is_active(&node, &mut active).await {
                continue;
            }
            info!(
                node = %node.name,
                description = node.description.as_deref().unwrap_or_default(),
                "found stale lock"
            );
            stale.push(node);
        }

        stale
    }

    async fn job_is_active(&self, node: &NodeStatus, active: &mut HashSet<String>) -> bool {
        let Some(description) = node.description.as_deref() else {
            return false;
        };
        if active.contains(description) {
            return true;
        }
        let Some((run_name, job_id)) = job_ref(description) else {
            return false;
        };

        match self.results.job_info(run_name, job_id).await {
            Some(job) if job.is_active() => {
                active.insert(description.to_string());
                true
            }
            _ => false,
        }
    }
}
