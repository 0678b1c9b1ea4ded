//! Undo log for a provisioning batch.
//!
//! Each resource a batch creates is recorded as an [`UndoAction`] right
//! after it exists. On failure the log is replayed newest first, so
//! volumes are released before the instance they hang off is deleted.

use std::fmt;

use tracing::{info, warn};

use crate::backend::ComputeBackend;
use crate::volume::VolumeManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    DestroyInstance { id: String },
    ReleaseVolume { server: String, id: String },
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoAction::DestroyInstance { id } => write!(f, "destroy instance {id}"),
            UndoAction::ReleaseVolume { server, id } => {
                write!(f, "release volume {id} from {server}")
            }
        }
    }
}

/// What a replay managed to undo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub undone: usize,
    pub failed: Vec<UndoAction>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<UndoAction>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The batch succeeded: keep every resource. Returns how many there were.
    pub fn commit(self) -> usize {
        self.actions.len()
    }

    /// Replay every action newest first. Never stops early.
    pub async fn run(self, backend: &dyn ComputeBackend, volumes: &VolumeManager) -> RollbackReport {
        let mut report = RollbackReport::default();

        for action in self.actions.into_iter().rev() {
            let ok = match &action {
                UndoAction::DestroyInstance { id } => match backend.delete_server(id).await {
                    Ok(()) => {
                        info!(instance = %id, "destroyed instance");
                        true
                    }
                    Err(e) => {
                        warn!(instance = %id, error = %e, "failed to destroy instance");
                        false
                    }
                },
                UndoAction::ReleaseVolume { server, id } => volumes.release_volume(server, id).await,
            };

            if ok {
                report.undone += 1;
            } else {
                report.failed.push(action);
            }
        }

        if !report.is_clean() {
            let failed: Vec<String> = report.failed.iter().map(ToString::to_string).collect();
            warn!(
                undone = report.undone,
                failed = report.failed.len(),
                actions = ?failed,
                "rollback incomplete, resources may have leaked"
            );
        }

        report
    }
}
