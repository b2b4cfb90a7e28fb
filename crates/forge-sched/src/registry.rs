//! Trained-artifact registry.
//!
//! Thin layer over the artifact store that builds records from finished
//! jobs. Activation semantics (exactly one active adapter per branch) live
//! in the store itself.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use forge_core::{ArtifactStore, Result, TrainedArtifact, TrainingJob};

#[derive(Clone)]
pub struct ArtifactRegistry {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Record a completed job's adapter and make it the branch's active
    /// artifact, superseding any previous one.
    pub async fn register(
        &self,
        job: &TrainingJob,
        output_path: &Path,
        metrics: BTreeMap<String, f64>,
        duration_secs: f64,
    ) -> Result<TrainedArtifact> {
        let artifact = TrainedArtifact {
            id: Uuid::now_v7(),
            branch: job.branch.clone(),
            job_id: job.id,
            path: output_path.display().to_string(),
            metrics,
            duration_secs,
            created_at: Utc::now(),
            active: true,
        };
        self.store.upsert_artifact(&artifact).await?;

        info!(
            subsystem = "registry",
            op = "register",
            branch = %artifact.branch,
            job_id = %artifact.job_id,
            artifact_id = %artifact.id,
            path = %artifact.path,
            "Artifact registered as active"
        );
        Ok(artifact)
    }

    /// The branch's currently active adapter, if any.
    pub async fn active(&self, branch: &str) -> Result<Option<TrainedArtifact>> {
        self.store.get_active_artifact(branch).await
    }

    /// All artifacts ever produced for the branch, newest first.
    pub async fn list(&self, branch: &str) -> Result<Vec<TrainedArtifact>> {
        self.store.list_artifacts(branch).await
    }
}
