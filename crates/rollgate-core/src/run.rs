//! Pipeline run records.
//!
//! A `PipelineRun` is only obtainable from `PipelineRunBuilder::finish`,
//! which consumes the builder. Once finished, a run exposes no way to
//! append or rewrite stage results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{DeployableRevision, RunOutcome, Stage, StageResult, StageStatus, now_ms};

/// One finished execution of the promotion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    id: String,
    service_family: String,
    artifact: DeployableRevision,
    rollback_intent: bool,
    stages: Vec<StageResult>,
    outcome: RunOutcome,
    started_at_ms: u64,
    finished_at_ms: u64,
}

impl PipelineRun {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service_family(&self) -> &str {
        &self.service_family
    }

    pub fn artifact(&self) -> &DeployableRevision {
        &self.artifact
    }

    pub fn rollback_intent(&self) -> bool {
        self.rollback_intent
    }

    /// Stage results in execution order.
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn finished_at_ms(&self) -> u64 {
        self.finished_at_ms
    }

    /// The most recent result recorded for `stage`.
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    /// Whether `stage` was actually executed (not skipped).
    pub fn executed(&self, stage: Stage) -> bool {
        self.stages
            .iter()
            .any(|r| r.stage == stage && r.status != StageStatus::Skipped)
    }

    /// The first failed stage, if any.
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.status == StageStatus::Failed)
    }

    /// Composite key for the runs table, ordered by start time.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{}",
            self.service_family, self.started_at_ms, self.id
        )
    }
}

/// Accumulates stage results for a run in progress.
#[derive(Debug)]
pub struct PipelineRunBuilder {
    id: String,
    service_family: String,
    artifact: DeployableRevision,
    rollback_intent: bool,
    stages: Vec<StageResult>,
    started_at_ms: u64,
}

impl PipelineRunBuilder {
    pub fn new(service_family: &str, artifact: DeployableRevision, rollback_intent: bool) -> Self {
        let started_at_ms = now_ms();
        Self {
            id: run_id(&artifact, started_at_ms),
            service_family: service_family.to_string(),
            artifact,
            rollback_intent,
            stages: Vec::new(),
            started_at_ms,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Seal the run with its terminal outcome.
    pub fn finish(self, outcome: RunOutcome) -> PipelineRun {
        PipelineRun {
            id: self.id,
            service_family: self.service_family,
            artifact: self.artifact,
            rollback_intent: self.rollback_intent,
            stages: self.stages,
            outcome,
            started_at_ms: self.started_at_ms,
            finished_at_ms: now_ms(),
        }
    }
}

/// First 12 hex chars of sha256(reference || started_at_ms).
fn run_id(artifact: &DeployableRevision, started_at_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(artifact.reference().as_bytes());
    hasher.update(started_at_ms.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn finish_preserves_order() {
        let artifact = DeployableRevision::new("sha:abc123", "abc123");
        let mut builder = PipelineRunBuilder::new("web", artifact.clone(), false);
        builder.record(StageResult::success(Stage::StagingDeploy, BTreeMap::new(), 1));
        builder.record(StageResult::skipped(Stage::StagingUpdate, None));

        let run = builder.finish(RunOutcome::Failed);
        assert_eq!(run.artifact(), &artifact);
        assert_eq!(run.stages().len(), 2);
        assert_eq!(run.stages()[0].stage, Stage::StagingDeploy);
        assert!(run.executed(Stage::StagingDeploy));
        assert!(!run.executed(Stage::StagingUpdate));
        assert!(run.finished_at_ms() >= run.started_at_ms());
    }

    #[test]
    fn run_id_is_short_hex() {
        let id = run_id(&DeployableRevision::new("sha:abc123", "abc123"), 42);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(
            id,
            run_id(&DeployableRevision::new("sha:abc123", "abc123"), 43)
        );
    }

    #[test]
    fn table_key_sorts_by_start_time() {
        let artifact = DeployableRevision::new("sha:abc123", "abc123");
        let run = PipelineRunBuilder::new("web", artifact, false).finish(RunOutcome::Succeeded);
        let key = run.table_key();
        assert!(key.starts_with("web:"));
        assert!(key.ends_with(run.id()));
    }
}
