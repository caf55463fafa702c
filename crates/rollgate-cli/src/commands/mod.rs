pub mod run;
pub mod runs;
pub mod setup;

use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;

use rollgate_core::{PipelineRun, StageStatus};
use rollgate_state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

const DB_FILE: &str = "rollgate.redb";

/// Open the audit store under `data_dir`, creating the directory.
pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path = data_dir.join(DB_FILE);
    StateStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

/// Human-readable stage table for one run.
pub fn format_run(run: &PipelineRun) -> String {
    let mut out = format!(
        "run {}  {}  artifact {}  outcome {}{}\n",
        run.id(),
        run.service_family(),
        run.artifact(),
        run.outcome(),
        if run.rollback_intent() {
            "  (rollback intent)"
        } else {
            ""
        },
    );
    out.push_str(&format!(
        "  {:<16} {:<8} {:>8}  {}\n",
        "STAGE", "STATUS", "TIME", "DETAIL"
    ));
    for result in run.stages() {
        let status = match result.status {
            StageStatus::Success => "ok",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "skipped",
        };
        let elapsed = result.finished_at_ms.saturating_sub(result.started_at_ms);
        let detail = match &result.failure {
            Some(failure) => failure.message.clone(),
            None => result
                .outputs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" "),
        };
        out.push_str(&format!(
            "  {:<16} {:<8} {:>6}ms  {}\n",
            result.stage.as_str(),
            status,
            elapsed,
            detail
        ));
        if let Some(failure) = &result.failure {
            for line in &failure.details {
                out.push_str(&format!("  {:<16} {:<8} {:>8}  | {line}\n", "", "", ""));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{
        DeployableRevision, FailureKind, PipelineRunBuilder, RunOutcome, Stage, StageFailure,
        StageResult,
    };
    use std::collections::BTreeMap;

    #[test]
    fn run_table_shows_failures_and_details() {
        let mut builder =
            PipelineRunBuilder::new("web", DeployableRevision::new("sha:abc123", "abc123"), true);
        builder.record(StageResult::success(
            Stage::StagingDeploy,
            BTreeMap::from([("endpoint".to_string(), "http://stg.example/".to_string())]),
            0,
        ));
        builder.record(StageResult::failed(
            Stage::StagingUpdate,
            StageFailure {
                kind: FailureKind::DeploymentRejected,
                message: "deployment rejected".to_string(),
                details: vec!["3 tasks failed to start".to_string()],
                retryable: false,
            },
            0,
        ));
        let run = builder.finish(RunOutcome::Failed);

        let table = format_run(&run);
        assert!(table.contains("outcome failed"));
        assert!(table.contains("(rollback intent)"));
        assert!(table.contains("endpoint=http://stg.example/"));
        assert!(table.contains("FAILED"));
        assert!(table.contains("| 3 tasks failed to start"));
    }

    #[test]
    fn open_store_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested/.rollgate");
        open_store(&data_dir).unwrap();
        assert!(data_dir.join(DB_FILE).exists());
    }
}
