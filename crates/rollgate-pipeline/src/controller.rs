//! Pipeline controller: drives the state machine for one run.
//!
//! The controller owns both environment records and hands them to one
//! executor at a time. Stages run strictly in sequence; cancellation is
//! only observed between stages, so an in-flight apply, rollout wait or
//! suite execution always runs to completion or to its own timeout.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use rollgate_core::config::{GateSettings, RolloutSettings};
use rollgate_core::{
    Config, ConfigError, DeployableRevision, Environment, EnvironmentName, FailureKind,
    PipelineRun, PipelineRunBuilder, RunOutcome, Stage, StageFailure, StageResult, now_ms,
};
use rollgate_deploy::{
    DeployError, DeployResult, GateRunner, RollbackResolver, ServiceUpdater, StackDeployer,
};
use rollgate_platform::{ClusterPlatform, GateSuite, InfrastructurePlatform};

use crate::state::{PipelineState, RollbackIntent, StepOutcome, transition};

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub artifact: DeployableRevision,
    /// Change description, typically the commit message.
    pub description: String,
    pub rollback_intent: RollbackIntent,
}

impl TriggerEvent {
    /// Derive rollback intent from `marker` in the description.
    pub fn new(artifact: DeployableRevision, description: &str, marker: &str) -> Self {
        Self {
            artifact,
            description: description.to_string(),
            rollback_intent: RollbackIntent::from_description(description, marker),
        }
    }

    pub fn with_rollback_intent(mut self, intent: RollbackIntent) -> Self {
        self.rollback_intent = intent;
        self
    }
}

/// Platform handles the executors are built from.
#[derive(Clone)]
pub struct Platforms {
    pub infrastructure: Arc<dyn InfrastructurePlatform>,
    pub cluster: Arc<dyn ClusterPlatform>,
    pub suites: Arc<dyn GateSuite>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub service_family: String,
    pub rollout: RolloutSettings,
    pub gate: GateSettings,
    /// Suite gating promotion out of staging.
    pub staging_suite: String,
    /// Suite gating production.
    pub production_suite: String,
}

pub struct PipelineController {
    settings: ControllerSettings,
    staging: Environment,
    production: Environment,
    stack: StackDeployer,
    updater: ServiceUpdater,
    gate: GateRunner,
    rollback: RollbackResolver,
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        staging: Environment,
        production: Environment,
        platforms: Platforms,
    ) -> Self {
        Self {
            stack: StackDeployer::new(platforms.infrastructure),
            updater: ServiceUpdater::new(platforms.cluster.clone(), settings.rollout),
            gate: GateRunner::new(platforms.suites, settings.gate),
            rollback: RollbackResolver::new(platforms.cluster),
            settings,
            staging,
            production,
        }
    }

    pub fn from_config(config: &Config, platforms: Platforms) -> Result<Self, ConfigError> {
        let suite = |name: EnvironmentName| {
            config
                .suite_for(name)
                .map(str::to_string)
                .ok_or(ConfigError::MissingEnvironment(name))
        };
        let settings = ControllerSettings {
            service_family: config.pipeline.service_family.clone(),
            rollout: config.rollout_settings()?,
            gate: config.gate_settings()?,
            staging_suite: suite(EnvironmentName::Staging)?,
            production_suite: suite(EnvironmentName::Production)?,
        };
        Ok(Self::new(
            settings,
            config.environment(EnvironmentName::Staging)?,
            config.environment(EnvironmentName::Production)?,
            platforms,
        ))
    }

    /// The environment records as the last run left them.
    pub fn environments(&self) -> [&Environment; 2] {
        [&self.staging, &self.production]
    }

    pub fn environment(&self, name: EnvironmentName) -> &Environment {
        match name {
            EnvironmentName::Staging => &self.staging,
            EnvironmentName::Production => &self.production,
        }
    }

    /// Execute one pipeline run to a terminal state.
    ///
    /// Never fails: every stage failure is recorded in the returned run.
    /// Setting `cancel` to `true` stops the run before its next stage.
    pub async fn run(
        &mut self,
        trigger: TriggerEvent,
        cancel: watch::Receiver<bool>,
    ) -> PipelineRun {
        let intent = trigger.rollback_intent;
        let mut run = PipelineRunBuilder::new(
            &self.settings.service_family,
            trigger.artifact.clone(),
            intent.is_present(),
        );
        info!(
            run_id = %run.id(),
            family = %self.settings.service_family,
            artifact = %trigger.artifact,
            rollback_intent = intent.is_present(),
            "pipeline run started"
        );

        let mut state = transition(PipelineState::Pending, StepOutcome::Succeeded, intent);
        while let Some(stage) = state.stage() {
            if *cancel.borrow() {
                warn!(run_id = %run.id(), %stage, "run cancelled before stage");
                run.record(StageResult::skipped(
                    stage,
                    Some(StageFailure {
                        kind: FailureKind::Cancelled,
                        message: format!("run cancelled before {stage}"),
                        details: Vec::new(),
                        retryable: true,
                    }),
                ));
                state = PipelineState::Failed;
                break;
            }

            info!(run_id = %run.id(), %stage, "stage started");
            let started = now_ms();
            let outcome = match self.execute(stage, &trigger.artifact).await {
                Ok(outputs) => {
                    info!(run_id = %run.id(), %stage, "stage succeeded");
                    run.record(StageResult::success(stage, outputs, started));
                    StepOutcome::Succeeded
                }
                Err(err) => {
                    self.report_failure(run.id(), stage, &err);
                    run.record(StageResult::failed(stage, err.to_failure(), started));
                    StepOutcome::Failed
                }
            };

            let next = transition(state, outcome, intent);
            debug!(run_id = %run.id(), from = %state, to = %next, "state transition");
            state = next;
        }

        for stage in Stage::FORWARD {
            if run.stages().iter().all(|r| r.stage != stage) {
                run.record(StageResult::skipped(stage, None));
            }
        }

        let outcome = match state {
            PipelineState::Succeeded => RunOutcome::Succeeded,
            PipelineState::RolledBack => RunOutcome::RolledBack,
            _ => RunOutcome::Failed,
        };
        let run = run.finish(outcome);
        info!(run_id = %run.id(), %outcome, final_state = %state, "pipeline run finished");
        run
    }

    async fn execute(
        &mut self,
        stage: Stage,
        artifact: &DeployableRevision,
    ) -> DeployResult<BTreeMap<String, String>> {
        let env = match stage.environment() {
            EnvironmentName::Staging => &mut self.staging,
            EnvironmentName::Production => &mut self.production,
        };
        let mut outputs = BTreeMap::new();

        match stage {
            Stage::StagingDeploy | Stage::ProdDeploy => {
                let applied = self.stack.apply(env, artifact).await?;
                outputs.insert("endpoint".to_string(), applied.endpoint);
                outputs.insert(
                    "declared_revision".to_string(),
                    applied.declared_revision.to_string(),
                );
                outputs.insert("changed".to_string(), applied.changed.to_string());
            }
            Stage::StagingUpdate | Stage::ProdUpdate => {
                let state = self.updater.roll_out(env, None).await?;
                outputs.insert("revision".to_string(), state.active_revision.to_string());
                outputs.insert(
                    "running".to_string(),
                    format!("{}/{}", state.running_count, state.desired_count),
                );
            }
            Stage::StagingGate | Stage::ProdGate => {
                let suite = match stage.environment() {
                    EnvironmentName::Staging => &self.settings.staging_suite,
                    EnvironmentName::Production => &self.settings.production_suite,
                };
                let endpoint = env.endpoint.clone().ok_or_else(|| DeployError::MissingOutput {
                    stack: env.stack_name.clone(),
                    key: env.outputs.endpoint.clone(),
                })?;
                let result = self.gate.run_suite(suite, &endpoint).await?;
                outputs.insert("suite".to_string(), suite.clone());
                outputs.insert("endpoint".to_string(), endpoint);
                outputs.insert("passed".to_string(), result.passed.to_string());
            }
            Stage::Rollback => {
                let from = env.running_revision;
                let record = self.rollback.resolve_previous(env).await?;
                let state = self.updater.roll_out(env, Some(record.revision)).await?;
                if let Some(from) = from {
                    outputs.insert("rolled_back_from".to_string(), from.to_string());
                }
                outputs.insert("revision".to_string(), record.revision.to_string());
                outputs.insert("identity".to_string(), record.identity);
                outputs.insert(
                    "running".to_string(),
                    format!("{}/{}", state.running_count, state.desired_count),
                );
            }
        }
        Ok(outputs)
    }

    fn report_failure(&self, run_id: &str, stage: Stage, err: &DeployError) {
        match (stage, err) {
            (_, DeployError::NoPriorRevision { family, current }) => error!(
                %run_id,
                %family,
                current,
                "rollback abandoned: production is stuck on its current revision"
            ),
            (Stage::Rollback, _) => error!(%run_id, error = %err, "rollback failed"),
            _ => warn!(
                %run_id,
                %stage,
                kind = ?err.kind(),
                retryable = err.is_retryable(),
                error = %err,
                "stage failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use rollgate_core::StageStatus;
    use rollgate_platform::{SandboxPlatform, ScriptedSuite};

    const MINIMAL: &str = r#"
[pipeline]
service_family = "web"
template = "infra/service.yml"

[pipeline.rollout]
poll_interval = "1ms"
max_attempts = 5

[pipeline.gate]
settle_delay = "0s"

[environments.staging]
cluster = "stg"
service = "web"
stack_name = "web-stg"
execution_role = "role/exec"
suite = "acceptance"

[environments.production]
cluster = "prod"
service = "web"
stack_name = "web-prod"
execution_role = "role/exec"
suite = "smoke"

[suites.acceptance]
command = ["./acceptance.sh"]

[suites.smoke]
command = ["./smoke.sh"]
"#;

    async fn controller(suites: ScriptedSuite) -> (PipelineController, SandboxPlatform) {
        controller_from(MINIMAL, suites).await
    }

    async fn controller_from(
        toml: &str,
        suites: ScriptedSuite,
    ) -> (PipelineController, SandboxPlatform) {
        let config = Config::from_toml_str(toml).unwrap();
        let platform = SandboxPlatform::from_config(&config).await.unwrap();
        let platforms = Platforms {
            infrastructure: Arc::new(platform.clone()),
            cluster: Arc::new(platform.clone()),
            suites: Arc::new(suites),
        };
        (
            PipelineController::from_config(&config, platforms).unwrap(),
            platform,
        )
    }

    fn trigger(message: &str) -> TriggerEvent {
        TriggerEvent::new(
            DeployableRevision::new("sha:abc123", "abc123"),
            message,
            "[rollback]",
        )
    }

    #[tokio::test]
    async fn green_run_succeeds_and_converges() {
        let suites = ScriptedSuite::new().pass("acceptance").pass("smoke");
        let (mut controller, _platform) = controller(suites.clone()).await;
        let (_tx, rx) = watch::channel(false);

        let run = controller.run(trigger("ship it"), rx).await;

        assert_eq!(run.outcome(), RunOutcome::Succeeded);
        assert_eq!(run.stages().len(), 6);
        assert!(run.stages().iter().all(|r| r.status == StageStatus::Success));
        assert!(controller.environments().iter().all(|e| e.is_converged()));
        assert_eq!(
            run.stage(Stage::StagingGate).unwrap().output("endpoint"),
            Some("https://web-stg.sandbox.local/")
        );
        assert_eq!(suites.invocations().len(), 2);
    }

    #[tokio::test]
    async fn stage_failure_skips_the_rest() {
        let suites = ScriptedSuite::new().pass("acceptance").pass("smoke");
        let (mut controller, platform) = controller(suites).await;
        platform.drop_output("web-prod", "ServiceUrl").await;
        let (_tx, rx) = watch::channel(false);

        let run = controller.run(trigger("ship it [rollback]"), rx).await;

        assert_eq!(run.outcome(), RunOutcome::Failed);
        let failure = run.first_failure().unwrap();
        assert_eq!(failure.stage, Stage::ProdDeploy);
        assert_eq!(failure.failure.as_ref().unwrap().kind, FailureKind::MissingOutput);
        assert_eq!(run.stage(Stage::ProdUpdate).unwrap().status, StageStatus::Skipped);
        assert!(!run.executed(Stage::Rollback));
    }

    #[tokio::test]
    async fn incomplete_artifact_never_leaves_staging() {
        let suites = ScriptedSuite::new().pass("acceptance").pass("smoke");
        let (mut controller, platform) = controller(suites.clone()).await;
        let (_tx, rx) = watch::channel(false);
        let trigger = TriggerEvent::new(
            DeployableRevision::new("sha:abc123", ""),
            "ship it",
            "[rollback]",
        );

        let run = controller.run(trigger, rx).await;

        assert_eq!(run.outcome(), RunOutcome::Failed);
        let failure = run.first_failure().unwrap();
        assert_eq!(failure.stage, Stage::StagingDeploy);
        assert_eq!(failure.failure.as_ref().unwrap().kind, FailureKind::Platform);
        assert_eq!(platform.call_count("apply_stack").await, 0);
        assert!(suites.invocations().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_stages() {
        let suites = ScriptedSuite::new().pass("acceptance").pass("smoke");
        let (mut controller, platform) = controller(suites).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let run = controller.run(trigger("ship it"), rx).await;

        assert_eq!(run.outcome(), RunOutcome::Failed);
        let first = &run.stages()[0];
        assert_eq!(first.stage, Stage::StagingDeploy);
        assert_eq!(first.status, StageStatus::Skipped);
        assert_eq!(first.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(run.stages().len(), 6);
        assert!(platform.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_applies_to_each_gate() {
        let suites = ScriptedSuite::new().pass("acceptance").pass("smoke");
        let toml = MINIMAL.replace("settle_delay = \"0s\"", "settle_delay = \"30s\"");
        let (mut controller, _platform) = controller_from(&toml, suites).await;
        let (_tx, rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let run = controller.run(trigger("ship it"), rx).await;

        assert_eq!(run.outcome(), RunOutcome::Succeeded);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[test]
    fn explicit_intent_overrides_the_description() {
        let event = trigger("no marker here").with_rollback_intent(RollbackIntent::PRESENT);
        assert!(event.rollback_intent.is_present());
        assert!(!trigger("no marker here").rollback_intent.is_present());
    }
}
