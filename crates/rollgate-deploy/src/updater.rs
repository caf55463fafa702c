//! Service updater: trigger a rolling update, then poll until the service
//! is stable on the target revision.
//!
//! Stability means all of the following hold on one poll:
//!
//! 1. exactly one deployment exists, it is primary and targets the revision
//! 2. that deployment reports its rollout completed
//! 3. its running count equals its desired count
//! 4. every task the service lists runs the target revision
//!
//! The loop is bounded twice: by `max_attempts` polls and by an overall
//! timeout. A target deployment the circuit breaker failed ends the loop
//! immediately.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use rollgate_core::config::RolloutSettings;
use rollgate_core::{Environment, RevisionNumber};
use rollgate_platform::{
    ClusterPlatform, PlatformError, RolloutState, ServiceDescription, ServiceUpdate, TaskStatus,
};

use crate::error::{DeployError, DeployResult};

/// Observed service state once the rollout settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    pub running_count: u32,
    pub desired_count: u32,
    pub circuit_breaker_tripped: bool,
    pub active_revision: RevisionNumber,
}

/// Last observation, kept for the timeout error.
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    running: u32,
    desired: u32,
}

enum Poll {
    Stable(ServiceState),
    Pending,
}

pub struct ServiceUpdater {
    cluster: Arc<dyn ClusterPlatform>,
    settings: RolloutSettings,
}

impl ServiceUpdater {
    pub fn new(cluster: Arc<dyn ClusterPlatform>, settings: RolloutSettings) -> Self {
        Self { cluster, settings }
    }

    /// Roll the environment's service onto `revision`, or onto its declared
    /// revision when none is given.
    ///
    /// On success `running_revision` is set; an explicit `revision` also
    /// becomes the declared one. On failure the environment is untouched.
    pub async fn roll_out(
        &self,
        env: &mut Environment,
        revision: Option<RevisionNumber>,
    ) -> DeployResult<ServiceState> {
        let target = revision
            .or(env.declared_revision)
            .ok_or(DeployError::NotDeclared {
                environment: env.name,
            })?;
        let service = format!("{}/{}", env.cluster, env.service);

        self.cluster
            .update_service(&ServiceUpdate {
                cluster: env.cluster.clone(),
                service: env.service.clone(),
                revision,
                force_new_deployment: true,
                policy: env.policy,
            })
            .await?;
        info!(
            environment = %env.name,
            %service,
            revision = target,
            max_running = env.policy.max_running_count,
            "rolling update started"
        );

        let mut progress = Progress::default();
        let polled = tokio::time::timeout(
            self.settings.timeout,
            self.poll_until_stable(env, target, &mut progress),
        )
        .await;

        let state = match polled {
            Ok(Ok(Some(state))) => state,
            Ok(Err(err)) => return Err(err),
            Ok(Ok(None)) | Err(_) => {
                warn!(
                    %service,
                    revision = target,
                    attempts = progress.attempts,
                    running = progress.running,
                    desired = progress.desired,
                    "service did not stabilize"
                );
                return Err(DeployError::StabilizationTimeout {
                    service,
                    revision: target,
                    attempts: progress.attempts,
                    running: progress.running,
                    desired: progress.desired,
                });
            }
        };

        env.running_revision = Some(target);
        if revision.is_some() {
            env.declared_revision = revision;
        }
        info!(
            environment = %env.name,
            %service,
            revision = target,
            running = state.running_count,
            "service stable"
        );
        Ok(state)
    }

    /// `Ok(None)` when attempts ran out.
    async fn poll_until_stable(
        &self,
        env: &Environment,
        target: RevisionNumber,
        progress: &mut Progress,
    ) -> DeployResult<Option<ServiceState>> {
        for attempt in 1..=self.settings.max_attempts {
            progress.attempts = attempt;
            if attempt > 1 {
                tokio::time::sleep(self.settings.poll_interval).await;
            }

            match self.poll_once(env, target, progress).await {
                Ok(Poll::Stable(state)) => return Ok(Some(state)),
                Ok(Poll::Pending) => {}
                // Throttling and transient API errors just cost an attempt.
                Err(DeployError::Platform(PlatformError::Unavailable(reason))) => {
                    debug!(attempt, %reason, "describe unavailable, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn poll_once(
        &self,
        env: &Environment,
        target: RevisionNumber,
        progress: &mut Progress,
    ) -> DeployResult<Poll> {
        let desc = self
            .cluster
            .describe_service(&env.cluster, &env.service)
            .await?;

        if let Some(rejected) = rejection(&desc, target) {
            warn!(
                service = %env.service,
                revision = target,
                reason = %rejected,
                "circuit breaker rejected deployment"
            );
            return Err(DeployError::DeploymentRejected {
                service: format!("{}/{}", env.cluster, env.service),
                revision: target,
                reason: rejected,
            });
        }

        let Some(primary) = desc.primary() else {
            debug!(attempt = progress.attempts, "no primary deployment yet");
            return Ok(Poll::Pending);
        };
        progress.running = primary.running_count;
        progress.desired = primary.desired_count;

        let settled = desc.deployments.len() == 1
            && primary.revision == target
            && primary.rollout_state == RolloutState::Completed
            && primary.running_count == primary.desired_count;
        debug!(
            attempt = progress.attempts,
            deployments = desc.deployments.len(),
            primary_revision = primary.revision,
            running = primary.running_count,
            desired = primary.desired_count,
            settled,
            "polled service"
        );
        if !settled {
            return Ok(Poll::Pending);
        }

        let tasks = self.cluster.list_tasks(&env.cluster, &env.service).await?;
        let stray = tasks
            .iter()
            .filter(|t| t.last_status == TaskStatus::Running && t.revision != target)
            .count();
        if stray > 0 {
            debug!(stray, "tasks still running an older revision");
            return Ok(Poll::Pending);
        }

        Ok(Poll::Stable(ServiceState {
            running_count: primary.running_count,
            desired_count: primary.desired_count,
            circuit_breaker_tripped: false,
            active_revision: target,
        }))
    }
}

/// Reason the target deployment was failed, if the breaker is armed and fired.
fn rejection(desc: &ServiceDescription, target: RevisionNumber) -> Option<String> {
    if !desc.circuit_breaker.enabled {
        return None;
    }
    let deployment = desc.deployment_for(target)?;
    (deployment.rollout_state == RolloutState::Failed).then(|| {
        deployment
            .rollout_state_reason
            .clone()
            .unwrap_or_else(|| format!("{} tasks failed to start", deployment.failed_tasks))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{environment, fast_rollout, sandbox};
    use rollgate_core::EnvironmentName;
    use rollgate_platform::{InfrastructurePlatform, RolloutBehavior, SandboxPlatform};

    /// Apply the production stack so revision `n` is declared, with the
    /// service already stable on `n - 1` when one exists.
    async fn declared_production(platform: &SandboxPlatform) -> Environment {
        let mut env = environment(EnvironmentName::Production);
        platform
            .seed_revision("web-production", Default::default())
            .await;
        platform.seed_service("prod", "web", 1).await.unwrap();
        env.running_revision = Some(1);

        let request = rollgate_platform::StackRequest {
            stack_name: env.stack_name.clone(),
            template: env.template.clone(),
            params: rollgate_platform::StackParams {
                environment_name: "production".to_string(),
                artifact_reference: "sha:abc123".to_string(),
                execution_role_ref: "role/exec".to_string(),
                network_placement_refs: vec!["subnet-a".to_string()],
            },
        };
        platform.apply_stack(&request).await.unwrap();
        env.declared_revision = Some(2);
        env
    }

    #[tokio::test]
    async fn converges_on_declared_revision() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        let updater = ServiceUpdater::new(Arc::new(platform.clone()), fast_rollout(10));

        let state = updater.roll_out(&mut env, None).await.unwrap();

        assert_eq!(state.running_count, 2);
        assert_eq!(state.desired_count, 2);
        assert_eq!(state.active_revision, 2);
        assert!(!state.circuit_breaker_tripped);
        assert_eq!(env.running_revision, Some(2));
        assert!(env.is_converged());
    }

    #[tokio::test]
    async fn polls_until_rollout_completes() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        platform
            .set_rollout_behavior("prod", "web", RolloutBehavior::Stabilize { polls: 3 })
            .await;
        let updater = ServiceUpdater::new(Arc::new(platform.clone()), fast_rollout(10));

        updater.roll_out(&mut env, None).await.unwrap();

        assert_eq!(platform.call_count("describe_service").await, 3);
        assert_eq!(platform.call_count("update_service").await, 1);
    }

    #[tokio::test]
    async fn exhausting_attempts_is_a_timeout() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        platform
            .set_rollout_behavior("prod", "web", RolloutBehavior::NeverStabilize)
            .await;
        let updater = ServiceUpdater::new(Arc::new(platform.clone()), fast_rollout(3));

        let err = updater.roll_out(&mut env, None).await.unwrap_err();

        match err {
            DeployError::StabilizationTimeout {
                attempts,
                running,
                desired,
                revision,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!((running, desired), (1, 2));
                assert_eq!(revision, 2);
            }
            other => panic!("expected StabilizationTimeout, got {other:?}"),
        }
        assert_eq!(env.running_revision, Some(1));
    }

    #[tokio::test]
    async fn overall_timeout_bounds_the_loop() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        platform
            .set_rollout_behavior("prod", "web", RolloutBehavior::NeverStabilize)
            .await;
        let settings = RolloutSettings {
            poll_interval: Duration::from_millis(10),
            max_attempts: u32::MAX,
            timeout: Duration::from_millis(50),
        };
        let updater = ServiceUpdater::new(Arc::new(platform), settings);

        let err = updater.roll_out(&mut env, None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn tripped_breaker_rejects_immediately() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        platform
            .set_rollout_behavior("prod", "web", RolloutBehavior::TripCircuitBreaker)
            .await;
        let updater = ServiceUpdater::new(Arc::new(platform.clone()), fast_rollout(40));

        let err = updater.roll_out(&mut env, None).await.unwrap_err();

        assert!(matches!(err, DeployError::DeploymentRejected { revision: 2, .. }));
        assert!(err.details()[0].contains("circuit breaker"));
        assert_eq!(platform.call_count("describe_service").await, 1);
        assert_eq!(env.running_revision, Some(1));
    }

    #[tokio::test]
    async fn explicit_revision_becomes_declared() {
        let platform = sandbox().await;
        let mut env = declared_production(&platform).await;
        let updater = ServiceUpdater::new(Arc::new(platform), fast_rollout(10));

        updater.roll_out(&mut env, Some(1)).await.unwrap();

        assert_eq!(env.declared_revision, Some(1));
        assert_eq!(env.running_revision, Some(1));
    }

    #[tokio::test]
    async fn nothing_declared_never_touches_the_service() {
        let platform = sandbox().await;
        let mut env = environment(EnvironmentName::Staging);
        let updater = ServiceUpdater::new(Arc::new(platform.clone()), fast_rollout(10));

        let err = updater.roll_out(&mut env, None).await.unwrap_err();

        assert!(matches!(err, DeployError::NotDeclared { .. }));
        assert_eq!(platform.call_count("update_service").await, 0);
    }
}
