//! Stack deployer: idempotent infrastructure apply for one environment.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rollgate_core::{DeployableRevision, Environment, RevisionNumber};
use rollgate_platform::{
    InfrastructurePlatform, PlatformError, StackOutputs, StackParams, StackRequest,
};

use crate::error::{DeployError, DeployResult};

/// What a successful apply resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackApplied {
    pub endpoint: String,
    pub declared_revision: RevisionNumber,
    /// False when the platform reported nothing to change.
    pub changed: bool,
}

pub struct StackDeployer {
    platform: Arc<dyn InfrastructurePlatform>,
}

impl StackDeployer {
    pub fn new(platform: Arc<dyn InfrastructurePlatform>) -> Self {
        Self { platform }
    }

    /// Apply the environment's stack for `artifact`.
    ///
    /// An apply with nothing to change is a success: the outputs are read
    /// back from the existing stack. On success the environment's declared
    /// revision and endpoint are updated.
    pub async fn apply(
        &self,
        env: &mut Environment,
        artifact: &DeployableRevision,
    ) -> DeployResult<StackApplied> {
        if !artifact.is_valid() {
            return Err(DeployError::InvalidArtifact {
                artifact: artifact.to_string(),
            });
        }

        let request = StackRequest {
            stack_name: env.stack_name.clone(),
            template: env.template.clone(),
            params: StackParams {
                environment_name: env.name.to_string(),
                artifact_reference: artifact.reference().to_string(),
                execution_role_ref: env.infrastructure.execution_role.clone(),
                network_placement_refs: env.infrastructure.network_placement_refs(),
            },
        };

        info!(
            environment = %env.name,
            stack = %env.stack_name,
            artifact = %artifact.reference(),
            "applying stack"
        );

        let (outputs, changed) = match self.platform.apply_stack(&request).await {
            Ok(outputs) => (outputs, true),
            Err(PlatformError::NoChanges) => {
                debug!(stack = %env.stack_name, "stack unchanged, reading existing outputs");
                let outputs = self
                    .platform
                    .describe_stack(&env.stack_name)
                    .await
                    .map_err(|source| DeployError::InfrastructureApply {
                        stack: env.stack_name.clone(),
                        source,
                    })?;
                (outputs, false)
            }
            Err(source) => {
                warn!(stack = %env.stack_name, error = %source, "stack apply failed");
                return Err(DeployError::InfrastructureApply {
                    stack: env.stack_name.clone(),
                    source,
                });
            }
        };

        let endpoint = required_output(&outputs, &env.stack_name, &env.outputs.endpoint)?;
        let raw_revision = required_output(&outputs, &env.stack_name, &env.outputs.revision)?;
        let declared_revision =
            raw_revision
                .trim()
                .parse::<RevisionNumber>()
                .map_err(|_| DeployError::InvalidOutput {
                    stack: env.stack_name.clone(),
                    key: env.outputs.revision.clone(),
                    value: raw_revision.clone(),
                })?;

        env.declared_revision = Some(declared_revision);
        env.endpoint = Some(endpoint.clone());

        info!(
            environment = %env.name,
            %endpoint,
            revision = declared_revision,
            changed,
            "stack applied"
        );

        Ok(StackApplied {
            endpoint,
            declared_revision,
            changed,
        })
    }
}

fn required_output(outputs: &StackOutputs, stack: &str, key: &str) -> DeployResult<String> {
    outputs
        .get(key)
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .ok_or_else(|| DeployError::MissingOutput {
            stack: stack.to_string(),
            key: key.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{environment, sandbox};
    use rollgate_core::EnvironmentName;

    fn env() -> Environment {
        environment(EnvironmentName::Staging)
    }

    #[tokio::test]
    async fn apply_declares_revision_and_endpoint() {
        let platform = sandbox().await;
        let deployer = StackDeployer::new(Arc::new(platform));
        let mut env = env();

        let applied = deployer
            .apply(&mut env, &DeployableRevision::new("sha:abc123", "abc123"))
            .await
            .unwrap();

        assert_eq!(applied.endpoint, "http://stg.example/");
        assert_eq!(applied.declared_revision, 1);
        assert!(applied.changed);
        assert_eq!(env.declared_revision, Some(1));
        assert_eq!(env.endpoint.as_deref(), Some("http://stg.example/"));
    }

    #[tokio::test]
    async fn apply_twice_is_idempotent() {
        let platform = sandbox().await;
        let deployer = StackDeployer::new(Arc::new(platform.clone()));
        let artifact = DeployableRevision::new("sha:abc123", "abc123");
        let mut env = env();

        let first = deployer.apply(&mut env, &artifact).await.unwrap();
        let second = deployer.apply(&mut env, &artifact).await.unwrap();

        assert_eq!(first.declared_revision, second.declared_revision);
        assert_eq!(first.endpoint, second.endpoint);
        assert!(!second.changed);
        assert_eq!(platform.latest_revision("web-staging").await, Some(1));
    }

    #[tokio::test]
    async fn artifact_without_commit_is_refused() {
        let platform = sandbox().await;
        let deployer = StackDeployer::new(Arc::new(platform.clone()));
        let mut env = env();

        let err = deployer
            .apply(&mut env, &DeployableRevision::new("sha:abc123", ""))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InvalidArtifact { .. }));
        assert_eq!(err.kind(), rollgate_core::FailureKind::Platform);
        assert_eq!(platform.call_count("apply_stack").await, 0);
        assert_eq!(env.declared_revision, None);
    }

    #[tokio::test]
    async fn apply_failure_is_infrastructure_error() {
        let platform = sandbox().await;
        platform
            .fail_next_apply(
                "web-stg",
                PlatformError::InvalidParameters("Subnets: malformed".to_string()),
            )
            .await;
        let deployer = StackDeployer::new(Arc::new(platform));
        let mut env = env();

        let err = deployer
            .apply(&mut env, &DeployableRevision::new("sha:abc123", "abc123"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InfrastructureApply { .. }));
        assert!(err.details()[0].contains("Subnets"));
        assert_eq!(env.declared_revision, None);
    }

    #[tokio::test]
    async fn missing_endpoint_output_is_fatal() {
        let platform = sandbox().await;
        platform.drop_output("web-stg", "ServiceUrl").await;
        let deployer = StackDeployer::new(Arc::new(platform));
        let mut env = env();

        let err = deployer
            .apply(&mut env, &DeployableRevision::new("sha:abc123", "abc123"))
            .await
            .unwrap_err();

        match err {
            DeployError::MissingOutput { key, .. } => assert_eq!(key, "ServiceUrl"),
            other => panic!("expected MissingOutput, got {other:?}"),
        }
        assert_eq!(env.endpoint, None);
    }

    #[tokio::test]
    async fn empty_role_is_rejected_by_platform() {
        let platform = sandbox().await;
        let deployer = StackDeployer::new(Arc::new(platform));
        let mut env = env();
        env.infrastructure.execution_role.clear();

        let err = deployer
            .apply(&mut env, &DeployableRevision::new("sha:abc123", "abc123"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::InfrastructureApply {
                source: PlatformError::AccessDenied(_),
                ..
            }
        ));
    }
}
