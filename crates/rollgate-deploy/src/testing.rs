//! Shared fixtures for executor tests.

use std::time::Duration;

use rollgate_core::config::RolloutSettings;
use rollgate_core::{
    DeploymentPolicy, Environment, EnvironmentName, InfrastructureParams, OutputKeys,
};
use rollgate_platform::{SandboxPlatform, StackBinding};

pub(crate) fn environment(name: EnvironmentName) -> Environment {
    let (short, family) = match name {
        EnvironmentName::Staging => ("stg", "web-staging"),
        EnvironmentName::Production => ("prod", "web-production"),
    };
    Environment {
        name,
        service_family: family.to_string(),
        cluster: short.to_string(),
        service: "web".to_string(),
        stack_name: format!("web-{short}"),
        template: "infra/service.yml".to_string(),
        infrastructure: InfrastructureParams {
            execution_role: "role/exec".to_string(),
            subnets: vec!["subnet-a".to_string()],
            security_groups: vec!["sg-1".to_string()],
            assign_public_ip: false,
        },
        policy: DeploymentPolicy::default(),
        outputs: OutputKeys::default(),
        declared_revision: None,
        running_revision: None,
        endpoint: None,
    }
}

/// Sandbox with both environments' stacks bound.
pub(crate) async fn sandbox() -> SandboxPlatform {
    let platform = SandboxPlatform::default();
    for name in [EnvironmentName::Staging, EnvironmentName::Production] {
        let env = environment(name);
        platform
            .bind_stack(
                &env.stack_name,
                StackBinding {
                    family: env.service_family.clone(),
                    cluster: env.cluster.clone(),
                    service: env.service.clone(),
                    endpoint: format!("http://{}.example/", env.cluster),
                    desired_count: 2,
                    outputs: OutputKeys::default(),
                },
            )
            .await;
    }
    platform
}

pub(crate) fn fast_rollout(max_attempts: u32) -> RolloutSettings {
    RolloutSettings {
        poll_interval: Duration::from_millis(1),
        max_attempts,
        timeout: Duration::from_secs(5),
    }
}
