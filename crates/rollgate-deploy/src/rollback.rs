//! Rollback resolver.
//!
//! "Previous" is the active revision number minus one. A registration made
//! outside the pipeline can occupy that number with an unrelated
//! definition; the resolver does not detect this and will replay it.

use std::sync::Arc;

use tracing::{error, info, warn};

use rollgate_core::{Environment, RevisionNumber, ServiceRevisionRecord};
use rollgate_platform::{
    ClusterPlatform, PLATFORM_ASSIGNED_FIELDS, RawDefinition, RegistrationRequest,
};

use crate::error::{DeployError, DeployResult};

pub struct RollbackResolver {
    cluster: Arc<dyn ClusterPlatform>,
}

impl RollbackResolver {
    pub fn new(cluster: Arc<dyn ClusterPlatform>) -> Self {
        Self { cluster }
    }

    /// Re-register the definition of the revision before the active one.
    ///
    /// The returned record always carries a fresh revision number greater
    /// than the active one; roll the service onto it to complete the
    /// rollback.
    pub async fn resolve_previous(&self, env: &Environment) -> DeployResult<ServiceRevisionRecord> {
        let current = self.active_revision(env).await?;
        let family = &env.service_family;

        let Some(previous) = current.checked_sub(1).filter(|p| *p >= 1) else {
            error!(
                %family,
                current,
                "no prior revision to roll back to; production stays on the current revision"
            );
            return Err(DeployError::NoPriorRevision {
                family: family.clone(),
                current,
            });
        };

        let raw = self.cluster.describe_revision(family, previous).await?;
        let definition = strip_platform_fields(raw);

        let record = self
            .cluster
            .register_revision(RegistrationRequest {
                family: family.clone(),
                definition,
            })
            .await?;

        if record.revision <= current {
            warn!(
                %family,
                current,
                registered = record.revision,
                "registration did not produce a newer revision"
            );
        }
        info!(
            %family,
            current,
            source = previous,
            registered = record.revision,
            "rollback revision registered"
        );
        Ok(record)
    }

    /// Revision the primary deployment runs, falling back to the last one
    /// this pipeline saw stable.
    async fn active_revision(&self, env: &Environment) -> DeployResult<RevisionNumber> {
        let desc = self
            .cluster
            .describe_service(&env.cluster, &env.service)
            .await?;
        desc.primary()
            .map(|d| d.revision)
            .or(env.running_revision)
            .ok_or_else(|| DeployError::NoPriorRevision {
                family: env.service_family.clone(),
                current: 0,
            })
    }
}

/// Drop every field the platform assigns on registration.
fn strip_platform_fields(mut definition: RawDefinition) -> RawDefinition {
    for field in PLATFORM_ASSIGNED_FIELDS {
        definition.remove(*field);
    }
    definition
}
