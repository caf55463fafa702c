//! Platform API traits and the wire types they exchange.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rollgate_core::{CircuitBreakerPolicy, DeploymentPolicy, RevisionNumber, ServiceRevisionRecord};

use crate::error::PlatformResult;

/// Raw revision definition as the platform returns it, metadata included.
pub type RawDefinition = serde_json::Map<String, serde_json::Value>;

/// Stack outputs by output key.
pub type StackOutputs = BTreeMap<String, String>;

/// Definition fields the platform assigns on registration.
///
/// A registration request carrying any of these is rejected.
pub const PLATFORM_ASSIGNED_FIELDS: &[&str] = &[
    "identity",
    "family",
    "revision",
    "status",
    "registered_at",
    "registered_by",
    "deregistered_at",
    "compatibilities",
    "requires_attributes",
];

// ── Infrastructure ────────────────────────────────────────────────

/// Template parameters for one environment's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackParams {
    pub environment_name: String,
    pub artifact_reference: String,
    pub execution_role_ref: String,
    pub network_placement_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRequest {
    pub stack_name: String,
    pub template: String,
    pub params: StackParams,
}

#[async_trait]
pub trait InfrastructurePlatform: Send + Sync {
    /// Create or update a stack. An unchanged stack yields `PlatformError::NoChanges`.
    async fn apply_stack(&self, request: &StackRequest) -> PlatformResult<StackOutputs>;

    async fn describe_stack(&self, stack_name: &str) -> PlatformResult<StackOutputs>;
}

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub cluster: String,
    pub service: String,
    /// Explicit target revision; `None` keeps the service's current definition.
    pub revision: Option<RevisionNumber>,
    pub force_new_deployment: bool,
    pub policy: DeploymentPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Primary,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    InProgress,
    Completed,
    Failed,
}

/// One deployment of a service, as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub id: String,
    pub revision: RevisionNumber,
    pub status: DeploymentStatus,
    pub rollout_state: RolloutState,
    pub rollout_state_reason: Option<String>,
    pub running_count: u32,
    pub desired_count: u32,
    pub failed_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub running_count: u32,
    pub desired_count: u32,
    pub deployments: Vec<ServiceDeployment>,
    pub circuit_breaker: CircuitBreakerPolicy,
}

impl ServiceDescription {
    pub fn primary(&self) -> Option<&ServiceDeployment> {
        self.deployments
            .iter()
            .find(|d| d.status == DeploymentStatus::Primary)
    }

    /// The newest deployment targeting `revision`.
    pub fn deployment_for(&self, revision: RevisionNumber) -> Option<&ServiceDeployment> {
        self.deployments.iter().rev().find(|d| d.revision == revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub revision: RevisionNumber,
    pub last_status: TaskStatus,
}

/// A definition to register under a family, user-intent fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub family: String,
    pub definition: RawDefinition,
}

#[async_trait]
pub trait ClusterPlatform: Send + Sync {
    async fn update_service(&self, update: &ServiceUpdate) -> PlatformResult<()>;

    async fn describe_service(&self, cluster: &str, service: &str)
        -> PlatformResult<ServiceDescription>;

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<TaskRef>>;

    /// Register a definition. Always appends a new revision number.
    async fn register_revision(
        &self,
        request: RegistrationRequest,
    ) -> PlatformResult<ServiceRevisionRecord>;

    async fn describe_revision(
        &self,
        family: &str,
        revision: RevisionNumber,
    ) -> PlatformResult<RawDefinition>;
}

// ── Gate suites ───────────────────────────────────────────────────

/// Result of executing a suite once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteOutcome {
    pub success: bool,
    /// Names of failing tests, when the suite reports them.
    pub failures: Vec<String>,
    /// Captured suite output, verbatim.
    pub output: String,
}

#[async_trait]
pub trait GateSuite: Send + Sync {
    async fn execute(&self, suite_id: &str, base_url: &str) -> PlatformResult<SuiteOutcome>;
}
