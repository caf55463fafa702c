//! Domain types shared by every Rollgate crate.
//!
//! These types describe what is being promoted (the artifact), where it is
//! going (environments), what the platform records about it (revision
//! records), and what the pipeline observed while promoting it (stage
//! results). All of them serialize to JSON for the audit store.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Revision numbers are strictly increasing per service family, starting at 1.
pub type RevisionNumber = u64;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Artifact ──────────────────────────────────────────────────────

/// One immutable build artifact, produced by the external build step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployableRevision {
    /// Content-addressed reference, e.g. `sha:abc123` or `registry/app@sha256:...`.
    reference: String,
    /// Source commit the artifact was built from.
    commit: String,
}

impl DeployableRevision {
    pub fn new(reference: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            commit: commit.into(),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Whether both identifiers are present.
    pub fn is_valid(&self) -> bool {
        !self.reference.trim().is_empty() && !self.commit.trim().is_empty()
    }
}

impl fmt::Display for DeployableRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reference, self.commit)
    }
}

// ── Environment ───────────────────────────────────────────────────

/// The two deployment targets, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentName {
    Staging,
    Production,
}

impl EnvironmentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentName::Staging => "staging",
            EnvironmentName::Production => "production",
        }
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network placement and role references passed to the stack template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InfrastructureParams {
    pub execution_role: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
}

impl InfrastructureParams {
    /// Subnets followed by security groups, as the template expects them.
    pub fn network_placement_refs(&self) -> Vec<String> {
        self.subnets
            .iter()
            .chain(self.security_groups.iter())
            .cloned()
            .collect()
    }
}

/// Platform-side deployment circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    /// Let the platform revert to the previous deployment when it trips.
    pub rollback: bool,
    /// Failed task launches tolerated before the breaker trips.
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            rollback: true,
            failure_threshold: 3,
        }
    }
}

/// How a rolling update may behave in one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    /// Upper bound on tasks running at once during a rollout.
    pub max_running_count: u32,
    pub circuit_breaker: CircuitBreakerPolicy,
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            max_running_count: 2,
            circuit_breaker: CircuitBreakerPolicy::default(),
        }
    }
}

/// Names of the stack outputs the pipeline depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputKeys {
    pub endpoint: String,
    pub revision: String,
}

impl Default for OutputKeys {
    fn default() -> Self {
        Self {
            endpoint: "ServiceUrl".to_string(),
            revision: "TaskRevision".to_string(),
        }
    }
}

/// A named deployment target and what the pipeline knows about it.
///
/// `declared_revision` is what the last stack apply declared;
/// `running_revision` is what the last rollout confirmed stable. They may
/// differ only while a rollout is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub service_family: String,
    pub cluster: String,
    pub service: String,
    pub stack_name: String,
    pub template: String,
    pub infrastructure: InfrastructureParams,
    pub policy: DeploymentPolicy,
    pub outputs: OutputKeys,
    pub declared_revision: Option<RevisionNumber>,
    pub running_revision: Option<RevisionNumber>,
    pub endpoint: Option<String>,
}

impl Environment {
    /// Declared and running revisions agree.
    pub fn is_converged(&self) -> bool {
        matches!(
            (self.declared_revision, self.running_revision),
            (Some(declared), Some(running)) if declared == running
        )
    }
}

// ── Revisions ─────────────────────────────────────────────────────

/// Registration status of a service revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    Active,
    Inactive,
}

/// An immutable, numbered service definition registered against a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRevisionRecord {
    pub family: String,
    pub revision: RevisionNumber,
    /// Platform-assigned identity, e.g. `web:9`.
    pub identity: String,
    pub status: RevisionStatus,
    pub registered_at: u64,
    /// User-intent fields only (image, cpu, memory, env, ...).
    pub definition: serde_json::Map<String, serde_json::Value>,
}

// ── Stages ────────────────────────────────────────────────────────

/// The executors a pipeline run can invoke, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    StagingDeploy,
    StagingUpdate,
    StagingGate,
    ProdDeploy,
    ProdUpdate,
    ProdGate,
    Rollback,
}

impl Stage {
    /// Forward stages, excluding the rollback side path.
    pub const FORWARD: [Stage; 6] = [
        Stage::StagingDeploy,
        Stage::StagingUpdate,
        Stage::StagingGate,
        Stage::ProdDeploy,
        Stage::ProdUpdate,
        Stage::ProdGate,
    ];

    pub fn environment(&self) -> EnvironmentName {
        match self {
            Stage::StagingDeploy | Stage::StagingUpdate | Stage::StagingGate => {
                EnvironmentName::Staging
            }
            Stage::ProdDeploy | Stage::ProdUpdate | Stage::ProdGate | Stage::Rollback => {
                EnvironmentName::Production
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::StagingDeploy => "staging_deploy",
            Stage::StagingUpdate => "staging_update",
            Stage::StagingGate => "staging_gate",
            Stage::ProdDeploy => "prod_deploy",
            Stage::ProdUpdate => "prod_update",
            Stage::ProdGate => "prod_gate",
            Stage::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

/// Failure taxonomy recorded on a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InfrastructureApply,
    MissingOutput,
    StabilizationTimeout,
    DeploymentRejected,
    GateFailure,
    NoPriorRevision,
    Platform,
    Cancelled,
}

/// Diagnostic payload of a failed (or cancelled) stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Platform-provided reasons, failing test names, and similar.
    #[serde(default)]
    pub details: Vec<String>,
    /// An operator may re-run after investigating.
    #[serde(default)]
    pub retryable: bool,
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl StageResult {
    pub fn success(stage: Stage, outputs: BTreeMap<String, String>, started_at_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            outputs,
            failure: None,
            started_at_ms,
            finished_at_ms: now_ms(),
        }
    }

    pub fn failed(stage: Stage, failure: StageFailure, started_at_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            outputs: BTreeMap::new(),
            failure: Some(failure),
            started_at_ms,
            finished_at_ms: now_ms(),
        }
    }

    /// A stage that never ran. `reason` is set for cancellations.
    pub fn skipped(stage: Stage, reason: Option<StageFailure>) -> Self {
        let at = now_ms();
        Self {
            stage,
            status: StageStatus::Skipped,
            outputs: BTreeMap::new(),
            failure: reason,
            started_at_ms: at,
            finished_at_ms: at,
        }
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }
}

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    RolledBack,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::RolledBack => "rolled_back",
        })
    }
}
