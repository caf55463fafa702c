//! SandboxPlatform: an in-process infrastructure and cluster platform.
//!
//! The sandbox keeps every piece of platform state behind one async lock:
//! applied stacks (with a fingerprint of their template and parameters),
//! an append-only revision store per family, and a small simulation of
//! each service's deployments and tasks. A rolling update advances one
//! step per `describe_service` call, so pollers observe the same
//! in-progress → completed (or failed) sequence a real cluster reports.
//!
//! Fault hooks (`fail_next_apply`, `drop_output`, `set_rollout_behavior`)
//! let tests and dry runs exercise every failure path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use rollgate_core::config::{Config, ConfigError, PlatformSettings};
use rollgate_core::{
    CircuitBreakerPolicy, EnvironmentName, OutputKeys, RevisionNumber, RevisionStatus,
    ServiceRevisionRecord, now_ms,
};

use crate::api::*;
use crate::error::{PlatformError, PlatformResult};

/// What the stack template provisions for a stack name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBinding {
    /// Revision family the stack registers definitions under.
    pub family: String,
    pub cluster: String,
    pub service: String,
    /// Public URL exported through the endpoint output.
    pub endpoint: String,
    pub desired_count: u32,
    pub outputs: OutputKeys,
}

/// How the next rollouts of a service behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutBehavior {
    /// Converge after this many `describe_service` polls.
    Stabilize { polls: u32 },
    /// Fail task launches until the deployment circuit breaker trips.
    TripCircuitBreaker,
    /// Stay in progress forever.
    NeverStabilize,
}

impl Default for RolloutBehavior {
    fn default() -> Self {
        Self::Stabilize { polls: 1 }
    }
}

#[derive(Debug)]
struct StackRecord {
    fingerprint: String,
    outputs: StackOutputs,
}

#[derive(Debug, Clone)]
struct StoredRevision {
    record: ServiceRevisionRecord,
    registered_by: String,
}

#[derive(Debug)]
struct ServiceSim {
    family: String,
    desired_count: u32,
    /// Definition new deployments use when no revision is given.
    task_revision: Option<RevisionNumber>,
    deployments: Vec<ServiceDeployment>,
    tasks: Vec<TaskRef>,
    breaker: CircuitBreakerPolicy,
    behavior: RolloutBehavior,
    polls_remaining: u32,
    next_deployment: u32,
}

impl ServiceSim {
    fn new(family: &str, desired_count: u32) -> Self {
        Self {
            family: family.to_string(),
            desired_count,
            task_revision: None,
            deployments: Vec::new(),
            tasks: Vec::new(),
            breaker: CircuitBreakerPolicy::default(),
            behavior: RolloutBehavior::default(),
            polls_remaining: 0,
            next_deployment: 1,
        }
    }

    fn start_deployment(&mut self, revision: RevisionNumber, desired: u32) {
        for deployment in &mut self.deployments {
            deployment.status = DeploymentStatus::Active;
        }
        self.deployments.push(ServiceDeployment {
            id: format!("deployment-{}", self.next_deployment),
            revision,
            status: DeploymentStatus::Primary,
            rollout_state: RolloutState::InProgress,
            rollout_state_reason: None,
            running_count: 0,
            desired_count: desired,
            failed_tasks: 0,
        });
        self.next_deployment += 1;
        self.polls_remaining = match self.behavior {
            RolloutBehavior::Stabilize { polls } => polls.max(1),
            _ => 0,
        };
    }

    /// Advance an in-progress rollout by one poll.
    fn tick(&mut self) {
        let Some(index) = self.deployments.iter().position(|d| {
            d.status == DeploymentStatus::Primary && d.rollout_state == RolloutState::InProgress
        }) else {
            return;
        };
        let revision = self.deployments[index].revision;
        let desired = self.deployments[index].desired_count;

        match self.behavior {
            RolloutBehavior::Stabilize { .. } => {
                self.polls_remaining = self.polls_remaining.saturating_sub(1);
                if self.polls_remaining == 0 {
                    let mut done = self.deployments.remove(index);
                    done.running_count = desired;
                    done.rollout_state = RolloutState::Completed;
                    done.rollout_state_reason =
                        Some("deployment completed successfully".to_string());
                    self.deployments = vec![done];
                    self.tasks = tasks_for(revision, desired);
                } else {
                    let partial = desired / 2;
                    self.deployments[index].running_count = partial;
                    self.tasks.retain(|t| t.revision != revision);
                    self.tasks.extend(tasks_for(revision, partial));
                }
            }
            RolloutBehavior::NeverStabilize => {
                self.deployments[index].running_count = desired.saturating_sub(1);
            }
            RolloutBehavior::TripCircuitBreaker => {
                let threshold = self.breaker.failure_threshold.max(1);
                self.deployments[index].failed_tasks = threshold;
                if !self.breaker.enabled {
                    return;
                }
                let failed = &mut self.deployments[index];
                failed.status = DeploymentStatus::Active;
                failed.rollout_state = RolloutState::Failed;
                failed.running_count = 0;
                failed.rollout_state_reason = Some(format!(
                    "deployment circuit breaker: {threshold} tasks failed to start"
                ));

                if self.breaker.rollback {
                    // Restore the most recent deployment before the failed one.
                    if let Some(previous) = self.deployments[..index].last_mut() {
                        previous.status = DeploymentStatus::Primary;
                        previous.rollout_state = RolloutState::Completed;
                        previous.running_count = previous.desired_count;
                        let restored = previous.revision;
                        let count = previous.desired_count;
                        self.task_revision = Some(restored);
                        self.tasks = tasks_for(restored, count);
                    }
                }
            }
        }
    }

    fn describe(&self) -> ServiceDescription {
        ServiceDescription {
            running_count: self.deployments.iter().map(|d| d.running_count).sum(),
            desired_count: self.desired_count,
            deployments: self.deployments.clone(),
            circuit_breaker: self.breaker,
        }
    }
}

fn tasks_for(revision: RevisionNumber, count: u32) -> Vec<TaskRef> {
    (0..count)
        .map(|i| TaskRef {
            id: format!("task-{revision}-{i}"),
            revision,
            last_status: TaskStatus::Running,
        })
        .collect()
}

#[derive(Debug, Default)]
struct SandboxState {
    bindings: HashMap<String, StackBinding>,
    stacks: HashMap<String, StackRecord>,
    families: HashMap<String, Vec<StoredRevision>>,
    services: HashMap<String, ServiceSim>,
    apply_failures: HashMap<String, PlatformError>,
    dropped_outputs: HashMap<String, Vec<String>>,
    calls: Vec<String>,
}

impl SandboxState {
    fn register(
        &mut self,
        family: &str,
        definition: RawDefinition,
        registered_by: &str,
    ) -> ServiceRevisionRecord {
        let revisions = self.families.entry(family.to_string()).or_default();
        let revision = revisions.last().map_or(1, |r| r.record.revision + 1);
        let record = ServiceRevisionRecord {
            family: family.to_string(),
            revision,
            identity: format!("{family}:{revision}"),
            status: RevisionStatus::Active,
            registered_at: now_ms(),
            definition,
        };
        revisions.push(StoredRevision {
            record: record.clone(),
            registered_by: registered_by.to_string(),
        });
        debug!(%family, revision, "revision registered");
        record
    }

    fn revision_exists(&self, family: &str, revision: RevisionNumber) -> bool {
        self.families
            .get(family)
            .is_some_and(|revs| revs.iter().any(|r| r.record.revision == revision))
    }
}

fn service_key(cluster: &str, service: &str) -> String {
    format!("{cluster}/{service}")
}

/// Sha256 over the template and its JSON-encoded parameters.
fn fingerprint(request: &StackRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.template.as_bytes());
    hasher.update(serde_json::to_vec(&request.params).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Thread-safe in-process platform. Clones share state.
#[derive(Clone, Default)]
pub struct SandboxPlatform {
    settings: PlatformSettings,
    state: Arc<RwLock<SandboxState>>,
}

impl SandboxPlatform {
    pub fn new(settings: PlatformSettings) -> Self {
        Self {
            settings,
            state: Arc::new(RwLock::new(SandboxState::default())),
        }
    }

    /// Build a sandbox whose stacks match the configured environments.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let platform = Self::new(config.platform.clone());
        for name in [EnvironmentName::Staging, EnvironmentName::Production] {
            let env = config.environment(name)?;
            platform
                .bind_stack(
                    &env.stack_name,
                    StackBinding {
                        family: env.service_family.clone(),
                        cluster: env.cluster.clone(),
                        service: env.service.clone(),
                        endpoint: format!("https://{}.sandbox.local/", env.stack_name),
                        desired_count: env.policy.max_running_count.max(1),
                        outputs: env.outputs.clone(),
                    },
                )
                .await;
        }
        Ok(platform)
    }

    pub fn settings(&self) -> &PlatformSettings {
        &self.settings
    }

    /// Declare what applying `stack_name` provisions.
    pub async fn bind_stack(&self, stack_name: &str, binding: StackBinding) {
        let mut state = self.state.write().await;
        state
            .services
            .entry(service_key(&binding.cluster, &binding.service))
            .or_insert_with(|| ServiceSim::new(&binding.family, binding.desired_count));
        state.bindings.insert(stack_name.to_string(), binding);
    }

    /// Register a definition directly, bypassing any stack.
    pub async fn seed_revision(&self, family: &str, definition: RawDefinition) -> ServiceRevisionRecord {
        self.state.write().await.register(family, definition, "seed")
    }

    /// Mark a service as stably running `revision`.
    pub async fn seed_service(
        &self,
        cluster: &str,
        service: &str,
        revision: RevisionNumber,
    ) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        let key = service_key(cluster, service);
        let family = state
            .services
            .get(&key)
            .map(|s| s.family.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))?;
        if !state.revision_exists(&family, revision) {
            return Err(PlatformError::NotFound(format!("revision {family}:{revision}")));
        }

        let sim = state
            .services
            .get_mut(&key)
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))?;
        let desired = sim.desired_count;
        sim.task_revision = Some(revision);
        sim.deployments = vec![ServiceDeployment {
            id: format!("deployment-{}", sim.next_deployment),
            revision,
            status: DeploymentStatus::Primary,
            rollout_state: RolloutState::Completed,
            rollout_state_reason: None,
            running_count: desired,
            desired_count: desired,
            failed_tasks: 0,
        }];
        sim.next_deployment += 1;
        sim.tasks = tasks_for(revision, desired);
        Ok(())
    }

    pub async fn set_rollout_behavior(&self, cluster: &str, service: &str, behavior: RolloutBehavior) {
        let mut state = self.state.write().await;
        if let Some(sim) = state.services.get_mut(&service_key(cluster, service)) {
            sim.behavior = behavior;
        }
    }

    /// Fail the next apply of `stack_name` with `error`.
    pub async fn fail_next_apply(&self, stack_name: &str, error: PlatformError) {
        self.state
            .write()
            .await
            .apply_failures
            .insert(stack_name.to_string(), error);
    }

    /// Omit an output key from future applies of `stack_name`.
    pub async fn drop_output(&self, stack_name: &str, key: &str) {
        self.state
            .write()
            .await
            .dropped_outputs
            .entry(stack_name.to_string())
            .or_default()
            .push(key.to_string());
    }

    /// Highest revision registered for a family.
    pub async fn latest_revision(&self, family: &str) -> Option<RevisionNumber> {
        self.state
            .read()
            .await
            .families
            .get(family)
            .and_then(|revs| revs.last())
            .map(|r| r.record.revision)
    }

    /// Every API call received, as `"{operation} {target}"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls to `operation` against any target.
    pub async fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation} ");
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl InfrastructurePlatform for SandboxPlatform {
    async fn apply_stack(&self, request: &StackRequest) -> PlatformResult<StackOutputs> {
        let mut state = self.state.write().await;
        state.calls.push(format!("apply_stack {}", request.stack_name));

        if let Some(error) = state.apply_failures.remove(&request.stack_name) {
            warn!(stack = %request.stack_name, %error, "injected apply failure");
            return Err(error);
        }

        let binding = state
            .bindings
            .get(&request.stack_name)
            .cloned()
            .ok_or_else(|| {
                PlatformError::InvalidParameters(format!(
                    "template {} has no stack named {}",
                    request.template, request.stack_name
                ))
            })?;

        let params = &request.params;
        if params.execution_role_ref.trim().is_empty() {
            return Err(PlatformError::AccessDenied(
                "execution role reference is required to pass a role to the service".to_string(),
            ));
        }
        if params.artifact_reference.trim().is_empty() {
            return Err(PlatformError::InvalidParameters(
                "artifact reference must not be empty".to_string(),
            ));
        }

        let fingerprint = fingerprint(request);
        if state
            .stacks
            .get(&request.stack_name)
            .is_some_and(|s| s.fingerprint == fingerprint)
        {
            debug!(stack = %request.stack_name, "no changes to apply");
            return Err(PlatformError::NoChanges);
        }

        let definition = json!({
            "image": params.artifact_reference,
            "environment": params.environment_name,
            "execution_role": params.execution_role_ref,
            "network": params.network_placement_refs,
            "cpu": 256,
            "memory": 512,
        });
        let Value::Object(definition) = definition else {
            return Err(PlatformError::Other("definition is not an object".to_string()));
        };
        let record = state.register(
            &binding.family,
            definition,
            &format!("stack/{}", request.stack_name),
        );

        let key = service_key(&binding.cluster, &binding.service);
        state
            .services
            .entry(key)
            .or_insert_with(|| ServiceSim::new(&binding.family, binding.desired_count))
            .task_revision = Some(record.revision);

        let dropped = state
            .dropped_outputs
            .get(&request.stack_name)
            .cloned()
            .unwrap_or_default();
        let mut outputs = StackOutputs::new();
        outputs.insert(binding.outputs.endpoint.clone(), binding.endpoint.clone());
        outputs.insert(binding.outputs.revision.clone(), record.revision.to_string());
        outputs.retain(|key, _| !dropped.contains(key));

        state.stacks.insert(
            request.stack_name.clone(),
            StackRecord {
                fingerprint,
                outputs: outputs.clone(),
            },
        );
        info!(stack = %request.stack_name, revision = record.revision, "stack applied");
        Ok(outputs)
    }

    async fn describe_stack(&self, stack_name: &str) -> PlatformResult<StackOutputs> {
        let mut state = self.state.write().await;
        state.calls.push(format!("describe_stack {stack_name}"));
        state
            .stacks
            .get(stack_name)
            .map(|s| s.outputs.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("stack {stack_name}")))
    }
}

#[async_trait]
impl ClusterPlatform for SandboxPlatform {
    async fn update_service(&self, update: &ServiceUpdate) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        let key = service_key(&update.cluster, &update.service);
        state.calls.push(format!("update_service {key}"));

        let family = state
            .services
            .get(&key)
            .map(|s| s.family.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))?;
        if let Some(revision) = update.revision
            && !state.revision_exists(&family, revision)
        {
            return Err(PlatformError::InvalidParameters(format!(
                "revision {family}:{revision} is not registered"
            )));
        }

        let sim = state
            .services
            .get_mut(&key)
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))?;
        let target = update.revision.or(sim.task_revision).ok_or_else(|| {
            PlatformError::InvalidParameters(format!("service {key} has no task definition"))
        })?;

        let unchanged = sim.deployments.len() == 1
            && sim.deployments[0].revision == target
            && sim.deployments[0].rollout_state == RolloutState::Completed;
        if unchanged && !update.force_new_deployment {
            debug!(service = %key, revision = target, "service already on revision");
            return Ok(());
        }

        sim.task_revision = Some(target);
        sim.breaker = update.policy.circuit_breaker;
        let desired = match update.policy.max_running_count {
            0 => sim.desired_count,
            max => sim.desired_count.min(max),
        };
        sim.start_deployment(target, desired);
        info!(service = %key, revision = target, desired, "rollout started");
        Ok(())
    }

    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> PlatformResult<ServiceDescription> {
        let mut state = self.state.write().await;
        let key = service_key(cluster, service);
        state.calls.push(format!("describe_service {key}"));
        let sim = state
            .services
            .get_mut(&key)
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))?;
        sim.tick();
        Ok(sim.describe())
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<TaskRef>> {
        let mut state = self.state.write().await;
        let key = service_key(cluster, service);
        state.calls.push(format!("list_tasks {key}"));
        state
            .services
            .get(&key)
            .map(|s| s.tasks.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("service {key}")))
    }

    async fn register_revision(
        &self,
        request: RegistrationRequest,
    ) -> PlatformResult<ServiceRevisionRecord> {
        let mut state = self.state.write().await;
        state.calls.push(format!("register_revision {}", request.family));

        if let Some(field) = PLATFORM_ASSIGNED_FIELDS
            .iter()
            .find(|f| request.definition.contains_key(**f))
        {
            return Err(PlatformError::InvalidParameters(format!(
                "unexpected platform-assigned field {field:?} in registration"
            )));
        }
        Ok(state.register(&request.family, request.definition, "registration"))
    }

    async fn describe_revision(
        &self,
        family: &str,
        revision: RevisionNumber,
    ) -> PlatformResult<RawDefinition> {
        let mut state = self.state.write().await;
        state.calls.push(format!("describe_revision {family}:{revision}"));
        let stored = state
            .families
            .get(family)
            .and_then(|revs| revs.iter().find(|r| r.record.revision == revision))
            .ok_or_else(|| PlatformError::NotFound(format!("revision {family}:{revision}")))?;

        let record = &stored.record;
        let mut raw = record.definition.clone();
        raw.insert("identity".into(), json!(record.identity));
        raw.insert("family".into(), json!(record.family));
        raw.insert("revision".into(), json!(record.revision));
        raw.insert("status".into(), json!(record.status));
        raw.insert("registered_at".into(), json!(record.registered_at));
        raw.insert("registered_by".into(), json!(stored.registered_by));
        raw.insert("compatibilities".into(), json!(["sandbox"]));
        raw.insert("requires_attributes".into(), json!([]));
        Ok(raw)
    }
}
