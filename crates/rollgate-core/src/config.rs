//! rollgate.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::{
    CircuitBreakerPolicy, DeploymentPolicy, Environment, EnvironmentName, InfrastructureParams,
    OutputKeys,
};

/// Errors found while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration {value:?} for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("missing environment: {0}")]
    MissingEnvironment(EnvironmentName),

    #[error("environment {environment}: {field} must not be empty")]
    EmptyField { environment: String, field: String },

    #[error("environment {environment} references undeclared suite {suite:?}")]
    UnknownSuite { environment: String, suite: String },

    #[error("suite {0:?} has an empty command")]
    EmptySuiteCommand(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub platform: PlatformSettings,
    /// Keyed by environment name (`staging`, `production`).
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub suites: BTreeMap<String, SuiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub service_family: String,
    pub template: String,
    #[serde(default = "default_rollback_marker")]
    pub rollback_marker: String,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub gate: GateConfig,
}

fn default_rollback_marker() -> String {
    "[rollback]".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rollout_timeout")]
    pub timeout: String,
}

fn default_poll_interval() -> String {
    "15s".to_string()
}

fn default_max_attempts() -> u32 {
    40
}

fn default_rollout_timeout() -> String {
    "15m".to_string()
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
            timeout: default_rollout_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_settle_delay")]
    pub settle_delay: String,
}

fn default_settle_delay() -> String {
    "30s".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
        }
    }
}

/// Access settings handed to platform clients at construction.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PlatformSettings {
    pub region: Option<String>,
    pub profile: Option<String>,
    /// Override for the platform API endpoint (local emulators).
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Revision family; defaults to `{service_family}-{environment}`.
    pub family: Option<String>,
    pub cluster: String,
    pub service: String,
    pub stack_name: String,
    pub execution_role: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
    pub suite: String,
    #[serde(default)]
    pub policy: PolicyConfig,
    pub endpoint_output: Option<String>,
    pub revision_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_max_running")]
    pub max_running_count: u32,
    #[serde(default = "default_true")]
    pub circuit_breaker: bool,
    #[serde(default = "default_true")]
    pub breaker_rollback: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_max_running() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_running_count: default_max_running(),
            circuit_breaker: true,
            breaker_rollback: true,
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub command: Vec<String>,
    pub timeout: Option<String>,
    pub working_dir: Option<String>,
}

/// Resolved polling parameters for the service updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_attempts: 40,
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Resolved gate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSettings {
    pub settle_delay: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check everything the pipeline relies on before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.service_family.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.service_family must not be empty".to_string(),
            ));
        }
        if self.pipeline.rollout.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.rollout.max_attempts must be at least 1".to_string(),
            ));
        }
        self.rollout_settings()?;
        self.gate_settings()?;

        for name in [EnvironmentName::Staging, EnvironmentName::Production] {
            let env = self
                .environments
                .get(name.as_str())
                .ok_or(ConfigError::MissingEnvironment(name))?;

            for (field, value) in [
                ("cluster", &env.cluster),
                ("service", &env.service),
                ("stack_name", &env.stack_name),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyField {
                        environment: name.to_string(),
                        field: field.to_string(),
                    });
                }
            }

            if env.policy.circuit_breaker && env.policy.failure_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "environment {name}: failure_threshold must be at least 1 when the circuit breaker is enabled"
                )));
            }

            if !self.suites.contains_key(&env.suite) {
                return Err(ConfigError::UnknownSuite {
                    environment: name.to_string(),
                    suite: env.suite.clone(),
                });
            }
        }

        for (name, suite) in &self.suites {
            if suite.command.is_empty() || suite.command[0].trim().is_empty() {
                return Err(ConfigError::EmptySuiteCommand(name.clone()));
            }
            if let Some(timeout) = &suite.timeout {
                duration_field(&format!("suites.{name}.timeout"), timeout)?;
            }
        }

        Ok(())
    }

    pub fn rollout_settings(&self) -> Result<RolloutSettings, ConfigError> {
        let rollout = &self.pipeline.rollout;
        Ok(RolloutSettings {
            poll_interval: duration_field("pipeline.rollout.poll_interval", &rollout.poll_interval)?,
            max_attempts: rollout.max_attempts,
            timeout: duration_field("pipeline.rollout.timeout", &rollout.timeout)?,
        })
    }

    pub fn gate_settings(&self) -> Result<GateSettings, ConfigError> {
        Ok(GateSettings {
            settle_delay: duration_field("pipeline.gate.settle_delay", &self.pipeline.gate.settle_delay)?,
        })
    }

    /// Suite id configured for an environment's gate.
    pub fn suite_for(&self, name: EnvironmentName) -> Option<&str> {
        self.environments
            .get(name.as_str())
            .map(|env| env.suite.as_str())
    }

    /// Materialize an environment record with nothing declared or running yet.
    pub fn environment(&self, name: EnvironmentName) -> Result<Environment, ConfigError> {
        let env = self
            .environments
            .get(name.as_str())
            .ok_or(ConfigError::MissingEnvironment(name))?;
        let defaults = OutputKeys::default();

        Ok(Environment {
            name,
            service_family: env
                .family
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.pipeline.service_family, name)),
            cluster: env.cluster.clone(),
            service: env.service.clone(),
            stack_name: env.stack_name.clone(),
            template: self.pipeline.template.clone(),
            infrastructure: InfrastructureParams {
                execution_role: env.execution_role.clone(),
                subnets: env.subnets.clone(),
                security_groups: env.security_groups.clone(),
                assign_public_ip: env.assign_public_ip,
            },
            policy: DeploymentPolicy {
                max_running_count: env.policy.max_running_count,
                circuit_breaker: CircuitBreakerPolicy {
                    enabled: env.policy.circuit_breaker,
                    rollback: env.policy.breaker_rollback,
                    failure_threshold: env.policy.failure_threshold,
                },
            },
            outputs: OutputKeys {
                endpoint: env.endpoint_output.clone().unwrap_or(defaults.endpoint),
                revision: env.revision_output.clone().unwrap_or(defaults.revision),
            },
            declared_revision: None,
            running_revision: None,
            endpoint: None,
        })
    }

    /// Scaffold a minimal rollgate.toml for a service family.
    pub fn scaffold(family: &str) -> Self {
        let env = |name: EnvironmentName, suite: &str| EnvironmentConfig {
            family: None,
            cluster: format!("{family}-{name}"),
            service: family.to_string(),
            stack_name: format!("{family}-{name}"),
            execution_role: format!("{family}-execution-role"),
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            security_groups: vec![format!("{family}-sg")],
            assign_public_ip: false,
            suite: suite.to_string(),
            policy: PolicyConfig::default(),
            endpoint_output: None,
            revision_output: None,
        };

        let suite = |script: &str| SuiteConfig {
            command: vec![script.to_string()],
            timeout: Some("10m".to_string()),
            working_dir: None,
        };

        Config {
            pipeline: PipelineConfig {
                service_family: family.to_string(),
                template: "infra/service.yml".to_string(),
                rollback_marker: default_rollback_marker(),
                rollout: RolloutConfig::default(),
                gate: GateConfig::default(),
            },
            platform: PlatformSettings::default(),
            environments: BTreeMap::from([
                (
                    EnvironmentName::Staging.to_string(),
                    env(EnvironmentName::Staging, "acceptance"),
                ),
                (
                    EnvironmentName::Production.to_string(),
                    env(EnvironmentName::Production, "smoke"),
                ),
            ]),
            suites: BTreeMap::from([
                ("acceptance".to_string(), suite("./scripts/acceptance.sh")),
                ("smoke".to_string(), suite("./scripts/smoke.sh")),
            ]),
        }
    }
}

fn duration_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[pipeline]
service_family = "web"
template = "infra/service.yml"

[environments.staging]
cluster = "web-staging"
service = "web"
stack_name = "web-staging"
execution_role = "web-exec"
subnets = ["subnet-a"]
suite = "acceptance"

[environments.production]
cluster = "web-prod"
service = "web"
stack_name = "web-prod"
execution_role = "web-exec"
suite = "smoke"
endpoint_output = "LoadBalancerUrl"

[environments.production.policy]
max_running_count = 4
failure_threshold = 5

[suites.acceptance]
command = ["./acceptance.sh"]

[suites.smoke]
command = ["./smoke.sh", "--quick"]
timeout = "2m"
"#;

    #[test]
    fn test_scaffold() {
        let config = Config::scaffold("my-api");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("my-api"));
        assert!(toml_str.contains("acceptance"));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.pipeline.service_family, "web");
        assert_eq!(config.pipeline.rollback_marker, "[rollback]");
        assert_eq!(config.suite_for(EnvironmentName::Production), Some("smoke"));

        let rollout = config.rollout_settings().unwrap();
        assert_eq!(rollout, RolloutSettings::default());
        assert_eq!(config.gate_settings().unwrap(), GateSettings::default());
    }

    #[test]
    fn environment_materializes_policy_and_outputs() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let prod = config.environment(EnvironmentName::Production).unwrap();

        assert_eq!(prod.policy.max_running_count, 4);
        assert_eq!(prod.policy.circuit_breaker.failure_threshold, 5);
        assert!(prod.policy.circuit_breaker.enabled);
        assert_eq!(prod.outputs.endpoint, "LoadBalancerUrl");
        assert_eq!(prod.outputs.revision, "TaskRevision");
        assert_eq!(prod.declared_revision, None);
        assert_eq!(prod.template, "infra/service.yml");
        assert_eq!(prod.service_family, "web-production");
    }

    #[test]
    fn missing_production_is_rejected() {
        let staging_only = MINIMAL
            .split("[environments.production]")
            .next()
            .unwrap()
            .to_string()
            + "\n[suites.acceptance]\ncommand = [\"./a.sh\"]\n";
        let err = Config::from_toml_str(&staging_only).unwrap_err();
        assert!(err.to_string().contains("production"));
    }

    #[test]
    fn unknown_suite_is_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.suites.remove("smoke");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownSuite { .. })
        ));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.pipeline.rollout.poll_interval = "often".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn overflowing_duration_is_rejected() {
        let toml = MINIMAL.replace(
            "[pipeline]\n",
            "[pipeline]\nrollout = { timeout = \"99999999999999999h\" }\n",
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("pipeline.rollout.timeout"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.pipeline.rollout.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn enabled_breaker_needs_threshold() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config
            .environments
            .get_mut("staging")
            .unwrap()
            .policy
            .failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
