//! Stage executor error types.

use thiserror::Error;

use rollgate_core::{EnvironmentName, FailureKind, RevisionNumber, StageFailure};
use rollgate_platform::PlatformError;

pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that fail a pipeline stage.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("artifact {artifact} needs both a reference and a commit")]
    InvalidArtifact { artifact: String },

    #[error("stack {stack} apply failed: {source}")]
    InfrastructureApply {
        stack: String,
        #[source]
        source: PlatformError,
    },

    #[error("stack {stack} is missing output {key:?}")]
    MissingOutput { stack: String, key: String },

    #[error("stack {stack} output {key:?} is not a revision number: {value:?}")]
    InvalidOutput {
        stack: String,
        key: String,
        value: String,
    },

    #[error("{environment} has no declared revision to roll out")]
    NotDeclared { environment: EnvironmentName },

    #[error(
        "service {service} did not stabilize on revision {revision} after {attempts} polls \
         ({running}/{desired} running)"
    )]
    StabilizationTimeout {
        service: String,
        revision: RevisionNumber,
        attempts: u32,
        running: u32,
        desired: u32,
    },

    #[error("deployment of revision {revision} to {service} rejected by circuit breaker: {reason}")]
    DeploymentRejected {
        service: String,
        revision: RevisionNumber,
        reason: String,
    },

    #[error("gate suite {suite} failed against {endpoint}")]
    GateFailure {
        suite: String,
        endpoint: String,
        failures: Vec<String>,
        output: String,
    },

    #[error("no revision before {family}:{current} to roll back to")]
    NoPriorRevision {
        family: String,
        current: RevisionNumber,
    },

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl DeployError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeployError::InfrastructureApply { .. } => FailureKind::InfrastructureApply,
            DeployError::MissingOutput { .. } | DeployError::InvalidOutput { .. } => {
                FailureKind::MissingOutput
            }
            DeployError::StabilizationTimeout { .. } => FailureKind::StabilizationTimeout,
            DeployError::DeploymentRejected { .. } => FailureKind::DeploymentRejected,
            DeployError::GateFailure { .. } => FailureKind::GateFailure,
            DeployError::NoPriorRevision { .. } => FailureKind::NoPriorRevision,
            DeployError::InvalidArtifact { .. }
            | DeployError::NotDeclared { .. }
            | DeployError::Platform(_) => FailureKind::Platform,
        }
    }

    /// Only a stabilization timeout is worth an operator re-run as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::StabilizationTimeout { .. })
    }

    /// Diagnostic payload carried into the stage result.
    pub fn details(&self) -> Vec<String> {
        match self {
            DeployError::InfrastructureApply { source, .. } => vec![source.to_string()],
            DeployError::DeploymentRejected { reason, .. } => vec![reason.clone()],
            DeployError::GateFailure {
                failures, output, ..
            } => {
                let mut details = failures.clone();
                if details.is_empty() && !output.is_empty() {
                    details.push(output.clone());
                }
                details
            }
            _ => Vec::new(),
        }
    }

    pub fn to_failure(&self) -> StageFailure {
        StageFailure {
            kind: self.kind(),
            message: self.to_string(),
            details: self.details(),
            retryable: self.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = DeployError::StabilizationTimeout {
            service: "prod/web".to_string(),
            revision: 3,
            attempts: 40,
            running: 1,
            desired: 2,
        };
        assert!(timeout.is_retryable());
        assert!(timeout.to_failure().retryable);

        let rejected = DeployError::DeploymentRejected {
            service: "prod/web".to_string(),
            revision: 3,
            reason: "3 tasks failed to start".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.kind(), FailureKind::DeploymentRejected);
        assert_eq!(rejected.details(), vec!["3 tasks failed to start"]);
    }

    #[test]
    fn gate_failure_carries_test_names() {
        let err = DeployError::GateFailure {
            suite: "smoke".to_string(),
            endpoint: "http://prod.example/".to_string(),
            failures: vec!["FAIL checkout".to_string()],
            output: "FAIL checkout\n1 failed".to_string(),
        };
        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::GateFailure);
        assert_eq!(failure.details, vec!["FAIL checkout"]);
    }

    #[test]
    fn gate_failure_without_names_keeps_output() {
        let err = DeployError::GateFailure {
            suite: "smoke".to_string(),
            endpoint: "http://prod.example/".to_string(),
            failures: Vec::new(),
            output: "exit status 2".to_string(),
        };
        assert_eq!(err.details(), vec!["exit status 2"]);
    }
}
