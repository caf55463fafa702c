//! Quality gate runner.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use rollgate_core::config::GateSettings;
use rollgate_platform::GateSuite;

use crate::error::{DeployError, DeployResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub details: String,
    pub failures: Vec<String>,
}

/// Runs one suite against one endpoint after a settle delay.
///
/// There is no retry: a flaky suite fails the gate.
pub struct GateRunner {
    suites: Arc<dyn GateSuite>,
    settings: GateSettings,
}

impl GateRunner {
    pub fn new(suites: Arc<dyn GateSuite>, settings: GateSettings) -> Self {
        Self { suites, settings }
    }

    pub async fn run_suite(&self, suite_id: &str, endpoint: &str) -> DeployResult<GateResult> {
        if !self.settings.settle_delay.is_zero() {
            info!(
                suite = %suite_id,
                delay = ?self.settings.settle_delay,
                "waiting for endpoint to settle"
            );
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let outcome = self.suites.execute(suite_id, endpoint).await?;
        if !outcome.success {
            warn!(
                suite = %suite_id,
                %endpoint,
                failures = outcome.failures.len(),
                "gate failed"
            );
            return Err(DeployError::GateFailure {
                suite: suite_id.to_string(),
                endpoint: endpoint.to_string(),
                failures: outcome.failures,
                output: outcome.output,
            });
        }

        info!(suite = %suite_id, %endpoint, "gate passed");
        Ok(GateResult {
            passed: true,
            details: outcome.output,
            failures: outcome.failures,
        })
    }
}
