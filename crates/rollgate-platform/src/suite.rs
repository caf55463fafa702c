//! Gate suite implementations.
//!
//! A suite's whole contract is "exit success or failure against a base
//! URL". `CommandSuite` runs the configured command once; `ScriptedSuite`
//! replays fixed outcomes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rollgate_core::config::SuiteConfig;
use rollgate_core::duration::parse_duration;

use crate::api::{GateSuite, SuiteOutcome};
use crate::error::{PlatformError, PlatformResult};

const DEFAULT_SUITE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long output readers may drain after the suite has exited.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Line prefixes test runners use to report a failing test.
const FAILURE_PREFIXES: &[&str] = &["FAIL", "FAILED", "not ok"];

#[derive(Debug, Clone)]
struct SuiteCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

/// Runs suites as child processes with `BASE_URL` set.
#[derive(Debug, Clone, Default)]
pub struct CommandSuite {
    suites: HashMap<String, SuiteCommand>,
}

impl CommandSuite {
    pub fn from_config(suites: &BTreeMap<String, SuiteConfig>) -> Self {
        let suites = suites
            .iter()
            .filter_map(|(id, cfg)| {
                let (program, args) = cfg.command.split_first()?;
                let timeout = cfg
                    .timeout
                    .as_deref()
                    .and_then(parse_duration)
                    .unwrap_or(DEFAULT_SUITE_TIMEOUT);
                Some((
                    id.clone(),
                    SuiteCommand {
                        program: program.clone(),
                        args: args.to_vec(),
                        timeout,
                        working_dir: cfg.working_dir.as_ref().map(PathBuf::from),
                    },
                ))
            })
            .collect();
        Self { suites }
    }
}

#[async_trait]
impl GateSuite for CommandSuite {
    async fn execute(&self, suite_id: &str, base_url: &str) -> PlatformResult<SuiteOutcome> {
        let suite = self
            .suites
            .get(suite_id)
            .ok_or_else(|| PlatformError::NotFound(format!("suite {suite_id}")))?;

        info!(suite = %suite_id, %base_url, program = %suite.program, "running gate suite");

        let mut cmd = Command::new(&suite.program);
        cmd.args(&suite.args)
            .env("BASE_URL", base_url)
            .env("ROLLGATE_SUITE", suite_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &suite.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PlatformError::Unavailable(format!("failed to start suite {suite_id}: {e}"))
        })?;
        let (stdout, stdout_task) = capture(child.stdout.take());
        let (stderr, stderr_task) = capture(child.stderr.take());

        let status = match tokio::time::timeout(suite.timeout, child.wait()).await {
            Ok(result) => Some(result.map_err(|e| {
                PlatformError::Unavailable(format!("suite {suite_id} did not complete: {e}"))
            })?),
            Err(_) => {
                warn!(suite = %suite_id, timeout = ?suite.timeout, "gate suite timed out");
                if let Err(e) = child.kill().await {
                    debug!(suite = %suite_id, error = %e, "failed to kill timed out suite");
                }
                None
            }
        };

        // A grandchild can keep the pipes open after the suite itself exits.
        for mut task in [stdout_task, stderr_task] {
            if tokio::time::timeout(READER_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        let mut text = drained(&stdout);
        text.push_str(&drained(&stderr));

        let Some(status) = status else {
            let mut failures = vec![format!("suite timed out after {:?}", suite.timeout)];
            failures.extend(failing_tests(&text));
            return Ok(SuiteOutcome {
                success: false,
                failures,
                output: text,
            });
        };

        let failures = failing_tests(&text);
        debug!(suite = %suite_id, %status, failures = failures.len(), "gate suite exited");

        Ok(SuiteOutcome {
            success: status.success(),
            failures,
            output: text,
        })
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Copy a child pipe into a shared buffer as it is written.
fn capture<R>(reader: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Captured::default();
    let sink = buffer.clone();
    let task = tokio::spawn(async move {
        let Some(mut reader) = reader else { return };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buffer, task)
}

fn drained(buffer: &Captured) -> String {
    buffer
        .lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Extract failing test lines from runner output.
fn failing_tests(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| FAILURE_PREFIXES.iter().any(|p| line.starts_with(p)))
        .map(str::to_string)
        .collect()
}

/// Replays fixed outcomes per suite id and records every invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSuite {
    outcomes: HashMap<String, SuiteOutcome>,
    invocations: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(mut self, suite_id: &str) -> Self {
        self.outcomes.insert(
            suite_id.to_string(),
            SuiteOutcome {
                success: true,
                failures: Vec::new(),
                output: format!("{suite_id}: all tests passed"),
            },
        );
        self
    }

    pub fn fail(mut self, suite_id: &str, failures: &[&str]) -> Self {
        self.outcomes.insert(
            suite_id.to_string(),
            SuiteOutcome {
                success: false,
                failures: failures.iter().map(|f| f.to_string()).collect(),
                output: failures.join("\n"),
            },
        );
        self
    }

    /// `(suite_id, base_url)` pairs in call order.
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GateSuite for ScriptedSuite {
    async fn execute(&self, suite_id: &str, base_url: &str) -> PlatformResult<SuiteOutcome> {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push((suite_id.to_string(), base_url.to_string()));
        }
        self.outcomes
            .get(suite_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("suite {suite_id}")))
    }
}
