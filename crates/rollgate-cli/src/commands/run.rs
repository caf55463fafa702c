use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use rollgate_core::{Config, DeployableRevision, PipelineRun, RunOutcome, now_ms};
use rollgate_pipeline::{PipelineController, Platforms, RollbackIntent, TriggerEvent};
use rollgate_platform::{CommandSuite, RawDefinition, SandboxPlatform};

use super::{format_run, open_store};

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Artifact reference to deploy, e.g. an image digest or tag.
    #[arg(long)]
    pub artifact: String,
    /// Commit the artifact was built from.
    #[arg(long)]
    pub commit: String,
    /// Change description; the configured rollback marker in it opts in to
    /// rollback.
    #[arg(short, long, default_value = "")]
    pub message: String,
    /// Opt in to rollback regardless of the message.
    #[arg(long)]
    pub rollback: bool,
    #[arg(short, long, default_value = "rollgate.toml")]
    pub config: PathBuf,
    #[arg(long, default_value = ".rollgate")]
    pub data_dir: PathBuf,
    /// Revisions production already ran before this run, the last one live.
    #[arg(long, default_value = "0")]
    pub prod_history: u64,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping before the next stage");
            let _ = cancel_tx.send(true);
        }
    });

    let artifact = DeployableRevision::new(args.artifact.as_str(), args.commit.as_str());
    if !artifact.is_valid() {
        anyhow::bail!("--artifact and --commit must both be non-empty");
    }

    let run = execute(&config, &args, cancel_rx).await?;
    print!("{}", format_run(&run));

    if run.outcome() != RunOutcome::Succeeded {
        anyhow::bail!("run {} ended {}", run.id(), run.outcome());
    }
    Ok(())
}

/// Run one pipeline under a lease and record it.
pub async fn execute(
    config: &Config,
    args: &RunArgs,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<PipelineRun> {
    let store = open_store(&args.data_dir)?;
    let family = config.pipeline.service_family.as_str();
    let holder = format!("pid-{}-{}", std::process::id(), now_ms());
    store
        .acquire_lease(family, &holder)
        .context("another run is in flight for this service family")?;

    let result = run_pipeline(config, args, cancel).await;

    // The run is recorded before the lease goes.
    let recorded = match &result {
        Ok(run) => store.put_run(run).map(|()| {
            info!(run_id = %run.id(), outcome = %run.outcome(), "run recorded");
        }),
        Err(_) => Ok(()),
    };
    let released = store.release_lease(family, &holder);
    recorded?;
    released?;
    result
}

async fn run_pipeline(
    config: &Config,
    args: &RunArgs,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<PipelineRun> {
    let platform = SandboxPlatform::from_config(config).await?;
    seed_production(&platform, config, args.prod_history).await?;

    let platforms = Platforms {
        infrastructure: Arc::new(platform.clone()),
        cluster: Arc::new(platform),
        suites: Arc::new(CommandSuite::from_config(&config.suites)),
    };
    let mut controller = PipelineController::from_config(config, platforms)?;

    let mut trigger = TriggerEvent::new(
        DeployableRevision::new(args.artifact.as_str(), args.commit.as_str()),
        &args.message,
        &config.pipeline.rollback_marker,
    );
    if args.rollback {
        trigger = trigger.with_rollback_intent(RollbackIntent::PRESENT);
    }

    Ok(controller.run(trigger, cancel).await)
}

/// Give production a revision history so a rollback has somewhere to go.
async fn seed_production(
    platform: &SandboxPlatform,
    config: &Config,
    history: u64,
) -> anyhow::Result<()> {
    if history == 0 {
        return Ok(());
    }
    let env = config.environment(rollgate_core::EnvironmentName::Production)?;
    for n in 1..=history {
        let mut definition = RawDefinition::new();
        definition.insert("image".into(), json!(format!("{}:previous-{n}", env.service)));
        definition.insert("cpu".into(), json!(256));
        definition.insert("memory".into(), json!(512));
        platform.seed_revision(&env.service_family, definition).await;
    }
    platform
        .seed_service(&env.cluster, &env.service, history)
        .await?;
    Ok(())
}
