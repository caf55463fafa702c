use std::path::Path;

use anyhow::Context;

use rollgate_core::{Config, StageStatus};

use super::{OutputFormat, format_run, open_store};

pub fn list(
    config: &Path,
    data_dir: &Path,
    family: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let family = match family {
        Some(family) => family.to_string(),
        None => {
            Config::from_file(config)
                .with_context(|| format!("loading {}", config.display()))?
                .pipeline
                .service_family
        }
    };
    let store = open_store(data_dir)?;
    let runs = store.list_runs(&family, limit)?;

    if runs.is_empty() {
        println!("No runs recorded for {family}.");
        return Ok(());
    }

    println!(
        "{:<14} {:<12} {:<24} {:<16} {}",
        "RUN", "OUTCOME", "ARTIFACT", "FAILED STAGE", "DURATION"
    );
    for run in &runs {
        let failed = run
            .stages()
            .iter()
            .find(|r| r.status == StageStatus::Failed)
            .map(|r| r.stage.as_str())
            .unwrap_or("-");
        let seconds = run.finished_at_ms().saturating_sub(run.started_at_ms()) as f64 / 1000.0;
        println!(
            "{:<14} {:<12} {:<24} {:<16} {:.1}s",
            run.id(),
            run.outcome().to_string(),
            run.artifact().reference(),
            failed,
            seconds
        );
    }
    Ok(())
}

pub fn show(id: &str, data_dir: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let run = store
        .get_run(id)?
        .with_context(|| format!("no run with id {id}"))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
        OutputFormat::Text => print!("{}", format_run(&run)),
    }
    Ok(())
}
