use std::path::Path;

use anyhow::Context;

use rollgate_core::{Config, EnvironmentName};
use rollgate_pipeline::{PipelineState, transition_table};

use super::OutputFormat;

pub fn init(family: &str, path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = Config::scaffold(family);
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config =
        Config::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    let rollout = config.rollout_settings()?;
    let gate = config.gate_settings()?;

    println!("{} is valid", path.display());
    println!(
        "  family {}  rollback marker {:?}",
        config.pipeline.service_family, config.pipeline.rollback_marker
    );
    println!(
        "  rollout: every {:?}, at most {} polls, {:?} overall; gate settle {:?}",
        rollout.poll_interval, rollout.max_attempts, rollout.timeout, gate.settle_delay
    );
    for name in [EnvironmentName::Staging, EnvironmentName::Production] {
        let env = config.environment(name)?;
        println!(
            "  {:<10} stack {:<20} service {}/{:<12} family {:<20} suite {}",
            name.as_str(),
            env.stack_name,
            env.cluster,
            env.service,
            env.service_family,
            config.suite_for(name).unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn plan(format: OutputFormat) -> anyhow::Result<()> {
    let table = transition_table();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&table)?),
        OutputFormat::Text => {
            println!("{:<14} {:<16} {:<10} {:<9} {}", "STATE", "EXECUTOR", "OUTCOME", "INTENT", "NEXT");
            for row in table {
                let executor = row.from.stage().map_or("-", |s| s.as_str());
                let outcome = match row.outcome {
                    rollgate_pipeline::StepOutcome::Succeeded => "success",
                    rollgate_pipeline::StepOutcome::Failed => "failure",
                };
                let intent = match row.intent {
                    None => "any",
                    Some(true) => "present",
                    Some(false) => "absent",
                };
                println!(
                    "{:<14} {:<16} {:<10} {:<9} {}",
                    row.from.as_str(),
                    executor,
                    outcome,
                    intent,
                    row.to
                );
            }
            let terminal: Vec<&str> = PipelineState::ALL
                .iter()
                .filter(|s| s.is_terminal())
                .map(|s| s.as_str())
                .collect();
            println!("terminal: {}", terminal.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_config_that_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollgate.toml");

        init("shop", &path, false).unwrap();
        check(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pipeline.service_family, "shop");
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollgate.toml");
        std::fs::write(&path, "keep me").unwrap();

        assert!(init("shop", &path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        init("shop", &path, true).unwrap();
        assert!(Config::from_file(&path).is_ok());
    }

    #[test]
    fn check_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollgate.toml");
        std::fs::write(&path, "[pipeline]\nservice_family = \"web\"\n").unwrap();
        assert!(check(&path).is_err());
    }

    #[test]
    fn plan_renders_in_both_formats() {
        plan(OutputFormat::Text).unwrap();
        plan(OutputFormat::Json).unwrap();
    }
}
