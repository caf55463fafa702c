//! rollgate: promote an artifact through staging and production.
//!
//! # Usage
//!
//! ```text
//! rollgate init --family web
//! rollgate run --artifact sha:abc123 --commit abc123 --message "fix checkout [rollback]"
//! rollgate runs list
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

use commands::OutputFormat;

#[derive(Parser)]
#[command(
    name = "rollgate",
    about = "Rollgate: gated staging-to-production promotion with opt-in rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one artifact.
    Run(commands::run::RunArgs),
    /// Inspect recorded pipeline runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Print the pipeline's state transition table.
    Plan {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Write a scaffold rollgate.toml.
    Init {
        /// Service family the pipeline deploys.
        #[arg(long, default_value = "web")]
        family: String,
        #[arg(short, long, default_value = "rollgate.toml")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a configuration file.
    Check {
        #[arg(short, long, default_value = "rollgate.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent runs, newest first.
    List {
        #[arg(short, long, default_value = "rollgate.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".rollgate")]
        data_dir: PathBuf,
        /// Service family; defaults to the configured one.
        #[arg(long)]
        family: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show one run's stage results.
    Show {
        id: String,
        #[arg(long, default_value = ".rollgate")]
        data_dir: PathBuf,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Run(args) => commands::run::run(args).await,
        Command::Runs { action } => match action {
            RunsAction::List {
                config,
                data_dir,
                family,
                limit,
            } => commands::runs::list(&config, &data_dir, family.as_deref(), limit),
            RunsAction::Show {
                id,
                data_dir,
                format,
            } => commands::runs::show(&id, &data_dir, format),
        },
        Command::Plan { format } => commands::setup::plan(format),
        Command::Init {
            family,
            path,
            force,
        } => commands::setup::init(&family, &path, force),
        Command::Check { config } => commands::setup::check(&config),
    }
}
