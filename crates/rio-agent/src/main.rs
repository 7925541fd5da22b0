//! RIO field agent entry point.

use rio_agent::agent;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// RIO remote IoT agent: feature plugins, rules, and fleet connectivity.
#[derive(Parser, Debug)]
#[command(name = "rio-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file.
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,

    /// Data directory for crontab.json, Ruleset.json, Test.json, and the
    /// retry buffer. Defaults to the settings file's directory.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("rio={default_level}")));

    // JSON logging for container/fleet environments.
    let json_logging = std::env::var("RIO_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| args.settings.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let code = agent::run(agent::AgentConfig {
        settings_path: args.settings,
        data_dir,
    })
    .await?;
    std::process::exit(code);
}
