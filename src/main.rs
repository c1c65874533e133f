use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rss_newsletter::config::Config;
use rss_newsletter::events::TracingLog;
use rss_newsletter::poller::{self, RunOptions};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "rss-newsletter",
    about = "Send newly published RSS posts to newsletter subscribers"
)]
struct Args {
    /// Optional TOML config file (environment variables take precedence)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sent-posts ledger file (overrides config and SENT_POSTS_FILE)
    #[arg(long, value_name = "FILE")]
    ledger: Option<PathBuf>,

    /// Log what would be sent without calling the API or writing the ledger
    #[arg(long)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer().compact()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config file '{}'", path.display()))?,
        None => Config::default(),
    };
    config
        .apply_env()
        .context("Invalid configuration in environment")?;
    if let Some(ledger) = &args.ledger {
        config.ledger_path = ledger.clone();
    }
    tracing::debug!(config = ?config, "Resolved configuration");
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load .env for local runs; CI provides real environment variables.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(args.log_format);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Newsletter run failed");
            return ExitCode::FAILURE;
        }
    };

    let options = RunOptions {
        dry_run: args.dry_run,
    };

    // Fatal errors are already logged by the run.
    match poller::run(&config, options, Utc::now(), &TracingLog).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
