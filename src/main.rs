mod admission;
mod cli;
mod collector;
mod commands;
mod crawl;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use tracing::{debug, warn};

// Use mimalloc to prevent memory bloat (glibc malloc doesn't release memory
// with high concurrency)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use deepharvest_core::{AppConfig, CrawlError};

use crate::cli::{Cli, Commands};
use crate::crawl::{run_crawl, CrawlOptions};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(async_main(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ (CrawlError::Config(_) | CrawlError::InvalidUrl(_))) => {
            eprintln!("configuration error: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::from(2)
        }
    }
}

async fn async_main(cli: Cli) -> Result<(), CrawlError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl {
            urls,
            depth,
            js,
            output,
            distributed,
            redis_url,
            workers,
        } => {
            let options = CrawlOptions {
                seeds: urls,
                depth,
                js,
                output: output.unwrap_or_else(|| PathBuf::from("harvest")),
                distributed,
                redis_url,
                workers,
                resume: None,
            };
            let summary = run_crawl(config, options).await?;
            debug!(processed = summary.stats.processed, "crawl finished");
            Ok(())
        }
        Commands::Resume { state_file, output } => {
            commands::resume::run(config, state_file, output).await
        }
        Commands::Osint {
            url,
            json,
            graph,
            screenshot,
            output,
        } => commands::osint::run(config, url, json, graph, screenshot, output).await,
    }
}

/// Config resolution: --config flag, then $DEEPHARVEST_CONFIG, then the
/// on-disk default, then the embedded default.
fn load_config(flag: Option<&str>) -> Result<AppConfig, CrawlError> {
    let path = flag
        .map(String::from)
        .or_else(|| std::env::var("DEEPHARVEST_CONFIG").ok());

    let raw = match &path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| CrawlError::Config(format!("{path}: {e}")))?,
        None => std::fs::read_to_string("config/default.toml").unwrap_or_else(|_| {
            warn!("no config file found, using built-in defaults");
            include_str!("../config/default.toml").to_string()
        }),
    };
    AppConfig::from_toml(&raw)
}
