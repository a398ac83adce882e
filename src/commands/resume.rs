use std::path::PathBuf;

use tracing::info;

use deepharvest_checkpoint::Checkpoint;
use deepharvest_core::{AppConfig, CrawlError};

use crate::crawl::{run_crawl, CrawlOptions};

pub async fn run(
    config: AppConfig,
    state_file: PathBuf,
    output: Option<PathBuf>,
) -> Result<(), CrawlError> {
    if config.distributed {
        return Err(CrawlError::Config(
            "checkpoints are a local-mode feature; in distributed mode the shared \
             store is the source of truth"
                .to_string(),
        ));
    }

    let checkpoint = Checkpoint::read(&state_file)?;
    checkpoint.validate(&config.compat_digest(), config.raw_digest.as_deref())?;
    info!(
        visited = checkpoint.visited.len(),
        pending = checkpoint.frontier.len(),
        "checkpoint loaded"
    );

    let output = output.unwrap_or_else(|| {
        state_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let options = CrawlOptions {
        seeds: Vec::new(),
        depth: None,
        js: false,
        output,
        distributed: false,
        redis_url: None,
        workers: None,
        resume: Some(checkpoint),
    };
    run_crawl(config, options).await.map(|_| ())
}
