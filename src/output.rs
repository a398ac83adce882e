use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use deepharvest_core::{ErrorKind, PageRecord};

/// Everything the workers hand downstream: page records to the record
/// stream, per-URL failures to the failure log.
pub enum OutputEvent {
    Page(PageRecord),
    Failure(FailureRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub url: String,
    pub kind: ErrorKind,
    pub detail: Option<String>,
    pub status: Option<u16>,
    pub retries: u32,
    pub failed_at: DateTime<Utc>,
}

pub struct OutputWriter {
    records: BufWriter<File>,
    failures: BufWriter<File>,
    pub dir: PathBuf,
}

impl OutputWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let records = BufWriter::new(append_to(&dir.join("records.jsonl"))?);
        let failures = BufWriter::new(append_to(&dir.join("failures.jsonl"))?);
        Ok(Self {
            records,
            failures,
            dir: dir.to_path_buf(),
        })
    }

    fn write(&mut self, event: &OutputEvent) -> Result<()> {
        match event {
            OutputEvent::Page(record) => {
                serde_json::to_writer(&mut self.records, record)?;
                self.records.write_all(b"\n")?;
            }
            OutputEvent::Failure(record) => {
                serde_json::to_writer(&mut self.failures, record)?;
                self.failures.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.records.flush()?;
        self.failures.flush()?;
        Ok(())
    }
}

fn append_to(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer task: drains the event channel, flags a stalled crawl, flushes on
/// shutdown after draining whatever is still queued.
pub async fn run_writer(
    mut writer: OutputWriter,
    mut rx: mpsc::Receiver<OutputEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut pages_written = 0u64;
    let mut last_write = std::time::Instant::now();
    let stall_threshold = std::time::Duration::from_secs(300);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if matches!(event, OutputEvent::Page(_)) {
                    pages_written += 1;
                    last_write = std::time::Instant::now();
                }
                if let Err(e) = writer.write(&event) {
                    error!("output write failed: {e}");
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                if last_write.elapsed() > stall_threshold {
                    warn!(
                        pages_written,
                        idle_secs = last_write.elapsed().as_secs(),
                        "no records written recently; crawl may be stalled"
                    );
                }
            }
            _ = shutdown.recv() => {
                while let Ok(event) = rx.try_recv() {
                    if let Err(e) = writer.write(&event) {
                        error!("output write failed during drain: {e}");
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.flush() {
        error!("output flush failed: {e}");
    }
    info!(pages_written, "output writer finished");
}
