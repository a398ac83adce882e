use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use deepharvest_core::{CrawlError, StatsSnapshot, UrlRecord};

pub const SCHEMA_VERSION: u32 = 1;

const VISITED_MARKER: &str = "@@visited";
const FRONTIER_MARKER: &str = "@@frontier";

/// First line of every checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    /// Digest over the restore-compatibility subset of the config
    /// (host allow-list, normalization rules).
    pub config_digest: String,
    /// Digest over the full config text; differences here only warn.
    #[serde(default)]
    pub options_digest: Option<String>,
    pub stats: StatsSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// One pending frontier entry, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub url: String,
    pub depth: u32,
    pub priority: f64,
    pub parent: Option<String>,
    pub retries: u32,
}

impl From<&UrlRecord> for FrontierEntry {
    fn from(record: &UrlRecord) -> Self {
        Self {
            url: record.url.to_string(),
            depth: record.depth,
            priority: record.priority,
            parent: record.parent.clone(),
            retries: record.retry_count,
        }
    }
}

impl FrontierEntry {
    pub fn into_record(self) -> Result<UrlRecord, CrawlError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CrawlError::InvalidUrl(format!("{}: {e}", self.url)))?;
        let host = url.host_str().unwrap_or_default().to_string();
        Ok(UrlRecord {
            url,
            host,
            depth: self.depth,
            priority: self.priority,
            parent: self.parent,
            discovered_at: Utc::now(),
            retry_count: self.retries,
            not_before: None,
        })
    }
}

/// A crawl checkpoint: header line, then a `@@visited` section with one
/// canonical URL per line, then a `@@frontier` section with one entry per
/// line in priority order. `visited` and `frontier` are disjoint and their
/// union is every URL ever admitted.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub visited: Vec<String>,
    pub frontier: Vec<FrontierEntry>,
}

impl Checkpoint {
    pub fn new(
        config_digest: String,
        options_digest: Option<String>,
        stats: StatsSnapshot,
        visited: Vec<String>,
        frontier: Vec<FrontierEntry>,
    ) -> Self {
        Self {
            header: CheckpointHeader {
                version: SCHEMA_VERSION,
                config_digest,
                options_digest,
                stats,
                timestamp: Utc::now(),
            },
            visited,
            frontier,
        }
    }

    /// Atomic write: temp file in the target directory, fsync, rename.
    pub fn write_atomic(&self, path: &Path) -> Result<(), CrawlError> {
        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)
                .map_err(|e| CrawlError::Store(format!("{}: {e}", tmp_path.display())))?;
            let mut writer = BufWriter::new(file);

            let header = serde_json::to_string(&self.header)
                .map_err(|e| CrawlError::Store(e.to_string()))?;
            writeln!(writer, "{header}").map_err(write_error)?;

            writeln!(writer, "{VISITED_MARKER}").map_err(write_error)?;
            for url in &self.visited {
                writeln!(writer, "{url}").map_err(write_error)?;
            }

            writeln!(writer, "{FRONTIER_MARKER}").map_err(write_error)?;
            for entry in &self.frontier {
                let line = serde_json::to_string(entry)
                    .map_err(|e| CrawlError::Store(e.to_string()))?;
                writeln!(writer, "{line}").map_err(write_error)?;
            }

            writer.flush().map_err(write_error)?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| CrawlError::Store(format!("fsync: {e}")))?;
        }
        fs::rename(&tmp_path, path)
            .map_err(|e| CrawlError::Store(format!("rename into place: {e}")))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, CrawlError> {
        let file = File::open(path)
            .map_err(|e| CrawlError::Store(format!("{}: {e}", path.display())))?;
        let mut lines = BufReader::new(file).lines();

        let header_line = lines
            .next()
            .ok_or_else(|| CrawlError::Store("empty checkpoint file".to_string()))?
            .map_err(read_error)?;
        let header: CheckpointHeader = serde_json::from_str(&header_line)
            .map_err(|e| CrawlError::Store(format!("bad checkpoint header: {e}")))?;

        let mut visited = Vec::new();
        let mut frontier = Vec::new();
        let mut section = None::<&str>;

        for line in lines {
            let line = line.map_err(read_error)?;
            match line.as_str() {
                VISITED_MARKER => section = Some(VISITED_MARKER),
                FRONTIER_MARKER => section = Some(FRONTIER_MARKER),
                "" => {}
                payload => match section {
                    Some(VISITED_MARKER) => visited.push(payload.to_string()),
                    Some(FRONTIER_MARKER) => {
                        let entry: FrontierEntry = serde_json::from_str(payload)
                            .map_err(|e| {
                                CrawlError::Store(format!("bad frontier entry: {e}"))
                            })?;
                        frontier.push(entry);
                    }
                    _ => {
                        return Err(CrawlError::Store(format!(
                            "payload before section marker: {payload:?}"
                        )))
                    }
                },
            }
        }

        Ok(Self {
            header,
            visited,
            frontier,
        })
    }

    /// Restore gate: the schema version must be recognized and the
    /// compatibility digest must match. A changed full-options digest is
    /// only worth a warning.
    pub fn validate(
        &self,
        config_digest: &str,
        options_digest: Option<&str>,
    ) -> Result<(), CrawlError> {
        if self.header.version != SCHEMA_VERSION {
            return Err(CrawlError::Config(format!(
                "unrecognized checkpoint schema version {} (expected {SCHEMA_VERSION})",
                self.header.version
            )));
        }
        if self.header.config_digest != config_digest {
            return Err(CrawlError::Config(
                "checkpoint was written with an incompatible allow-list or \
                 normalization config"
                    .to_string(),
            ));
        }
        if let (Some(stored), Some(current)) = (&self.header.options_digest, options_digest) {
            if stored != current {
                warn!("config options differ from the checkpointed run; continuing");
            }
        }
        Ok(())
    }
}

fn write_error(e: std::io::Error) -> CrawlError {
    CrawlError::Store(format!("checkpoint write: {e}"))
}

fn read_error(e: std::io::Error) -> CrawlError {
    CrawlError::Store(format!("checkpoint read: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint::new(
            "digest-a".to_string(),
            Some("digest-full".to_string()),
            StatsSnapshot {
                admitted: 3,
                processed: 1,
                succeeded: 1,
                ..StatsSnapshot::default()
            },
            vec!["http://h/a".to_string()],
            vec![
                FrontierEntry {
                    url: "http://h/b".to_string(),
                    depth: 1,
                    priority: 0.5,
                    parent: Some("http://h/a".to_string()),
                    retries: 0,
                },
                FrontierEntry {
                    url: "http://h/c".to_string(),
                    depth: 2,
                    priority: 0.25,
                    parent: Some("http://h/b".to_string()),
                    retries: 1,
                },
            ],
        )
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.dh");

        let checkpoint = sample();
        checkpoint.write_atomic(&path).unwrap();
        // No temp residue after the rename.
        assert!(!path.with_extension("tmp").exists());

        let loaded = Checkpoint::read(&path).unwrap();
        assert_eq!(loaded.header.version, SCHEMA_VERSION);
        assert_eq!(loaded.header.config_digest, "digest-a");
        assert_eq!(loaded.header.stats.admitted, 3);
        assert_eq!(loaded.visited, vec!["http://h/a"]);
        assert_eq!(loaded.frontier.len(), 2);
        assert_eq!(loaded.frontier[1].retries, 1);
    }

    #[test]
    fn test_file_layout_is_line_oriented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.dh");
        sample().write_atomic(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with('{'), "line 1 is the JSON header");
        assert_eq!(lines[1], "@@visited");
        assert_eq!(lines[2], "http://h/a");
        assert_eq!(lines[3], "@@frontier");
        assert!(lines[4].contains("\"url\":\"http://h/b\""));
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mut checkpoint = sample();
        checkpoint.header.version = 2;
        let err = checkpoint.validate("digest-a", None).unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_incompatible_digest() {
        let checkpoint = sample();
        assert!(checkpoint.validate("other-digest", None).is_err());
        assert!(checkpoint.validate("digest-a", None).is_ok());
    }

    #[test]
    fn test_entry_record_round_trip() {
        let entry = FrontierEntry {
            url: "http://h/x?a=1".to_string(),
            depth: 3,
            priority: 0.125,
            parent: None,
            retries: 2,
        };
        let record = entry.clone().into_record().unwrap();
        assert_eq!(record.host, "h");
        assert_eq!(record.retry_count, 2);
        let back = FrontierEntry::from(&record);
        assert_eq!(back.url, entry.url);
        assert_eq!(back.priority, entry.priority);
    }

    #[test]
    fn test_rewrite_is_atomic_against_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.dh");
        sample().write_atomic(&path).unwrap();

        let mut second = sample();
        second.visited.push("http://h/b".to_string());
        second.frontier.clear();
        second.write_atomic(&path).unwrap();

        let loaded = Checkpoint::read(&path).unwrap();
        assert_eq!(loaded.visited.len(), 2);
        assert!(loaded.frontier.is_empty());
    }
}
