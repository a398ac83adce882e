pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod plugin;
pub mod rules;
pub mod stats;
pub mod types;
pub mod urlnorm;

pub use config::{AppConfig, DomainPolicy, Strategy};
pub use error::{CrawlError, ErrorKind};
pub use metrics::CrawlMetrics;
pub use rules::{RuleSet, SiteRule};
pub use stats::{CrawlStats, StatsSnapshot};
pub use types::*;
pub use urlnorm::UrlNormalizer;
