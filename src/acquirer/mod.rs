pub mod http_client;

use crate::config::{AcquirerConfig, SourceKind};
use crate::loader::{discover_exports, raw_filename};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub use self::http_client::B3HttpAcquirer;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AcquireError {
    /// Weekend, holiday, or the portal still serving the previous session.
    /// Not a failure; the run should end quietly.
    #[error("{requested} is not a trading day (latest export available: {available:?})")]
    NotATradingDay {
        requested: NaiveDate,
        available: Option<NaiveDate>,
    },

    #[error("no export available for {date}: {reason}")]
    Unavailable { date: NaiveDate, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("unexpected portfolio payload: {0}")]
    BadPayload(String),

    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    /// Worth another attempt with the same inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            AcquireError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AcquireError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Produces the raw export file for a trade date.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, date: NaiveDate) -> Result<PathBuf, AcquireError>;
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Build the acquirer selected by `config.source`. `title_lines` is the
/// normalizer's header line count, used to read the served trade date.
pub fn from_config(
    config: &AcquirerConfig,
    title_lines: usize,
) -> Result<Box<dyn Acquirer>, AcquireError> {
    Ok(match config.source {
        SourceKind::Http => Box::new(B3HttpAcquirer::new(config, title_lines)?),
        SourceKind::Local => Box::new(LocalAcquirer::new(&config.download_dir)),
    })
}

fn latest_export(dir: &Path) -> Option<NaiveDate> {
    discover_exports(dir).ok()?.first().map(|(d, _)| *d)
}

// ── Local directory ───────────────────────────────────────────────────────────

/// Picks up `IBOVDia_dd-mm-yy.csv` files that were dropped into a directory
/// by some other process.
pub struct LocalAcquirer {
    dir: PathBuf,
}

impl LocalAcquirer {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(raw_filename(date))
    }
}

#[async_trait]
impl Acquirer for LocalAcquirer {
    async fn acquire(&self, date: NaiveDate) -> Result<PathBuf, AcquireError> {
        if is_weekend(date) {
            return Err(AcquireError::NotATradingDay {
                requested: date,
                available: latest_export(&self.dir),
            });
        }

        let path = self.path_for(date);
        debug!("Looking for {:?}", path);
        if path.is_file() {
            info!("Using local export {:?}", path);
            return Ok(path);
        }

        Err(AcquireError::Unavailable {
            date,
            reason: format!(
                "{} not found in {:?} (latest present: {:?})",
                raw_filename(date),
                self.dir,
                latest_export(&self.dir)
            ),
        })
    }
}
