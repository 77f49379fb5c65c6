//! Pipeline orchestrator: acquirer → normalizer → publisher.
//!
//! One run handles one trade date and is strictly sequential. Each stage
//! only sees what the previous one produced: a file path, then a
//! [`Batch`](crate::models::Batch). A fatal normalization error stops the
//! run before anything is published.
//!
//! Re-running a date is safe: the publisher replaces the partition.

use crate::acquirer::{self, Acquirer, AcquireError};
use crate::config::AppConfig;
use crate::loader::raw_filename;
use crate::models::BatchSummary;
use crate::normalizer::{NormalizeError, Normalizer, RejectionReport};
use crate::publisher::{FsPublisher, PublishError, PublishReceipt, Publisher};
use crate::utils::Timer;
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("acquire stage failed")]
    Acquire(#[from] AcquireError),

    #[error("normalize stage failed")]
    Normalize(#[from] NormalizeError),

    #[error("publish stage failed")]
    Publish(#[from] PublishError),
}

#[derive(Debug)]
pub enum RunOutcome {
    Published(PipelineStats),
    NotATradingDay {
        requested: NaiveDate,
        available: Option<NaiveDate>,
    },
}

#[derive(Debug)]
pub struct PipelineStats {
    pub trade_date: NaiveDate,
    pub source_file: PathBuf,
    pub report: RejectionReport,
    pub summary: BatchSummary,
    pub receipt: PublishReceipt,
}

pub struct Pipeline {
    config: AppConfig,
    acquirer: Box<dyn Acquirer>,
    normalizer: Normalizer,
    publisher: Box<dyn Publisher>,
}

impl Pipeline {
    /// Wire up the collaborators selected by `config`.
    pub fn new(config: AppConfig) -> Result<Self, PipelineError> {
        let acquirer = acquirer::from_config(&config.acquirer, config.normalizer.header_lines)?;
        let publisher = Box::new(FsPublisher::new(
            &config.storage,
            !config.pipeline.skip_upload,
        ));
        Self::with_parts(config, acquirer, publisher)
    }

    pub fn with_parts(
        config: AppConfig,
        acquirer: Box<dyn Acquirer>,
        publisher: Box<dyn Publisher>,
    ) -> Result<Self, PipelineError> {
        let normalizer = Normalizer::new(&config.normalizer)?;
        Ok(Self {
            config,
            acquirer,
            normalizer,
            publisher,
        })
    }

    pub async fn run(&self, date: NaiveDate) -> Result<RunOutcome, PipelineError> {
        let _t = Timer::start(format!("IBOV pipeline for {date}"));

        // ── 1. Acquire ────────────────────────────────────────────────────────
        info!("=== Step 1: Acquiring export for {} ===", date);
        let path = match self.acquire(date).await {
            Ok(path) => path,
            Err(AcquireError::NotATradingDay {
                requested,
                available,
            }) => {
                info!(
                    "{} is not a trading day (latest export: {:?}); nothing to do",
                    requested, available
                );
                return Ok(RunOutcome::NotATradingDay {
                    requested,
                    available,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // ── 2. Normalize ──────────────────────────────────────────────────────
        info!("=== Step 2: Normalizing {:?} ===", path);
        let normalized = {
            let _t = Timer::start("normalize");
            self.normalizer.normalize_file(&path, date)?
        };
        let report = normalized.report;
        let batch = normalized.batch;

        for (reason, count) in report.by_reason() {
            warn!("{} row(s) rejected: {}", count, reason);
        }

        // ── 3. Publish ────────────────────────────────────────────────────────
        info!("=== Step 3: Publishing {} records ===", batch.len());
        let receipt = self.publisher.publish(&batch).await?;

        info!(
            "=== Done: {} | {} processed | {} accepted | {} rejected | {} sentinel | {} blank ===",
            batch.trade_date(),
            report.rows_processed,
            report.accepted,
            report.rejected(),
            report.sentinels_skipped,
            report.blank_skipped
        );

        Ok(RunOutcome::Published(PipelineStats {
            trade_date: batch.trade_date(),
            source_file: path,
            summary: batch.summary(),
            report,
            receipt,
        }))
    }

    async fn acquire(&self, date: NaiveDate) -> Result<PathBuf, AcquireError> {
        if self.config.pipeline.skip_download {
            let existing = self.config.acquirer.download_dir.join(raw_filename(date));
            if existing.is_file() {
                info!("Download skipped; using {:?}", existing);
                return Ok(existing);
            }
            warn!("{:?} not present; downloading anyway", existing);
        }
        self.acquirer.acquire(date).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, StorageConfig};
    use crate::storage::ParquetStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const EXPORT: &str = "IBOV - Carteira do Dia 04/08/25\n\
        Código;Ação;Tipo;Qtde. Teórica;Part. (%);\n\
        PETR4;PETROBRAS;PN N2;4.566.099.516;8,75;\n\
        VALE3;VALE;ON NM;N/D;10,12;\n\
        ITUB4;ITAUUNIBANCO;PN N1;4.801.593.832;7,55;\n\
        Quantidade Teórica Total;;;97.829.128.484;100,000;\n\
        Redutor;;;;18.231,41813237;\n";

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 4).unwrap()
    }

    /// Writes `text` as the day's export and counts calls.
    struct FakeAcquirer {
        dir: PathBuf,
        text: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acquirer for FakeAcquirer {
        async fn acquire(&self, date: NaiveDate) -> Result<PathBuf, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if date != monday() {
                return Err(AcquireError::NotATradingDay {
                    requested: date,
                    available: Some(monday()),
                });
            }
            let path = self.dir.join(raw_filename(date));
            std::fs::write(&path, self.text).map_err(|source| AcquireError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(path)
        }
    }

    fn config(root: &Path, pipeline: PipelineConfig) -> AppConfig {
        let mut config = AppConfig {
            storage: StorageConfig {
                data_dir: root.join("data"),
                bucket_root: root.join("bucket"),
                retry_base_ms: 1,
                ..StorageConfig::default()
            },
            pipeline,
            ..AppConfig::default()
        };
        config.acquirer.download_dir = root.to_path_buf();
        config
    }

    fn pipeline(root: &Path, text: &'static str, pipeline: PipelineConfig) -> (Pipeline, Arc<AtomicUsize>) {
        let config = config(root, pipeline);
        let calls = Arc::new(AtomicUsize::new(0));
        let acquirer = Box::new(FakeAcquirer {
            dir: root.to_path_buf(),
            text,
            calls: Arc::clone(&calls),
        });
        let publisher = Box::new(FsPublisher::new(&config.storage, !config.pipeline.skip_upload));
        (
            Pipeline::with_parts(config, acquirer, publisher).unwrap(),
            calls,
        )
    }

    #[test]
    fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (p, calls) = pipeline(dir.path(), EXPORT, PipelineConfig::default());

        let outcome = tokio_test::block_on(p.run(monday())).unwrap();
        let stats = match outcome {
            RunOutcome::Published(stats) => stats,
            other => panic!("expected Published, got {other:?}"),
        };
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.trade_date, monday());
        assert_eq!(stats.report.rows_processed, 3);
        assert_eq!(stats.report.accepted, 2);
        assert_eq!(stats.report.rejected(), 1);
        assert_eq!(stats.summary.total_rows, 2);

        let key = stats.receipt.key.unwrap();
        assert_eq!(key, "raw/date=2025-08-04/IBOVDia_04-08-25.parquet");
        let store = ParquetStore::open_in_memory().unwrap();
        let records = store
            .read_records(&dir.path().join("bucket").join(key), None)
            .unwrap();
        let codes: Vec<&str> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["PETR4", "ITUB4"]);
    }

    #[test]
    fn test_not_a_trading_day_is_an_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(dir.path(), EXPORT, PipelineConfig::default());
        let holiday = NaiveDate::from_ymd_opt(2025, 8, 5).unwrap();

        match tokio_test::block_on(p.run(holiday)).unwrap() {
            RunOutcome::NotATradingDay {
                requested,
                available,
            } => {
                assert_eq!(requested, holiday);
                assert_eq!(available, Some(monday()));
            }
            other => panic!("expected NotATradingDay, got {other:?}"),
        }
        assert!(!dir.path().join("bucket").exists());
    }

    #[test]
    fn test_fatal_normalize_error_stops_before_publish() {
        let dir = tempfile::tempdir().unwrap();
        let broken = "IBOV - Carteira do Dia 04/08/25\nCódigo;Ação;Tipo;Part. (%);\nPETR4;PETROBRAS;PN;8,75;\n;;;\n;;;\n";
        let (p, _) = pipeline(dir.path(), broken, PipelineConfig::default());

        let err = tokio_test::block_on(p.run(monday())).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Normalize(NormalizeError::MissingColumn { .. })
        ));
        assert!(!dir.path().join("data").exists());
        assert!(!dir.path().join("bucket").exists());
    }

    #[test]
    fn test_skip_download_reuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(raw_filename(monday())), EXPORT).unwrap();
        let (p, calls) = pipeline(
            dir.path(),
            EXPORT,
            PipelineConfig {
                skip_download: true,
                skip_upload: true,
            },
        );

        match tokio_test::block_on(p.run(monday())).unwrap() {
            RunOutcome::Published(stats) => {
                assert!(stats.receipt.key.is_none());
                assert!(stats.receipt.local_path.is_file());
            }
            other => panic!("expected Published, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("bucket").exists());
    }
}
