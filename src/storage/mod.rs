//! Columnar persistence: batches go through an in-memory DuckDB table and
//! leave as Parquet via `COPY … TO`.

use crate::models::{AssetRecord, Batch};
use duckdb::{params, Connection};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE OR REPLACE TABLE ibov_composition (
    seq                  INTEGER       NOT NULL,
    code                 VARCHAR       NOT NULL PRIMARY KEY,
    name                 VARCHAR       NOT NULL,
    share_class          VARCHAR       NOT NULL,
    theoretical_quantity UBIGINT       NOT NULL,
    -- six places covers every weight the parser accepts
    index_weight_pct     DECIMAL(18,6) NOT NULL,
    trade_date           DATE          NOT NULL,
    extracted_at         TIMESTAMP     NOT NULL
);
"#;

const COLUMNS: &str =
    "code, name, share_class, theoretical_quantity, index_weight_pct, trade_date, extracted_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb: {0}")]
    Duckdb(#[from] duckdb::Error),

    #[error("could not prepare {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored weight '{0}' is not a decimal")]
    BadDecimal(String),

    #[error("wrote {expected} rows to {path:?} but read back {found}")]
    RowCountMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn sql_literal(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "''"))
}

// ── ParquetStore ──────────────────────────────────────────────────────────────

pub struct ParquetStore {
    conn: Connection,
}

impl ParquetStore {
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Serialize `batch` to `path` (Snappy-compressed Parquet), replacing any
    /// existing file. Returns the file size in bytes.
    pub fn write_batch(&self, batch: &Batch, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        self.conn.execute_batch(DDL)?;

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO ibov_composition
                (seq, code, name, share_class, theoretical_quantity, index_weight_pct, trade_date, extracted_at)
            VALUES (?, ?, ?, ?, ?, CAST(? AS DECIMAL(18,6)), ?, ?)
        "#;
        for (seq, r) in batch.records().iter().enumerate() {
            let seq = seq as i64;
            tx.execute(
                sql,
                params![
                    seq,
                    r.code,
                    r.name,
                    r.share_class,
                    r.theoretical_quantity,
                    r.index_weight_pct.to_string(),
                    r.trade_date,
                    r.extracted_at,
                ],
            )?;
        }
        tx.commit()?;

        self.conn.execute_batch(&format!(
            "COPY (SELECT {COLUMNS} FROM ibov_composition ORDER BY seq) TO {} (FORMAT PARQUET, COMPRESSION SNAPPY)",
            sql_literal(path)
        ))?;

        let bytes = std::fs::metadata(path)
            .map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        info!(
            "Wrote {} rows to {:?} ({:.1} KB)",
            batch.len(),
            path,
            bytes as f64 / 1024.0
        );
        Ok(bytes)
    }

    /// Write, then read the file back and check nothing was lost.
    pub fn write_verified(&self, batch: &Batch, path: &Path) -> Result<u64> {
        let bytes = self.write_batch(batch, path)?;
        let found = self.count_rows(path)?;
        if found != batch.len() {
            return Err(StorageError::RowCountMismatch {
                path: path.to_path_buf(),
                expected: batch.len(),
                found,
            });
        }
        debug!("Verified {} rows in {:?}", found, path);
        Ok(bytes)
    }

    pub fn count_rows(&self, path: &Path) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM read_parquet({})", sql_literal(path)),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Read records back in file order; `limit` caps how many.
    pub fn read_records(&self, path: &Path, limit: Option<usize>) -> Result<Vec<AssetRecord>> {
        let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT code, name, share_class, theoretical_quantity, \
             CAST(index_weight_pct AS VARCHAR), trade_date, extracted_at \
             FROM read_parquet({}){limit}",
            sql_literal(path)
        ))?;

        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, u64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, chrono::NaiveDate>(5)?,
                r.get::<_, chrono::NaiveDateTime>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (code, name, share_class, theoretical_quantity, weight, trade_date, extracted_at) =
                row?;
            let index_weight_pct =
                Decimal::from_str(&weight).map_err(|_| StorageError::BadDecimal(weight.clone()))?;
            records.push(AssetRecord {
                code,
                name,
                share_class,
                theoretical_quantity,
                index_weight_pct,
                trade_date,
                extracted_at,
            });
        }
        Ok(records)
    }
}
