//! Hands a validated batch to durable storage.
//!
//! The batch is staged locally as Parquet (`<data_dir>/IBOVDia_dd-mm-yy.parquet`)
//! and then copied under a date-partitioned key into the bucket root:
//!
//! ```text
//! <bucket_root>/<prefix>/date=2025-08-04/IBOVDia_04-08-25.parquet
//! <bucket_root>/<prefix>/date=2025-08-04/IBOVDia_04-08-25.parquet.metadata.json
//! ```
//!
//! Republishing a date replaces both objects.

use crate::config::StorageConfig;
use crate::loader::parquet_filename;
use crate::models::{Batch, BatchMetadata};
use crate::storage::{ParquetStore, StorageError};
use crate::utils::backoff;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

pub const SOURCE: &str = "b3-ibovespa";

const SIDECAR_SUFFIX: &str = ".metadata.json";
const PART_SUFFIX: &str = ".part";
const ACCESS_CHECK_FILE: &str = ".ibov-etl-write-check";

#[derive(Debug, Error)]
pub enum PublishError {
    /// Destination hiccup; the same batch can be published again unchanged.
    #[error("transient failure writing {path:?}")]
    Transient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bucket root cannot be created or written; retrying won't help.
    #[error("bucket root {path:?} is not usable")]
    BucketUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not serialize batch")]
    Serialize(#[from] StorageError),

    #[error("could not encode object metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("uploaded {found} bytes to {key} but staged {expected}")]
    SizeMismatch {
        key: String,
        expected: u64,
        found: u64,
    },
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }
}

/// Sidecar written next to every published object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub pipeline_version: String,
    pub processing_date: NaiveDateTime,
    pub data_date: NaiveDate,
    pub source: String,
    pub record_count: usize,
    pub file_size: u64,
}

/// What the bucket knows about one published object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// `None` when the sidecar is missing or unreadable.
    pub metadata: Option<ObjectMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub local_path: PathBuf,
    /// `None` when the upload step was skipped.
    pub key: Option<String>,
    pub bytes: u64,
    pub metadata: BatchMetadata,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, batch: &Batch) -> Result<PublishReceipt, PublishError>;
}

/// `raw/date=2025-08-04/IBOVDia_04-08-25.parquet`
pub fn object_key(prefix: &str, date: NaiveDate) -> String {
    let partition = format!("date={}", date.format("%Y-%m-%d"));
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{partition}/{}", parquet_filename(date))
    } else {
        format!("{prefix}/{partition}/{}", parquet_filename(date))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn sidecar_path(object: &Path) -> PathBuf {
    with_suffix(object, SIDECAR_SUFFIX)
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let hidden = rel
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if !hidden && !key.ends_with(SIDECAR_SUFFIX) && !key.ends_with(PART_SUFFIX) {
            keys.push(key);
        }
    }
    Ok(())
}

// ── Filesystem bucket ─────────────────────────────────────────────────────────

/// Publishes into a directory tree standing in for an object store
/// (a mounted bucket, a shared volume).
pub struct FsPublisher {
    config: StorageConfig,
    upload: bool,
}

impl FsPublisher {
    pub fn new(config: &StorageConfig, upload: bool) -> Self {
        Self {
            config: config.clone(),
            upload,
        }
    }

    /// Make sure the bucket root exists and accepts writes before any work
    /// is staged for it.
    pub async fn check_access(&self) -> Result<(), PublishError> {
        let root = &self.config.bucket_root;
        let unavailable = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PublishError::BucketUnavailable { path, source }
        };

        tokio::fs::create_dir_all(root)
            .await
            .map_err(unavailable(root))?;
        let marker = root.join(ACCESS_CHECK_FILE);
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(unavailable(&marker))?;
        tokio::fs::remove_file(&marker)
            .await
            .map_err(unavailable(&marker))?;

        debug!("Bucket root {:?} is writable", root);
        Ok(())
    }

    /// Published object keys under `prefix`, sorted. Sidecars and partial
    /// uploads are not objects.
    pub fn list_objects(&self, prefix: &str) -> Result<Vec<String>, PublishError> {
        let root = &self.config.bucket_root;
        if !root.is_dir() {
            return Ok(vec![]);
        }

        let mut keys = Vec::new();
        collect_keys(root, root, &mut keys).map_err(|source| PublishError::BucketUnavailable {
            path: root.clone(),
            source,
        })?;
        let prefix = prefix.trim_start_matches('/');
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();

        info!("Found {} objects with prefix '{}'", keys.len(), prefix);
        Ok(keys)
    }

    /// Size, modification time and sidecar of one object; `None` if absent.
    pub fn object_info(&self, key: &str) -> Option<ObjectInfo> {
        let path = self.config.bucket_root.join(key.trim_start_matches('/'));
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                warn!("Object not found: {}", key);
                return None;
            }
        };

        let metadata = std::fs::read_to_string(sidecar_path(&path))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok());

        Some(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            metadata,
        })
    }

    /// Write the batch as Parquet into the local data dir.
    pub fn stage(&self, batch: &Batch) -> Result<(PathBuf, u64), PublishError> {
        let path = self
            .config
            .data_dir
            .join(parquet_filename(batch.trade_date()));
        let store = ParquetStore::open_in_memory()?;
        let bytes = store.write_verified(batch, &path)?;
        Ok((path, bytes))
    }

    /// Copy via a temp file and rename so readers never see a half object.
    async fn put(&self, dest: &Path, contents: &[u8]) -> Result<(), PublishError> {
        let transient = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PublishError::Transient { path, source }
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(transient(parent))?;
        }

        let tmp = with_suffix(dest, PART_SUFFIX);

        tokio::fs::write(&tmp, contents)
            .await
            .map_err(transient(&tmp))?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(transient(dest))?;
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<u64, PublishError> {
        let contents = tokio::fs::read(local)
            .await
            .map_err(|source| PublishError::Transient {
                path: local.to_path_buf(),
                source,
            })?;

        let dest = self.config.bucket_root.join(key);
        self.put(&dest, &contents).await?;
        self.put(
            &sidecar_path(&dest),
            serde_json::to_string_pretty(metadata)?.as_bytes(),
        )
        .await?;

        let found = tokio::fs::metadata(&dest)
            .await
            .map_err(|source| PublishError::Transient {
                path: dest.clone(),
                source,
            })?
            .len();
        if found != metadata.file_size {
            return Err(PublishError::SizeMismatch {
                key: key.to_string(),
                expected: metadata.file_size,
                found,
            });
        }
        debug!("Verified {} ({} bytes)", key, found);
        Ok(found)
    }
}

#[async_trait]
impl Publisher for FsPublisher {
    async fn publish(&self, batch: &Batch) -> Result<PublishReceipt, PublishError> {
        if self.upload {
            self.check_access().await?;
        }
        let (local_path, bytes) = self.stage(batch)?;
        let batch_meta = batch.metadata();

        if !self.upload {
            info!("Upload skipped; Parquet kept at {:?}", local_path);
            return Ok(PublishReceipt {
                local_path,
                key: None,
                bytes,
                metadata: batch_meta,
            });
        }

        let key = object_key(&self.config.key_prefix, batch.trade_date());
        let metadata = ObjectMetadata {
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
            processing_date: Utc::now().naive_utc(),
            data_date: batch.trade_date(),
            source: SOURCE.to_string(),
            record_count: batch.len(),
            file_size: bytes,
        };

        let strategy = backoff(self.config.retry_base_ms, self.config.max_retries);
        RetryIf::spawn(
            strategy,
            || self.upload(&local_path, &key, &metadata),
            |e: &PublishError| {
                let retry = e.is_transient();
                if retry {
                    warn!("Upload of {} failed, retrying: {}", key, e);
                }
                retry
            },
        )
        .await?;

        info!(
            "Published {} records to {:?}",
            batch.len(),
            self.config.bucket_root.join(&key)
        );

        Ok(PublishReceipt {
            local_path,
            key: Some(key),
            bytes,
            metadata: batch_meta,
        })
    }
}
