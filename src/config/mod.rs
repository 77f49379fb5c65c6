use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub acquirer: AcquirerConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Download the day's portfolio from the B3 index proxy.
    Http,
    /// Pick up a file someone else already dropped into `download_dir`.
    Local,
}

/// Acquirer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcquirerConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_index")]
    pub index: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Raw export layout and row rules
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default = "default_header_lines")]
    pub header_lines: usize,

    #[serde(default = "default_footer_lines")]
    pub footer_lines: usize,

    #[serde(default = "default_ticker_pattern")]
    pub ticker_pattern: String,

    #[serde(default = "default_sentinels")]
    pub sentinels: Vec<String>,

    /// Allowed distance of the weight sum from 100 before a warning is logged.
    #[serde(default = "default_weight_sum_tolerance")]
    pub weight_sum_tolerance: Decimal,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Local staging directory for Parquet files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Durable destination (e.g. a mounted bucket).
    #[serde(default = "default_bucket_root")]
    pub bucket_root: PathBuf,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

/// Pipeline configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Reuse an export already in `download_dir` instead of fetching.
    #[serde(default)]
    pub skip_download: bool,

    #[serde(default)]
    pub skip_upload: bool,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_source() -> SourceKind {
    SourceKind::Http
}
fn default_base_url() -> String {
    "https://sistemaswebb3-listados.b3.com.br/indexProxy/indexCall/".to_string()
}
fn default_index() -> String {
    "IBOV".to_string()
}
fn default_language() -> String {
    "pt-br".to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_user_agent() -> String {
    "ibov-etl/0.1 (daily index composition snapshot)".to_string()
}
fn default_delimiter() -> char {
    ';'
}
fn default_header_lines() -> usize {
    1
}
fn default_footer_lines() -> usize {
    2
}
fn default_ticker_pattern() -> String {
    r"^[A-Z]{4}[0-9]{1,2}$".to_string()
}
fn default_sentinels() -> Vec<String> {
    vec![
        "Total".to_string(),
        "Quantidade Teórica Total".to_string(),
        "Redutor".to_string(),
    ]
}
fn default_weight_sum_tolerance() -> Decimal {
    Decimal::new(5, 1)
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_bucket_root() -> PathBuf {
    PathBuf::from("bucket")
}
fn default_key_prefix() -> String {
    "raw".to_string()
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            base_url: default_base_url(),
            index: default_index(),
            language: default_language(),
            download_dir: default_download_dir(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            header_lines: default_header_lines(),
            footer_lines: default_footer_lines(),
            ticker_pattern: default_ticker_pattern(),
            sentinels: default_sentinels(),
            weight_sum_tolerance: default_weight_sum_tolerance(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bucket_root: default_bucket_root(),
            key_prefix: default_key_prefix(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::load_from(Path::new("config"))
    }

    /// `<dir>/default.toml`, then `<dir>/local.toml`, then `IBOV__*` env vars.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name(&dir.join("default").to_string_lossy())
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name(&dir.join("local").to_string_lossy())
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("IBOV").separator("__"))
            .build()
            .context("Failed to read configuration sources")?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}

/// Contents of `.env.template`.
pub const ENV_TEMPLATE: &str = "\
# ibov-etl settings; copy to .env and adjust
# IBOV__ACQUIRER__SOURCE=http            # http | local
# IBOV__ACQUIRER__DOWNLOAD_DIR=downloads
# IBOV__ACQUIRER__TIMEOUT_SECS=30
# IBOV__ACQUIRER__MAX_RETRIES=3
# IBOV__NORMALIZER__HEADER_LINES=1
# IBOV__NORMALIZER__FOOTER_LINES=2
# IBOV__STORAGE__DATA_DIR=data
IBOV__STORAGE__BUCKET_ROOT=/mnt/your-bucket
# IBOV__STORAGE__KEY_PREFIX=raw
# IBOV__PIPELINE__SKIP_UPLOAD=false
RUST_LOG=ibov_etl=info
";
