use super::{is_weekend, Acquirer, AcquireError};
use crate::config::AcquirerConfig;
use crate::loader::{decode_export, export_date, raw_filename};
use crate::utils::backoff;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};
use url::Url;

const PORTFOLIO_ENDPOINT: &str = "GetDownloadPortfolioDay";

#[derive(Serialize)]
struct PortfolioRequest<'a> {
    index: &'a str,
    language: &'a str,
}

/// Path segment the index proxy expects: the request as base64 JSON.
pub fn encode_request(index: &str, language: &str) -> String {
    // serializing two borrowed strs cannot fail
    let json = serde_json::to_string(&PortfolioRequest { index, language }).unwrap_or_default();
    STANDARD.encode(json)
}

/// The proxy answers with the CSV as base64, usually wrapped in a JSON string.
pub fn decode_portfolio_payload(body: &str) -> Result<Vec<u8>, AcquireError> {
    let body = body.trim();
    let encoded = if body.starts_with('"') {
        serde_json::from_str::<String>(body)
            .map_err(|e| AcquireError::BadPayload(format!("not a JSON string: {e}")))?
    } else {
        body.to_string()
    };

    if encoded.is_empty() {
        return Err(AcquireError::BadPayload("empty body".into()));
    }

    STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| AcquireError::BadPayload(format!("not base64: {e}")))
}

/// Downloads the day's portfolio from the B3 index proxy into `download_dir`.
pub struct B3HttpAcquirer {
    inner: reqwest::Client,
    config: AcquirerConfig,
    base: Url,
    /// Lines before the column header; same value the normalizer cuts.
    title_lines: usize,
}

impl B3HttpAcquirer {
    pub fn new(config: &AcquirerConfig, title_lines: usize) -> Result<Self, AcquireError> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // the proxy sets a session cookie on first contact
            .cookie_store(true)
            .build()?;

        let base_url = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let base = Url::parse(&base_url)
            .map_err(|e| AcquireError::BadPayload(format!("base_url {base_url:?}: {e}")))?;

        Ok(Self {
            inner,
            config: config.clone(),
            base,
            title_lines,
        })
    }

    /// Trade date the downloaded export claims to be for.
    pub fn served_date(&self, bytes: &[u8]) -> Option<NaiveDate> {
        export_date(&decode_export(bytes), self.title_lines)
    }

    pub fn portfolio_url(&self) -> Result<Url, AcquireError> {
        let segment = encode_request(&self.config.index, &self.config.language);
        self.base
            .join(&format!("{PORTFOLIO_ENDPOINT}/{segment}"))
            .map_err(|e| AcquireError::BadPayload(format!("portfolio url: {e}")))
    }

    async fn get_text(&self, url: &Url) -> Result<String, AcquireError> {
        debug!("GET {}", url);
        let resp = self.inner.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AcquireError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    /// Fetch with retry on timeouts, connection failures, 429 and 5xx.
    pub async fn fetch_portfolio(&self) -> Result<Vec<u8>, AcquireError> {
        let url = self.portfolio_url()?;
        let strategy = backoff(self.config.retry_base_ms, self.config.max_retries);

        let body = RetryIf::spawn(
            strategy,
            || self.get_text(&url),
            |e: &AcquireError| {
                let retry = e.is_transient();
                if retry {
                    warn!("Portfolio download failed, retrying: {}", e);
                }
                retry
            },
        )
        .await?;

        decode_portfolio_payload(&body)
    }
}

#[async_trait]
impl Acquirer for B3HttpAcquirer {
    async fn acquire(&self, date: NaiveDate) -> Result<PathBuf, AcquireError> {
        if is_weekend(date) {
            return Err(AcquireError::NotATradingDay {
                requested: date,
                available: None,
            });
        }

        let bytes = self.fetch_portfolio().await?;
        let served = self.served_date(&bytes);
        if served.is_none() {
            warn!("Export title carries no date; filing it under {}", date);
        }
        let file_date = served.unwrap_or(date);

        let dir = &self.config.download_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| AcquireError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(raw_filename(file_date));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| AcquireError::Io {
                path: path.clone(),
                source,
            })?;
        info!("Saved {} bytes to {:?}", bytes.len(), path);

        // B3 keeps serving the last session on holidays
        if file_date != date {
            return Err(AcquireError::NotATradingDay {
                requested: date,
                available: Some(file_date),
            });
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        assert_eq!(
            encode_request("IBOV", "pt-br"),
            "eyJpbmRleCI6IklCT1YiLCJsYW5ndWFnZSI6InB0LWJyIn0="
        );
    }

    #[test]
    fn test_portfolio_url() {
        let acq = B3HttpAcquirer::new(&AcquirerConfig::default(), 1).unwrap();
        assert_eq!(
            acq.portfolio_url().unwrap().as_str(),
            "https://sistemaswebb3-listados.b3.com.br/indexProxy/indexCall/\
             GetDownloadPortfolioDay/eyJpbmRleCI6IklCT1YiLCJsYW5ndWFnZSI6InB0LWJyIn0="
        );
    }

    #[test]
    fn test_base_url_without_trailing_slash() {
        let config = AcquirerConfig {
            base_url: "http://localhost:8080/indexCall".into(),
            ..AcquirerConfig::default()
        };
        let acq = B3HttpAcquirer::new(&config, 1).unwrap();
        assert!(
            acq.portfolio_url()
                .unwrap()
                .as_str()
                .starts_with("http://localhost:8080/indexCall/GetDownloadPortfolioDay/")
        );
    }

    #[test]
    fn test_decode_payload_json_string() {
        let body = "\"SUJPViAtIENhcnRlaXJhIGRvIERpYSAwNC8wOC8yNQpD82RpZ287\"";
        let bytes = decode_portfolio_payload(body).unwrap();
        let text = decode_export(&bytes);
        assert_eq!(text, "IBOV - Carteira do Dia 04/08/25\nCódigo;");
        assert_eq!(export_date(&text, 1), NaiveDate::from_ymd_opt(2025, 8, 4));
    }

    #[test]
    fn test_decode_payload_bare_base64() {
        let bytes = decode_portfolio_payload("SUJPVg==\n").unwrap();
        assert_eq!(bytes, b"IBOV");
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert!(matches!(
            decode_portfolio_payload("<html>error</html>"),
            Err(AcquireError::BadPayload(_))
        ));
        assert!(matches!(decode_portfolio_payload("\"\""), Err(AcquireError::BadPayload(_))));
    }

    #[test]
    fn test_served_date_follows_title_lines() {
        let export = "IBOV - Carteira Teórica\nválida para 04/08/25\nCódigo;Ação\n";
        let one = B3HttpAcquirer::new(&AcquirerConfig::default(), 1).unwrap();
        let two = B3HttpAcquirer::new(&AcquirerConfig::default(), 2).unwrap();
        assert_eq!(one.served_date(export.as_bytes()), None);
        assert_eq!(
            two.served_date(export.as_bytes()),
            NaiveDate::from_ymd_opt(2025, 8, 4)
        );
    }

    #[test]
    fn test_weekend_short_circuits() {
        let acq = B3HttpAcquirer::new(&AcquirerConfig::default(), 1).unwrap();
        let sunday = NaiveDate::from_ymd_opt(2025, 8, 3).unwrap();
        assert!(matches!(
            tokio_test::block_on(acq.acquire(sunday)),
            Err(AcquireError::NotATradingDay { available: None, .. })
        ));
    }
}
