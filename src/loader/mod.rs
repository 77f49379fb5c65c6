//! Raw export files on disk: naming, discovery and decoding.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::normalizer::cleaner::parse_br_date;

const RAW_PREFIX: &str = "IBOVDia_";
const FILE_DATE_FORMAT: &str = "%d-%m-%y";

/// `IBOVDia_04-08-25.csv`
pub fn raw_filename(date: NaiveDate) -> String {
    format!("{RAW_PREFIX}{}.csv", date.format(FILE_DATE_FORMAT))
}

/// `IBOVDia_04-08-25.parquet`
pub fn parquet_filename(date: NaiveDate) -> String {
    format!("{RAW_PREFIX}{}.parquet", date.format(FILE_DATE_FORMAT))
}

/// Extract the trade date from an export filename.
pub fn date_from_filename(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    let date = stem.strip_prefix(RAW_PREFIX)?;
    NaiveDate::parse_from_str(date, FILE_DATE_FORMAT).ok()
}

/// Decode export bytes. B3 serves Latin-1; UTF-8 (with or without BOM) is
/// accepted as well.
pub fn decode_export(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // ISO-8859-1 maps every byte to the code point of the same value
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Trade date printed in the first `title_lines` lines, e.g.
/// `IBOV - Carteira do Dia 04/08/25`.
pub fn export_date(text: &str, title_lines: usize) -> Option<NaiveDate> {
    text.lines()
        .take(title_lines)
        .flat_map(str::split_whitespace)
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_digit()))
        .filter(|token| token.contains('/'))
        .find_map(parse_br_date)
}

pub fn read_export(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    debug!("Read {} bytes from {:?}", bytes.len(), path);
    Ok(decode_export(&bytes))
}

/// Exports already present in `dir`, newest trade date first.
pub fn discover_exports(dir: &Path) -> std::io::Result<Vec<(NaiveDate, PathBuf)>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path.extension().map(|e| e == "csv").unwrap_or(false);
        if path.is_file() && is_csv {
            if let Some(date) = date_from_filename(&path) {
                files.push((date, path));
            }
        }
    }
    files.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(files)
}
