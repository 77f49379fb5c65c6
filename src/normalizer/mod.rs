//! Raw B3 export → validated [`Batch`].
//!
//! ## Stages, per row
//!
//!   1. Schema mapping: header labels resolved once against [`SchemaMap`]
//!      (fatal if a required column is missing)
//!   2. Row filter: sentinels dropped, ticker format + share count checked
//!   3. Type coercion: pt-BR weights and dates
//!   4. Validation: range, uniqueness, trade date
//!
//! Row-level failures go into the [`RejectionReport`]; only batch-level
//! failures surface as [`NormalizeError`].
//!
//! [`Normalizer::normalize`] is pure: text, fallback date and extraction
//! timestamp in, `(Batch, RejectionReport)` out.

pub mod cleaner;
pub mod error;
pub mod filter;
pub mod report;
pub mod schema;
pub mod validator;

use chrono::{NaiveDate, NaiveDateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::config::NormalizerConfig;
use crate::loader::{export_date, read_export};
use crate::models::{AssetRecord, Batch, MappedRow, RawRecord};

use self::cleaner::{clean_name, normalise_code, parse_br_date, parse_weight};
use self::filter::{RowClass, RowFilter};
use self::validator::Validator;

pub use self::error::NormalizeError;
pub use self::report::{RejectReason, Rejection, RejectionReport, Stage};
pub use self::schema::SchemaMap;

// ── Layout ────────────────────────────────────────────────────────────────────

/// Physical shape of the export around the table itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportLayout {
    pub delimiter: u8,
    /// Title lines before the column header, e.g. `IBOV - Carteira do Dia 04/08/25`.
    pub header_lines: usize,
    /// Summary lines after the table: theoretical total and reducer.
    pub footer_lines: usize,
}

impl Default for ExportLayout {
    fn default() -> Self {
        Self {
            delimiter: b';',
            header_lines: 1,
            footer_lines: 2,
        }
    }
}

/// Output of a successful normalization.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub batch: Batch,
    pub report: RejectionReport,
}

struct Table {
    header: Vec<String>,
    rows: Vec<RawRecord>,
    /// 1-based lines of empty body lines; the csv reader never yields these.
    blank_lines: BTreeSet<u64>,
}

enum Skip {
    Sentinel,
    Rejected(RejectReason),
}

// ── Normalizer ────────────────────────────────────────────────────────────────

pub struct Normalizer {
    layout: ExportLayout,
    schema: SchemaMap,
    filter: RowFilter,
    weight_sum_tolerance: Decimal,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, NormalizeError> {
        let delimiter = u8::try_from(config.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or(NormalizeError::InvalidDelimiter(config.delimiter))?;

        Ok(Self {
            layout: ExportLayout {
                delimiter,
                header_lines: config.header_lines,
                footer_lines: config.footer_lines,
            },
            schema: SchemaMap::default(),
            filter: RowFilter::new(&config.ticker_pattern, &config.sentinels)?,
            weight_sum_tolerance: config.weight_sum_tolerance,
        })
    }

    pub fn with_schema(mut self, schema: SchemaMap) -> Self {
        self.schema = schema;
        self
    }

    pub fn layout(&self) -> ExportLayout {
        self.layout
    }

    /// Read and normalize an acquired export, stamping records with now (UTC,
    /// microsecond precision to match the Parquet timestamp column).
    pub fn normalize_file(
        &self,
        path: &Path,
        fallback_date: NaiveDate,
    ) -> Result<Normalized, NormalizeError> {
        let text = read_export(path).map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Normalizing {:?} ({} bytes)", path, text.len());
        self.normalize(&text, fallback_date, Utc::now().naive_utc().trunc_subsecs(6))
    }

    /// Trade date printed in the title lines, if any.
    pub fn title_date(&self, text: &str) -> Option<NaiveDate> {
        export_date(text, self.layout.header_lines)
    }

    pub fn normalize(
        &self,
        text: &str,
        fallback_date: NaiveDate,
        extracted_at: NaiveDateTime,
    ) -> Result<Normalized, NormalizeError> {
        let trade_date = self.title_date(text).unwrap_or(fallback_date);
        let Table {
            header,
            rows,
            mut blank_lines,
        } = self.read_table(text)?;
        let columns = self.schema.resolve(&header)?;

        let mut report = RejectionReport::default();
        let mut validator = Validator::new(trade_date);
        let mut records = Vec::new();

        for raw in rows {
            if raw.is_blank() {
                blank_lines.insert(raw.line);
                continue;
            }
            report.rows_processed += 1;

            let row = columns.map(&raw);
            match self.coerce(&row, trade_date, extracted_at, &mut validator) {
                Ok(record) => records.push(record),
                Err(Skip::Sentinel) => {
                    debug!("line {}: sentinel row skipped", row.line);
                    report.sentinels_skipped += 1;
                }
                Err(Skip::Rejected(reason)) => {
                    debug!("line {}: {} ({})", row.line, reason, row.raw);
                    report.reject(row.line, reason, row.raw);
                }
            }
        }
        report.accepted = records.len();
        report.blank_skipped = blank_lines.len();
        report.rows_processed += blank_lines.len();
        if !blank_lines.is_empty() {
            debug!("blank rows skipped at lines {:?}", blank_lines);
        }

        let batch = validator.finish(records, &report, self.weight_sum_tolerance)?;

        info!(
            "{}: {} rows processed, {} accepted, {} rejected, {} sentinel, {} blank",
            trade_date,
            report.rows_processed,
            report.accepted,
            report.rejected(),
            report.sentinels_skipped,
            report.blank_skipped
        );

        Ok(Normalized { batch, report })
    }

    fn coerce(
        &self,
        row: &MappedRow,
        trade_date: NaiveDate,
        extracted_at: NaiveDateTime,
        validator: &mut Validator,
    ) -> Result<AssetRecord, Skip> {
        let code = normalise_code(&row.code);
        let quantity = match self.filter.classify(&code, &row.theoretical_quantity) {
            RowClass::Asset { quantity } => quantity,
            RowClass::Sentinel => return Err(Skip::Sentinel),
            RowClass::Rejected(reason) => return Err(Skip::Rejected(reason)),
        };

        let weight = parse_weight(&row.index_weight_pct)
            .ok_or(Skip::Rejected(RejectReason::InvalidWeight))?;

        let row_date = match row.trade_date.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                Some(parse_br_date(s).ok_or(Skip::Rejected(RejectReason::InvalidTradeDate))?)
            }
            _ => None,
        };

        let record = AssetRecord {
            code,
            name: clean_name(&row.name),
            share_class: clean_name(&row.share_class),
            theoretical_quantity: quantity,
            index_weight_pct: weight,
            trade_date,
            extracted_at,
        };

        validator.check(&record, row_date).map_err(Skip::Rejected)?;
        Ok(record)
    }

    /// Cut title and footer lines, then read header + body as delimited text.
    fn read_table(&self, text: &str) -> Result<Table, NormalizeError> {
        let lines: Vec<&str> = text.lines().collect();

        let mut end = lines.len();
        while end > 0 && lines[end - 1].trim().is_empty() {
            end -= 1;
        }

        let mut header_idx = self.layout.header_lines;
        while header_idx < end && lines[header_idx].trim().is_empty() {
            header_idx += 1;
        }
        if header_idx >= end {
            return Err(NormalizeError::MissingHeader {
                skipped: self.layout.header_lines,
            });
        }

        let body_end = end
            .saturating_sub(self.layout.footer_lines)
            .max(header_idx + 1);
        let table = lines[header_idx..body_end].join("\n");
        let blank_lines: BTreeSet<u64> = (header_idx + 1..body_end)
            .filter(|&i| lines[i].trim().is_empty())
            .map(|i| i as u64 + 1)
            .collect();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.layout.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(table.as_bytes());

        let header: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            // csv lines are 1-based and start at the header line
            let line = header_idx as u64 + record.position().map(|p| p.line()).unwrap_or(0);
            let values = record
                .iter()
                .enumerate()
                .map(|(i, v)| (header.get(i).cloned().unwrap_or_default(), v.to_string()))
                .collect();
            rows.push(RawRecord { line, values });
        }

        Ok(Table {
            header,
            rows,
            blank_lines,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CanonicalField;
    use rust_decimal_macros::dec;

    const TITLE: &str = "IBOV - Carteira do Dia 04/08/25";
    const HEADER: &str = "Código;Ação;Tipo;Qtde. Teórica;Part. (%);";
    const FOOTER: &str = "Quantidade Teórica Total;;;97.829.128.484;100,000;\nRedutor;;;;18.231,41813237;";

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig::default()).unwrap()
    }

    fn export(rows: &[&str]) -> String {
        format!("{TITLE}\n{HEADER}\n{}\n{FOOTER}\n", rows.join("\n"))
    }

    fn fallback() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 5).unwrap()
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 4)
            .unwrap()
            .and_hms_opt(21, 30, 0)
            .unwrap()
    }

    fn run(text: &str) -> Result<Normalized, NormalizeError> {
        normalizer().normalize(text, fallback(), now())
    }

    #[test]
    fn test_petr4_scenario() {
        let out = run(&export(&["PETR4;PETROBRAS;PN;1.234.567;8,75"])).unwrap();
        let rec = &out.batch.records()[0];
        assert_eq!(rec.code, "PETR4");
        assert_eq!(rec.name, "PETROBRAS");
        assert_eq!(rec.share_class, "PN");
        assert_eq!(rec.theoretical_quantity, 1_234_567);
        assert_eq!(rec.index_weight_pct, dec!(8.75));
        assert_eq!(rec.trade_date, NaiveDate::from_ymd_opt(2025, 8, 4).unwrap());
        assert_eq!(rec.extracted_at, now());
    }

    #[test]
    fn test_total_sentinel_is_not_a_rejection() {
        let out = run(&export(&[
            "PETR4;PETROBRAS;PN;1.234.567;8,75",
            "Total;;;;100,00",
        ]))
        .unwrap();
        assert_eq!(out.batch.len(), 1);
        assert!(out.batch.records().iter().all(|r| r.code != "TOTAL"));
        assert_eq!(out.report.sentinels_skipped, 1);
        assert_eq!(out.report.rejected(), 0);
    }

    #[test]
    fn test_footer_rows_inside_body_are_sentinels() {
        let text = format!(
            "{TITLE}\n{HEADER}\nPETR4;PETROBRAS;PN;1.234.567;8,75\n{FOOTER}\n"
        );
        let no_footer_skip = NormalizerConfig {
            footer_lines: 0,
            ..NormalizerConfig::default()
        };
        let out = Normalizer::new(&no_footer_skip)
            .unwrap()
            .normalize(&text, fallback(), now())
            .unwrap();
        assert_eq!(out.batch.len(), 1);
        assert_eq!(out.report.sentinels_skipped, 2);
        assert_eq!(out.report.rejected(), 0);
    }

    #[test]
    fn test_invalid_quantity_is_reported() {
        let out = run(&export(&[
            "PETR4;PETROBRAS;PN;1.234.567;8,75",
            "VALE3;VALE;ON;N/D;5,00",
        ]))
        .unwrap();
        assert_eq!(out.batch.len(), 1);
        assert_eq!(out.report.rejected(), 1);
        let rej = &out.report.rejections[0];
        assert_eq!(rej.reason, RejectReason::InvalidQuantity);
        assert_eq!(rej.reason.to_string(), "invalid quantity");
        assert_eq!(rej.stage, Stage::Filter);
        assert_eq!(rej.raw, "VALE3;VALE;ON;N/D;5,00");
        assert_eq!(rej.line, 4);
    }

    #[test]
    fn test_codes_uppercase_trimmed_and_unique() {
        let out = run(&export(&[
            " petr4 ;PETROBRAS;PN;1.234.567;8,75",
            "PETR4;PETROBRAS;PN;1.234.567;8,75",
            "vale3;VALE;ON;2.000;10,10",
        ]))
        .unwrap();
        let codes: Vec<&str> = out.batch.records().iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["PETR4", "VALE3"]);
        assert_eq!(out.report.by_reason()[&RejectReason::DuplicateCode], 1);
    }

    #[test]
    fn test_row_level_failures_do_not_abort() {
        let out = run(&export(&[
            "PETR4;PETROBRAS;PN;1.234.567;8,75",
            "ITUB4;ITAU UNIBANCO;PN;10;abc",
            "BBDC4;BRADESCO;PN;10;101,00",
            "ABEV3;;ON;10;1,00",
            ";;;;",
            "Código;Ação;Tipo;Qtde. Teórica;Part. (%)",
        ]))
        .unwrap();
        let r = &out.report;
        assert_eq!(r.accepted, 1);
        assert_eq!(r.rows_processed, 6);
        assert_eq!(r.blank_skipped, 1);
        assert_eq!(
            r.accepted + r.rejected() + r.sentinels_skipped + r.blank_skipped,
            r.rows_processed
        );
        let reasons: Vec<RejectReason> = r.rejections.iter().map(|x| x.reason).collect();
        assert_eq!(
            reasons,
            vec![
                RejectReason::InvalidWeight,
                RejectReason::WeightOutOfRange,
                RejectReason::EmptyName,
                RejectReason::InvalidTicker,
            ]
        );
    }

    #[test]
    fn test_blank_body_rows_are_counted() {
        let text = format!("{TITLE}\n{HEADER}\nPETR4;PETROBRAS;PN;1.234.567;8,75\n;;;;\n\n  ;  ;;;\n{FOOTER}\n");
        let out = run(&text).unwrap();
        let r = &out.report;
        assert_eq!(r.accepted, 1);
        assert_eq!(r.blank_skipped, 3);
        assert_eq!(r.rows_processed, 4);
        assert_eq!(r.rejected(), 0);
        assert!(r.to_string().contains("3 blank"));
        let json = serde_json::to_value(r).unwrap();
        assert_eq!(json["blank_skipped"], 3);
    }

    #[test]
    fn test_missing_column_produces_no_batch() {
        let text = format!(
            "{TITLE}\nCódigo;Ação;Tipo;Part. (%);\nPETR4;PETROBRAS;PN;8,75\n{FOOTER}\n"
        );
        match run(&text) {
            Err(NormalizeError::MissingColumn { field, .. }) => {
                assert_eq!(field, CanonicalField::TheoreticalQuantity)
            }
            other => panic!("expected MissingColumn, got {:?}", other.map(|n| n.batch)),
        }
    }

    #[test]
    fn test_zero_valid_rows_is_no_data() {
        let text = export(&["VALE3;VALE;ON;N/D;5,00", "Total;;;;100,00"]);
        assert!(matches!(
            run(&text),
            Err(NormalizeError::NoData { rejected: 1, sentinels: 1 })
        ));
    }

    #[test]
    fn test_header_only_is_no_data() {
        let text = format!("{TITLE}\n{HEADER}\n{FOOTER}\n");
        assert!(matches!(run(&text), Err(NormalizeError::NoData { .. })));
    }

    #[test]
    fn test_truncated_export_has_no_header() {
        assert!(matches!(run(TITLE), Err(NormalizeError::MissingHeader { skipped: 1 })));
        assert!(matches!(run(""), Err(NormalizeError::MissingHeader { .. })));
    }

    #[test]
    fn test_trade_date_fallback_and_column() {
        let text = "sem data\nCódigo;Ação;Tipo;Qtde. Teórica;Part. (%);Data Pregão\n\
                    PETR4;PETROBRAS;PN;1.234.567;8,75;05/08/2025\n\
                    VALE3;VALE;ON;2.000;10,10;04/08/2025\n\
                    ITUB4;ITAU;PN;2.000;3,10;ontem\n\
                    BBDC4;BRADESCO;PN;2.000;3,10;\n\
                    x\ny\n";
        let out = run(text).unwrap();
        assert_eq!(out.batch.trade_date(), fallback());
        let codes: Vec<&str> = out.batch.records().iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["PETR4", "BBDC4"]);
        let reasons: Vec<RejectReason> = out.report.rejections.iter().map(|x| x.reason).collect();
        assert_eq!(
            reasons,
            vec![RejectReason::TradeDateMismatch, RejectReason::InvalidTradeDate]
        );
    }

    #[test]
    fn test_title_date_four_digit_year() {
        let n = normalizer();
        assert_eq!(
            n.title_date("IBOV - Carteira do Dia 15/01/2024\n"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(n.title_date("IBOV\n04/08/25"), None);
    }

    #[test]
    fn test_names_are_cleaned() {
        let out = run(&export(&["ITUB4;  ITAU\u{a0}UNIBANCO\u{fffd} ;PN  N1;10;1,00"])).unwrap();
        let rec = &out.batch.records()[0];
        assert_eq!(rec.name, "ITAU UNIBANCO");
        assert_eq!(rec.share_class, "PN N1");
    }

    #[test]
    fn test_custom_schema_variant() {
        let text = format!(
            "{TITLE}\nTicker;Razão Social;Tipo;Qtde. Teórica;Part. (%);\nPETR4;PETROBRAS;PN;1;8,75\n{FOOTER}\n"
        );
        assert!(matches!(run(&text), Err(NormalizeError::MissingColumn { .. })));

        let n = normalizer()
            .with_schema(SchemaMap::default().with_variant(CanonicalField::Name, "Razão Social"));
        let out = n.normalize(&text, fallback(), now()).unwrap();
        assert_eq!(out.batch.records()[0].name, "PETROBRAS");
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let text = export(&[
            "PETR4;PETROBRAS;PN;1.234.567;8,75",
            "VALE3;VALE;ON;N/D;5,00",
        ]);
        let a = run(&text).unwrap();
        let b = run(&text).unwrap();
        assert_eq!(a.batch, b.batch);
        assert_eq!(a.report, b.report);
    }

    #[test]
    fn test_normalize_file_reads_latin1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IBOVDia_04-08-25.csv");
        let text = export(&["PETR4;PETROBRAS;PN;1.234.567;8,75"]);
        let latin1: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
        std::fs::write(&path, latin1).unwrap();

        let out = normalizer().normalize_file(&path, fallback()).unwrap();
        assert_eq!(out.batch.len(), 1);
        assert_eq!(out.batch.trade_date(), NaiveDate::from_ymd_opt(2025, 8, 4).unwrap());
    }

    #[test]
    fn test_normalize_file_missing() {
        let err = normalizer()
            .normalize_file(Path::new("/nonexistent/IBOVDia.csv"), fallback())
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Io { .. }));
    }
}
