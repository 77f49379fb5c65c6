use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ── Canonical fields ──────────────────────────────────────────────────────────

/// Column set every normalized row is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Code,
    Name,
    ShareClass,
    TheoreticalQuantity,
    IndexWeightPct,
    TradeDate,
}

impl CanonicalField {
    /// Fields that must be present in every export header.
    pub const REQUIRED: [CanonicalField; 5] = [
        CanonicalField::Code,
        CanonicalField::Name,
        CanonicalField::ShareClass,
        CanonicalField::TheoreticalQuantity,
        CanonicalField::IndexWeightPct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Code => "code",
            CanonicalField::Name => "name",
            CanonicalField::ShareClass => "share_class",
            CanonicalField::TheoreticalQuantity => "theoretical_quantity",
            CanonicalField::IndexWeightPct => "index_weight_pct",
            CanonicalField::TradeDate => "trade_date",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Raw rows ──────────────────────────────────────────────────────────────────

/// One line of the export body, paired with the header labels as published.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub line: u64,
    pub values: Vec<(String, String)>,
}

impl RawRecord {
    pub fn get(&self, index: usize) -> &str {
        self.values.get(index).map(|(_, v)| v.as_str()).unwrap_or("")
    }

    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|(_, v)| v.trim().is_empty())
    }

    /// The row as it appeared in the export.
    pub fn raw_line(&self) -> String {
        self.values
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// A raw row after schema mapping, before type coercion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRow {
    pub line: u64,
    pub code: String,
    pub name: String,
    pub share_class: String,
    pub theoretical_quantity: String,
    pub index_weight_pct: String,
    pub trade_date: Option<String>,
    pub raw: String,
}

// ── Asset record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetRecord {
    pub code: String,
    pub name: String,
    pub share_class: String,
    pub theoretical_quantity: u64,
    pub index_weight_pct: Decimal,
    pub trade_date: NaiveDate,
    pub extracted_at: NaiveDateTime,
}

// ── Batch ─────────────────────────────────────────────────────────────────────

/// Full index snapshot for one trade date, in source order.
///
/// Only the normalizer builds batches; once handed out they are read-only.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Batch {
    trade_date: NaiveDate,
    records: Vec<AssetRecord>,
}

impl Batch {
    pub(crate) fn new(trade_date: NaiveDate, records: Vec<AssetRecord>) -> Self {
        Self { trade_date, records }
    }

    pub fn trade_date(&self) -> NaiveDate {
        self.trade_date
    }

    pub fn records(&self) -> &[AssetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_weight(&self) -> Decimal {
        self.records.iter().map(|r| r.index_weight_pct).sum()
    }

    pub fn metadata(&self) -> BatchMetadata {
        BatchMetadata {
            trade_date: self.trade_date,
            extracted_at: self.records.iter().map(|r| r.extracted_at).max(),
            record_count: self.records.len(),
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let distinct: HashSet<&str> = self.records.iter().map(|r| r.code.as_str()).collect();
        let total_weight = self.total_weight();
        let average = if self.records.is_empty() {
            Decimal::ZERO
        } else {
            (total_weight / Decimal::from(self.records.len() as u64)).round_dp(4)
        };

        let mut top: Vec<&AssetRecord> = self.records.iter().collect();
        top.sort_by(|a, b| b.index_weight_pct.cmp(&a.index_weight_pct));

        BatchSummary {
            total_rows: self.records.len(),
            distinct_codes: distinct.len(),
            total_theoretical_quantity: self.records.iter().map(|r| r.theoretical_quantity).sum(),
            total_weight_pct: total_weight,
            average_weight_pct: average,
            top: top
                .into_iter()
                .take(5)
                .map(|r| TopHolding {
                    code: r.code.clone(),
                    name: r.name.clone(),
                    index_weight_pct: r.index_weight_pct,
                })
                .collect(),
        }
    }
}

/// What the publisher needs to know about a batch besides its rows.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchMetadata {
    pub trade_date: NaiveDate,
    pub extracted_at: Option<NaiveDateTime>,
    pub record_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchSummary {
    pub total_rows: usize,
    pub distinct_codes: usize,
    pub total_theoretical_quantity: u64,
    pub total_weight_pct: Decimal,
    pub average_weight_pct: Decimal,
    pub top: Vec<TopHolding>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopHolding {
    pub code: String,
    pub name: String,
    pub index_weight_pct: Decimal,
}
