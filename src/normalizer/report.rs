//! Rejection accounting for one normalization call.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Filter,
    Parse,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Filter => "filter",
            Stage::Parse => "parse",
            Stage::Validate => "validate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidTicker,
    InvalidQuantity,
    InvalidWeight,
    InvalidTradeDate,
    EmptyCode,
    EmptyName,
    DuplicateCode,
    WeightOutOfRange,
    TradeDateMismatch,
}

impl RejectReason {
    pub fn stage(&self) -> Stage {
        match self {
            RejectReason::InvalidTicker | RejectReason::InvalidQuantity => Stage::Filter,
            RejectReason::InvalidWeight | RejectReason::InvalidTradeDate => Stage::Parse,
            _ => Stage::Validate,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::InvalidTicker => "invalid ticker format",
            RejectReason::InvalidQuantity => "invalid quantity",
            RejectReason::InvalidWeight => "invalid weight",
            RejectReason::InvalidTradeDate => "invalid trade date",
            RejectReason::EmptyCode => "empty code",
            RejectReason::EmptyName => "empty name",
            RejectReason::DuplicateCode => "duplicate code",
            RejectReason::WeightOutOfRange => "weight out of range",
            RejectReason::TradeDateMismatch => "trade date mismatch",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub line: u64,
    pub stage: Stage,
    pub reason: RejectReason,
    pub raw: String,
}

/// Returned next to the batch; every body row lands in exactly one of
/// `accepted`, `sentinels_skipped`, `blank_skipped` or `rejections`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RejectionReport {
    pub rows_processed: usize,
    pub accepted: usize,
    pub sentinels_skipped: usize,
    /// Empty lines and rows made only of delimiters, e.g. `;;;;`.
    pub blank_skipped: usize,
    pub rejections: Vec<Rejection>,
}

impl RejectionReport {
    pub fn reject(&mut self, line: u64, reason: RejectReason, raw: impl Into<String>) {
        self.rejections.push(Rejection {
            line,
            stage: reason.stage(),
            reason,
            raw: raw.into(),
        });
    }

    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }

    pub fn by_reason(&self) -> BTreeMap<RejectReason, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.rejections {
            *counts.entry(r.reason).or_insert(0) += 1;
        }
        counts
    }

    pub fn reasons_for(&self, line: u64) -> Vec<RejectReason> {
        self.rejections
            .iter()
            .filter(|r| r.line == line)
            .map(|r| r.reason)
            .collect()
    }
}

impl fmt::Display for RejectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} rows processed: {} accepted, {} rejected, {} sentinel, {} blank",
            self.rows_processed,
            self.accepted,
            self.rejected(),
            self.sentinels_skipped,
            self.blank_skipped
        )?;
        for (reason, n) in self.by_reason() {
            writeln!(f, "  {:<22} {}", reason.to_string(), n)?;
        }
        for r in &self.rejections {
            writeln!(f, "  line {:>4} [{}] {}: {}", r.line, r.stage, r.reason, r.raw)?;
        }
        Ok(())
    }
}
