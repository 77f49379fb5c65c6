use regex::Regex;
use std::collections::HashSet;

use super::cleaner::{clean_label, parse_quantity};
use super::error::NormalizeError;
use super::report::RejectReason;

#[derive(Debug, Clone, PartialEq)]
pub enum RowClass {
    /// Looks like an index constituent; carries the parsed share count.
    Asset { quantity: u64 },
    /// Totals / rounding residual line. Dropped without being an error.
    Sentinel,
    Rejected(RejectReason),
}

/// Separates constituent rows from totals, residuals and stray text that
/// human-oriented exports mix into the table.
#[derive(Debug, Clone)]
pub struct RowFilter {
    ticker: Regex,
    sentinels: HashSet<String>,
}

impl RowFilter {
    pub fn new(ticker_pattern: &str, sentinels: &[String]) -> Result<Self, NormalizeError> {
        Ok(Self {
            ticker: Regex::new(ticker_pattern)?,
            sentinels: sentinels.iter().map(|s| clean_label(s)).collect(),
        })
    }

    pub fn is_sentinel(&self, code: &str) -> bool {
        let key = clean_label(code);
        !key.is_empty() && self.sentinels.contains(&key)
    }

    /// `code` must already be trimmed and uppercased.
    pub fn classify(&self, code: &str, quantity: &str) -> RowClass {
        if self.is_sentinel(code) {
            return RowClass::Sentinel;
        }
        if !self.ticker.is_match(code) {
            return RowClass::Rejected(RejectReason::InvalidTicker);
        }
        match parse_quantity(quantity) {
            Some(quantity) => RowClass::Asset { quantity },
            None => RowClass::Rejected(RejectReason::InvalidQuantity),
        }
    }
}
