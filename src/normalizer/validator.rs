use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::models::{AssetRecord, Batch};

use super::error::NormalizeError;
use super::report::{RejectReason, RejectionReport};

/// Record- and batch-level invariants for one trade date.
#[derive(Debug)]
pub struct Validator {
    trade_date: NaiveDate,
    seen: HashSet<String>,
}

impl Validator {
    pub fn new(trade_date: NaiveDate) -> Self {
        Self {
            trade_date,
            seen: HashSet::new(),
        }
    }

    /// Check one record. Codes are only claimed by accepted records, so a
    /// broken first occurrence does not shadow a good later one.
    pub fn check(
        &mut self,
        record: &AssetRecord,
        row_date: Option<NaiveDate>,
    ) -> Result<(), RejectReason> {
        if record.code.is_empty() {
            return Err(RejectReason::EmptyCode);
        }
        if record.name.is_empty() {
            return Err(RejectReason::EmptyName);
        }
        if record.index_weight_pct < Decimal::ZERO || record.index_weight_pct > Decimal::ONE_HUNDRED {
            return Err(RejectReason::WeightOutOfRange);
        }
        if row_date.is_some_and(|d| d != self.trade_date) || record.trade_date != self.trade_date {
            return Err(RejectReason::TradeDateMismatch);
        }
        if !self.seen.insert(record.code.clone()) {
            return Err(RejectReason::DuplicateCode);
        }
        Ok(())
    }

    /// Close the batch. Empty is fatal; the ~100% weight sum is only logged.
    pub fn finish(
        self,
        records: Vec<AssetRecord>,
        report: &RejectionReport,
        weight_sum_tolerance: Decimal,
    ) -> Result<Batch, NormalizeError> {
        if records.is_empty() {
            return Err(NormalizeError::NoData {
                rejected: report.rejected(),
                sentinels: report.sentinels_skipped,
            });
        }

        let batch = Batch::new(self.trade_date, records);
        let total = batch.total_weight();
        if (total - Decimal::ONE_HUNDRED).abs() > weight_sum_tolerance {
            warn!(
                "{}: index weights sum to {}% across {} assets",
                self.trade_date,
                total,
                batch.len()
            );
        } else {
            info!("{}: index weights sum to {}%", self.trade_date, total);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 4).unwrap()
    }

    fn record(code: &str, weight: Decimal) -> AssetRecord {
        AssetRecord {
            code: code.to_string(),
            name: "ACME".to_string(),
            share_class: "ON".to_string(),
            theoretical_quantity: 10,
            index_weight_pct: weight,
            trade_date: date(),
            extracted_at: date().and_hms_opt(19, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_accepts_valid_record() {
        let mut v = Validator::new(date());
        assert_eq!(v.check(&record("PETR4", dec!(8.75)), None), Ok(()));
        assert_eq!(v.check(&record("VALE3", dec!(0)), Some(date())), Ok(()));
        assert_eq!(v.check(&record("ITUB4", dec!(100)), None), Ok(()));
    }

    #[test]
    fn test_duplicate_code_rejected_after_first() {
        let mut v = Validator::new(date());
        assert_eq!(v.check(&record("PETR4", dec!(1)), None), Ok(()));
        assert_eq!(
            v.check(&record("PETR4", dec!(2)), None),
            Err(RejectReason::DuplicateCode)
        );
    }

    #[test]
    fn test_invalid_first_occurrence_does_not_claim_code() {
        let mut v = Validator::new(date());
        assert_eq!(
            v.check(&record("PETR4", dec!(100.01)), None),
            Err(RejectReason::WeightOutOfRange)
        );
        assert_eq!(v.check(&record("PETR4", dec!(1)), None), Ok(()));
    }

    #[test]
    fn test_empty_fields_and_dates() {
        let mut v = Validator::new(date());
        let mut nameless = record("PETR4", dec!(1));
        nameless.name.clear();
        assert_eq!(v.check(&nameless, None), Err(RejectReason::EmptyName));
        assert_eq!(v.check(&record("", dec!(1)), None), Err(RejectReason::EmptyCode));
        let other_day = NaiveDate::from_ymd_opt(2025, 8, 1);
        assert_eq!(
            v.check(&record("VALE3", dec!(1)), other_day),
            Err(RejectReason::TradeDateMismatch)
        );
    }

    #[test]
    fn test_finish_empty_is_no_data() {
        let report = RejectionReport {
            rows_processed: 2,
            sentinels_skipped: 1,
            ..Default::default()
        };
        let err = Validator::new(date()).finish(vec![], &report, dec!(0.5)).unwrap_err();
        assert!(matches!(err, NormalizeError::NoData { rejected: 0, sentinels: 1 }));
    }

    #[test]
    fn test_finish_keeps_partial_weight_sum() {
        let report = RejectionReport::default();
        let batch = Validator::new(date())
            .finish(vec![record("PETR4", dec!(8.75))], &report, dec!(0.5))
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.trade_date(), date());
    }
}
