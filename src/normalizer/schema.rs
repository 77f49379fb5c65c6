use crate::models::{CanonicalField, MappedRow, RawRecord};
use std::collections::BTreeMap;

use super::cleaner::clean_label;
use super::error::NormalizeError;

/// Lookup table from canonical field to the header labels B3 has used for
/// it. Variants are stored already reduced by [`clean_label`].
#[derive(Debug, Clone)]
pub struct SchemaMap {
    variants: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for SchemaMap {
    fn default() -> Self {
        Self::new([
            (CanonicalField::Code, &["codigo", "cod", "ticker", "code", "symbol"][..]),
            (CanonicalField::Name, &["acao", "empresa", "nome", "name", "company"][..]),
            (CanonicalField::ShareClass, &["tipo", "type", "classe", "shareclass"][..]),
            (
                CanonicalField::TheoreticalQuantity,
                &["qtdeteorica", "quantidadeteorica", "qtdteorica", "qtde", "theoreticalquantity"][..],
            ),
            (
                CanonicalField::IndexWeightPct,
                &["part", "participacao", "partpct", "peso", "weight", "indexweightpct"][..],
            ),
            (CanonicalField::TradeDate, &["datapregao", "data", "tradedate"][..]),
        ])
    }
}

impl SchemaMap {
    pub fn new<'a>(table: impl IntoIterator<Item = (CanonicalField, &'a [&'a str])>) -> Self {
        let mut variants: BTreeMap<CanonicalField, Vec<String>> = BTreeMap::new();
        for (field, labels) in table {
            variants
                .entry(field)
                .or_default()
                .extend(labels.iter().map(|l| clean_label(l)));
        }
        Self { variants }
    }

    /// Accept one more raw label for `field`.
    pub fn with_variant(mut self, field: CanonicalField, label: &str) -> Self {
        self.variants.entry(field).or_default().push(clean_label(label));
        self
    }

    pub fn field_for(&self, raw_label: &str) -> Option<CanonicalField> {
        let key = clean_label(raw_label);
        if key.is_empty() {
            return None;
        }
        self.variants
            .iter()
            .find(|(_, labels)| labels.iter().any(|l| *l == key))
            .map(|(field, _)| *field)
    }

    /// Match the export header against the table. Every required field must
    /// resolve to exactly one column; anything else means B3 changed the
    /// export format and the whole run stops.
    pub fn resolve(&self, header: &[String]) -> Result<ColumnIndex, NormalizeError> {
        let mut hits: BTreeMap<CanonicalField, Vec<usize>> = BTreeMap::new();
        for (idx, label) in header.iter().enumerate() {
            if let Some(field) = self.field_for(label) {
                hits.entry(field).or_default().push(idx);
            }
        }

        for (field, idxs) in &hits {
            if idxs.len() > 1 {
                return Err(NormalizeError::AmbiguousColumn {
                    field: *field,
                    labels: idxs.iter().map(|&i| header[i].clone()).collect(),
                });
            }
        }

        for field in CanonicalField::REQUIRED {
            if !hits.contains_key(&field) {
                return Err(NormalizeError::MissingColumn {
                    field,
                    header: header.join(";"),
                });
            }
        }

        Ok(ColumnIndex {
            columns: hits.into_iter().map(|(f, idxs)| (f, idxs[0])).collect(),
        })
    }
}

/// Resolved header positions for one export.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndex {
    columns: BTreeMap<CanonicalField, usize>,
}

impl ColumnIndex {
    pub fn position(&self, field: CanonicalField) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    fn value(&self, raw: &RawRecord, field: CanonicalField) -> String {
        self.position(field)
            .map(|i| raw.get(i).to_string())
            .unwrap_or_default()
    }

    pub fn map(&self, raw: &RawRecord) -> MappedRow {
        MappedRow {
            line: raw.line,
            code: self.value(raw, CanonicalField::Code),
            name: self.value(raw, CanonicalField::Name),
            share_class: self.value(raw, CanonicalField::ShareClass),
            theoretical_quantity: self.value(raw, CanonicalField::TheoreticalQuantity),
            index_weight_pct: self.value(raw, CanonicalField::IndexWeightPct),
            trade_date: self
                .position(CanonicalField::TradeDate)
                .map(|i| raw.get(i).to_string()),
            raw: raw.raw_line(),
        }
    }
}
