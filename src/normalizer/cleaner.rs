use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::utils::group_digits;

/// Most fractional digits a weight may carry; matches the Parquet column scale.
pub const WEIGHT_MAX_SCALE: u32 = 6;
const WEIGHT_MIN_SCALE: u32 = 2;

fn is_placeholder(s: &str) -> bool {
    s.is_empty() || matches!(s, "N/D" | "N/A" | "-" | "—")
}

/// Drop `.` thousands separators, insisting on well-formed 3-digit groups.
/// "1.234.567" → "1234567" | "1234" → "1234" | "12.34" → None
fn strip_thousands(s: &str) -> Option<String> {
    let groups: Vec<&str> = s.split('.').collect();
    if !groups
        .iter()
        .all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    if groups.len() > 1 && (groups[0].len() > 3 || groups[1..].iter().any(|g| g.len() != 3)) {
        return None;
    }
    Some(groups.concat())
}

// ── Numbers ───────────────────────────────────────────────────────────────────

/// Parse a pt-BR share count.
/// "1.234.567" → 1234567 | "476976044" → 476976044 | "1.000,00" → 1000 | "N/D" → None
pub fn parse_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    if is_placeholder(s) {
        return None;
    }

    let int_part = match s.split_once(',') {
        Some((int_part, frac)) => {
            if frac.is_empty() || !frac.bytes().all(|b| b == b'0') {
                return None;
            }
            int_part
        }
        None => s,
    };

    strip_thousands(int_part)?.parse().ok()
}

/// Parse a pt-BR percentage into an exact decimal.
/// "8,75" → 8.75 | "0,487" → 0.487 | "12" → 12.00 | "5,5%" → 5.50
pub fn parse_weight(s: &str) -> Option<Decimal> {
    let s = s.trim().trim_end_matches('%').trim_end();
    if is_placeholder(s) {
        return None;
    }

    let (int_part, frac) = match s.split_once(',') {
        Some((int_part, frac)) => (int_part, Some(frac)),
        None => (s, None),
    };
    let int_digits = strip_thousands(int_part)?;

    let text = match frac {
        Some(f) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{int_digits}.{f}")
        }
        Some(_) => return None,
        None => int_digits,
    };

    let mut value = Decimal::from_str(&text).ok()?;
    if value.scale() > WEIGHT_MAX_SCALE {
        return None;
    }
    if value.scale() < WEIGHT_MIN_SCALE {
        value.rescale(WEIGHT_MIN_SCALE);
    }
    Some(value)
}

/// Render a share count the way the export writes it.
pub fn format_quantity(n: u64) -> String {
    group_digits(&n.to_string(), '.')
}

/// Render a weight the way the export writes it.
pub fn format_weight(value: Decimal) -> String {
    let text = value.abs().to_string();
    let (int_part, frac) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let sign = if value.is_sign_negative() && !value.is_zero() { "-" } else { "" };
    let grouped = group_digits(int_part, '.');
    if frac.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped},{frac}")
    }
}

// ── Dates ─────────────────────────────────────────────────────────────────────

/// Parse "04/08/2025", "04/08/25" (20yy) or ISO "2025-08-04".
pub fn parse_br_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();

    if let [day, month, year] = s.split('/').collect::<Vec<_>>().as_slice() {
        let day: u32 = day.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        let year: i32 = match year.len() {
            2 => 2000 + year.parse::<i32>().ok()?,
            4 => year.parse().ok()?,
            _ => return None,
        };
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

// ── Text ──────────────────────────────────────────────────────────────────────

pub fn normalise_code(s: &str) -> String {
    s.trim().to_uppercase()
}

/// Strip export noise from a display name: control characters, replacement
/// characters, non-breaking spaces, repeated whitespace.
pub fn clean_name(s: &str) -> String {
    s.chars()
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .filter(|c| !c.is_control() || c.is_whitespace())
        .filter(|c| *c != '\u{fffd}')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reduce a header label to its comparison key.
/// "Qtde. Teórica" → "qtdeteorica" | "Part. (%)" → "part" | "Código" → "codigo"
pub fn clean_label(s: &str) -> String {
    // decompose, then drop the combining marks: "Ç" → "C" + U+0327 → "C"
    s.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
