//! Record shapes shared by the ingest pipeline, the store and the snapshot archive

use crate::error::{DatahubError, Result};
use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of every row in `key_indicators`
pub const INDICATOR_KEY_PREFIX: &str = "latest_";

/// Storage format for calendar dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Pipeline Records
// ============================================================================

/// One merged observation, ready to be written to history.
///
/// After a merge there is at most one row per `(series_key, date)` and dates
/// are strictly increasing within a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub series_key: String,
    pub date: NaiveDate,
    pub value: f64,
}

impl NormalizedRow {
    pub fn new(series_key: impl Into<String>, date: NaiveDate, value: f64) -> Self {
        Self {
            series_key: series_key.into(),
            date,
            value,
        }
    }
}

// ============================================================================
// Persisted Records
// ============================================================================

/// One `(series, date, value)` point as stored in `historical_series`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSeriesRow {
    pub series_key: String,
    pub date: NaiveDate,
    pub value: f64,
}

impl From<NormalizedRow> for HistoricalSeriesRow {
    fn from(row: NormalizedRow) -> Self {
        Self {
            series_key: row.series_key,
            date: row.date,
            value: row.value,
        }
    }
}

/// Latest known value of a series, one row per indicator in `key_indicators`.
///
/// Rows are overwritten in place on every successful reconciliation;
/// `updated_at` strictly increases across rewrites of the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyIndicator {
    /// `latest_<series_key>`
    pub indicator_key: String,
    pub label: String,
    pub value: f64,
    pub unit: String,
    pub reference_date: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Snapshot Document
// ============================================================================

/// Indicator entry inside a snapshot document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotIndicator {
    pub label: String,
    pub value: f64,
    pub unit: String,
    pub reference_date: NaiveDate,
}

/// Immutable dated export of the current indicator values.
///
/// Indicators live in a `BTreeMap` so the same input always serializes to
/// the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_timestamp: String,
    pub source_label: String,
    pub indicators: BTreeMap<String, SnapshotIndicator>,
}

impl Snapshot {
    /// Build a snapshot from indicator rows, keyed by `indicator_key`
    pub fn from_indicators<'a>(
        timestamp: DateTime<Utc>,
        source_label: impl Into<String>,
        indicators: impl IntoIterator<Item = &'a KeyIndicator>,
    ) -> Self {
        let indicators = indicators
            .into_iter()
            .map(|ind| {
                (
                    ind.indicator_key.clone(),
                    SnapshotIndicator {
                        label: ind.label.clone(),
                        value: ind.value,
                        unit: ind.unit.clone(),
                        reference_date: ind.reference_date,
                    },
                )
            })
            .collect();

        Self {
            snapshot_timestamp: format_timestamp(timestamp),
            source_label: source_label.into(),
            indicators,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Indicator key under which the latest value of `series_key` is stored
pub fn indicator_key_for(series_key: &str) -> String {
    format!("{INDICATOR_KEY_PREFIX}{series_key}")
}

/// Check that a logical series key is usable as a table key and file-safe
pub fn validate_series_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DatahubError::InvalidSeriesKey(key.to_string()))
    }
}

/// Series key suffix for a category label: "Norte (NUTS II)" -> "norte_nuts_ii".
///
/// Portuguese diacritics are folded to ASCII, runs of separators collapse to
/// one underscore and anything else is dropped, so the result always passes
/// [`validate_series_key`] once prefixed.
pub fn category_slug(category: &str) -> String {
    let mut slug = String::with_capacity(category.len());
    for c in category.chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            c => c,
        };
        if folded.is_ascii_alphanumeric() {
            slug.push(folded);
        } else if (folded.is_whitespace() || folded == '-' || folded == '_' || folded == '/')
            && !slug.is_empty()
            && !slug.ends_with('_')
        {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// First day of the month containing `date`
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// `YYYY-MM-DD`
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// RFC 3339, UTC, microsecond precision
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a period label into the first day of that period.
///
/// Accepted forms: `YYYY-MM-DD` (a trailing time part is ignored),
/// `YYYY-MM`, `YYYYQn` / `YYYY-Qn` / `YYYY Qn`, and `YYYY`.
pub fn parse_period(raw: &str) -> Result<NaiveDate> {
    let s = raw.trim();
    let invalid = || DatahubError::InvalidPeriod(raw.to_string());

    // Timestamps such as 2024-03-01T00:00:00
    let day_part = s.split(['T', ' ']).next().unwrap_or(s);
    if day_part.len() == 10 {
        return NaiveDate::parse_from_str(day_part, DATE_FORMAT).map_err(|_| invalid());
    }

    if let Some(q_pos) = s.find(['Q', 'q']) {
        let year = s[..q_pos].trim_end_matches(['-', ' ']);
        let quarter: u32 = s[q_pos + 1..].parse().map_err(|_| invalid())?;
        if !(1..=4).contains(&quarter) || year.len() != 4 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        return NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).ok_or_else(invalid);
    }

    match s.len() {
        7 => {
            let (year, month) = s.split_once('-').ok_or_else(invalid)?;
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let month: u32 = month.parse().map_err(|_| invalid())?;
            NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)
        }
        4 => {
            let year: i32 = s.parse().map_err(|_| invalid())?;
            NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}
