//! Frequency normalization and merge
//!
//! Fetched series arrive as [`SeriesTable`]s, each with its own native
//! frequency. [`merge`] aligns them on one date axis:
//!
//! 1. outer join on date, ascending
//! 2. forward-fill every column (never back-fill, leading gaps stay empty)
//! 3. optionally collapse to one row per calendar month, dated the 1st
//! 4. round each column to its precision

use crate::bpstat::RawObservation;
use crate::catalog::{Cadence, CompletenessPolicy, DEFAULT_PRECISION};
use crate::error::{FetchError, MergeError};
use chrono::{Months, NaiveDate};
use datahub_common::types::{month_start, NormalizedRow};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Dimension carrying the unit of measure in BPstat datasets
pub const UNIT_DIMENSION: &str = "Unidade de medida";

// ============================================================================
// Series Table
// ============================================================================

/// One fetched series in validated form: finite values, dates strictly increasing
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesTable {
    pub series_key: String,
    pub points: Vec<(NaiveDate, f64)>,
    /// Unit label of the latest observation, when the dataset has one
    pub unit_hint: Option<String>,
    /// Category this table was split out by, if any
    pub category: Option<String>,
}

impl SeriesTable {
    /// Validate raw observations into a table.
    ///
    /// Null and non-finite values are dropped. On duplicate dates the first
    /// observation in payload order wins.
    pub fn from_observations(
        series_key: impl Into<String>,
        observations: Vec<RawObservation>,
    ) -> Result<Self, FetchError> {
        let series_key = series_key.into();

        let mut valid: Vec<(NaiveDate, f64, Option<String>)> = observations
            .into_iter()
            .filter_map(|obs| {
                let value = obs.value.filter(|v| v.is_finite())?;
                let unit = obs.dimension_labels.get(UNIT_DIMENSION).cloned();
                Some((obs.date, value, unit))
            })
            .collect();

        // Stable: equal dates keep payload order
        valid.sort_by_key(|(date, _, _)| *date);

        let mut points: Vec<(NaiveDate, f64)> = Vec::with_capacity(valid.len());
        let mut unit_hint = None;
        let mut duplicates = 0usize;
        for (date, value, unit) in valid {
            if points.last().is_some_and(|(last, _)| *last == date) {
                duplicates += 1;
                continue;
            }
            points.push((date, value));
            unit_hint = unit;
        }

        if duplicates > 0 {
            warn!(
                series_key = %series_key,
                duplicates,
                "Duplicate dates in payload, kept first observation"
            );
        }

        if points.is_empty() {
            return Err(FetchError::Empty(series_key));
        }

        Ok(Self {
            series_key,
            points,
            unit_hint,
            category: None,
        })
    }

    /// Build a table from already clean points (sorted and deduplicated here)
    pub fn from_points(series_key: impl Into<String>, mut points: Vec<(NaiveDate, f64)>) -> Self {
        points.sort_by_key(|(date, _)| *date);
        points.dedup_by_key(|(date, _)| *date);
        Self {
            series_key: series_key.into(),
            points,
            unit_hint: None,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn latest(&self) -> Option<(NaiveDate, f64)> {
        self.points.last().copied()
    }
}

// ============================================================================
// Merge
// ============================================================================

/// How a group's tables are merged
#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub group: String,
    pub cadence: Cadence,
    pub policy: CompletenessPolicy,
    /// Every series the group declares, in catalog order
    pub required: Vec<String>,
    /// Decimals per series key; missing keys use `DEFAULT_PRECISION`
    pub precision: HashMap<String, u32>,
}

impl MergeSpec {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            cadence: Cadence::Native,
            policy: CompletenessPolicy::Partial,
            required: Vec::new(),
            precision: HashMap::new(),
        }
    }

    fn precision_for(&self, key: &str) -> u32 {
        self.precision.get(key).copied().unwrap_or(DEFAULT_PRECISION)
    }
}

/// Date-indexed table, one column per series
#[derive(Debug, Clone, PartialEq)]
pub struct MergedTable {
    dates: Vec<NaiveDate>,
    columns: Vec<(String, Vec<Option<f64>>)>,
}

impl MergedTable {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn series_keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(key, _)| key.as_str())
    }

    pub fn column(&self, series_key: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|(key, _)| key == series_key)
            .map(|(_, cells)| cells.as_slice())
    }

    /// Rows of one column, skipping empty cells
    pub fn rows(&self, series_key: &str) -> Vec<NormalizedRow> {
        self.column(series_key)
            .map(|cells| {
                self.dates
                    .iter()
                    .zip(cells)
                    .filter_map(|(date, cell)| {
                        cell.map(|value| NormalizedRow::new(series_key, *date, value))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Align `tables` on one date axis.
///
/// Under the strict policy every key in `spec.required` must have a table.
pub fn merge(tables: &[SeriesTable], spec: &MergeSpec) -> Result<MergedTable, MergeError> {
    if spec.policy == CompletenessPolicy::Strict {
        let missing: Vec<String> = spec
            .required
            .iter()
            .filter(|key| !tables.iter().any(|t| &t.series_key == *key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(MergeError::MissingSeries {
                group: spec.group.clone(),
                series: missing,
            });
        }
    }

    let dates: Vec<NaiveDate> = tables
        .iter()
        .flat_map(|t| t.points.iter().map(|(date, _)| *date))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if dates.is_empty() {
        return Err(MergeError::Empty(spec.group.clone()));
    }

    let mut columns: Vec<(String, Vec<Option<f64>>)> = tables
        .iter()
        .map(|table| {
            let by_date: HashMap<NaiveDate, f64> = table.points.iter().copied().collect();
            let mut cells: Vec<Option<f64>> =
                dates.iter().map(|d| by_date.get(d).copied()).collect();
            forward_fill(&mut cells);
            (table.series_key.clone(), cells)
        })
        .collect();

    let dates = match spec.cadence {
        Cadence::Native => dates,
        Cadence::Monthly => to_monthly(&dates, &mut columns),
    };

    for (key, cells) in &mut columns {
        let precision = spec.precision_for(key);
        for value in cells.iter_mut().flatten() {
            *value = round_to(*value, precision);
        }
    }

    Ok(MergedTable { dates, columns })
}

/// Each empty cell takes the nearest earlier non-empty value
pub fn forward_fill(cells: &mut [Option<f64>]) {
    let mut last = None;
    for cell in cells.iter_mut() {
        match cell {
            Some(value) => last = Some(*value),
            None => *cell = last,
        }
    }
}

/// Round half away from zero to `precision` decimals
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(15) as i32);
    (value * factor).round() / factor
}

/// Collapse forward-filled rows to one row per month, dated the 1st.
///
/// Each column takes its first non-empty cell inside the month. A month
/// without rows repeats the last cell before it. Values never move to an
/// earlier month.
fn to_monthly(dates: &[NaiveDate], columns: &mut [(String, Vec<Option<f64>>)]) -> Vec<NaiveDate> {
    let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
        return Vec::new();
    };

    // (month, first row, end row) with the row range half-open
    let mut spans = Vec::new();
    let mut month = month_start(*first);
    let end = month_start(*last);
    let mut row = 0usize;

    while month <= end {
        let start = row;
        while row < dates.len() && month_start(dates[row]) == month {
            row += 1;
        }
        spans.push((month, start, row));

        month = match month.checked_add_months(Months::new(1)) {
            Some(next) => next,
            None => break,
        };
    }

    for (_, cells) in columns.iter_mut() {
        *cells = spans
            .iter()
            .map(|&(_, start, end)| {
                if start < end {
                    cells[start..end].iter().find_map(|cell| *cell)
                } else {
                    start.checked_sub(1).and_then(|prev| cells[prev])
                }
            })
            .collect();
    }

    spans.into_iter().map(|(month, _, _)| month).collect()
}
