//! Series catalog
//!
//! The catalog is the static list of groups the worker ingests. It is loaded
//! once from TOML and passed to the pipelines; nothing mutates it afterwards.
//!
//! ```toml
//! [[groups]]
//! name = "euribor"
//! policy = "strict"
//! cadence = "monthly"
//! precision = 3
//!
//! [[groups.series]]
//! key = "euribor_3m"
//! label = "Euribor 3 meses"
//! unit = "%"
//! series_id = 13168436
//!
//! [[groups.series]]
//! key = "house_price_index"
//! label = "Índice de preços da habitação"
//! domain_id = 39
//! dataset_id = "da133c091337a417b8b242c65e477ca0"
//! filters = { Indicadores = "Preços de habitação" }
//!
//! [[groups.series]]
//! key = "risk_incumprimento_bportugal"
//! label = "Risco Incumprimento"
//! domain_id = 188
//! dataset_id = "961306c1ed49daf795a53dc5fea4a04b"
//! split_by = "Território de contraparte"
//! ```
//!
//! A series with `split_by` fans out into one series per category of that
//! dimension, keyed `<key>_<category slug>`.

use crate::error::{IngestError, Result};
use datahub_common::types::{category_slug, validate_series_key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Default number of decimals kept when a group declares none
pub const DEFAULT_PRECISION: u32 = 2;

/// What a group does when some of its series could not be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompletenessPolicy {
    /// Every series must be present or nothing is stored
    Strict,
    /// Store whatever succeeded, report the rest as absent
    #[default]
    Partial,
}

/// Output time axis of a merged group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// Union of the observed dates
    #[default]
    Native,
    /// One row per calendar month, dated the 1st
    Monthly,
}

/// Where a dataset lives in the remote API
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetLocation {
    pub domain_id: u64,
    pub dataset_id: String,
    /// Narrows the data request to one series of the dataset
    pub series_id: Option<String>,
}

/// How a series is found
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesLocator {
    /// External series id, resolved through the metadata endpoint
    SeriesId(String),
    /// Known dataset, used as is
    Dataset(DatasetLocation),
}

/// One logical series of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SeriesEntry")]
pub struct SeriesReference {
    pub key: String,
    pub label: String,
    pub unit: Option<String>,
    pub precision: Option<u32>,
    pub locator: SeriesLocator,
    /// Dimension label -> case-insensitive substring the category must contain
    pub filters: BTreeMap<String, String>,
    /// Dimension label whose categories each become their own series
    pub split_by: Option<String>,
}

impl SeriesReference {
    /// Series resolved through the metadata endpoint
    pub fn by_series_id(
        key: impl Into<String>,
        label: impl Into<String>,
        series_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            unit: None,
            precision: None,
            locator: SeriesLocator::SeriesId(series_id.into()),
            filters: BTreeMap::new(),
            split_by: None,
        }
    }

    /// Series read straight from a known dataset
    pub fn by_dataset(
        key: impl Into<String>,
        label: impl Into<String>,
        domain_id: u64,
        dataset_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            unit: None,
            precision: None,
            locator: SeriesLocator::Dataset(DatasetLocation {
                domain_id,
                dataset_id: dataset_id.into(),
                series_id: None,
            }),
            filters: BTreeMap::new(),
            split_by: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_filter(mut self, dimension: impl Into<String>, needle: impl Into<String>) -> Self {
        self.filters.insert(dimension.into(), needle.into());
        self
    }

    pub fn with_split(mut self, dimension: impl Into<String>) -> Self {
        self.split_by = Some(dimension.into());
        self
    }

    /// Key of the series split out for `category`
    pub fn split_key(&self, category: &str) -> String {
        format!("{}_{}", self.key, category_slug(category))
    }

    /// Label of the series split out for `category`
    pub fn split_label(&self, category: &str) -> String {
        format!("{}: {}", self.label, category)
    }
}

/// Identifiers may be written as TOML integers or strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Int(u64),
    Str(String),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Int(n) => n.to_string(),
            IdValue::Str(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeriesEntry {
    key: String,
    label: String,
    unit: Option<String>,
    precision: Option<u32>,
    series_id: Option<IdValue>,
    domain_id: Option<IdValue>,
    dataset_id: Option<String>,
    #[serde(default)]
    filters: BTreeMap<String, String>,
    split_by: Option<String>,
}

impl TryFrom<SeriesEntry> for SeriesReference {
    type Error = String;

    fn try_from(entry: SeriesEntry) -> std::result::Result<Self, Self::Error> {
        validate_series_key(&entry.key).map_err(|e| e.to_string())?;

        let locator = match (entry.series_id, entry.domain_id, entry.dataset_id) {
            (Some(id), None, None) => SeriesLocator::SeriesId(id.into_string()),
            (None, Some(domain), Some(dataset)) => {
                let domain = domain.into_string();
                let domain_id = domain.parse().map_err(|_| {
                    format!("series '{}' has a non-numeric domain_id '{}'", entry.key, domain)
                })?;
                SeriesLocator::Dataset(DatasetLocation {
                    domain_id,
                    dataset_id: dataset,
                    series_id: None,
                })
            }
            _ => {
                return Err(format!(
                    "series '{}' needs exactly one locator: series_id, or domain_id with dataset_id",
                    entry.key
                ))
            }
        };

        if entry.split_by.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(format!("series '{}' has an empty split_by", entry.key));
        }

        Ok(Self {
            key: entry.key,
            label: entry.label,
            unit: entry.unit,
            precision: entry.precision,
            locator,
            filters: entry.filters,
            split_by: entry.split_by,
        })
    }
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

fn default_snapshot() -> bool {
    true
}

/// A set of series fetched, merged and stored together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub policy: CompletenessPolicy,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Export the daily snapshot after storing
    #[serde(default = "default_snapshot")]
    pub snapshot: bool,
    pub series: Vec<SeriesReference>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, series: Vec<SeriesReference>) -> Self {
        Self {
            name: name.into(),
            description: None,
            policy: CompletenessPolicy::default(),
            cadence: Cadence::default(),
            precision: DEFAULT_PRECISION,
            snapshot: true,
            series,
        }
    }

    pub fn with_policy(mut self, policy: CompletenessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Decimals kept for `series`
    pub fn precision_for(&self, series: &SeriesReference) -> u32 {
        series.precision.unwrap_or(self.precision)
    }

    pub fn is_strict(&self) -> bool {
        self.policy == CompletenessPolicy::Strict
    }
}

/// The full series catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub groups: Vec<GroupConfig>,
}

impl Catalog {
    /// Build and validate a catalog from groups
    pub fn new(groups: Vec<GroupConfig>) -> Result<Self> {
        let catalog = Self { groups };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::catalog(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate catalog TOML
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let catalog: Catalog =
            toml::from_str(raw).map_err(|e| IngestError::catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Unique group names, non-empty groups, unique series keys per group
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(IngestError::catalog("group name cannot be empty"));
            }
            if !names.insert(group.name.as_str()) {
                return Err(IngestError::catalog(format!(
                    "duplicate group '{}'",
                    group.name
                )));
            }
            if group.series.is_empty() {
                return Err(IngestError::catalog(format!(
                    "group '{}' has no series",
                    group.name
                )));
            }

            let mut keys = HashSet::new();
            for series in &group.series {
                validate_series_key(&series.key)?;
                if !keys.insert(series.key.as_str()) {
                    return Err(IngestError::catalog(format!(
                        "group '{}' declares series '{}' twice",
                        group.name, series.key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// The group declaring `series_key`, narrowed to that one series
    pub fn series_group(&self, series_key: &str) -> Option<GroupConfig> {
        self.groups.iter().find_map(|group| {
            let series = group.series.iter().find(|s| s.key == series_key)?;
            Some(GroupConfig {
                series: vec![series.clone()],
                ..group.clone()
            })
        })
    }

    /// Groups named in `names`, in catalog order; every group when `names` is empty
    pub fn select(&self, names: &[String]) -> Result<Vec<GroupConfig>> {
        if names.is_empty() {
            return Ok(self.groups.clone());
        }

        if let Some(unknown) = names.iter().find(|n| self.group(n).is_none()) {
            return Err(IngestError::catalog(format!("unknown group '{}'", unknown)));
        }

        Ok(self
            .groups
            .iter()
            .filter(|g| names.contains(&g.name))
            .cloned()
            .collect())
    }
}
