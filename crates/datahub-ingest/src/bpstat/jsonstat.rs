//! JSON-stat 2.0 dataset decoding
//!
//! A dataset is a dense cube: dimensions in `id` order with sizes `size`, and
//! a flat `value` array in row-major order (the last dimension varies
//! fastest). This module flattens the cube into one [`RawObservation`] per
//! cell, keyed by the human labels of every non-time dimension.

use crate::error::FetchError;
use chrono::NaiveDate;
use datahub_common::types::parse_period;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Dimension ids/labels recognised as the time axis when `role.time` is absent
const TIME_DIMENSION_NAMES: &[&str] = &["reference_date", "data", "date", "time"];

/// One cell of a decoded dataset
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    /// Dimension label -> category label, for every non-time dimension
    pub dimension_labels: BTreeMap<String, String>,
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Wire shape of a JSON-stat 2.0 dataset
#[derive(Debug, Clone, Deserialize)]
pub struct JsonStatDataset {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub id: Vec<String>,
    #[serde(default)]
    pub size: Vec<usize>,
    #[serde(default)]
    pub role: Option<Roles>,
    #[serde(default)]
    pub dimension: HashMap<String, Dimension>,
    #[serde(default)]
    pub value: Values,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Roles {
    #[serde(default)]
    pub time: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dimension {
    #[serde(default)]
    pub label: Option<String>,
    pub category: Category,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub index: Option<CategoryIndex>,
    #[serde(default)]
    pub label: Option<HashMap<String, String>>,
}

/// `category.index` is either the ordered ids or an id -> position map
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CategoryIndex {
    List(Vec<String>),
    Map(HashMap<String, usize>),
}

/// `value` is either dense or sparse (keyed by flat index)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Values {
    Dense(Vec<Option<f64>>),
    Sparse(HashMap<String, Option<f64>>),
}

impl Default for Values {
    fn default() -> Self {
        Values::Dense(Vec::new())
    }
}

/// A dimension with its categories resolved into positional order
struct OrderedDimension {
    label: String,
    category_ids: Vec<String>,
    category_labels: Vec<String>,
}

impl JsonStatDataset {
    /// Flatten the cube into observations.
    ///
    /// Cells missing from a sparse `value` object are skipped; explicit
    /// nulls are kept with `value: None` so filtering sees every category.
    pub fn observations(&self) -> Result<Vec<RawObservation>, FetchError> {
        if self.id.len() != self.size.len() {
            return Err(FetchError::malformed(format!(
                "{} dimension ids but {} sizes",
                self.id.len(),
                self.size.len()
            )));
        }

        let dims = self
            .id
            .iter()
            .zip(&self.size)
            .map(|(id, &size)| self.ordered_dimension(id, size))
            .collect::<Result<Vec<_>, _>>()?;

        let time_idx = self.time_dimension(&dims)?;
        let dates = dims[time_idx]
            .category_ids
            .iter()
            .zip(&dims[time_idx].category_labels)
            .map(|(id, label)| {
                parse_period(id)
                    .or_else(|_| parse_period(label))
                    .map_err(|_| FetchError::InvalidDate(label.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let total: usize = self.size.iter().product();
        let strides = strides(&self.size);

        let cells: Vec<(usize, Option<f64>)> = match &self.value {
            Values::Dense(values) => {
                if values.len() != total {
                    return Err(FetchError::malformed(format!(
                        "expected {} values, got {}",
                        total,
                        values.len()
                    )));
                }
                values.iter().copied().enumerate().collect()
            }
            Values::Sparse(values) => {
                let mut cells = values
                    .iter()
                    .map(|(k, v)| match k.parse::<usize>() {
                        Ok(flat) if flat < total => Ok((flat, *v)),
                        _ => Err(FetchError::malformed(format!("bad value index '{}'", k))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                cells.sort_by_key(|(flat, _)| *flat);
                cells
            }
        };

        let observations = cells
            .into_iter()
            .map(|(flat, value)| {
                let position = |d: usize| (flat / strides[d]) % self.size[d];
                let dimension_labels = dims
                    .iter()
                    .enumerate()
                    .filter(|(d, _)| *d != time_idx)
                    .map(|(d, dim)| (dim.label.clone(), dim.category_labels[position(d)].clone()))
                    .collect();
                RawObservation {
                    dimension_labels,
                    date: dates[position(time_idx)],
                    value,
                }
            })
            .collect();

        Ok(observations)
    }

    fn ordered_dimension(&self, id: &str, size: usize) -> Result<OrderedDimension, FetchError> {
        let dim = self
            .dimension
            .get(id)
            .ok_or_else(|| FetchError::malformed(format!("dimension '{}' is not described", id)))?;

        let category_ids: Vec<String> = match (&dim.category.index, &dim.category.label) {
            (Some(CategoryIndex::List(ids)), _) => ids.clone(),
            (Some(CategoryIndex::Map(map)), _) => {
                let mut ids = vec![None; map.len()];
                for (cat, &pos) in map {
                    let slot = ids.get_mut(pos).ok_or_else(|| {
                        FetchError::malformed(format!("dimension '{}' index out of range", id))
                    })?;
                    *slot = Some(cat.clone());
                }
                ids.into_iter()
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| FetchError::malformed(format!("dimension '{}' has index gaps", id)))?
            }
            (None, Some(labels)) if labels.len() == 1 => labels.keys().cloned().collect(),
            _ => {
                return Err(FetchError::malformed(format!(
                    "dimension '{}' has no usable category index",
                    id
                )))
            }
        };

        if category_ids.len() != size {
            return Err(FetchError::malformed(format!(
                "dimension '{}' declares size {} but has {} categories",
                id,
                size,
                category_ids.len()
            )));
        }

        let category_labels = category_ids
            .iter()
            .map(|cat| {
                dim.category
                    .label
                    .as_ref()
                    .and_then(|labels| labels.get(cat))
                    .cloned()
                    .unwrap_or_else(|| cat.clone())
            })
            .collect();

        Ok(OrderedDimension {
            label: dim.label.clone().unwrap_or_else(|| id.to_string()),
            category_ids,
            category_labels,
        })
    }

    fn time_dimension(&self, dims: &[OrderedDimension]) -> Result<usize, FetchError> {
        let by_role = self
            .role
            .as_ref()
            .and_then(|role| role.time.first())
            .and_then(|time_id| self.id.iter().position(|id| id == time_id));

        by_role
            .or_else(|| {
                self.id.iter().zip(dims).position(|(id, dim)| {
                    let id = id.to_lowercase();
                    let label = dim.label.to_lowercase();
                    TIME_DIMENSION_NAMES
                        .iter()
                        .any(|name| *name == id || *name == label)
                })
            })
            .ok_or(FetchError::NoTimeDimension)
    }
}

/// Row-major strides: the last dimension varies fastest
fn strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1];
    }
    strides
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn decode(value: serde_json::Value) -> Result<Vec<RawObservation>, FetchError> {
        serde_json::from_value::<JsonStatDataset>(value)
            .unwrap()
            .observations()
    }

    #[test]
    fn test_row_major_layout() {
        let obs = decode(json!({
            "id": ["indicator", "reference_date"],
            "size": [2, 2],
            "dimension": {
                "indicator": {
                    "label": "Indicadores",
                    "category": {
                        "index": ["a", "b"],
                        "label": {"a": "Preços de habitação", "b": "Rendas"}
                    }
                },
                "reference_date": {
                    "label": "Data",
                    "category": {"index": {"2024-01-31": 0, "2024-02-29": 1}}
                }
            },
            "value": [1.0, 2.0, 3.0, null]
        }))
        .unwrap();

        assert_eq!(obs.len(), 4);
        assert_eq!(obs[1].date, ymd(2024, 2, 29));
        assert_eq!(obs[1].value, Some(2.0));
        assert_eq!(obs[1].dimension_labels["Indicadores"], "Preços de habitação");
        assert_eq!(obs[2].dimension_labels["Indicadores"], "Rendas");
        assert_eq!(obs[2].date, ymd(2024, 1, 31));
        assert_eq!(obs[3].value, None);
    }

    #[test]
    fn test_role_time_and_sparse_values() {
        let obs = decode(json!({
            "id": ["periodo", "unit"],
            "size": [3, 1],
            "role": {"time": ["periodo"]},
            "dimension": {
                "periodo": {
                    "label": "Período",
                    "category": {"index": ["2023Q4", "2024Q1", "2024Q2"]}
                },
                "unit": {
                    "label": "Unidade de medida",
                    "category": {"label": {"pct": "Percentagem"}}
                }
            },
            "value": {"2": 4.5, "0": 4.1}
        }))
        .unwrap();

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].date, ymd(2023, 10, 1));
        assert_eq!(obs[1].date, ymd(2024, 4, 1));
        assert_eq!(obs[1].dimension_labels["Unidade de medida"], "Percentagem");
    }

    #[test]
    fn test_missing_time_dimension() {
        let err = decode(json!({
            "id": ["indicator"],
            "size": [1],
            "dimension": {"indicator": {"category": {"index": ["a"]}}},
            "value": [1.0]
        }))
        .unwrap_err();
        assert!(matches!(err, FetchError::NoTimeDimension));
    }

    #[test]
    fn test_unparsable_date() {
        let err = decode(json!({
            "id": ["date"],
            "size": [1],
            "dimension": {"date": {"category": {"index": ["last tuesday"]}}},
            "value": [1.0]
        }))
        .unwrap_err();
        assert!(matches!(err, FetchError::InvalidDate(ref d) if d == "last tuesday"));
    }

    #[test]
    fn test_value_count_mismatch_is_malformed() {
        let err = decode(json!({
            "id": ["date"],
            "size": [2],
            "dimension": {"date": {"category": {"index": ["2024-01", "2024-02"]}}},
            "value": [1.0]
        }))
        .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[5]), vec![1]);
        assert!(strides(&[]).is_empty());
    }
}
