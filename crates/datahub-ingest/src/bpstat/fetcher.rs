// Series fetcher
//
// Downloads one dataset, flattens it, and keeps the observations that match
// the series' filters. One call is one independent fetch unit.

use super::client::{BpstatClient, RequestFailure};
use super::jsonstat::RawObservation;
use crate::catalog::{DatasetLocation, SeriesReference};
use crate::error::FetchError;
use crate::merge::SeriesTable;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct SeriesFetcher {
    client: BpstatClient,
}

impl SeriesFetcher {
    pub fn new(client: BpstatClient) -> Self {
        Self { client }
    }

    /// Fetch the observations of `location` that pass `filters`
    pub async fn fetch(
        &self,
        location: &DatasetLocation,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<RawObservation>, FetchError> {
        let url = self.client.dataset_url(location);

        let dataset = self
            .client
            .dataset(location)
            .await
            .map_err(|failure| self.request_error(&url, failure))?;

        let observations = dataset.observations()?;
        let total = observations.len();
        let kept = apply_filters(observations, filters);

        debug!(url = %url, total, kept = kept.len(), "Filtered observations");

        if kept.is_empty() {
            return Err(FetchError::Empty(url));
        }

        Ok(kept)
    }

    /// Fetch one catalog series and validate it into a table
    pub async fn fetch_table(
        &self,
        reference: &SeriesReference,
        location: &DatasetLocation,
    ) -> Result<SeriesTable, FetchError> {
        let observations = self.fetch(location, &reference.filters).await?;
        let table = SeriesTable::from_observations(&reference.key, observations)?;

        info!(
            series_key = %reference.key,
            points = table.points.len(),
            latest = ?table.latest(),
            "Fetched series"
        );

        Ok(table)
    }

    /// Fetch one catalog series as one table, or one table per category
    /// when the series splits by a dimension.
    pub async fn fetch_tables(
        &self,
        reference: &SeriesReference,
        location: &DatasetLocation,
    ) -> Result<Vec<SeriesTable>, FetchError> {
        let Some(dimension) = reference.split_by.as_deref() else {
            return Ok(vec![self.fetch_table(reference, location).await?]);
        };

        let observations = self.fetch(location, &reference.filters).await?;
        let tables = split_tables(reference, dimension, observations)?;

        info!(
            series_key = %reference.key,
            split_by = dimension,
            tables = tables.len(),
            "Fetched split series"
        );

        Ok(tables)
    }

    fn request_error(&self, url: &str, failure: RequestFailure) -> FetchError {
        let url = url.to_string();
        match failure {
            RequestFailure::Timeout => FetchError::Timeout {
                url,
                timeout_secs: self.client.data_timeout().as_secs(),
            },
            RequestFailure::Status(status) => FetchError::Status { url, status },
            RequestFailure::Transport(message) => FetchError::Request { url, message },
            RequestFailure::Decode(message) => FetchError::Malformed(message),
        }
    }
}

/// Keep observations whose labelled dimensions contain every filter value.
///
/// Matching is a case-insensitive substring test. A filter naming a dimension
/// the dataset does not have is ignored.
pub fn apply_filters(
    observations: Vec<RawObservation>,
    filters: &BTreeMap<String, String>,
) -> Vec<RawObservation> {
    let active: Vec<(String, String)> = filters
        .iter()
        .filter(|(dimension, _)| {
            observations
                .iter()
                .any(|obs| dimension_value(obs, dimension).is_some())
        })
        .map(|(dimension, needle)| (dimension.clone(), needle.to_lowercase()))
        .collect();

    if active.is_empty() {
        return observations;
    }

    observations
        .into_iter()
        .filter(|obs| {
            active.iter().all(|(dimension, needle)| {
                dimension_value(obs, dimension)
                    .is_some_and(|value| value.to_lowercase().contains(needle.as_str()))
            })
        })
        .collect()
}

/// One table per category of `dimension`, in category order.
///
/// Categories with no usable value are skipped.
pub fn split_tables(
    reference: &SeriesReference,
    dimension: &str,
    observations: Vec<RawObservation>,
) -> Result<Vec<SeriesTable>, FetchError> {
    let mut by_category: BTreeMap<String, Vec<RawObservation>> = BTreeMap::new();
    for obs in observations {
        let Some(category) = dimension_value(&obs, dimension) else {
            return Err(FetchError::malformed(format!(
                "series '{}' splits by '{}', which the dataset does not have",
                reference.key, dimension
            )));
        };
        by_category.entry(category.to_string()).or_default().push(obs);
    }

    let tables: Vec<SeriesTable> = by_category
        .into_iter()
        .filter_map(|(category, observations)| {
            match SeriesTable::from_observations(reference.split_key(&category), observations) {
                Ok(table) => Some(table.with_category(category)),
                Err(err) => {
                    debug!(
                        series_key = %reference.key,
                        category = %category,
                        error = %err,
                        "Skipping category"
                    );
                    None
                }
            }
        })
        .collect();

    if tables.is_empty() {
        return Err(FetchError::Empty(reference.key.clone()));
    }

    Ok(tables)
}

fn dimension_value<'a>(obs: &'a RawObservation, dimension: &str) -> Option<&'a str> {
    obs.dimension_labels
        .get(dimension)
        .or_else(|| {
            obs.dimension_labels
                .iter()
                .find(|(label, _)| label.eq_ignore_ascii_case(dimension))
                .map(|(_, value)| value)
        })
        .map(String::as_str)
}
