// Series resolver
//
// Maps a catalog series onto the dataset that holds it. Dataset locators
// resolve locally; series ids go through the metadata endpoint once and are
// cached for the lifetime of the resolver.

use super::client::{BpstatClient, RequestFailure, SeriesMetadata};
use crate::catalog::{DatasetLocation, SeriesLocator, SeriesReference};
use crate::error::ResolutionError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct SeriesResolver {
    client: BpstatClient,
    cache: Mutex<HashMap<String, DatasetLocation>>,
}

impl SeriesResolver {
    pub fn new(client: BpstatClient) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a catalog series to its dataset location
    pub async fn resolve(
        &self,
        reference: &SeriesReference,
    ) -> Result<DatasetLocation, ResolutionError> {
        match &reference.locator {
            SeriesLocator::Dataset(location) => Ok(location.clone()),
            SeriesLocator::SeriesId(series_id) => self.resolve_series_id(series_id).await,
        }
    }

    /// Resolve an external series id, hitting the API at most once per id
    pub async fn resolve_series_id(
        &self,
        series_id: &str,
    ) -> Result<DatasetLocation, ResolutionError> {
        if let Some(hit) = self.cache.lock().await.get(series_id) {
            debug!(series_id, "Resolution cache hit");
            return Ok(hit.clone());
        }

        let entries = self
            .client
            .series_metadata(series_id)
            .await
            .map_err(|failure| self.request_error(series_id, failure))?;

        let location = location_from_metadata(series_id, entries.first())?;

        info!(
            series_id,
            domain_id = location.domain_id,
            dataset_id = %location.dataset_id,
            "Resolved series"
        );

        self.cache
            .lock()
            .await
            .insert(series_id.to_string(), location.clone());

        Ok(location)
    }

    /// Number of cached resolutions
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }

    fn request_error(&self, series_id: &str, failure: RequestFailure) -> ResolutionError {
        let series_id = series_id.to_string();
        match failure {
            RequestFailure::Timeout => ResolutionError::Timeout {
                series_id,
                timeout_secs: self.client.metadata_timeout().as_secs(),
            },
            RequestFailure::Status(status) => ResolutionError::Status { series_id, status },
            RequestFailure::Transport(message) | RequestFailure::Decode(message) => {
                ResolutionError::Request { series_id, message }
            }
        }
    }
}

/// First metadata entry -> `(domain_ids[0], dataset_id)`
fn location_from_metadata(
    series_id: &str,
    entry: Option<&SeriesMetadata>,
) -> Result<DatasetLocation, ResolutionError> {
    let entry = entry.ok_or_else(|| ResolutionError::NotFound(series_id.to_string()))?;
    let missing = |field| ResolutionError::MissingField {
        series_id: series_id.to_string(),
        field,
    };

    let domain_id = entry
        .domain_ids
        .as_ref()
        .and_then(|ids| ids.as_array())
        .and_then(|ids| ids.first())
        .and_then(|id| match id {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .ok_or_else(|| missing("domain_ids"))?;

    let dataset_id = entry
        .dataset_id
        .as_ref()
        .and_then(|id| match id {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| missing("dataset_id"))?;

    Ok(DatasetLocation {
        domain_id,
        dataset_id,
        series_id: Some(series_id.to_string()),
    })
}
