// BPstat HTTP client
//
// Thin wrapper around reqwest for the two read-only endpoints the worker
// uses. Each request carries its own timeout; nothing is retried here.

use super::jsonstat::JsonStatDataset;
use crate::catalog::DatasetLocation;
use crate::config::IngestConfig;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// One entry of the `/series/` metadata response
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesMetadata {
    #[serde(default)]
    pub domain_ids: Option<serde_json::Value>,
    #[serde(default)]
    pub dataset_id: Option<serde_json::Value>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Why a request produced no usable body
#[derive(Debug)]
pub enum RequestFailure {
    Timeout,
    Status(u16),
    Transport(String),
    Decode(String),
}

impl From<reqwest::Error> for RequestFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestFailure::Timeout
        } else if let Some(status) = err.status() {
            RequestFailure::Status(status.as_u16())
        } else {
            RequestFailure::Transport(err.to_string())
        }
    }
}

/// Client for the BPstat data API
#[derive(Debug, Clone)]
pub struct BpstatClient {
    client: Client,
    base_url: String,
    lang: String,
    metadata_timeout: Duration,
    data_timeout: Duration,
}

impl BpstatClient {
    /// Build a client from the worker configuration
    pub fn new(config: &IngestConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            lang: config.api_lang.clone(),
            metadata_timeout: config.metadata_timeout(),
            data_timeout: config.data_timeout(),
        })
    }

    pub fn metadata_timeout(&self) -> Duration {
        self.metadata_timeout
    }

    pub fn data_timeout(&self) -> Duration {
        self.data_timeout
    }

    pub fn metadata_url(&self) -> String {
        format!("{}/series/", self.base_url)
    }

    pub fn dataset_url(&self, location: &DatasetLocation) -> String {
        format!(
            "{}/domains/{}/datasets/{}/",
            self.base_url, location.domain_id, location.dataset_id
        )
    }

    /// `GET /series/?lang=..&series_ids=..`
    pub async fn series_metadata(
        &self,
        series_id: &str,
    ) -> Result<Vec<SeriesMetadata>, RequestFailure> {
        let query = [("lang", self.lang.as_str()), ("series_ids", series_id)];
        self.get_json(&self.metadata_url(), &query, self.metadata_timeout)
            .await
    }

    /// `GET /domains/{d}/datasets/{ds}/?lang=..[&series_ids=..]`
    pub async fn dataset(
        &self,
        location: &DatasetLocation,
    ) -> Result<JsonStatDataset, RequestFailure> {
        let mut query = vec![("lang", self.lang.as_str())];
        if let Some(series_id) = location.series_id.as_deref() {
            query.push(("series_ids", series_id));
        }
        self.get_json(&self.dataset_url(location), &query, self.data_timeout)
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T, RequestFailure> {
        debug!(url = %url, ?query, timeout_secs = timeout.as_secs(), "GET");

        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestFailure::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RequestFailure::Decode(e.to_string()))
    }
}
