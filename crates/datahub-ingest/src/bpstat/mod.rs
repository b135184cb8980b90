//! BPstat (Banco de Portugal statistics) API access
//!
//! Two read-only endpoints are used:
//!
//! - `GET {base}/series/?lang=PT&series_ids={id}`: series metadata, used to
//!   find the `(domain, dataset)` holding a series
//! - `GET {base}/domains/{domain}/datasets/{dataset}/?lang=PT[&series_ids={id}]`:
//!   the dataset itself as JSON-stat 2.0
//!
//! [`SeriesResolver`] wraps the first, [`SeriesFetcher`] the second.

pub mod client;
pub mod fetcher;
pub mod jsonstat;
pub mod resolver;

pub use client::BpstatClient;
pub use fetcher::{apply_filters, split_tables, SeriesFetcher};
pub use jsonstat::{JsonStatDataset, RawObservation};
pub use resolver::SeriesResolver;
