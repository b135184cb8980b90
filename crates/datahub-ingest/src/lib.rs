//! Datahub Ingest Library
//!
//! Pulls statistical time series from the BPstat API, aligns each catalog
//! group on a common date axis and keeps a SQLite store plus a daily JSON
//! snapshot archive up to date.
//!
//! # Example
//!
//! ```no_run
//! use datahub_ingest::{Catalog, IngestConfig, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let catalog = Catalog::load(&config.catalog_path)?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!
//!     let summary = orchestrator.run(&catalog.select(&[])?).await;
//!     println!("{} groups failed", summary.failed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bpstat;
pub mod catalog;
pub mod config;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod pipeline;
pub mod snapshot;
pub mod store;

pub use catalog::{Catalog, GroupConfig, SeriesReference};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use orchestrator::{Orchestrator, RunSummary};
pub use pipeline::{GroupPipeline, GroupReport, PipelineContext, PipelineState};
pub use snapshot::SnapshotExporter;
pub use store::SeriesStore;
