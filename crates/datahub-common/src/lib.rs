//! Datahub Common Library
//!
//! Shared types, logging, and error handling for the datahub workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`DatahubError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Types**: the persisted record shapes (history rows, key indicators,
//!   snapshots) and the calendar helpers used to normalize observation dates
//!
//! # Example
//!
//! ```no_run
//! use datahub_common::types::{parse_period, NormalizedRow};
//!
//! fn first_row() -> datahub_common::Result<NormalizedRow> {
//!     let date = parse_period("2024-03")?;
//!     Ok(NormalizedRow::new("euribor_3m", date, 3.92))
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{DatahubError, Result};
