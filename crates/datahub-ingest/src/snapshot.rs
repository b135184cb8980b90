//! Daily snapshot archive
//!
//! One pretty-printed JSON document per calendar day under the snapshot
//! directory, named `YYYY-MM-DD.json`. Re-exporting on the same day replaces
//! that day's document; other days are never touched.

use crate::error::SnapshotError;
use chrono::{DateTime, NaiveDate, Utc};
use datahub_common::types::{format_date, KeyIndicator, Snapshot};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes snapshot documents into one directory
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    dir: PathBuf,
    source_label: String,
}

impl SnapshotExporter {
    pub fn new(dir: impl Into<PathBuf>, source_label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            source_label: source_label.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", format_date(date)))
    }

    /// Export `indicators` as the document for `date`.
    ///
    /// Output depends only on the arguments, so identical input yields
    /// identical bytes.
    pub fn export<'a>(
        &self,
        date: NaiveDate,
        timestamp: DateTime<Utc>,
        indicators: impl IntoIterator<Item = &'a KeyIndicator>,
    ) -> Result<PathBuf, SnapshotError> {
        let snapshot = Snapshot::from_indicators(timestamp, self.source_label.as_str(), indicators);
        let mut body = serde_json::to_vec_pretty(&snapshot)?;
        body.push(b'\n');

        std::fs::create_dir_all(&self.dir).map_err(|e| SnapshotError::io(&self.dir, e))?;

        let target = self.path_for(date);
        let tmp = self.dir.join(format!(".{}.json.tmp", format_date(date)));

        write_file(&tmp, &body)?;
        std::fs::rename(&tmp, &target).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            SnapshotError::io(&target, e)
        })?;

        info!(
            path = %target.display(),
            indicators = snapshot.indicators.len(),
            "Snapshot written"
        );

        Ok(target)
    }
}

fn write_file(path: &Path, body: &[u8]) -> Result<(), SnapshotError> {
    let mut file = std::fs::File::create(path).map_err(|e| SnapshotError::io(path, e))?;
    file.write_all(body)
        .and_then(|_| file.sync_all())
        .map_err(|e| SnapshotError::io(path, e))
}
