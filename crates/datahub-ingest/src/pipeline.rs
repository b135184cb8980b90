// Group ingestion pipeline
//
// Runs one catalog group through:
// 1. Resolve every series to its dataset (one metadata call per distinct id)
// 2. Fetch every series as an independent unit, bounded fan-out
// 3. Merge at the join barrier
// 4. Reconcile history and indicators
// 5. Export the daily snapshot (best effort)

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use crate::bpstat::{BpstatClient, SeriesFetcher, SeriesResolver};
use crate::catalog::{DatasetLocation, GroupConfig, SeriesLocator, SeriesReference};
use crate::config::IngestConfig;
use crate::error::{IngestError, MergeError, ResolutionError, Result};
use crate::merge::{merge, MergeSpec, MergedTable, SeriesTable};
use crate::snapshot::SnapshotExporter;
use crate::store::{SeriesBatch, SeriesStore};

/// Unit used when neither the catalog nor the dataset names one
pub const FALLBACK_UNIT: &str = "%";

/// Where a group run is, or where it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Resolving,
    Fetching,
    Merging,
    Storing,
    Snapshotting,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::Resolving => "resolving",
            PipelineState::Fetching => "fetching",
            PipelineState::Merging => "merging",
            PipelineState::Storing => "storing",
            PipelineState::Snapshotting => "snapshotting",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A series that made it into the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSeries {
    pub series_key: String,
    pub rows: usize,
    pub latest_date: NaiveDate,
    pub latest_value: f64,
}

/// A series that was skipped, and why
#[derive(Debug, Clone, PartialEq)]
pub struct AbsentSeries {
    pub series_key: String,
    pub reason: String,
}

/// Outcome of one group run
#[derive(Debug)]
pub struct GroupReport {
    pub group: String,
    pub state: PipelineState,
    /// State in which the run failed
    pub failed_at: Option<PipelineState>,
    pub stored: Vec<StoredSeries>,
    pub absent: Vec<AbsentSeries>,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_error: Option<String>,
    pub error: Option<IngestError>,
    pub duration: Duration,
}

impl GroupReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            state: PipelineState::Init,
            failed_at: None,
            stored: Vec::new(),
            absent: Vec::new(),
            snapshot_path: None,
            snapshot_error: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }
}

/// Long-lived collaborators shared by every group of a run
pub struct PipelineContext {
    pub resolver: SeriesResolver,
    pub fetcher: SeriesFetcher,
    pub store: SeriesStore,
    pub exporter: SnapshotExporter,
    pub max_concurrency: usize,
}

impl PipelineContext {
    /// Build the HTTP client, open the store and prepare the exporter
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        config.validate()?;

        let client = BpstatClient::new(config)?;
        let store = SeriesStore::connect(&config.db_path).await?;

        Ok(Self {
            resolver: SeriesResolver::new(client.clone()),
            fetcher: SeriesFetcher::new(client),
            store,
            exporter: SnapshotExporter::new(&config.snapshot_dir, config.source_label.as_str()),
            max_concurrency: config.max_concurrency,
        })
    }
}

/// Series paired with where to fetch it
type Resolved<'g> = Vec<(&'g SeriesReference, DatasetLocation)>;

/// Fetched tables with the catalog series each came from
type Fetched<'g> = Vec<(&'g SeriesReference, SeriesTable)>;

/// Runs a single group
pub struct GroupPipeline<'a> {
    context: &'a PipelineContext,
    group: &'a GroupConfig,
    state: PipelineState,
    resync: bool,
}

impl<'a> GroupPipeline<'a> {
    pub fn new(context: &'a PipelineContext, group: &'a GroupConfig) -> Self {
        Self {
            context,
            group,
            state: PipelineState::Init,
            resync: false,
        }
    }

    /// Replace each series' stored history instead of upserting into it
    pub fn with_resync(mut self) -> Self {
        self.resync = true;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run the group to completion. Never fails: faults land in the report.
    pub async fn run(mut self) -> GroupReport {
        let start_time = Instant::now();
        let mut report = GroupReport::new(&self.group.name);

        info!(
            group = %self.group.name,
            series = self.group.series.len(),
            policy = ?self.group.policy,
            cadence = ?self.group.cadence,
            resync = self.resync,
            "Starting group pipeline"
        );

        match self.execute(&mut report).await {
            Ok(()) => {
                self.transition(PipelineState::Done);
                info!(
                    group = %self.group.name,
                    stored = report.stored.len(),
                    absent = report.absent.len(),
                    "Group pipeline complete"
                );
            }
            Err(err) => {
                error!(
                    group = %self.group.name,
                    state = %self.state,
                    error = %err,
                    "Group pipeline failed"
                );
                report.failed_at = Some(self.state);
                report.error = Some(err);
                self.transition(PipelineState::Failed);
            }
        }

        report.state = self.state;
        report.duration = start_time.elapsed();
        report
    }

    async fn execute(&mut self, report: &mut GroupReport) -> Result<()> {
        self.transition(PipelineState::Resolving);
        let resolved = self.resolve_all(report).await?;

        self.transition(PipelineState::Fetching);
        let fetched = self.fetch_all(resolved, report).await?;

        self.transition(PipelineState::Merging);
        let (sources, tables): (Vec<&SeriesReference>, Vec<SeriesTable>) =
            fetched.into_iter().unzip();
        let spec = self.merge_spec(&sources, &tables);
        let merged = merge(&tables, &spec)?;
        let batches = self.batches(&sources, &tables, &merged, report)?;

        self.transition(PipelineState::Storing);
        let outcomes = if self.resync {
            let mut outcomes = Vec::with_capacity(batches.len());
            for batch in batches {
                outcomes.push(self.context.store.resync(batch).await?);
            }
            outcomes
        } else {
            self.context.store.reconcile_group(&batches).await?
        };

        report.stored = outcomes
            .into_iter()
            .map(|outcome| StoredSeries {
                series_key: outcome.series_key,
                rows: outcome.rows_written,
                latest_date: outcome.indicator.reference_date,
                latest_value: outcome.indicator.value,
            })
            .collect();

        if self.group.snapshot {
            self.transition(PipelineState::Snapshotting);
            self.snapshot(report).await;
        }

        Ok(())
    }

    /// Resolve every series. Each distinct locator is resolved once.
    async fn resolve_all(&self, report: &mut GroupReport) -> Result<Resolved<'a>> {
        let group: &'a GroupConfig = self.group;

        let mut seen = HashSet::new();
        let distinct: Vec<&'a SeriesReference> = group
            .series
            .iter()
            .filter(|s| seen.insert(&s.locator))
            .collect();

        let resolver = &self.context.resolver;
        let lookups: HashMap<&SeriesLocator, std::result::Result<DatasetLocation, ResolutionError>> =
            stream::iter(distinct)
                .map(|reference| async move {
                    (&reference.locator, resolver.resolve(reference).await)
                })
                .buffer_unordered(self.concurrency())
                .collect()
                .await;

        let mut resolved = Vec::with_capacity(group.series.len());
        for reference in &group.series {
            let outcome = lookups
                .get(&reference.locator)
                .cloned()
                .unwrap_or_else(|| Err(ResolutionError::NotFound(reference.key.clone())));

            match outcome {
                Ok(location) => resolved.push((reference, location)),
                Err(err) if group.is_strict() => return Err(err.into()),
                Err(err) => {
                    warn!(
                        group = %group.name,
                        series_key = %reference.key,
                        error = %err,
                        "Series unresolved, marking absent"
                    );
                    report.absent.push(AbsentSeries {
                        series_key: reference.key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(resolved)
    }

    /// Fetch every resolved series concurrently. Failed units become absent.
    async fn fetch_all(
        &self,
        resolved: Resolved<'a>,
        report: &mut GroupReport,
    ) -> Result<Fetched<'a>> {
        let concurrency = self.concurrency();
        let attempted = resolved.len();
        let fetcher = &self.context.fetcher;

        info!(
            group = %self.group.name,
            units = attempted,
            concurrency,
            "Fetching series"
        );

        let mut results: Vec<_> = stream::iter(resolved.into_iter().enumerate())
            .map(|(index, (reference, location))| {
                let span = info_span!("fetch_unit", series_key = %reference.key);
                async move {
                    let result = fetcher.fetch_tables(reference, &location).await;
                    (index, reference, result)
                }
                .instrument(span)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        // Catalog order, regardless of completion order
        results.sort_by_key(|(index, _, _)| *index);

        let mut fetched = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (_, reference, result) in results {
            match result {
                Ok(tables) => fetched.extend(tables.into_iter().map(|table| (reference, table))),
                Err(err) => {
                    warn!(
                        group = %self.group.name,
                        series_key = %reference.key,
                        error = %err,
                        "Series fetch failed, marking absent"
                    );
                    report.absent.push(AbsentSeries {
                        series_key: reference.key.clone(),
                        reason: err.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        info!(
            group = %self.group.name,
            tables = fetched.len(),
            attempted,
            "Fetch barrier reached"
        );

        match (fetched.is_empty(), first_error) {
            (true, Some(err)) => Err(err.into()),
            _ => Ok(fetched),
        }
    }

    /// One store batch per merged column.
    ///
    /// A column left without values is absent under the partial policy and
    /// missing under the strict one.
    fn batches(
        &self,
        sources: &[&SeriesReference],
        tables: &[SeriesTable],
        merged: &MergedTable,
        report: &mut GroupReport,
    ) -> Result<Vec<SeriesBatch>> {
        let mut batches = Vec::with_capacity(tables.len());
        let mut empty = Vec::new();

        for (reference, table) in sources.iter().zip(tables) {
            let rows = merged.rows(&table.series_key);
            if rows.is_empty() {
                empty.push(table.series_key.clone());
                continue;
            }

            let label = match table.category.as_deref() {
                Some(category) => reference.split_label(category),
                None => reference.label.clone(),
            };
            let unit = reference
                .unit
                .clone()
                .or_else(|| table.unit_hint.clone())
                .unwrap_or_else(|| FALLBACK_UNIT.to_string());
            batches.push(SeriesBatch::new(&table.series_key, label, unit, rows));
        }

        if !empty.is_empty() {
            if self.group.is_strict() {
                return Err(MergeError::MissingSeries {
                    group: self.group.name.clone(),
                    series: empty,
                }
                .into());
            }
            for series_key in empty {
                warn!(
                    group = %self.group.name,
                    series_key = %series_key,
                    "No values on the merged date axis, marking absent"
                );
                report.absent.push(AbsentSeries {
                    series_key,
                    reason: "no values on the merged date axis".to_string(),
                });
            }
        }

        if batches.is_empty() {
            return Err(MergeError::Empty(self.group.name.clone()).into());
        }

        Ok(batches)
    }

    async fn snapshot(&self, report: &mut GroupReport) {
        let now = Utc::now();
        let result = match self.context.store.indicators().await {
            Ok(indicators) => self
                .context
                .exporter
                .export(now.date_naive(), now, &indicators),
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(path) => report.snapshot_path = Some(path),
            Err(err) => {
                warn!(
                    group = %self.group.name,
                    error = %err,
                    "Snapshot export failed, store writes are kept"
                );
                report.snapshot_error = Some(err.to_string());
            }
        }
    }

    /// Split series are required through the tables they produced, or by
    /// their own key when they produced none.
    fn merge_spec(&self, sources: &[&SeriesReference], tables: &[SeriesTable]) -> MergeSpec {
        let required = self
            .group
            .series
            .iter()
            .flat_map(|reference| {
                let derived: Vec<String> = sources
                    .iter()
                    .zip(tables)
                    .filter(|(source, _)| {
                        reference.split_by.is_some() && source.key == reference.key
                    })
                    .map(|(_, table)| table.series_key.clone())
                    .collect();
                if derived.is_empty() {
                    vec![reference.key.clone()]
                } else {
                    derived
                }
            })
            .collect();

        MergeSpec {
            group: self.group.name.clone(),
            cadence: self.group.cadence,
            policy: self.group.policy,
            required,
            precision: sources
                .iter()
                .zip(tables)
                .map(|(source, table)| (table.series_key.clone(), self.group.precision_for(source)))
                .collect(),
        }
    }

    fn concurrency(&self) -> usize {
        self.group
            .series
            .len()
            .min(self.context.max_concurrency)
            .max(1)
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!(
            group = %self.group.name,
            from = %self.state,
            to = %next,
            "Pipeline transition"
        );
        self.state = next;
    }
}
