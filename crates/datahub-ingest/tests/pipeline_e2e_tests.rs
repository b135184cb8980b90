//! End-to-end tests for the group pipeline and orchestrator
//!
//! The BPstat API is served by wiremock; the store is a SQLite file and the
//! snapshot archive a directory, both under a temp dir.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use datahub_ingest::catalog::{Cadence, CompletenessPolicy};
use datahub_ingest::error::MergeError;
use datahub_ingest::{
    Catalog, GroupConfig, GroupPipeline, IngestConfig, IngestError, Orchestrator,
    PipelineContext, PipelineState, SeriesReference,
};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn config(server: &MockServer, temp: &TempDir) -> IngestConfig {
    IngestConfig {
        api_url: server.uri(),
        data_timeout_secs: 1,
        metadata_timeout_secs: 1,
        db_path: temp.path().join("datahub.db").display().to_string(),
        snapshot_dir: temp.path().join("datalake"),
        ..Default::default()
    }
}

/// Single-dimension JSON-stat payload over the time axis
fn dataset(points: &[(&str, Option<f64>)]) -> Value {
    let dates: Vec<&str> = points.iter().map(|(d, _)| *d).collect();
    let values: Vec<Option<f64>> = points.iter().map(|(_, v)| *v).collect();
    json!({
        "label": "test dataset",
        "id": ["reference_date"],
        "size": [points.len()],
        "role": {"time": ["reference_date"]},
        "dimension": {
            "reference_date": {"label": "Data", "category": {"index": dates}}
        },
        "value": values
    })
}

async fn mount_dataset(server: &MockServer, dataset_id: &str, body: Value, delay: Option<Duration>) {
    let mut response = ResponseTemplate::new(200).set_body_json(body);
    if let Some(delay) = delay {
        response = response.set_delay(delay);
    }
    Mock::given(method("GET"))
        .and(path(format!("/domains/1/datasets/{dataset_id}/")))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_policy_rate(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/series/"))
        .and(query_param("series_ids", "12345"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 12345, "label": "Policy rate", "domain_ids": [7], "dataset_id": "abc"}
        ])))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/domains/7/datasets/abc/"))
        .and(query_param("series_ids", "12345"))
        .and(query_param("lang", "PT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dataset(&[
            ("2024-01-01", Some(1.0)),
            ("2024-03-01", Some(1.5)),
        ])))
        .mount(server)
        .await;
}

fn policy_rate_group() -> GroupConfig {
    GroupConfig::new(
        "rates",
        vec![SeriesReference::by_series_id("policy_rate", "Policy rate", "12345")],
    )
    .with_cadence(Cadence::Monthly)
}

fn three_series_group(policy: CompletenessPolicy) -> GroupConfig {
    GroupConfig::new(
        "three",
        vec![
            SeriesReference::by_dataset("a", "A", 1, "a"),
            SeriesReference::by_dataset("b", "B", 1, "b"),
            SeriesReference::by_dataset("slow", "Slow", 1, "slow"),
        ],
    )
    .with_policy(policy)
}

async fn mount_three_series(server: &MockServer) {
    mount_dataset(server, "a", dataset(&[("2024-01-01", Some(1.0))]), None).await;
    mount_dataset(server, "b", dataset(&[("2024-01-01", Some(2.0))]), None).await;
    mount_dataset(
        server,
        "slow",
        dataset(&[("2024-01-01", Some(3.0))]),
        Some(Duration::from_secs(3)),
    )
    .await;
}

#[tokio::test]
async fn test_policy_rate_end_to_end() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_policy_rate(&server).await;

    let ctx = PipelineContext::from_config(&config(&server, &temp)).await?;
    let group = policy_rate_group();

    let report = GroupPipeline::new(&ctx, &group).run().await;
    assert_eq!(report.state, PipelineState::Done, "{:?}", report.error);
    assert_eq!(report.stored.len(), 1);
    assert_eq!(report.stored[0].rows, 3);
    assert_eq!(report.stored[0].latest_date, ymd(2024, 3, 1));
    assert_eq!(report.stored[0].latest_value, 1.5);

    let history: Vec<(NaiveDate, f64)> = ctx
        .store
        .history("policy_rate")
        .await?
        .into_iter()
        .map(|row| (row.date, row.value))
        .collect();
    assert_eq!(
        history,
        vec![
            (ymd(2024, 1, 1), 1.0),
            (ymd(2024, 2, 1), 1.0),
            (ymd(2024, 3, 1), 1.5)
        ]
    );

    let indicator = ctx.store.indicator("latest_policy_rate").await?.unwrap();
    assert_eq!(indicator.value, 1.5);
    assert_eq!(indicator.reference_date, ymd(2024, 3, 1));
    assert_eq!(indicator.label, "Policy rate");
    assert_eq!(indicator.unit, "%");

    Ok(())
}

#[tokio::test]
async fn test_snapshot_written_for_today() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_policy_rate(&server).await;

    let ctx = PipelineContext::from_config(&config(&server, &temp)).await?;
    let group = policy_rate_group();
    let report = GroupPipeline::new(&ctx, &group).run().await;

    let snapshot_path = report.snapshot_path.unwrap();
    assert_eq!(snapshot_path, ctx.exporter.path_for(Utc::now().date_naive()));

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&snapshot_path)?)?;
    assert_eq!(doc["source_label"], "BPstat (Banco de Portugal)");
    assert_eq!(doc["indicators"]["latest_policy_rate"]["value"], 1.5);
    assert_eq!(doc["indicators"]["latest_policy_rate"]["reference_date"], "2024-03-01");

    Ok(())
}

#[tokio::test]
async fn test_rerun_is_idempotent_and_advances_updated_at() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_policy_rate(&server).await;
    let config = config(&server, &temp);
    let group = policy_rate_group();

    let ctx = PipelineContext::from_config(&config).await?;
    assert!(GroupPipeline::new(&ctx, &group).run().await.succeeded());
    let history = ctx.store.history("policy_rate").await?;
    let first = ctx.store.indicator("latest_policy_rate").await?.unwrap();

    // Same process: the resolver cache serves the second run
    assert!(GroupPipeline::new(&ctx, &group).run().await.succeeded());
    let second = ctx.store.indicator("latest_policy_rate").await?.unwrap();

    assert_eq!(ctx.store.history("policy_rate").await?, history);
    assert_eq!(second.value, first.value);
    assert_eq!(second.reference_date, first.reference_date);
    assert!(second.updated_at > first.updated_at);

    Ok(())
}

#[tokio::test]
async fn test_partial_group_tolerates_timed_out_unit() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_three_series(&server).await;

    let ctx = PipelineContext::from_config(&config(&server, &temp)).await?;
    let group = three_series_group(CompletenessPolicy::Partial);

    let report = GroupPipeline::new(&ctx, &group).run().await;
    assert!(report.succeeded());

    let stored: Vec<&str> = report.stored.iter().map(|s| s.series_key.as_str()).collect();
    assert_eq!(stored, vec!["a", "b"]);
    assert_eq!(report.absent.len(), 1);
    assert_eq!(report.absent[0].series_key, "slow");
    assert!(report.absent[0].reason.contains("timed out"));
    assert!(ctx.store.indicator("latest_slow").await?.is_none());

    // No retry after the timeout
    let slow_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/domains/1/datasets/slow/")
        .count();
    assert_eq!(slow_requests, 1);

    Ok(())
}

#[tokio::test]
async fn test_strict_group_stores_nothing_on_timeout() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_three_series(&server).await;

    let ctx = PipelineContext::from_config(&config(&server, &temp)).await?;
    let group = three_series_group(CompletenessPolicy::Strict);

    let report = GroupPipeline::new(&ctx, &group).run().await;
    assert_eq!(report.state, PipelineState::Failed);
    assert_eq!(report.failed_at, Some(PipelineState::Merging));
    assert!(matches!(
        report.error,
        Some(IngestError::Merge(MergeError::MissingSeries { .. }))
    ));
    assert!(report.stored.is_empty());
    assert!(report.snapshot_path.is_none());
    assert!(ctx.store.indicators().await?.is_empty());
    assert!(ctx.store.history("a").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_orchestrator_continues_after_failed_group() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_policy_rate(&server).await;
    Mock::given(method("GET"))
        .and(path("/domains/1/datasets/down/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let catalog = Catalog::from_toml_str(
        r#"
        [[groups]]
        name = "broken"

        [[groups.series]]
        key = "down"
        label = "Down"
        domain_id = 1
        dataset_id = "down"

        [[groups]]
        name = "rates"
        cadence = "monthly"

        [[groups.series]]
        key = "policy_rate"
        label = "Policy rate"
        series_id = 12345
        "#,
    )?;

    let orchestrator = Orchestrator::from_config(&config(&server, &temp)).await?;
    let summary = orchestrator.run(&catalog.select(&[])?).await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.all_succeeded());

    let failed: Vec<&str> = summary.failed_groups().map(|r| r.group.as_str()).collect();
    assert_eq!(failed, vec!["broken"]);
    assert_eq!(summary.reports[0].failed_at, Some(PipelineState::Fetching));
    assert_eq!(summary.reports[1].state, PipelineState::Done);

    let indicators = orchestrator.context().store.indicators().await?;
    assert_eq!(indicators.len(), 1);
    assert_eq!(indicators[0].indicator_key, "latest_policy_rate");

    Ok(())
}

#[tokio::test]
async fn test_store_survives_reopen() -> Result<()> {
    let server = MockServer::start().await;
    let temp = TempDir::new()?;
    mount_policy_rate(&server).await;
    let config = config(&server, &temp);

    {
        let ctx = PipelineContext::from_config(&config).await?;
        let group = policy_rate_group();
        assert!(GroupPipeline::new(&ctx, &group).run().await.succeeded());
        ctx.store.pool().close().await;
    }

    let reopened = PipelineContext::from_config(&config).await?;
    assert_eq!(reopened.store.history("policy_rate").await?.len(), 3);
    assert!(reopened.store.indicator("latest_policy_rate").await?.is_some());

    Ok(())
}
