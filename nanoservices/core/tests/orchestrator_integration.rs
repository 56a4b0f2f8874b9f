mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use dimload_core::config::{ColumnMapping, ColumnType, LoadStrategy, SourceJoin, TableMapping};
use dimload_core::destinations::TargetStore;
use dimload_core::events::NotifyEvent;
use dimload_core::orchestrator::recovery::IssueKind;
use dimload_core::orchestrator::{RecoveryRequest, RunStatus, TableStage, TriggerRequest};
use dimload_core::sources::memory::MemorySourceProvider;
use dimload_core::store::db::Store;
use dimload_utils::error::Error;

fn stage(summary: &dimload_core::orchestrator::RunSummary, table: &str) -> TableStage {
    summary.outcome(table).map(|o| o.stage).expect("outcome recorded")
}

#[tokio::test]
async fn continue_on_error_isolates_a_failing_load() {
    let h = harness(LoadStrategy::ContinueOnError, &["B"]);

    let response = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap();
    let summary = response.summary.unwrap();

    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    assert_eq!(stage(&summary, "A"), TableStage::Loaded);
    assert_eq!(stage(&summary, "B"), TableStage::Failed);
    assert_eq!(stage(&summary, "C"), TableStage::Loaded);
    assert_eq!(summary.outcome("B").unwrap().error.as_deref(), Some("synthetic load failure"));
    assert_eq!(summary.rows_loaded, 4);

    // Window starts at the watermark and the watermark moves to its end.
    assert_eq!(summary.run.window.start, d(2024, 1, 1));
    assert_eq!(summary.run.window.end, Utc::now().date_naive());
    let checkpoint = h.orchestrator.checkpoint_status().await.unwrap().checkpoint;
    assert_eq!(checkpoint.last_date, Some(summary.run.window.end));
    assert_eq!(summary.run.watermark_after, Some(summary.run.window.end));

    assert_eq!(h.target.count_rows("A").await.unwrap(), Some(3));
    assert_eq!(h.target.count_rows("C").await.unwrap(), Some(1));
    assert_eq!(h.notifier.events(), vec![NotifyEvent::Started, NotifyEvent::PartialSuccess]);
}

#[tokio::test]
async fn fail_fast_skips_tables_after_the_failure() {
    let h = harness(LoadStrategy::FailFast, &["B"]);

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    assert_eq!(stage(&summary, "A"), TableStage::Loaded);
    assert_eq!(stage(&summary, "B"), TableStage::Failed);
    assert_eq!(stage(&summary, "C"), TableStage::Skipped);
    assert_eq!(summary.tables_skipped, 1);
    assert_eq!(h.target.count_rows("C").await.unwrap(), None);

    let checkpoint = h.orchestrator.checkpoint_status().await.unwrap().checkpoint;
    assert_eq!(checkpoint.last_date, Some(summary.run.window.end));
}

#[tokio::test]
async fn all_failed_loads_fail_the_run_and_keep_the_watermark() {
    let h = harness(LoadStrategy::ContinueOnError, &["A", "B", "C"]);

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::Failed);
    assert_eq!(summary.tables_failed, 3);
    assert!(summary.run.watermark_after.is_none());

    let checkpoint = h.orchestrator.checkpoint_status().await.unwrap().checkpoint;
    assert_eq!(checkpoint.last_date, None);
    assert_eq!(checkpoint.effective_start, d(2024, 1, 1));
    assert_eq!(h.notifier.events(), vec![NotifyEvent::Started, NotifyEvent::Failed]);
}

#[tokio::test]
async fn every_table_loaded_succeeds() {
    let h = harness(LoadStrategy::ContinueOnError, &[]);

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::Succeeded);
    assert_eq!(summary.tables_loaded, 3);
    assert_eq!(summary.rows_extracted, 6);
    assert_eq!(summary.rows_loaded, 6);
    assert!(summary.run.finished_at.is_some());
    assert!(h.orchestrator.validate_run(&summary.run.id).await.unwrap().is_clean());
    assert!(h.orchestrator.active_run().is_none());
}

#[tokio::test]
async fn request_strategy_overrides_configured_strategy() {
    let h = harness(LoadStrategy::FailFast, &["B"]);

    let request = TriggerRequest {
        load_strategy: Some(LoadStrategy::ContinueOnError),
        ..TriggerRequest::default()
    };
    let summary = h.orchestrator.trigger(request).await.unwrap().summary.unwrap();

    assert_eq!(summary.run.load_strategy, LoadStrategy::ContinueOnError);
    assert_eq!(stage(&summary, "C"), TableStage::Loaded);
}

#[tokio::test]
async fn explicit_window_is_used_as_given() {
    let h = harness(LoadStrategy::ContinueOnError, &[]);

    let request = TriggerRequest {
        start_date: Some(d(2024, 2, 1)),
        end_date: Some(d(2024, 2, 15)),
        ..TriggerRequest::default()
    };
    let summary = h.orchestrator.trigger(request).await.unwrap().summary.unwrap();

    assert_eq!(summary.run.window.start, d(2024, 2, 1));
    assert_eq!(summary.run.window.end, d(2024, 2, 15));
    let checkpoint = h.orchestrator.checkpoint_status().await.unwrap().checkpoint;
    assert_eq!(checkpoint.last_date, Some(d(2024, 2, 15)));
}

#[tokio::test]
async fn inverted_window_is_rejected_before_a_run_exists() {
    let h = harness(LoadStrategy::ContinueOnError, &[]);

    let request = TriggerRequest {
        start_date: Some(d(2024, 3, 1)),
        end_date: Some(d(2024, 2, 1)),
        ..TriggerRequest::default()
    };
    let result = h.orchestrator.trigger(request).await;

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(h.orchestrator.recent_runs(10).await.unwrap().is_empty());
    assert!(h.orchestrator.active_run().is_none());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn checkpoint_regression_is_recorded_on_the_run() {
    let h = harness(LoadStrategy::ContinueOnError, &[]);

    let later = TriggerRequest {
        start_date: Some(d(2024, 2, 1)),
        end_date: Some(d(2024, 3, 1)),
        ..TriggerRequest::default()
    };
    h.orchestrator.trigger(later).await.unwrap();

    let earlier = TriggerRequest {
        start_date: Some(d(2024, 1, 1)),
        end_date: Some(d(2024, 2, 1)),
        ..TriggerRequest::default()
    };
    let summary = h.orchestrator.trigger(earlier).await.unwrap().summary.unwrap();

    // Loaded data stands; only the checkpoint step failed.
    assert_eq!(summary.status(), RunStatus::Succeeded);
    assert!(summary.run.watermark_after.is_none());
    assert!(summary.run.checkpoint_error.as_deref().unwrap().contains("cannot regress"));
    let checkpoint = h.orchestrator.checkpoint_status().await.unwrap().checkpoint;
    assert_eq!(checkpoint.last_date, Some(d(2024, 3, 1)));
}

#[tokio::test]
async fn async_trigger_returns_immediately_and_blocks_concurrent_runs() {
    let h = harness(LoadStrategy::ContinueOnError, &[]);
    h.target.slow_down(Duration::from_millis(100));

    let request = TriggerRequest { run_async: true, ..TriggerRequest::default() };
    let response = h.orchestrator.trigger(request).await.unwrap();
    assert!(response.summary.is_none());

    // Persisted before the trigger returned.
    let pending = h.orchestrator.run_status(&response.run_id).await.unwrap();
    assert!(pending.run.finished_at.is_none());

    match h.orchestrator.trigger(TriggerRequest::default()).await {
        Err(Error::AlreadyRunning(active)) => assert_eq!(active, response.run_id),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert!(matches!(
        h.orchestrator.recover(RecoveryRequest::default()).await,
        Err(Error::AlreadyRunning(_))
    ));

    let mut summary = h.orchestrator.run_status(&response.run_id).await.unwrap();
    for _ in 0..100 {
        if summary.run.finished_at.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        summary = h.orchestrator.run_status(&response.run_id).await.unwrap();
    }
    assert_eq!(summary.status(), RunStatus::Succeeded);

    // The slot is released once the spawned run finishes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.orchestrator.active_run().is_none());
    assert!(h.orchestrator.trigger(TriggerRequest::default()).await.is_ok());
}

#[tokio::test]
async fn notifier_failures_never_fail_the_run() {
    let h = harness_with(
        sources(),
        tables(),
        LoadStrategy::ContinueOnError,
        &[],
        RecordingNotifier::failing(),
    );

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::Succeeded);
    assert_eq!(h.notifier.events(), vec![NotifyEvent::Started, NotifyEvent::Succeeded]);
}

#[tokio::test]
async fn extraction_failure_is_scoped_to_its_table() {
    let mut sources = sources();
    sources.fail_table("tenant_acme", "b_src", "connection reset");
    let h = harness_with(sources, tables(), LoadStrategy::FailFast, &[], RecordingNotifier::default());

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    let b = summary.outcome("B").unwrap();
    assert_eq!(b.stage, TableStage::Failed);
    assert_eq!(b.step.as_str(), "extract");
    assert!(b.error.as_deref().unwrap().contains("connection reset"));
    // Extraction failures never trigger the load strategy.
    assert_eq!(stage(&summary, "C"), TableStage::Loaded);
}

#[tokio::test]
async fn transformation_failure_is_scoped_to_its_table() {
    let mut tables = tables();
    tables[0] = TableMapping::Dimension {
        target: "A".into(),
        source_table: "a_src".into(),
        natural_key: vec!["key".into()],
        columns: vec![ColumnMapping { source: "missing".into(), target: "key".into(), coerce: None }],
        incremental_column: None,
        source_db_column: None,
        joins: vec![],
    };
    let h = harness_with(sources(), tables, LoadStrategy::ContinueOnError, &[], RecordingNotifier::default());

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    let a = summary.outcome("A").unwrap();
    assert_eq!(a.stage, TableStage::Failed);
    assert_eq!(a.step.as_str(), "transform");
    assert_eq!(stage(&summary, "B"), TableStage::Loaded);
    assert_eq!(summary.status(), RunStatus::PartialSuccess);
}

#[tokio::test]
async fn panicking_transformer_fails_only_its_table() {
    let h = harness_transforming(LoadStrategy::ContinueOnError, PanickingTransformer::on("B"));

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    let b = summary.outcome("B").unwrap();
    assert_eq!(b.stage, TableStage::Failed);
    assert_eq!(b.step.as_str(), "transform");
    assert!(b.error.as_deref().unwrap().contains("transformer bug on B"));
    assert_eq!(stage(&summary, "A"), TableStage::Loaded);
    assert_eq!(stage(&summary, "C"), TableStage::Loaded);
    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    assert_eq!(h.target.count_rows("C").await.unwrap(), Some(1));
    assert_eq!(h.notifier.events(), vec![NotifyEvent::Started, NotifyEvent::PartialSuccess]);
}

#[tokio::test]
async fn empty_tables_load_and_are_reported() {
    let mut sources = sources();
    sources.add_table("tenant_acme", "c_src", people(&[]));
    let h = harness_with(sources, tables(), LoadStrategy::ContinueOnError, &[], RecordingNotifier::default());

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::Succeeded);
    assert_eq!(h.orchestrator.empty_tables(&summary.run.id).await.unwrap(), vec!["C"]);
    let validation = h.orchestrator.validate_run(&summary.run.id).await.unwrap();
    assert_eq!(validation.issues.len(), 1);
    assert_eq!(validation.issues[0].kind, IssueKind::EmptyLoad);
    assert_eq!(h.target.count_rows("C").await.unwrap(), Some(0));
}

#[tokio::test]
async fn rows_from_every_candidate_database_are_merged_and_stamped() {
    let mut sources = MemorySourceProvider::new();
    sources
        .add_table("tenant_acme", "orders", people(&[1, 2]))
        .add_table("tenant_globex", "orders", people(&[3]))
        .add_table("tenant_archive", "orders", people(&[4, 5, 6]));
    let orders = TableMapping::Dimension {
        target: "dim_order".into(),
        source_table: "orders".into(),
        natural_key: vec!["order_id".into()],
        columns: vec![
            ColumnMapping { source: "id".into(), target: "order_id".into(), coerce: Some(ColumnType::Text) },
        ],
        incremental_column: None,
        source_db_column: Some("tenant".into()),
        joins: vec![],
    };

    dimload_core::logging::init_with_default("warn");
    let target = FlakyTarget::new(&[]);
    let orchestrator = dimload_core::builder::OrchestratorBuilder::new("test")
        .source_provider(sources)
        .exclude_keywords(&["archive".to_string()])
        .target_provider(FlakyProvider(target.clone()))
        .settings(settings(LoadStrategy::ContinueOnError))
        .table(orders)
        .build()
        .unwrap();

    let summary = orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    assert_eq!(summary.status(), RunStatus::Succeeded);
    assert_eq!(summary.rows_loaded, 3);
    assert_eq!(target.count_rows("dim_order").await.unwrap(), Some(3));
}

#[tokio::test]
async fn joined_source_tables_feed_one_target() {
    let mut sources = sources();
    sources.add_table("tenant_acme", "nicknames", people(&[1, 3, 3]));
    let with_nicknames = |target: &str, joined: &str| TableMapping::Dimension {
        target: target.into(),
        source_table: "a_src".into(),
        natural_key: vec!["key".into()],
        columns: vec![
            ColumnMapping { source: "id".into(), target: "key".into(), coerce: None },
            ColumnMapping { source: format!("{joined}.name"), target: "nickname".into(), coerce: None },
        ],
        incremental_column: None,
        source_db_column: None,
        joins: vec![SourceJoin { table: joined.into(), left: "id".into(), right: "id".into() }],
    };
    let tables = vec![with_nicknames("A", "nicknames"), with_nicknames("B", "aliases")];
    let h = harness_with(sources, tables, LoadStrategy::ContinueOnError, &[], RecordingNotifier::default());

    let summary = h.orchestrator.trigger(TriggerRequest::default()).await.unwrap().summary.unwrap();

    // Ids 1 and 2 match at most once; id 3 matches twice.
    let a = summary.outcome("A").unwrap();
    assert_eq!(a.stage, TableStage::Loaded);
    assert_eq!(a.rows_out, 4);
    assert_eq!(h.target.count_rows("A").await.unwrap(), Some(4));

    let b = summary.outcome("B").unwrap();
    assert_eq!(b.stage, TableStage::Failed);
    assert_eq!(b.step.as_str(), "extract");
    assert!(b.error.as_deref().unwrap().contains("aliases"));
    assert_eq!(summary.status(), RunStatus::PartialSuccess);
}

#[tokio::test]
async fn interrupted_runs_are_failed_on_startup() {
    let dir = std::env::temp_dir().join(format!("dimload-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let state = dir.join("state.db");

    {
        let store = Store::open(&state).unwrap();
        let h = dimload_core::builder::OrchestratorBuilder::new("test")
            .source_provider(sources())
            .target_provider(FlakyProvider(FlakyTarget::new(&[])))
            .settings(settings(LoadStrategy::ContinueOnError))
            .tables(tables())
            .store(store)
            .build()
            .unwrap();
        // Nothing in flight: nothing to close.
        assert_eq!(h.fail_interrupted_runs().await.unwrap(), 0);
        h.trigger(TriggerRequest::default()).await.unwrap();
    }

    let reopened = dimload_core::builder::OrchestratorBuilder::new("test")
        .source_provider(sources())
        .settings(settings(LoadStrategy::ContinueOnError))
        .tables(tables())
        .store(Store::open(&state).unwrap())
        .build()
        .unwrap();
    // The finished run survives a restart and is not touched.
    assert_eq!(reopened.fail_interrupted_runs().await.unwrap(), 0);
    assert_eq!(reopened.recent_runs(5).await.unwrap().len(), 1);
    assert!(reopened.checkpoint_status().await.unwrap().checkpoint.last_date.is_some());

    std::fs::remove_dir_all(&dir).ok();
}
