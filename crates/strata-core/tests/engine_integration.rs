//! End-to-end tests for the migration engine over real migration files.

use std::path::PathBuf;
use strata_core::migration::state::{MarkerStatus, RecordState};
use strata_core::{
    ApplyMode, DirectorySource, EngineConfig, FieldDescriptor, FieldType, MigrationEngine,
    MigrationError, MigrationId, MigrationRecord, MigrationStatus, MigrationTarget, Operation,
    PlanAction, SchemaGraph, StaticSource, TableId,
};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture_graph() -> SchemaGraph {
    SchemaGraph::from_source(&DirectorySource::new(fixtures())).unwrap()
}

fn gateway_id() -> MigrationId {
    MigrationId::new(
        "passbook_providers_app_gw",
        "0003_applicationgatewayprovider",
    )
}

fn shared_db() -> sled::Db {
    sled::Config::new().temporary(true).open().unwrap()
}

fn provider_graph(second: Operation) -> SchemaGraph {
    SchemaGraph::from_source(&StaticSource::new(vec![
        MigrationRecord::new("core", "0001_initial")
            .initial()
            .with_operation(Operation::create_table(
                "Provider",
                vec![FieldDescriptor::new("name", FieldType::Text)],
            )),
        MigrationRecord::new("core", "0002_provider_fields")
            .depends_on("core", "0001_initial")
            .with_operation(Operation::add_field(
                "Provider",
                FieldDescriptor::nullable("slug", FieldType::Text),
            ))
            .with_operation(second),
    ]))
    .unwrap()
}

fn missing_default() -> Operation {
    Operation::add_field("Provider", FieldDescriptor::new("host", FieldType::Text))
}

fn with_default() -> Operation {
    Operation::add_field(
        "Provider",
        FieldDescriptor::new("host", FieldType::Text)
            .with_default(strata_core::DefaultValue::Text("localhost".to_string())),
    )
}

#[test]
fn test_gateway_migration_after_its_dependencies() {
    let graph = fixture_graph();
    assert_eq!(graph.len(), 7);

    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();
    let summary = engine.migrate(&graph, &MigrationTarget::Latest).unwrap();
    assert_eq!(summary.applied.len(), 7);

    let position = |id: &MigrationId| summary.applied.iter().position(|a| a == id).unwrap();
    let gateway = position(&gateway_id());
    for dependency in &graph.get(&gateway_id()).unwrap().dependencies {
        assert!(position(dependency) < gateway, "{} ran after the gateway", dependency);
    }

    let (_, ddl) = summary
        .ddl
        .iter()
        .find(|(id, _)| id == &gateway_id())
        .unwrap();
    let create = &ddl[0];
    assert!(create.starts_with(
        "CREATE TABLE \"passbook_providers_app_gw_applicationgatewayprovider\" ("
    ));
    assert_eq!(create.lines().filter(|l| l.starts_with("    ")).count(), 4);
    assert!(create.contains("\"provider_ptr_id\" INTEGER NOT NULL PRIMARY KEY"));
    assert!(create.contains("REFERENCES \"passbook_core_provider\" (\"id\") ON DELETE CASCADE"));
    assert!(create.contains("REFERENCES \"oidc_provider_client\" (\"id\") ON DELETE CASCADE"));
    assert!(ddl.iter().any(|s| s.starts_with("CREATE INDEX") && s.ends_with("(\"client_id\")")));

    let schema = engine.schema().unwrap();
    let table = schema
        .table(&TableId::new(
            "passbook_providers_app_gw",
            "ApplicationGatewayProvider",
        ))
        .unwrap();
    let names: Vec<&str> = table.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["provider_ptr", "name", "host", "client"]);
    assert_eq!(
        table.options.verbose_name.as_deref(),
        Some("Application Gateway Provider")
    );
}

#[test]
fn test_second_run_is_a_noop() {
    let graph = fixture_graph();
    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();

    engine.migrate(&graph, &MigrationTarget::Latest).unwrap();
    let schema = engine.schema().unwrap();

    let again = engine.migrate(&graph, &MigrationTarget::Latest).unwrap();
    assert!(again.is_noop());
    assert_eq!(again.skipped.len(), 7);
    assert_eq!(engine.applied_log().len(), 7);
    assert_eq!(engine.schema().unwrap(), schema);
    assert!(engine
        .plan(&graph, &MigrationTarget::Latest)
        .unwrap()
        .is_up_to_date());
}

#[test]
fn test_sqlite_dialect_runs_the_fixtures() {
    let graph = fixture_graph();
    let engine = MigrationEngine::open(
        EngineConfig::temporary().with_dialect(strata_core::Dialect::Sqlite),
    )
    .unwrap();

    let plan = engine.plan(&graph, &MigrationTarget::Latest).unwrap();
    assert!(plan
        .ddl()
        .iter()
        .any(|s| s.contains("\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT")));
    engine.migrate(&graph, &MigrationTarget::Latest).unwrap();
}

#[test]
fn test_held_lock_blocks_other_engine() {
    let db = shared_db();
    let holder =
        MigrationEngine::with_db(db.clone(), EngineConfig::temporary().with_owner("deploy-1"))
            .unwrap();
    let other =
        MigrationEngine::with_db(db, EngineConfig::temporary().with_owner("deploy-2")).unwrap();
    let graph = fixture_graph();

    let guard = holder.acquire_lock().unwrap();
    let err = other.migrate(&graph, &MigrationTarget::Latest).unwrap_err();
    match &err {
        MigrationError::LockContention { holder, .. } => assert_eq!(holder, "deploy-1"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_retryable());
    assert!(other.applied_log().is_empty());

    drop(guard);
    let summary = other.migrate(&graph, &MigrationTarget::Latest).unwrap();
    assert_eq!(summary.applied.len(), 7);
    assert!(holder
        .migrate(&graph, &MigrationTarget::Latest)
        .unwrap()
        .is_noop());
}

#[test]
fn test_atomic_failure_leaves_record_pending() {
    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();
    let graph = provider_graph(missing_default());

    let err = engine.migrate(&graph, &MigrationTarget::Latest).unwrap_err();
    match &err {
        MigrationError::ApplyFailure {
            migration,
            operation_index,
            applied,
            ..
        } => {
            assert_eq!(migration, &MigrationId::new("core", "0002_provider_fields"));
            assert_eq!(*operation_index, Some(1));
            assert_eq!(applied, &vec![MigrationId::new("core", "0001_initial")]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(matches!(
        err.root_cause(),
        MigrationError::RequiresDefault { .. }
    ));
    assert!(err.is_warning());

    let status = engine.status(&graph).unwrap();
    assert_eq!(status[0].status, MigrationStatus::Applied);
    assert_eq!(status[1].status, MigrationStatus::Pending);
    let provider = TableId::new("core", "Provider");
    assert!(!engine.schema().unwrap().table(&provider).unwrap().has_field("slug"));

    // Fixing the record lets the next run apply it from the start.
    let summary = engine
        .migrate(&provider_graph(with_default()), &MigrationTarget::Latest)
        .unwrap();
    assert_eq!(summary.applied, vec![MigrationId::new("core", "0002_provider_fields")]);
}

#[test]
fn test_non_atomic_failure_then_resume() {
    let db = shared_db();
    let config = EngineConfig::temporary().with_mode(ApplyMode::NonAtomic);
    let engine = MigrationEngine::with_db(db.clone(), config.clone()).unwrap();

    let err = engine
        .migrate(&provider_graph(missing_default()), &MigrationTarget::Latest)
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::ApplyFailure {
            operation_index: Some(1),
            ..
        }
    ));

    let provider = TableId::new("core", "Provider");
    assert!(engine.schema().unwrap().table(&provider).unwrap().has_field("slug"));
    let status = engine.status(&provider_graph(missing_default())).unwrap();
    assert_eq!(status[1].status, MigrationStatus::Failed);
    assert_eq!(status[1].operation_index, Some(1));
    assert!(status[1].error.is_some());

    // Without resume the failed record is reported, not retried.
    let fixed = provider_graph(with_default());
    let err = engine.migrate(&fixed, &MigrationTarget::Latest).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        MigrationError::PreviouslyFailed {
            operation_index: 1,
            ..
        }
    ));

    let resuming = MigrationEngine::with_db(db, config.resume_failed(true)).unwrap();
    let plan = resuming.plan(&fixed, &MigrationTarget::Latest).unwrap();
    assert_eq!(plan.steps[1].action, PlanAction::Resume { from_operation: 1 });

    let summary = resuming.migrate(&fixed, &MigrationTarget::Latest).unwrap();
    assert_eq!(summary.applied, vec![MigrationId::new("core", "0002_provider_fields")]);
    let table = resuming.schema().unwrap();
    let table = table.table(&provider).unwrap();
    assert!(table.has_field("slug"));
    assert!(table.has_field("host"));
    assert!(resuming.state_store().list().unwrap().is_empty());
}

#[test]
fn test_acknowledged_missing_default_applies() {
    let engine =
        MigrationEngine::open(EngineConfig::temporary().allow_missing_defaults(true)).unwrap();
    let summary = engine
        .migrate(&provider_graph(missing_default()), &MigrationTarget::Latest)
        .unwrap();
    assert_eq!(summary.applied.len(), 2);
}

#[test]
fn test_fake_initial_records_existing_tables() {
    let db = shared_db();
    let bootstrap = SchemaGraph::load(vec![MigrationRecord::new("core", "0000_bootstrap")
        .initial()
        .with_operation(Operation::create_table(
            "Provider",
            vec![FieldDescriptor::new("name", FieldType::Text)],
        ))])
    .unwrap();
    MigrationEngine::with_db(db.clone(), EngineConfig::temporary())
        .unwrap()
        .migrate(&bootstrap, &MigrationTarget::Latest)
        .unwrap();

    let graph = SchemaGraph::load(vec![MigrationRecord::new("core", "0001_initial")
        .initial()
        .with_operation(Operation::create_table(
            "Provider",
            vec![FieldDescriptor::new("name", FieldType::Text)],
        ))])
    .unwrap();

    let plain = MigrationEngine::with_db(db.clone(), EngineConfig::temporary()).unwrap();
    let err = plain.migrate(&graph, &MigrationTarget::Latest).unwrap_err();
    assert!(matches!(err.root_cause(), MigrationError::DuplicateTable(_)));

    let faking =
        MigrationEngine::with_db(db, EngineConfig::temporary().fake_initial(true)).unwrap();
    let summary = faking.migrate(&graph, &MigrationTarget::Latest).unwrap();
    assert_eq!(summary.faked, vec![MigrationId::new("core", "0001_initial")]);
    assert!(summary.applied.is_empty());

    let entry = faking
        .applied_log()
        .get(&MigrationId::new("core", "0001_initial"))
        .unwrap()
        .unwrap();
    assert!(entry.faked);
}

#[test]
fn test_inconsistent_history_is_rejected() {
    let db = shared_db();
    let engine = MigrationEngine::with_db(db, EngineConfig::temporary()).unwrap();
    let first = SchemaGraph::load(vec![MigrationRecord::new("core", "0001_initial").initial()])
        .unwrap();
    engine.migrate(&first, &MigrationTarget::Latest).unwrap();

    // The applied record now claims a dependency that never ran.
    let rewritten = SchemaGraph::load(vec![
        MigrationRecord::new("base", "0001_initial"),
        MigrationRecord::new("core", "0001_initial")
            .initial()
            .depends_on("base", "0001_initial"),
    ])
    .unwrap();
    let err = engine
        .migrate(&rewritten, &MigrationTarget::Latest)
        .unwrap_err();
    match err {
        MigrationError::InconsistentHistory {
            migration,
            dependency,
        } => {
            assert_eq!(migration, MigrationId::new("core", "0001_initial"));
            assert_eq!(dependency, MigrationId::new("base", "0001_initial"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(engine.applied_log().len(), 1);
    assert!(engine.check(&rewritten).is_err());
}

#[test]
fn test_modified_applied_record_is_rejected() {
    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();
    engine
        .migrate(&provider_graph(with_default()), &MigrationTarget::Latest)
        .unwrap();

    let err = engine
        .migrate(&provider_graph(missing_default()), &MigrationTarget::Latest)
        .unwrap_err();
    assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));
    assert_eq!(err.kind(), strata_core::ErrorKind::Validation);
}

#[test]
fn test_graph_validation_errors() {
    let cycle = SchemaGraph::load(vec![
        MigrationRecord::new("a", "0001").depends_on("b", "0001"),
        MigrationRecord::new("b", "0001").depends_on("a", "0001"),
    ])
    .unwrap_err();
    match cycle {
        MigrationError::Cycle { chain } => {
            assert_eq!(chain.first(), chain.last());
            assert_eq!(chain.len(), 3);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let unknown = SchemaGraph::load(vec![
        MigrationRecord::new("a", "0002").depends_on("a", "0001")
    ])
    .unwrap_err();
    assert!(matches!(
        unknown,
        MigrationError::UnknownDependency { .. }
    ));
}

#[test]
fn test_check_returns_resolve_order() {
    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();
    let order = engine.check(&fixture_graph()).unwrap();
    assert_eq!(order.len(), 7);
    assert_eq!(order.last(), Some(&gateway_id()));
    assert_eq!(order[0], MigrationId::new("oidc_provider", "0001_initial"));
}

#[test]
fn test_stale_marker_at_first_operation_is_cleared() {
    let engine = MigrationEngine::open(EngineConfig::temporary()).unwrap();
    let graph = provider_graph(with_default());
    let interrupted = MigrationId::new("core", "0002_provider_fields");

    // A crash right after the record entered Applying, before anything committed.
    engine
        .state_store()
        .save(&RecordState::applying(&interrupted, 0))
        .unwrap();
    assert_eq!(
        engine.status(&graph).unwrap()[1].status,
        MigrationStatus::Applying
    );

    let summary = engine.migrate(&graph, &MigrationTarget::Latest).unwrap();
    assert_eq!(
        summary.applied,
        vec![MigrationId::new("core", "0001_initial"), interrupted]
    );
    assert!(engine.state_store().list().unwrap().is_empty());
}

#[test]
fn test_interrupted_marker_past_first_operation_needs_resume() {
    let db = shared_db();
    let config = EngineConfig::temporary().with_mode(ApplyMode::NonAtomic);
    let engine = MigrationEngine::with_db(db.clone(), config.clone()).unwrap();
    let interrupted = MigrationId::new("core", "0002_provider_fields");

    // Commit operation 0 of the record, then turn the Failed marker into the
    // Applying marker a crash before operation 1 would have left behind.
    engine
        .migrate(&provider_graph(missing_default()), &MigrationTarget::Latest)
        .unwrap_err();
    let mut marker = engine.state_store().load(&interrupted).unwrap().unwrap();
    marker.status = MarkerStatus::Applying;
    marker.error = None;
    engine.state_store().save(&marker).unwrap();

    let fixed = provider_graph(with_default());
    let err = engine.migrate(&fixed, &MigrationTarget::Latest).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        MigrationError::PreviouslyFailed {
            operation_index: 1,
            ..
        }
    ));
    assert!(!engine.applied_log().contains(&interrupted).unwrap());

    let resuming = MigrationEngine::with_db(db, config.resume_failed(true)).unwrap();
    assert_eq!(
        resuming.plan(&fixed, &MigrationTarget::Latest).unwrap().steps[1].action,
        PlanAction::Resume { from_operation: 1 }
    );
    let summary = resuming.migrate(&fixed, &MigrationTarget::Latest).unwrap();
    assert_eq!(summary.applied, vec![interrupted]);

    let schema = resuming.schema().unwrap();
    let provider = schema.table(&TableId::new("core", "Provider")).unwrap();
    assert!(provider.has_field("slug"));
    assert!(provider.has_field("host"));
    assert!(resuming.state_store().list().unwrap().is_empty());
}

#[test]
fn test_second_open_of_data_dir_is_lock_contention() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = EngineConfig::new(dir.path().join("data"));

    let first = MigrationEngine::open(config.clone()).unwrap();
    let err = match MigrationEngine::open(config.clone()) {
        Ok(_) => panic!("second open of a held data dir succeeded"),
        Err(e) => e,
    };
    assert!(matches!(err, MigrationError::LockContention { .. }));
    assert!(err.is_retryable());

    drop(first);
    let reopened = MigrationEngine::open(config).unwrap();
    assert!(reopened.applied_log().is_empty());
}
