#[pg_schema]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pgrx::prelude::*;
    use serde_json::json;

    use crate::catalog::{DefinitionNormalizer, SpiStore, ViewStore};
    use crate::definition::{IndexSpec, QualifiedName, ViewDeclaration, ViewKind};
    use crate::error::testing::{assert_error_sqlstate, assert_failed_at, outcome_of};
    use crate::error::{ViewSyncError, ViewSyncResult};
    use crate::plan::Decision;
    use crate::registry::{SyncFilter, ViewRegistry};
    use crate::sync::{
        clear_views, query_view, refresh_view, refresh_views, FailureStage, Outcome, SyncEvent, SyncListener,
        SyncOptions, SyncReport, ViewSyncer,
    };
    use crate::testing::ScriptedStore;

    fn qn(name: &str) -> QualifiedName {
        QualifiedName::new("public", name)
    }

    fn run(store: &mut ScriptedStore, registry: &ViewRegistry, options: SyncOptions) -> SyncReport {
        ViewSyncer::new(options).sync(store, registry, &SyncFilter::All).unwrap()
    }

    fn forced() -> SyncOptions {
        SyncOptions {
            force: true,
            ..SyncOptions::default()
        }
    }

    fn names_in(report: &SyncReport) -> Vec<String> {
        report.entries.iter().map(|e| e.name.to_string()).collect()
    }

    fn definition_of(registry: &ViewRegistry, name: &str) -> crate::definition::ViewDefinition {
        crate::definition::extract(registry.get(&qn(name)).unwrap()).unwrap()
    }

    /// V1 plain, V2 materialized on top of it
    fn two_level_registry() -> ViewRegistry {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("v2", "SELECT id FROM public.v1 WHERE id > 1").depends_on("v1"))
            .unwrap();
        registry
            .register(ViewDeclaration::view("v1", "SELECT id FROM public.items"))
            .unwrap();
        registry
    }

    #[derive(Default)]
    struct Recorded {
        events: Vec<(String, &'static str)>,
        finished: usize,
    }

    struct RecordingListener(Rc<RefCell<Recorded>>);

    impl SyncListener for RecordingListener {
        fn view_synced(&mut self, event: &SyncEvent) {
            self.0.borrow_mut().events.push((event.name.to_string(), event.status.as_str()));
        }

        fn all_synced(&mut self, _report: &SyncReport) {
            self.0.borrow_mut().finished += 1;
        }
    }

    // ============ Scripted catalog ============

    #[pg_test]
    fn test_empty_catalog_creates_in_dependency_order() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new();

        let report = run(&mut store, &registry, SyncOptions::default());

        assert_eq!(names_in(&report), vec!["public.v1", "public.v2"]);
        assert_eq!(*outcome_of(&report, "v1"), Outcome::Created);
        assert_eq!(*outcome_of(&report, "v2"), Outcome::Created);
        assert!(report.entries.iter().all(|e| e.decision == Some(Decision::Create) && e.changed));
        assert_eq!(
            store.statements("CREATE"),
            vec![
                "CREATE VIEW public.v1 AS SELECT id FROM public.items",
                "CREATE MATERIALIZED VIEW public.v2 AS SELECT id FROM public.v1 WHERE id > 1",
            ]
        );
        assert_eq!(report.exit_code(true), 0);
    }

    #[pg_test]
    fn test_second_run_is_unchanged_and_runs_no_ddl() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new();
        run(&mut store, &registry, SyncOptions::default());
        let executed = store.executed.len();

        let report = run(&mut store, &registry, SyncOptions::default());

        assert!(report.entries.iter().all(|e| e.status == Outcome::Unchanged && !e.changed));
        assert!(report.entries.iter().all(|e| e.decision == Some(Decision::Exists)));
        assert_eq!(store.executed.len(), executed);
    }

    #[pg_test]
    fn test_changed_definition_needs_force() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new()
            .with_view("public.v1", ViewKind::View, "SELECT id FROM public.items")
            .with_view("public.v2", ViewKind::Materialized, "SELECT id FROM public.v1 WHERE id > 100");

        let report = run(&mut store, &registry, SyncOptions::default());
        let v2 = report.get(&qn("v2")).unwrap();
        assert_eq!(v2.decision, Some(Decision::ForceRequired));
        assert_eq!(v2.status, Outcome::SkippedConflict);
        assert!(!v2.changed);
        assert_eq!(store.definition_of("public.v2"), Some("SELECT id FROM public.v1 WHERE id > 100"));
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 1);

        let report = run(&mut store, &registry, forced());
        let v2 = report.get(&qn("v2")).unwrap();
        assert_eq!(v2.decision, Some(Decision::ForceReplace));
        assert_eq!(v2.status, Outcome::Created);
        assert!(v2.forced && v2.changed);
        assert_eq!(store.definition_of("public.v2"), Some("SELECT id FROM public.v1 WHERE id > 1"));
        assert_eq!(store.statements("DROP"), vec!["DROP MATERIALIZED VIEW IF EXISTS public.v2"]);

        // Unchanged objects are never touched, forced or not
        assert_eq!(*outcome_of(&report, "v1"), Outcome::Unchanged);
    }

    #[pg_test]
    fn test_force_drop_uses_cascade_only_when_asked() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("v", "SELECT 2 AS n")).unwrap();
        let mut store = ScriptedStore::new().with_view("public.v", ViewKind::View, "SELECT 1 AS n");

        let options = SyncOptions {
            cascade: true,
            ..forced()
        };
        run(&mut store, &registry, options);
        assert_eq!(store.statements("DROP"), vec!["DROP VIEW IF EXISTS public.v CASCADE"]);
    }

    #[pg_test]
    fn test_index_reconcile_drops_undeclared_and_creates_declared() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv", "SELECT id, day FROM public.events").index(IndexSpec::new("idx_a", &["id"])))
            .unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv", ViewKind::Materialized, "SELECT id, day FROM public.events")
            .with_index("public.mv", "idx_b", &["day"], false);

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(report.get(&qn("mv")).unwrap().decision, Some(Decision::Exists));
        assert_eq!(*outcome_of(&report, "mv"), Outcome::Synced);
        assert_eq!(store.index_names("public.mv"), vec!["idx_a"]);
        assert_eq!(
            store.executed,
            vec!["DROP INDEX IF EXISTS public.idx_b", "CREATE INDEX idx_a ON public.mv (id)"]
        );

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv"), Outcome::Unchanged);
        assert_eq!(store.executed.len(), 2);
    }

    #[pg_test]
    fn test_changed_index_shape_is_recreated() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(
                ViewDeclaration::materialized("mv", "SELECT id, day FROM public.events")
                    .index(IndexSpec::new("mv_key", &["id", "day"]).unique()),
            )
            .unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv", ViewKind::Materialized, "SELECT id, day FROM public.events")
            .with_index("public.mv", "mv_key", &["id"], true);

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv"), Outcome::Synced);
        assert_eq!(
            store.executed,
            vec!["DROP INDEX IF EXISTS public.mv_key", "CREATE UNIQUE INDEX mv_key ON public.mv (id, day)"]
        );
    }

    #[pg_test]
    fn test_create_builds_concurrent_index() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv_daily", "SELECT id, day FROM public.events").concurrent_index("id, day"))
            .unwrap();
        let mut store = ScriptedStore::new();

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv_daily"), Outcome::Created);
        assert_eq!(store.index_names("public.mv_daily"), vec!["public_mv_daily_id_day_index"]);
        assert_eq!(
            store.statements("CREATE UNIQUE INDEX"),
            vec!["CREATE UNIQUE INDEX public_mv_daily_id_day_index ON public.mv_daily (id, day)"]
        );
    }

    #[pg_test]
    fn test_cycle_fails_before_any_ddl() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("a", "SELECT 1 AS x").depends_on("b")).unwrap();
        registry.register(ViewDeclaration::view("b", "SELECT 1 AS x").depends_on("a")).unwrap();
        let mut store = ScriptedStore::new();

        let result = ViewSyncer::new(SyncOptions::default()).sync(&mut store, &registry, &SyncFilter::All);
        match &result {
            Err(ViewSyncError::CyclicDependency { cycle }) => {
                assert!(cycle.contains(&"public.a".to_string()));
                assert!(cycle.contains(&"public.b".to_string()));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert_error_sqlstate(result, "55P03");
        assert!(store.executed.is_empty());
    }

    #[pg_test]
    fn test_inspection_failure_fails_dependants_only() {
        let mut registry = two_level_registry();
        registry.register(ViewDeclaration::view("v_other", "SELECT 1 AS one")).unwrap();
        let mut store = ScriptedStore::new().fail_inspect("public.v1");

        let report = run(&mut store, &registry, SyncOptions::default());

        let reason = assert_failed_at(&report, "v1", FailureStage::Inspection);
        assert!(reason.message.contains("permission denied"));
        let reason = assert_failed_at(&report, "v2", FailureStage::Dependency);
        assert!(reason.message.contains("public.v1"));
        assert_eq!(*outcome_of(&report, "v_other"), Outcome::Created);
        assert!(!store.exists("public.v2"));
        assert_eq!(report.exit_code(false), 1);
    }

    #[pg_test]
    fn test_dependency_failure_propagates_transitively() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("c", "SELECT id FROM public.b").depends_on("b")).unwrap();
        registry.register(ViewDeclaration::view("b", "SELECT id FROM public.a").depends_on("a")).unwrap();
        registry.register(ViewDeclaration::view("a", "SELECT id FROM public.items")).unwrap();
        let mut store = ScriptedStore::new().fail_on("CREATE VIEW public.a ");

        let report = run(&mut store, &registry, SyncOptions::default());

        assert_eq!(names_in(&report), vec!["public.a", "public.b", "public.c"]);
        assert_failed_at(&report, "a", FailureStage::Create);
        let reason = assert_failed_at(&report, "b", FailureStage::Dependency);
        assert!(reason.message.contains("public.a"));
        let reason = assert_failed_at(&report, "c", FailureStage::Dependency);
        assert!(reason.message.contains("public.b"));
        assert_eq!(report.get(&qn("c")).unwrap().decision, None);
        assert_eq!(store.executed.len(), 1);
    }

    #[pg_test]
    fn test_provider_failure_is_configuration_failure() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::dynamic(
                "v_dynamic",
                ViewKind::View,
                Box::new(|| -> ViewSyncResult<(String, serde_json::Value)> {
                    Ok(("SELECT $1 AS n".to_string(), json!({"n": 1})))
                }),
            ))
            .unwrap();
        registry
            .register(ViewDeclaration::view("v_fine", "SELECT 1 AS n"))
            .unwrap();
        let mut store = ScriptedStore::new();

        let report = run(&mut store, &registry, SyncOptions::default());
        let reason = assert_failed_at(&report, "v_dynamic", FailureStage::Configuration);
        assert!(reason.message.contains("flat ordered sequence"));
        assert_eq!(report.get(&qn("v_dynamic")).unwrap().decision, None);
        assert_eq!(*outcome_of(&report, "v_fine"), Outcome::Created);
    }

    #[pg_test]
    fn test_dynamic_params_are_bound_into_ddl() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::dynamic(
                "v_recent",
                ViewKind::View,
                Box::new(|| -> ViewSyncResult<(String, serde_json::Value)> {
                    let sql = "SELECT id FROM public.orders WHERE status = $1 AND total > $2";
                    Ok((sql.to_string(), json!(["paid", 20])))
                }),
            ))
            .unwrap();
        let mut store = ScriptedStore::new();

        run(&mut store, &registry, SyncOptions::default());
        assert_eq!(
            store.executed,
            vec!["CREATE VIEW public.v_recent AS SELECT id FROM public.orders WHERE status = 'paid' AND total > 20"]
        );
    }

    #[pg_test]
    fn test_failed_replace_keeps_old_object() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv", "SELECT id, broken FROM public.events"))
            .unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv", ViewKind::Materialized, "SELECT id FROM public.events")
            .with_index("public.mv", "mv_id", &["id"], false)
            .fail_on("CREATE MATERIALIZED VIEW");

        let report = run(&mut store, &registry, forced());

        let reason = assert_failed_at(&report, "mv", FailureStage::Create);
        assert!(reason.after_drop);
        assert!(reason.to_string().contains("rolled back"));
        assert_eq!(store.definition_of("public.mv"), Some("SELECT id FROM public.events"));
        assert_eq!(store.index_names("public.mv"), vec!["mv_id"]);
    }

    #[pg_test]
    fn test_force_replace_rebuilds_indexes() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(
                ViewDeclaration::materialized("mv_totals", "SELECT id, day, total FROM public.events")
                    .concurrent_index("id")
                    .index(IndexSpec::new("mv_totals_day", &["day"])),
            )
            .unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv_totals", ViewKind::Materialized, "SELECT id, day FROM public.events")
            .with_index("public.mv_totals", "public_mv_totals_id_index", &["id"], true)
            .with_index("public.mv_totals", "mv_totals_day", &["day"], false);

        let report = run(&mut store, &registry, forced());

        let entry = report.get(&qn("mv_totals")).unwrap();
        assert_eq!(entry.decision, Some(Decision::ForceReplace));
        assert!(entry.forced);
        assert_eq!(entry.status, Outcome::Created);
        assert_eq!(
            store.index_names("public.mv_totals"),
            vec!["mv_totals_day", "public_mv_totals_id_index"]
        );
        // the drop took the old indexes with it, so nothing is dropped one by one
        assert!(store.statements("DROP INDEX").is_empty());
        assert_eq!(
            store.statements("CREATE UNIQUE INDEX"),
            vec!["CREATE UNIQUE INDEX public_mv_totals_id_index ON public.mv_totals (id)"]
        );
        assert_eq!(
            store.statements("CREATE INDEX"),
            vec!["CREATE INDEX mv_totals_day ON public.mv_totals (day)"]
        );
    }

    #[pg_test]
    fn test_update_off_only_creates_missing_objects() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("v_old", "SELECT id, name FROM public.users")).unwrap();
        registry
            .register(ViewDeclaration::materialized("mv_new", "SELECT id FROM public.users").concurrent_index("id"))
            .unwrap();
        let mut store = ScriptedStore::new().with_view("public.v_old", ViewKind::View, "SELECT id FROM public.users");
        let options = SyncOptions {
            update: false,
            ..forced()
        };

        let report = run(&mut store, &registry, options);

        let old = report.get(&qn("v_old")).unwrap();
        assert_eq!(old.decision, Some(Decision::Exists));
        assert_eq!(old.status, Outcome::Unchanged);
        assert!(!old.changed);
        assert_eq!(store.definition_of("public.v_old"), Some("SELECT id FROM public.users"));
        assert_eq!(*outcome_of(&report, "mv_new"), Outcome::Created);
        assert!(store.statements("DROP").is_empty());
        assert!(store.executed.iter().all(|s| !s.contains("v_old")));
    }

    #[pg_test]
    fn test_failed_index_rolls_back_create() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv", "SELECT id FROM public.events").index(IndexSpec::new("mv_id", &["id"])))
            .unwrap();
        let mut store = ScriptedStore::new().fail_on("CREATE INDEX");

        let report = run(&mut store, &registry, SyncOptions::default());
        let reason = assert_failed_at(&report, "mv", FailureStage::Index);
        assert!(!reason.after_drop);
        assert!(!store.exists("public.mv"));
    }

    #[pg_test]
    fn test_replace_compatible_updates_plain_view_in_place() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("v", "SELECT id, name FROM public.users")).unwrap();
        let mut store = ScriptedStore::new().with_view("public.v", ViewKind::View, "SELECT id FROM public.users");

        let options = SyncOptions {
            replace_compatible: true,
            ..SyncOptions::default()
        };
        let report = run(&mut store, &registry, options);

        let v = report.get(&qn("v")).unwrap();
        assert_eq!(v.decision, Some(Decision::ForceRequired));
        assert_eq!(v.status, Outcome::Updated);
        assert!(v.changed);
        assert_eq!(
            store.executed,
            vec!["CREATE OR REPLACE VIEW public.v AS SELECT id, name FROM public.users"]
        );
        assert_eq!(store.definition_of("public.v"), Some("SELECT id, name FROM public.users"));
    }

    #[pg_test]
    fn test_incompatible_replace_falls_back_to_conflict() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("v", "SELECT name FROM public.users")).unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.v", ViewKind::View, "SELECT id FROM public.users")
            .fail_on("CREATE OR REPLACE");

        let options = SyncOptions {
            replace_compatible: true,
            ..SyncOptions::default()
        };
        let report = run(&mut store, &registry, options);
        assert_eq!(*outcome_of(&report, "v"), Outcome::SkippedConflict);

        let options = SyncOptions {
            replace_compatible: true,
            ..forced()
        };
        let report = run(&mut store, &registry, options);
        assert_eq!(*outcome_of(&report, "v"), Outcome::Created);
        assert_eq!(store.definition_of("public.v"), Some("SELECT name FROM public.users"));
    }

    #[pg_test]
    fn test_unpopulated_existing_view_is_refreshed() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::materialized("mv", "SELECT 1 AS n")).unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv", ViewKind::Materialized, "SELECT 1 AS n")
            .unpopulated("public.mv");

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv"), Outcome::Synced);
        assert_eq!(store.executed, vec!["REFRESH MATERIALIZED VIEW public.mv"]);
        assert_eq!(store.is_populated("public.mv"), Some(true));
    }

    #[pg_test]
    fn test_canonicalization_failure_compares_raw_text() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new()
            .with_view("public.v1", ViewKind::View, "SELECT   id\n  FROM public.items")
            .with_view("public.v2", ViewKind::Materialized, "SELECT id FROM public.v1 WHERE id > 1")
            .fail_canonicalization();

        let report = run(&mut store, &registry, SyncOptions::default());
        assert!(report.entries.iter().all(|e| e.status == Outcome::Unchanged));
    }

    #[pg_test]
    fn test_kind_change_is_reported_as_create_failure() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::materialized("v", "SELECT 1 AS n")).unwrap();
        let mut store = ScriptedStore::new().with_view("public.v", ViewKind::View, "SELECT 1 AS n");

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(report.get(&qn("v")).unwrap().decision, Some(Decision::Create));
        assert_failed_at(&report, "v", FailureStage::Create);
    }

    #[pg_test]
    fn test_filter_limits_the_run() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new();

        let filter = SyncFilter::Names([qn("v1")].into_iter().collect());
        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &filter)
            .unwrap();
        assert_eq!(names_in(&report), vec!["public.v1"]);
        assert!(!store.exists("public.v2"));

        let filter = SyncFilter::Names([qn("nope")].into_iter().collect());
        let result = ViewSyncer::new(SyncOptions::default()).sync(&mut store, &registry, &filter);
        assert_error_sqlstate(result, "42704");
    }

    #[pg_test]
    fn test_listeners_see_every_event_and_one_finish() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new().fail_inspect("public.v1");
        let recorded = Rc::new(RefCell::new(Recorded::default()));

        let mut syncer = ViewSyncer::new(SyncOptions::default())
            .with_listener(Box::new(RecordingListener(Rc::clone(&recorded))))
            .with_listener(Box::new(crate::sync::LogListener));
        syncer.sync(&mut store, &registry, &SyncFilter::All).unwrap();

        let recorded = recorded.borrow();
        assert_eq!(
            recorded.events,
            vec![("public.v1".to_string(), "FAILED"), ("public.v2".to_string(), "FAILED")]
        );
        assert_eq!(recorded.finished, 1);
    }

    #[pg_test]
    fn test_concurrent_refresh_without_index_is_refused() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::materialized("mv_plain", "SELECT 1 AS id")).unwrap();
        registry
            .register(ViewDeclaration::materialized("mv_keyed", "SELECT 1 AS id").concurrent_index("id"))
            .unwrap();
        let mut store = ScriptedStore::new()
            .with_view("public.mv_plain", ViewKind::Materialized, "SELECT 1 AS id")
            .with_view("public.mv_keyed", ViewKind::Materialized, "SELECT 1 AS id");

        let result = refresh_view(&mut store, &definition_of(&registry, "mv_plain"), true);
        assert_error_sqlstate(result, "0A000");

        let result = refresh_view(&mut store, &definition_of(&registry, "mv_keyed"), true);
        match result {
            Err(ViewSyncError::ConcurrentRefreshUnsupported { columns, .. }) => assert_eq!(columns, vec!["id"]),
            other => panic!("expected ConcurrentRefreshUnsupported, got {other:?}"),
        }
        assert!(store.statements("REFRESH").is_empty());

        let mut store = store.with_index("public.mv_keyed", "public_mv_keyed_id_index", &["id"], true);
        refresh_view(&mut store, &definition_of(&registry, "mv_keyed"), true).unwrap();
        assert_eq!(store.statements("REFRESH"), vec!["REFRESH MATERIALIZED VIEW CONCURRENTLY public.mv_keyed"]);
    }

    #[pg_test]
    fn test_no_data_view_is_queryable_after_refresh() {
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv_late", "SELECT 1 AS n").with_data(false))
            .unwrap();
        let mut store = ScriptedStore::new();

        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv_late"), Outcome::Created);
        assert_eq!(store.executed, vec!["CREATE MATERIALIZED VIEW public.mv_late AS SELECT 1 AS n WITH NO DATA"]);

        let def = definition_of(&registry, "mv_late");
        let result = query_view(&mut store, &def);
        assert!(matches!(result, Err(ViewSyncError::NotPopulated { .. })));
        assert_error_sqlstate(result, "55000");

        // Sync never populates a WITH NO DATA view
        let report = run(&mut store, &registry, SyncOptions::default());
        assert_eq!(*outcome_of(&report, "mv_late"), Outcome::Unchanged);
        assert_eq!(store.is_populated("public.mv_late"), Some(false));

        refresh_view(&mut store, &def, false).unwrap();
        assert_eq!(query_view(&mut store, &def).unwrap(), Vec::<serde_json::Value>::new());
    }

    #[pg_test]
    fn test_query_returns_rows() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::view("v", "SELECT 1 AS n")).unwrap();
        let rows = vec![json!({"n": 1})];
        let mut store = ScriptedStore::new()
            .with_view("public.v", ViewKind::View, "SELECT 1 AS n")
            .with_rows("public.v", rows.clone());

        assert_eq!(query_view(&mut store, &definition_of(&registry, "v")).unwrap(), rows);

        let mut empty = ScriptedStore::new();
        assert_error_sqlstate(query_view(&mut empty, &definition_of(&registry, "v")), "58000");
    }

    #[pg_test]
    fn test_refresh_views_follows_dependency_edges() {
        let mut registry = ViewRegistry::new("public");
        registry.register(ViewDeclaration::materialized("base", "SELECT 1 AS n")).unwrap();
        registry
            .register(ViewDeclaration::materialized("mid", "SELECT n FROM public.base").depends_on("base"))
            .unwrap();
        registry
            .register(ViewDeclaration::view("top", "SELECT n FROM public.mid").depends_on("mid"))
            .unwrap();
        registry.register(ViewDeclaration::materialized("other", "SELECT 2 AS n")).unwrap();
        let mut store = ScriptedStore::new();
        run(&mut store, &registry, SyncOptions::default());
        store.executed.clear();

        let count = refresh_views(&mut store, &registry, Some(&[qn("base")]), false).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            store.executed,
            vec!["REFRESH MATERIALIZED VIEW public.base", "REFRESH MATERIALIZED VIEW public.mid"]
        );

        store.executed.clear();
        assert_eq!(refresh_views(&mut store, &registry, None, false).unwrap(), 3);
        assert_error_sqlstate(refresh_views(&mut store, &registry, Some(&[qn("ghost")]), false), "42704");
    }

    #[pg_test]
    fn test_clear_drops_in_teardown_order() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new();
        run(&mut store, &registry, SyncOptions::default());
        store.executed.clear();

        let report = clear_views(&mut store, &registry, &SyncFilter::All, false).unwrap();
        assert_eq!(names_in(&report), vec!["public.v2", "public.v1"]);
        assert!(report.entries.iter().all(|e| e.status == Outcome::Dropped));
        assert_eq!(
            store.executed,
            vec!["DROP MATERIALIZED VIEW IF EXISTS public.v2", "DROP VIEW IF EXISTS public.v1"]
        );
        assert!(!store.exists("public.v1"));
    }

    #[pg_test]
    fn test_clear_reports_failed_drop() {
        let registry = two_level_registry();
        let mut store = ScriptedStore::new().fail_on("DROP VIEW");
        run(&mut store, &registry, SyncOptions::default());

        let report = clear_views(&mut store, &registry, &SyncFilter::All, false).unwrap();
        assert_eq!(*outcome_of(&report, "v2"), Outcome::Dropped);
        assert_failed_at(&report, "v1", FailureStage::Drop);
        assert!(store.exists("public.v1"));
    }

    // ============ Live catalog ============

    fn orders_table() {
        Spi::run("CREATE TABLE public.orders (id int PRIMARY KEY, status text NOT NULL, total numeric NOT NULL)")
            .unwrap();
        Spi::run("INSERT INTO public.orders VALUES (1, 'paid', 10), (2, 'paid', 30), (3, 'open', 50)").unwrap();
    }

    fn count(sql: &str) -> i64 {
        Spi::get_one::<i64>(sql).unwrap().unwrap()
    }

    #[pg_test]
    fn test_catalog_round_trip_is_unchanged() {
        orders_table();
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::view(
                "v_paid",
                "select id,   total\nfrom public.orders where status = 'paid';",
            ))
            .unwrap();
        registry
            .register(
                ViewDeclaration::materialized("mv_paid_big", "SELECT id, total FROM public.v_paid WHERE total > 20")
                    .depends_on("v_paid")
                    .concurrent_index("id"),
            )
            .unwrap();
        let mut store = SpiStore::new();

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(*outcome_of(&report, "v_paid"), Outcome::Created);
        assert_eq!(*outcome_of(&report, "mv_paid_big"), Outcome::Created);
        assert_eq!(count("SELECT count(*) FROM public.mv_paid_big"), 1);

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        for entry in &report.entries {
            assert_eq!(entry.decision, Some(Decision::Exists), "{} was not recognised", entry.name);
            assert_eq!(entry.status, Outcome::Unchanged);
        }
    }

    #[pg_test]
    fn test_catalog_force_replace() {
        orders_table();
        Spi::run("CREATE VIEW public.v_open AS SELECT id FROM public.orders WHERE status = 'open'").unwrap();

        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::view(
                "v_open",
                "SELECT id, total FROM public.orders WHERE status = 'open'",
            ))
            .unwrap();
        let mut store = SpiStore::new();

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(*outcome_of(&report, "v_open"), Outcome::SkippedConflict);
        assert_eq!(
            count("SELECT count(*) FROM information_schema.columns WHERE table_name = 'v_open'"),
            1
        );

        let report = ViewSyncer::new(forced()).sync(&mut store, &registry, &SyncFilter::All).unwrap();
        assert_eq!(*outcome_of(&report, "v_open"), Outcome::Created);
        assert_eq!(
            count("SELECT count(*) FROM information_schema.columns WHERE table_name = 'v_open'"),
            2
        );
    }

    #[pg_test]
    fn test_catalog_failed_create_keeps_transaction_usable() {
        orders_table();
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::view("v_broken", "SELECT no_such_column FROM public.orders"))
            .unwrap();
        registry.register(ViewDeclaration::view("v_ok", "SELECT id FROM public.orders")).unwrap();
        let mut store = SpiStore::new();

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        let reason = assert_failed_at(&report, "v_broken", FailureStage::Create);
        assert!(reason.message.contains("no_such_column"));
        assert_eq!(*outcome_of(&report, "v_ok"), Outcome::Created);
        assert_eq!(count("SELECT count(*) FROM public.v_ok"), 3);
    }

    #[pg_test]
    fn test_catalog_ddl_error_keeps_server_code() {
        orders_table();
        let mut store = SpiStore::new();
        let result = store.execute(
            &qn("v_broken"),
            "CREATE VIEW public.v_broken AS SELECT no_such_column FROM public.orders",
        );
        assert_error_sqlstate(result, "42703");
        assert_eq!(count("SELECT count(*) FROM public.orders"), 3);
    }

    /// Treats every definition as the same one
    struct IgnoreDefinitions;

    impl DefinitionNormalizer for IgnoreDefinitions {
        fn normalize(&self, _sql: &str) -> String {
            "*".to_string()
        }
    }

    #[pg_test]
    fn test_catalog_uses_custom_normalizer() {
        orders_table();
        Spi::run("CREATE VIEW public.v_open AS SELECT id FROM public.orders WHERE status = 'open'").unwrap();
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::view("v_open", "SELECT id, total FROM public.orders"))
            .unwrap();

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut SpiStore::new(), &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(report.get(&qn("v_open")).unwrap().decision, Some(Decision::ForceRequired));

        let mut store = SpiStore::with_normalizer(Box::new(IgnoreDefinitions));
        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(report.get(&qn("v_open")).unwrap().decision, Some(Decision::Exists));
        assert_eq!(*outcome_of(&report, "v_open"), Outcome::Unchanged);
    }

    #[pg_test]
    fn test_catalog_index_reconcile() {
        orders_table();
        Spi::run("CREATE MATERIALIZED VIEW public.mv_orders AS SELECT id, status FROM public.orders").unwrap();
        Spi::run("CREATE INDEX idx_b ON public.mv_orders (status)").unwrap();

        let mut registry = ViewRegistry::new("public");
        registry
            .register(
                ViewDeclaration::materialized("mv_orders", "SELECT id, status FROM public.orders")
                    .index(IndexSpec::new("idx_a", &["id"])),
            )
            .unwrap();
        let mut store = SpiStore::new();

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(*outcome_of(&report, "mv_orders"), Outcome::Synced);
        assert_eq!(count("SELECT count(*) FROM pg_indexes WHERE tablename = 'mv_orders' AND indexname = 'idx_a'"), 1);
        assert_eq!(count("SELECT count(*) FROM pg_indexes WHERE tablename = 'mv_orders' AND indexname = 'idx_b'"), 0);

        let report = ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();
        assert_eq!(*outcome_of(&report, "mv_orders"), Outcome::Unchanged);
    }

    #[pg_test]
    fn test_catalog_concurrent_refresh() {
        orders_table();
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv_unkeyed", "SELECT id, total FROM public.orders"))
            .unwrap();
        registry
            .register(ViewDeclaration::materialized("mv_keyed", "SELECT id, total FROM public.orders").concurrent_index("id"))
            .unwrap();
        let mut store = SpiStore::new();
        ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();

        Spi::run("INSERT INTO public.orders VALUES (4, 'open', 70)").unwrap();

        let result = refresh_view(&mut store, &definition_of(&registry, "mv_unkeyed"), true);
        assert_error_sqlstate(result, "0A000");
        assert_eq!(count("SELECT count(*) FROM public.mv_unkeyed"), 3);

        refresh_view(&mut store, &definition_of(&registry, "mv_keyed"), true).unwrap();
        assert_eq!(count("SELECT count(*) FROM public.mv_keyed"), 4);
    }

    #[pg_test]
    fn test_catalog_not_populated_guard() {
        orders_table();
        let mut registry = ViewRegistry::new("public");
        registry
            .register(ViewDeclaration::materialized("mv_empty", "SELECT id FROM public.orders").with_data(false))
            .unwrap();
        let mut store = SpiStore::new();
        ViewSyncer::new(SyncOptions::default())
            .sync(&mut store, &registry, &SyncFilter::All)
            .unwrap();

        let def = definition_of(&registry, "mv_empty");
        assert_error_sqlstate(query_view(&mut store, &def), "55000");

        refresh_view(&mut store, &def, false).unwrap();
        let rows = query_view(&mut store, &def).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().any(|row| row["id"] == json!(1)));
    }
}
