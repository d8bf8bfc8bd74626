//! SQL-callable surface of pg_viewsync.
//!
//! Each function loads the registry, runs one operation against the live
//! catalog through `SpiStore`, and turns an `Err` into a backend ERROR that
//! carries the error's SQLSTATE.

use std::collections::BTreeSet;

use pgrx::pg_sys::panic::ErrorReport;
use pgrx::prelude::*;
use pgrx::JsonB;

use crate::catalog::{SpiStore, ViewStore};
use crate::config;
use crate::definition::{extract, IndexSpec, QualifiedName, ViewKind};
use crate::dependency::DependencyGraph;
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::metadata::{self, RegistryRow};
use crate::registry::{SyncFilter, ViewRegistry};
use crate::sync::{self, LogListener, SyncOptions, SyncReport, ViewSyncer};
use crate::{audit::AuditListener, ddl};

/// Raise `error` as an ERROR with its own SQLSTATE
fn raise(error: ViewSyncError) -> ! {
    ErrorReport::new(error.error_code(), error.to_string(), "pg_viewsync").report(PgLogLevel::ERROR);
    unreachable!("ERROR reports do not return")
}

fn ok_or_raise<T>(result: ViewSyncResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => raise(e),
    }
}

fn load_registry() -> ViewSyncResult<ViewRegistry> {
    metadata::load_registry(&config::default_schema())
}

fn filter_for(registry: &ViewRegistry, names: Option<Vec<String>>) -> ViewSyncResult<SyncFilter> {
    match names {
        None => Ok(SyncFilter::All),
        Some(names) => {
            let set = names
                .iter()
                .map(|n| registry.resolve(n))
                .collect::<ViewSyncResult<BTreeSet<_>>>()?;
            Ok(SyncFilter::Names(set))
        }
    }
}

/// Register a view declaration
///
/// The declaration is validated before it is stored: names and indexes are
/// checked, static SQL is extracted, and the new dependency edges must not
/// close a cycle. Returns the qualified name.
#[pg_extern]
#[allow(clippy::too_many_arguments)]
fn pg_viewsync_register(
    name: &str,
    definition: default!(Option<&str>, "NULL"),
    materialized: default!(bool, false),
    dependencies: default!(Vec<String>, "ARRAY[]::text[]"),
    concurrent_index: default!(Option<&str>, "NULL"),
    with_data: default!(bool, true),
    indexes: default!(JsonB, "'[]'::jsonb"),
    params: default!(Option<JsonB>, "NULL"),
    provider: default!(Option<&str>, "NULL"),
) -> String {
    ok_or_raise(register_impl(
        name,
        definition,
        materialized,
        dependencies,
        concurrent_index,
        with_data,
        indexes.0,
        params.map(|p| p.0),
        provider,
    ))
}

#[allow(clippy::too_many_arguments)]
fn register_impl(
    name: &str,
    definition: Option<&str>,
    materialized: bool,
    dependencies: Vec<String>,
    concurrent_index: Option<&str>,
    with_data: bool,
    indexes: serde_json::Value,
    params: Option<serde_json::Value>,
    provider: Option<&str>,
) -> ViewSyncResult<String> {
    let default_schema = config::default_schema();
    let qualified = QualifiedName::parse(name, &default_schema)?;

    if definition.is_some() == provider.is_some() {
        return Err(ViewSyncError::configuration(
            qualified.to_string(),
            "exactly one of definition or provider is required",
        ));
    }
    if provider.is_some() && params.is_some() {
        return Err(ViewSyncError::configuration(
            qualified.to_string(),
            "params come from the provider; do not pass them with it",
        ));
    }

    let indexes: Vec<IndexSpec> = serde_json::from_value(indexes).map_err(|e| ViewSyncError::Configuration {
        name: qualified.to_string(),
        reason: format!("indexes must be a list of {{name, columns, unique}} objects: {e}"),
    })?;
    let dependencies = dependencies
        .iter()
        .map(|d| QualifiedName::parse(d, &default_schema).map(|q| q.to_string()))
        .collect::<ViewSyncResult<Vec<_>>>()?;

    let row = RegistryRow {
        name: qualified.to_string(),
        materialized,
        definition: definition.map(str::to_string),
        params,
        provider: provider.map(str::to_string),
        dependencies,
        concurrent_index: concurrent_index.map(str::to_string),
        with_data,
        indexes,
    };

    let mut registry = load_registry()?;
    registry.register(row.clone().into_declaration()?)?;
    if row.provider.is_none() {
        let view = crate::require!(registry.get(&qualified), crate::internal_error!("{} vanished", qualified));
        extract(view)?;
    }
    DependencyGraph::from_views(registry.iter()).build_order()?;

    metadata::insert_row(&row)?;
    info!("pg_viewsync: registered {} {}", row_kind(&row), qualified);
    Ok(qualified.to_string())
}

fn row_kind(row: &RegistryRow) -> ViewKind {
    if row.materialized {
        ViewKind::Materialized
    } else {
        ViewKind::View
    }
}

/// Remove a declaration, optionally dropping its object too
#[pg_extern]
fn pg_viewsync_unregister(name: &str, drop_object: default!(bool, false)) -> bool {
    ok_or_raise(unregister_impl(name, drop_object))
}

fn unregister_impl(name: &str, drop_object: bool) -> ViewSyncResult<bool> {
    let registry = load_registry()?;
    let qualified = QualifiedName::parse(name, registry.default_schema())?;
    let Some(view) = registry.get(&qualified) else {
        return Ok(false);
    };

    if drop_object {
        let statement = ddl::drop_view(&qualified, view.declaration.kind, config::cascade_drops());
        let mut store = SpiStore::new();
        store.atomically(|s| s.execute(&qualified, &statement))?;
        info!("pg_viewsync: dropped {} {}", view.declaration.kind, qualified);
    }
    metadata::delete_row(&qualified)
}

/// Sync registered views against the catalog, in dependency order
#[pg_extern]
#[allow(clippy::type_complexity)]
fn pg_viewsync_sync(
    force: default!(bool, false),
    names: default!(Option<Vec<String>>, "NULL"),
    update: default!(bool, true),
) -> TableIterator<
    'static,
    (
        name!(position, i64),
        name!(name, String),
        name!(decision, Option<String>),
        name!(outcome, String),
        name!(forced, bool),
        name!(changed, bool),
        name!(detail, Option<String>),
    ),
> {
    let report = ok_or_raise(sync_impl(force, names, update));
    let rows: Vec<_> = report
        .entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            (
                i as i64 + 1,
                e.name.to_string(),
                e.decision.map(|d| d.as_str().to_string()),
                e.status.as_str().to_string(),
                e.forced,
                e.changed,
                e.status.failure().map(ToString::to_string),
            )
        })
        .collect();
    TableIterator::new(rows)
}

fn sync_impl(force: bool, names: Option<Vec<String>>, update: bool) -> ViewSyncResult<SyncReport> {
    let registry = load_registry()?;
    let filter = filter_for(&registry, names)?;

    let mut syncer = ViewSyncer::new(SyncOptions::from_gucs(force, update)).with_listener(Box::new(LogListener));
    if config::audit_enabled() {
        syncer = syncer.with_listener(Box::new(AuditListener::new()));
    }

    let mut store = SpiStore::new();
    let report = syncer.sync(&mut store, &registry, &filter)?;
    if report.exit_code(syncer.options().fail_on_conflict) != 0 {
        warning!("pg_viewsync: sync did not complete cleanly: {}", report.summary());
    }
    Ok(report)
}

/// Refresh materialized views; returns how many were refreshed
#[pg_extern]
fn pg_viewsync_refresh(
    names: default!(Option<Vec<String>>, "NULL"),
    concurrently: default!(bool, false),
) -> i64 {
    ok_or_raise(refresh_impl(names, concurrently)) as i64
}

fn refresh_impl(names: Option<Vec<String>>, concurrently: bool) -> ViewSyncResult<usize> {
    let registry = load_registry()?;
    let names = names
        .map(|names| names.iter().map(|n| registry.resolve(n)).collect::<ViewSyncResult<Vec<_>>>())
        .transpose()?;

    let mut store = SpiStore::new();
    sync::refresh_views(&mut store, &registry, names.as_deref(), concurrently)
}

/// Drop registered views, dependants first
#[pg_extern]
#[allow(clippy::type_complexity)]
fn pg_viewsync_clear(
    names: default!(Option<Vec<String>>, "NULL"),
) -> TableIterator<'static, (name!(name, String), name!(outcome, String), name!(detail, Option<String>))> {
    let report = ok_or_raise(clear_impl(names));
    let rows: Vec<_> = report
        .entries
        .into_iter()
        .map(|e| {
            (
                e.name.to_string(),
                e.status.as_str().to_string(),
                e.status.failure().map(ToString::to_string),
            )
        })
        .collect();
    TableIterator::new(rows)
}

fn clear_impl(names: Option<Vec<String>>) -> ViewSyncResult<SyncReport> {
    let registry = load_registry()?;
    let filter = filter_for(&registry, names)?;
    let mut store = SpiStore::new();
    sync::clear_views(&mut store, &registry, &filter, config::cascade_drops())
}

/// Rows of a registered view as jsonb
#[pg_extern]
fn pg_viewsync_query(name: &str) -> SetOfIterator<'static, JsonB> {
    let rows = ok_or_raise(query_impl(name));
    SetOfIterator::new(rows.into_iter().map(JsonB))
}

fn query_impl(name: &str) -> ViewSyncResult<Vec<serde_json::Value>> {
    let registry = load_registry()?;
    let qualified = registry.resolve(name)?;
    let view = crate::require!(registry.get(&qualified), crate::internal_error!("{} vanished", qualified));
    let def = extract(view)?;
    sync::query_view(&mut SpiStore::new(), &def)
}

/// NULL for plain views and for objects that do not exist yet
#[pg_extern]
fn pg_viewsync_is_populated(name: &str) -> Option<bool> {
    ok_or_raise(is_populated_impl(name))
}

fn is_populated_impl(name: &str) -> ViewSyncResult<Option<bool>> {
    let registry = load_registry()?;
    let qualified = registry.resolve(name)?;
    let view = crate::require!(registry.get(&qualified), crate::internal_error!("{} vanished", qualified));
    let state = SpiStore::new().inspect(&qualified, view.declaration.kind)?;
    Ok(state.populated.filter(|_| state.exists))
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    fn register_orders() {
        Spi::run("CREATE TABLE public.orders (id int PRIMARY KEY, total numeric)").unwrap();
        Spi::run("INSERT INTO public.orders VALUES (1, 10), (2, 25)").unwrap();
        Spi::run("SELECT pg_viewsync_register('v_orders', 'SELECT id, total FROM public.orders')").unwrap();
        Spi::run(
            "SELECT pg_viewsync_register('mv_big_orders',
                 'SELECT id, total FROM public.v_orders WHERE total > 20',
                 materialized => true,
                 dependencies => ARRAY['v_orders'],
                 concurrent_index => 'id',
                 with_data => false)",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_register_returns_qualified_name() {
        let name = Spi::get_one::<String>("SELECT pg_viewsync_register('v_one', 'SELECT 1 AS one')")
            .unwrap()
            .unwrap();
        assert_eq!(name, "public.v_one");
    }

    #[pg_test]
    #[should_panic(expected = "already registered")]
    fn test_register_twice_is_rejected() {
        Spi::run("SELECT pg_viewsync_register('v_twice', 'SELECT 1 AS one')").unwrap();
        Spi::run("SELECT pg_viewsync_register('public.v_twice', 'SELECT 2 AS two')").unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "only valid on materialized views")]
    fn test_register_rejects_index_on_plain_view() {
        Spi::run(
            "SELECT pg_viewsync_register('v_bad', 'SELECT 1 AS id',
                 indexes => '[{\"name\": \"v_bad_id\", \"columns\": [\"id\"]}]')",
        )
        .unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "Circular dependency")]
    fn test_register_rejects_cycle() {
        Spi::run("SELECT pg_viewsync_register('v_a', 'SELECT 1 AS x', dependencies => ARRAY['v_b'])").unwrap();
        Spi::run("SELECT pg_viewsync_register('v_b', 'SELECT 1 AS x', dependencies => ARRAY['v_a'])").unwrap();
    }

    #[pg_test]
    fn test_sync_reports_rows_in_dependency_order() {
        register_orders();

        let rows: Vec<(i64, String, String)> = Spi::connect(|client| {
            client
                .select("SELECT position, name, outcome FROM pg_viewsync_sync() ORDER BY position", None, &[])
                .unwrap()
                .map(|row| {
                    (
                        row["position"].value::<i64>().unwrap().unwrap(),
                        row["name"].value::<String>().unwrap().unwrap(),
                        row["outcome"].value::<String>().unwrap().unwrap(),
                    )
                })
                .collect()
        });
        assert_eq!(
            rows,
            vec![
                (1, "public.v_orders".to_string(), "CREATED".to_string()),
                (2, "public.mv_big_orders".to_string(), "CREATED".to_string()),
            ]
        );

        let logged = Spi::get_one::<i64>("SELECT count(*) FROM public.pg_viewsync_sync_log")
            .unwrap()
            .unwrap();
        assert_eq!(logged, 2);

        let second = Spi::get_one::<i64>("SELECT count(*) FROM pg_viewsync_sync() WHERE outcome = 'UNCHANGED'")
            .unwrap()
            .unwrap();
        assert_eq!(second, 2);
    }

    #[pg_test]
    fn test_sync_without_update_leaves_existing_objects() {
        Spi::run("CREATE VIEW public.v_kept AS SELECT 2 AS two").unwrap();
        Spi::run("SELECT pg_viewsync_register('v_kept', 'SELECT 1 AS one')").unwrap();
        Spi::run("SELECT pg_viewsync_register('v_added', 'SELECT 3 AS three')").unwrap();

        let kept = Spi::get_one::<String>(
            "SELECT decision || '/' || outcome FROM pg_viewsync_sync(force => true, update => false)
             WHERE name = 'public.v_kept'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(kept, "EXISTS/UNCHANGED");
        let two = Spi::get_one::<i32>("SELECT two FROM public.v_kept").unwrap().unwrap();
        assert_eq!(two, 2);
        let three = Spi::get_one::<i32>("SELECT three FROM public.v_added").unwrap().unwrap();
        assert_eq!(three, 3);

        let compared = Spi::get_one::<String>("SELECT decision FROM pg_viewsync_sync() WHERE name = 'public.v_kept'")
            .unwrap()
            .unwrap();
        assert_eq!(compared, "FORCE_REQUIRED");
    }

    #[pg_test]
    #[should_panic(expected = "has not been populated")]
    fn test_query_unpopulated_raises() {
        register_orders();
        Spi::run("SELECT * FROM pg_viewsync_sync()").unwrap();
        Spi::run("SELECT * FROM pg_viewsync_query('mv_big_orders')").unwrap();
    }

    #[pg_test]
    fn test_refresh_then_query() {
        register_orders();
        Spi::run("SELECT * FROM pg_viewsync_sync()").unwrap();
        assert_eq!(
            Spi::get_one::<bool>("SELECT pg_viewsync_is_populated('mv_big_orders')").unwrap(),
            Some(false)
        );
        assert_eq!(Spi::get_one::<bool>("SELECT pg_viewsync_is_populated('v_orders')").unwrap(), None);

        let refreshed = Spi::get_one::<i64>("SELECT pg_viewsync_refresh(ARRAY['mv_big_orders'])")
            .unwrap()
            .unwrap();
        assert_eq!(refreshed, 1);

        let id = Spi::get_one::<i32>("SELECT (r->>'id')::int FROM pg_viewsync_query('mv_big_orders') AS r")
            .unwrap()
            .unwrap();
        assert_eq!(id, 2);
    }

    #[pg_test]
    fn test_clear_drops_dependants_first() {
        register_orders();
        Spi::run("SELECT * FROM pg_viewsync_sync()").unwrap();

        let names: Vec<String> = Spi::connect(|client| {
            client
                .select("SELECT name FROM pg_viewsync_clear()", None, &[])
                .unwrap()
                .map(|row| row["name"].value::<String>().unwrap().unwrap())
                .collect()
        });
        assert_eq!(names, vec!["public.mv_big_orders", "public.v_orders"]);

        let left = Spi::get_one::<i64>("SELECT count(*) FROM pg_class WHERE relname IN ('v_orders', 'mv_big_orders')")
            .unwrap()
            .unwrap();
        assert_eq!(left, 0);
    }

    #[pg_test]
    fn test_unregister_with_drop() {
        Spi::run("SELECT pg_viewsync_register('v_temp', 'SELECT 1 AS one')").unwrap();
        Spi::run("SELECT * FROM pg_viewsync_sync()").unwrap();

        assert_eq!(Spi::get_one::<bool>("SELECT pg_viewsync_unregister('v_temp', true)").unwrap(), Some(true));
        assert_eq!(Spi::get_one::<bool>("SELECT pg_viewsync_unregister('v_temp')").unwrap(), Some(false));
        let exists = Spi::get_one::<bool>("SELECT to_regclass('public.v_temp') IS NOT NULL").unwrap().unwrap();
        assert!(!exists);
    }
}
