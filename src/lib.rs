use pgrx::prelude::*;

mod api;
mod audit;
mod utils;
pub mod catalog;
pub mod config;
pub mod ddl;
pub mod definition;
pub mod dependency;
pub mod error;
pub mod metadata;
pub mod plan;
pub mod registry;
pub mod sync;
pub mod validation;

#[cfg(any(test, feature = "pg_test"))]
pub mod testing;

pub use error::{ViewSyncError, ViewSyncResult};

pg_module_magic!();

/// Get the version of the pg_viewsync extension
#[pg_extern]
fn pg_viewsync_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Initialize the extension
/// Registers the pg_viewsync.* GUCs
#[pg_guard]
extern "C" fn _PG_init() {
    config::register_gucs();
    pgrx::debug1!("pg_viewsync: settings registered");
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use crate::ViewSyncError;

    #[pg_test]
    fn test_version_function() {
        let version = crate::pg_viewsync_version();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[pg_test]
    fn test_version_callable_from_sql() {
        let version = Spi::get_one::<String>("SELECT pg_viewsync_version()").unwrap();
        assert_eq!(version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[pg_test]
    fn test_gucs_registered() {
        let schema = Spi::get_one::<String>("SELECT current_setting('pg_viewsync.default_schema')")
            .unwrap()
            .unwrap();
        assert_eq!(schema, "public");

        Spi::run("SET pg_viewsync.cascade_drops = on").unwrap();
        assert!(crate::config::cascade_drops());
    }

    #[pg_test]
    fn test_default_schema_guc_qualifies_names() {
        Spi::run("CREATE SCHEMA reporting").unwrap();
        Spi::run("SET pg_viewsync.default_schema = 'reporting'").unwrap();
        let name = Spi::get_one::<String>("SELECT pg_viewsync_register('v_daily', 'SELECT 1 AS one')")
            .unwrap()
            .unwrap();
        assert_eq!(name, "reporting.v_daily");
    }

    #[pg_test]
    #[should_panic(expected = "is not registered")]
    fn test_error_propagates_to_postgres() {
        Err::<(), _>(ViewSyncError::NotRegistered {
            name: "public.missing".to_string(),
        })
        .unwrap();
    }
}
