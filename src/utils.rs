//! SPI helpers shared by the store, the registry loader and the audit log.

use std::panic::AssertUnwindSafe;

use pgrx::datum::DatumWithOid;
use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;

use crate::error::ViewSyncResult;

/// A database error raised while running inside a subtransaction
#[derive(Debug, Clone)]
pub struct DbError {
    pub code: PgSqlErrorCode,
    pub message: String,
}

impl From<CaughtError> for DbError {
    fn from(caught: CaughtError) -> Self {
        match caught {
            CaughtError::PostgresError(report)
            | CaughtError::ErrorReport(report)
            | CaughtError::RustPanic { ereport: report, .. } => DbError {
                code: report.sql_error_code(),
                message: report.message().to_string(),
            },
        }
    }
}

/// Run `work` inside an internal subtransaction.
///
/// The subtransaction is released when `work` returns `Ok` and `keep` is set;
/// otherwise it is rolled back. A PostgreSQL error raised by `work` rolls it
/// back too and comes out as the outer `Err`, leaving the surrounding
/// transaction usable.
pub fn subtransaction<T, F>(keep: bool, work: F) -> Result<ViewSyncResult<T>, DbError>
where
    F: FnOnce() -> ViewSyncResult<T>,
{
    let outer_context = unsafe { pg_sys::CurrentMemoryContext };
    let outer_owner = unsafe { pg_sys::CurrentResourceOwner };

    unsafe { pg_sys::BeginInternalSubTransaction(std::ptr::null()) };

    let finish = move |commit: bool| unsafe {
        if commit {
            pg_sys::ReleaseCurrentSubTransaction();
        } else {
            pg_sys::RollbackAndReleaseCurrentSubTransaction();
        }
        pg_sys::CurrentMemoryContext = outer_context;
        pg_sys::CurrentResourceOwner = outer_owner;
    };

    PgTryBuilder::new(AssertUnwindSafe(move || {
        let result = work();
        finish(keep && result.is_ok());
        Ok(result)
    }))
    .catch_others(move |caught| {
        finish(false);
        Err(DbError::from(caught))
    })
    .execute()
}

/// TEXT argument for `Spi::*_with_args`
pub fn text_arg(value: &str) -> DatumWithOid<'static> {
    unsafe { DatumWithOid::new(value.to_string(), PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value()) }
}

/// TEXT argument that may be NULL
pub fn nullable_text_arg(value: Option<&str>) -> DatumWithOid<'static> {
    unsafe {
        DatumWithOid::new(
            value.map(str::to_string),
            PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value(),
        )
    }
}

pub fn bool_arg(value: bool) -> DatumWithOid<'static> {
    unsafe { DatumWithOid::new(value, PgOid::BuiltIn(PgBuiltInOids::BOOLOID).value()) }
}

pub fn jsonb_arg(value: serde_json::Value) -> DatumWithOid<'static> {
    unsafe { DatumWithOid::new(pgrx::JsonB(value), PgOid::BuiltIn(PgBuiltInOids::JSONBOID).value()) }
}

pub fn text_array_arg(values: Vec<String>) -> DatumWithOid<'static> {
    unsafe { DatumWithOid::new(values, PgOid::BuiltIn(PgBuiltInOids::TEXTARRAYOID).value()) }
}
