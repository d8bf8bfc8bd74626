//! Settings for pg_viewsync
//!
//! Compile-time limits live here as constants. Run-time behaviour is
//! controlled through GUCs registered from `_PG_init`:
//!
//! | GUC | Default | Effect |
//! |-----|---------|--------|
//! | `pg_viewsync.default_schema` | `public` | schema for unqualified view names |
//! | `pg_viewsync.cascade_drops` | `off` | append `CASCADE` to view drops |
//! | `pg_viewsync.replace_compatible` | `off` | try `CREATE OR REPLACE VIEW` before requiring force |
//! | `pg_viewsync.fail_on_conflict` | `off` | a skipped conflict makes the report fail |
//! | `pg_viewsync.audit` | `on` | record sync events in `pg_viewsync_sync_log` |

use std::ffi::CStr;

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// PostgreSQL identifier length limit (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Temporary view used to let the server canonicalize a declared definition
pub const PROBE_VIEW_NAME: &str = "pg_viewsync_probe";

/// Schema used when neither the name nor the GUC provides one
pub const FALLBACK_SCHEMA: &str = "public";

static DEFAULT_SCHEMA: GucSetting<Option<&'static CStr>> =
    GucSetting::<Option<&'static CStr>>::new(Some(c"public"));
static CASCADE_DROPS: GucSetting<bool> = GucSetting::<bool>::new(false);
static REPLACE_COMPATIBLE: GucSetting<bool> = GucSetting::<bool>::new(false);
static FAIL_ON_CONFLICT: GucSetting<bool> = GucSetting::<bool>::new(false);
static AUDIT_ENABLED: GucSetting<bool> = GucSetting::<bool>::new(true);

/// Register all GUCs. Called once from `_PG_init`.
pub fn register_gucs() {
    GucRegistry::define_string_guc(
        "pg_viewsync.default_schema",
        "Schema for unqualified view names",
        "Views registered without a schema prefix are created in this schema.",
        &DEFAULT_SCHEMA,
        GucContext::Userset,
        GucFlags::default(),
    );
    GucRegistry::define_bool_guc(
        "pg_viewsync.cascade_drops",
        "Drop views with CASCADE",
        "When on, forced replacements and teardown drop dependent objects too.",
        &CASCADE_DROPS,
        GucContext::Userset,
        GucFlags::default(),
    );
    GucRegistry::define_bool_guc(
        "pg_viewsync.replace_compatible",
        "Try CREATE OR REPLACE VIEW before requiring force",
        "Plain views whose new definition is column-compatible are replaced in place.",
        &REPLACE_COMPATIBLE,
        GucContext::Userset,
        GucFlags::default(),
    );
    GucRegistry::define_bool_guc(
        "pg_viewsync.fail_on_conflict",
        "Treat skipped conflicts as failures",
        "When on, a view that needs --force makes pg_viewsync_sync report failure.",
        &FAIL_ON_CONFLICT,
        GucContext::Userset,
        GucFlags::default(),
    );
    GucRegistry::define_bool_guc(
        "pg_viewsync.audit",
        "Record sync events",
        "Write one row per synced view into pg_viewsync_sync_log.",
        &AUDIT_ENABLED,
        GucContext::Userset,
        GucFlags::default(),
    );
}

pub fn default_schema() -> String {
    DEFAULT_SCHEMA
        .get()
        .and_then(|s| s.to_str().ok().map(str::to_owned))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SCHEMA.to_string())
}

pub fn cascade_drops() -> bool {
    CASCADE_DROPS.get()
}

pub fn replace_compatible() -> bool {
    REPLACE_COMPATIBLE.get()
}

pub fn fail_on_conflict() -> bool {
    FAIL_ON_CONFLICT.get()
}

pub fn audit_enabled() -> bool {
    AUDIT_ENABLED.get()
}
