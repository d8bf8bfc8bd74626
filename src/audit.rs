use chrono::Utc;
use pgrx::prelude::*;

use crate::plan::Decision;
use crate::sync::{SyncEvent, SyncListener, SyncReport};
use crate::error::ViewSyncError;
use crate::utils::{bool_arg, jsonb_arg, nullable_text_arg, subtransaction, text_arg};

const INSERT_EVENT: &str = "\
    INSERT INTO public.pg_viewsync_sync_log (view_name, decision, outcome, forced, changed, details) \
    VALUES ($1, $2, $3, $4, $5, $6)";

/// Records each synced view in `pg_viewsync_sync_log`
///
/// Each insert runs in its own subtransaction. A failed insert is logged
/// and dropped, and the sync carries on.
#[derive(Debug, Default)]
pub struct AuditListener {
    recorded: usize,
}

impl AuditListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

/// Row details beyond the fixed columns
fn event_details(event: &SyncEvent) -> serde_json::Value {
    serde_json::json!({
        "failure": event.status.failure(),
        "recorded_at": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

impl SyncListener for AuditListener {
    fn view_synced(&mut self, event: &SyncEvent) {
        let args = [
            text_arg(&event.name.to_string()),
            nullable_text_arg(event.decision.map(Decision::as_str)),
            text_arg(event.status.as_str()),
            bool_arg(event.forced),
            bool_arg(event.changed),
            jsonb_arg(event_details(event)),
        ];

        let inserted = subtransaction(true, || {
            Spi::run_with_args(INSERT_EVENT, &args).map_err(|e| ViewSyncError::Spi {
                query: INSERT_EVENT.to_string(),
                error: e.to_string(),
            })
        });

        match inserted {
            Ok(Ok(())) => self.recorded += 1,
            Ok(Err(e)) => warning!("pg_viewsync: could not record sync of {}: {}", event.name, e),
            Err(e) => warning!(
                "pg_viewsync: could not record sync of {} ({:?}): {}",
                event.name,
                e.code,
                e.message
            ),
        }
    }

    fn all_synced(&mut self, report: &SyncReport) {
        debug1!(
            "pg_viewsync: recorded {} of {} sync events",
            self.recorded,
            report.entries.len()
        );
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::definition::QualifiedName;
    use crate::sync::{FailureReason, FailureStage, Outcome};

    #[pg_test]
    fn test_audit_listener_writes_rows() {
        let mut listener = AuditListener::new();
        listener.view_synced(&SyncEvent {
            name: QualifiedName::new("public", "v_audit"),
            decision: Some(Decision::Create),
            forced: false,
            status: Outcome::Created,
            changed: true,
        });
        listener.view_synced(&SyncEvent {
            name: QualifiedName::new("public", "v_broken"),
            decision: None,
            forced: false,
            status: Outcome::Failed(FailureReason::new(FailureStage::Configuration, "bad params")),
            changed: false,
        });
        assert_eq!(listener.recorded(), 2);

        let created = Spi::get_one::<String>(
            "SELECT outcome FROM public.pg_viewsync_sync_log WHERE view_name = 'public.v_audit'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(created, "CREATED");

        let stage = Spi::get_one::<String>(
            "SELECT details->'failure'->>'stage' FROM public.pg_viewsync_sync_log
             WHERE view_name = 'public.v_broken'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(stage, "configuration");
    }

    #[pg_test]
    fn test_rejected_audit_insert_does_not_abort_sync() {
        Spi::run("ALTER TABLE public.pg_viewsync_sync_log ADD CONSTRAINT reject_all CHECK (false)").unwrap();
        Spi::run("SELECT pg_viewsync_register('v_unaudited', 'SELECT 1 AS one')").unwrap();

        let outcome = Spi::get_one::<String>("SELECT outcome FROM pg_viewsync_sync()")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, "CREATED");

        let exists = Spi::get_one::<bool>("SELECT to_regclass('public.v_unaudited') IS NOT NULL")
            .unwrap()
            .unwrap();
        assert!(exists);

        let logged = Spi::get_one::<i64>("SELECT count(*) FROM public.pg_viewsync_sync_log")
            .unwrap()
            .unwrap();
        assert_eq!(logged, 0);
    }

    #[pg_test]
    fn test_listener_counts_only_recorded_rows() {
        Spi::run("ALTER TABLE public.pg_viewsync_sync_log ADD CONSTRAINT reject_all CHECK (false)").unwrap();
        let mut listener = AuditListener::new();
        listener.view_synced(&SyncEvent {
            name: QualifiedName::new("public", "v_audit"),
            decision: Some(Decision::Exists),
            forced: false,
            status: Outcome::Unchanged,
            changed: false,
        });
        assert_eq!(listener.recorded(), 0);
    }
}
