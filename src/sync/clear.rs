//! Teardown of declared views, dependants first.

use pgrx::prelude::*;

use super::{FailureReason, FailureStage, Outcome, SyncEvent, SyncReport};
use crate::catalog::ViewStore;
use crate::ddl;
use crate::dependency::DependencyGraph;
use crate::error::ViewSyncResult;
use crate::registry::{SyncFilter, ViewRegistry};

/// Drop every view `filter` selects in teardown order
///
/// A failed drop is reported and the run goes on; objects that were already
/// absent are reported as dropped, since `IF EXISTS` makes that a no-op.
pub fn clear_views<S: ViewStore>(
    store: &mut S,
    registry: &ViewRegistry,
    filter: &SyncFilter,
    cascade: bool,
) -> ViewSyncResult<SyncReport> {
    let selected = registry.select(filter)?;
    let order = DependencyGraph::from_views(selected.iter().copied()).teardown_order()?;

    let mut entries = Vec::with_capacity(order.len());
    for name in order {
        let view = crate::require!(registry.get(&name), crate::internal_error!("ordered view {} vanished", name));
        let kind = view.declaration.kind;
        let statement = ddl::drop_view(&name, kind, cascade);

        let status = match store.atomically(|s| s.execute(&name, &statement)) {
            Ok(()) => {
                info!("pg_viewsync: dropped {} {}", kind, name);
                Outcome::Dropped
            }
            Err(e) => {
                warning!("pg_viewsync: could not drop {}: {}", name, e);
                Outcome::Failed(FailureReason::new(FailureStage::Drop, e.to_string()))
            }
        };

        entries.push(SyncEvent {
            changed: status == Outcome::Dropped,
            name,
            decision: None,
            forced: false,
            status,
        });
    }

    Ok(SyncReport::new(entries))
}
