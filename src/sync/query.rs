//! Reading a view's rows, with the populated guard for materialized views.

use crate::catalog::ViewStore;
use crate::ddl;
use crate::definition::{ViewDefinition, ViewKind};
use crate::error::{ViewSyncError, ViewSyncResult};

/// All rows of `def` as JSON objects
///
/// # Errors
/// `NotPopulated` for a materialized view created `WITH NO DATA` and not yet
/// refreshed; `Inspection` when the object does not exist.
pub fn query_view<S: ViewStore>(store: &mut S, def: &ViewDefinition) -> ViewSyncResult<Vec<serde_json::Value>> {
    let state = store.inspect(&def.name, def.kind)?;
    if !state.exists {
        return Err(ViewSyncError::Inspection {
            name: def.name.to_string(),
            reason: format!("{} does not exist", def.kind),
        });
    }
    if def.kind == ViewKind::Materialized && state.populated == Some(false) {
        return Err(ViewSyncError::NotPopulated {
            name: def.name.to_string(),
        });
    }

    store.select_json(&def.name, &ddl::select_rows_as_json(&def.name))
}
