//! Materialized view refresh.
//!
//! Concurrent refresh needs a unique index on exactly the declared
//! concurrent-index columns. When that index is missing the refresh is
//! refused; it never silently falls back to a blocking refresh.

use std::collections::BTreeSet;

use pgrx::prelude::*;

use crate::catalog::ViewStore;
use crate::ddl;
use crate::definition::{extract, QualifiedName, ViewDefinition, ViewKind};
use crate::dependency::DependencyGraph;
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::registry::ViewRegistry;

/// Refresh one materialized view
///
/// # Errors
/// `ConcurrentRefreshUnsupported` when `concurrently` is set and no live
/// unique index covers the concurrent-index columns; nothing is run then.
pub fn refresh_view<S: ViewStore>(store: &mut S, def: &ViewDefinition, concurrently: bool) -> ViewSyncResult<()> {
    if def.kind != ViewKind::Materialized {
        return Err(ViewSyncError::configuration(def.name.to_string(), "only materialized views can be refreshed"));
    }

    if concurrently {
        if def.concurrent_index_columns.is_empty() {
            return Err(ViewSyncError::ConcurrentRefreshUnsupported {
                name: def.name.to_string(),
                columns: Vec::new(),
            });
        }
        let state = store.inspect(&def.name, def.kind)?;
        if !state.has_unique_index_on(&def.concurrent_index_columns) {
            return Err(ViewSyncError::ConcurrentRefreshUnsupported {
                name: def.name.to_string(),
                columns: def.concurrent_index_columns.clone(),
            });
        }
    }

    let statement = ddl::refresh_view(&def.name, concurrently);
    store.atomically(|s| s.execute(&def.name, &statement))?;
    info!(
        "pg_viewsync: refreshed {}{}",
        def.name,
        if concurrently { " concurrently" } else { "" }
    );
    Ok(())
}

/// Refresh `names` plus everything connected to them, in dependency order.
///
/// With `names = None` every registered materialized view is refreshed.
/// Otherwise the set grows by the dependencies and dependants of each named
/// view, so data read through them is refreshed along with it. Plain views
/// in the set are passed over. Stops at the first error.
pub fn refresh_views<S: ViewStore>(
    store: &mut S,
    registry: &ViewRegistry,
    names: Option<&[QualifiedName]>,
    concurrently: bool,
) -> ViewSyncResult<usize> {
    let graph = DependencyGraph::from_views(registry.iter());
    let order = graph.build_order()?;

    let wanted: Option<BTreeSet<QualifiedName>> = match names {
        None => None,
        Some(names) => {
            let mut set = BTreeSet::new();
            for name in names {
                if !registry.contains(name) {
                    return Err(ViewSyncError::NotRegistered { name: name.to_string() });
                }
                set.insert(name.clone());
                set.extend(graph.dependencies_of(name)?);
                set.extend(graph.dependants_of(name)?);
            }
            Some(set)
        }
    };

    let mut refreshed = 0;
    for name in order {
        if wanted.as_ref().is_some_and(|set| !set.contains(&name)) {
            continue;
        }
        let view = crate::require!(registry.get(&name), crate::internal_error!("ordered view {} vanished", name));
        if view.declaration.kind != ViewKind::Materialized {
            continue;
        }
        let def = extract(view)?;
        refresh_view(store, &def, concurrently)?;
        refreshed += 1;
    }
    Ok(refreshed)
}
