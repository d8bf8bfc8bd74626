//! Per-object sync state machine.
//!
//! ```text
//! PENDING ─ CREATE ────────► create [+ indexes] ───────────► CREATED
//!         ─ EXISTS ────────► [indexes] [repopulate] ───────► UNCHANGED | SYNCED
//!         ─ EXISTS (no update) ─────────────────────────────► UNCHANGED
//!         ─ FORCE_REQUIRED ► [replace in place] ───────────► SKIPPED_CONFLICT | UPDATED
//!         ─ FORCE_REPLACE ─► [replace in place] | drop, create [+ indexes] ► CREATED | UPDATED
//! ```
//!
//! Each object's DDL runs inside one `ViewStore::atomically` group, so a
//! failure partway leaves the object exactly as it was.

use std::collections::HashSet;

use pgrx::prelude::*;

use super::{FailureReason, FailureStage, Outcome, SyncEvent, SyncListener, SyncOptions, SyncReport};
use crate::catalog::{CatalogState, ViewStore};
use crate::ddl;
use crate::definition::{extract, DeclaredView, QualifiedName, ViewDefinition, ViewKind};
use crate::dependency::DependencyGraph;
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::plan::{plan_view, Decision, IndexPlan};
use crate::registry::{SyncFilter, ViewRegistry};

pub struct ViewSyncer {
    options: SyncOptions,
    listeners: Vec<Box<dyn SyncListener>>,
}

impl ViewSyncer {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn SyncListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Sync every view `filter` selects, in dependency order
    ///
    /// # Errors
    /// `CyclicDependency` for a cycle among the selected views and
    /// `NotRegistered` for a filter naming an unknown view. Object-level
    /// failures are reported in the `SyncReport` instead.
    pub fn sync<S: ViewStore>(
        &mut self,
        store: &mut S,
        registry: &ViewRegistry,
        filter: &SyncFilter,
    ) -> ViewSyncResult<SyncReport> {
        let selected = registry.select(filter)?;
        let graph = DependencyGraph::from_views(selected.iter().copied());
        debug1!("pg_viewsync: syncing {} views", graph.len());
        let order = graph.build_order()?;

        let mut failed: HashSet<QualifiedName> = HashSet::new();
        let mut entries = Vec::with_capacity(order.len());
        for name in &order {
            let view = crate::require!(registry.get(name), crate::internal_error!("ordered view {} vanished", name));
            let event = self.sync_one(store, view, &failed);
            if event.status.is_failure() {
                failed.insert(event.name.clone());
            }
            for listener in &mut self.listeners {
                listener.view_synced(&event);
            }
            entries.push(event);
        }

        let report = SyncReport::new(entries);
        for listener in &mut self.listeners {
            listener.all_synced(&report);
        }
        Ok(report)
    }

    fn sync_one<S: ViewStore>(&self, store: &mut S, view: &DeclaredView, failed: &HashSet<QualifiedName>) -> SyncEvent {
        let mut event = SyncEvent {
            name: view.name.clone(),
            decision: None,
            forced: false,
            status: Outcome::Unchanged,
            changed: false,
        };

        let def = match extract(view) {
            Ok(def) => def,
            Err(e) => {
                event.status = failure(FailureStage::Configuration, &e);
                return event;
            }
        };

        if let Some(dep) = def.dependencies.iter().find(|d| failed.contains(*d)) {
            event.status = Outcome::Failed(FailureReason::new(
                FailureStage::Dependency,
                format!("dependency {dep} failed"),
            ));
            return event;
        }

        let state = match store.inspect(&def.name, def.kind) {
            Ok(state) => state,
            Err(e) => {
                event.status = failure(FailureStage::Inspection, &e);
                return event;
            }
        };

        if state.exists && !self.options.update {
            event.decision = Some(Decision::Exists);
            return event;
        }

        let declared = if state.exists {
            declared_definition(store, &def)
        } else {
            String::new()
        };

        let plan = plan_view(&def, &state, &declared, self.options.force);
        event.decision = Some(plan.decision);
        let indexes = plan.indexes.unwrap_or_default();

        match plan.decision {
            Decision::Create => self.create(store, &def, &indexes, &mut event),
            Decision::Exists => self.reconcile(store, &def, &state, &indexes, &mut event),
            Decision::ForceRequired => self.resolve_conflict(store, &def, &mut event),
            Decision::ForceReplace => {
                event.forced = true;
                if !self.replace_in_place(store, &def, &mut event) {
                    self.drop_and_create(store, &def, &indexes, &mut event);
                }
            }
        }
        event
    }

    fn create<S: ViewStore>(&self, store: &mut S, def: &ViewDefinition, indexes: &IndexPlan, event: &mut SyncEvent) {
        let mut stage = FailureStage::Create;
        let result = store.atomically(|s| {
            s.execute(&def.name, &ddl::create_view(def)?)?;
            stage = FailureStage::Index;
            apply_indexes(s, &def.name, indexes)
        });

        event.status = match result {
            Ok(_) => {
                event.changed = true;
                Outcome::Created
            }
            Err(e) => failure(stage, &e),
        };
    }

    fn reconcile<S: ViewStore>(
        &self,
        store: &mut S,
        def: &ViewDefinition,
        state: &CatalogState,
        indexes: &IndexPlan,
        event: &mut SyncEvent,
    ) {
        if def.kind == ViewKind::View {
            event.status = Outcome::Unchanged;
            return;
        }

        let repopulate = def.with_data && state.populated == Some(false);
        let mut stage = FailureStage::Index;
        let result = store.atomically(|s| {
            let mut changed = apply_indexes(s, &def.name, indexes)?;
            if repopulate {
                stage = FailureStage::Refresh;
                s.execute(&def.name, &ddl::refresh_view(&def.name, false))?;
                changed = true;
            }
            Ok(changed)
        });

        event.status = match result {
            Ok(true) => {
                event.changed = true;
                Outcome::Synced
            }
            Ok(false) => Outcome::Unchanged,
            Err(e) => failure(stage, &e),
        };
    }

    fn resolve_conflict<S: ViewStore>(&self, store: &mut S, def: &ViewDefinition, event: &mut SyncEvent) {
        if !self.replace_in_place(store, def, event) {
            event.status = Outcome::SkippedConflict;
        }
    }

    /// `CREATE OR REPLACE VIEW` for plain views when enabled; true if it took
    fn replace_in_place<S: ViewStore>(&self, store: &mut S, def: &ViewDefinition, event: &mut SyncEvent) -> bool {
        if !self.options.replace_compatible || def.kind != ViewKind::View {
            return false;
        }

        let result = store.atomically(|s| s.execute(&def.name, &ddl::replace_view(def)?));
        match result {
            Ok(()) => {
                event.status = Outcome::Updated;
                event.changed = true;
                true
            }
            Err(e) => {
                info!("pg_viewsync: {} cannot be replaced in place: {}", def.name, e);
                false
            }
        }
    }

    fn drop_and_create<S: ViewStore>(&self, store: &mut S, def: &ViewDefinition, indexes: &IndexPlan, event: &mut SyncEvent) {
        let mut stage = FailureStage::Drop;
        let mut dropped = false;
        let result = store.atomically(|s| {
            s.execute(&def.name, &ddl::drop_view(&def.name, def.kind, self.options.cascade))?;
            dropped = true;
            stage = FailureStage::Create;
            s.execute(&def.name, &ddl::create_view(def)?)?;
            stage = FailureStage::Index;
            apply_indexes(s, &def.name, indexes)
        });

        event.status = match result {
            Ok(_) => {
                event.changed = true;
                Outcome::Created
            }
            Err(e) => {
                let mut reason = FailureReason::new(stage, e.to_string());
                reason.after_drop = dropped;
                Outcome::Failed(reason)
            }
        };
    }
}

/// The declared SELECT as the server prints it, or the normalized raw text
/// when the server rejects it
fn declared_definition<S: ViewStore>(store: &mut S, def: &ViewDefinition) -> String {
    match store.canonical_definition(def) {
        Ok(canonical) => canonical,
        Err(e) => {
            debug1!("pg_viewsync: comparing raw definition of {}: {}", def.name, e);
            def.bound_sql().map(|sql| store.normalize(&sql)).unwrap_or_default()
        }
    }
}

/// Drops first, then creates; true if anything ran
fn apply_indexes<S: ViewStore>(store: &mut S, view: &QualifiedName, plan: &IndexPlan) -> ViewSyncResult<bool> {
    for index in &plan.drop {
        store.execute(view, &ddl::drop_index(view, index))?;
        if !plan.is_changed(index) {
            info!("pg_viewsync: dropped index {} on {}", index, view);
        }
    }
    for index in &plan.create {
        store.execute(view, &ddl::create_index(view, index))?;
        if plan.is_changed(&index.name) {
            info!(
                "pg_viewsync: recreated index {} on {} ({})",
                index.name,
                view,
                index.columns.join(", ")
            );
        } else {
            info!("pg_viewsync: created index {} on {}", index.name, view);
        }
    }
    Ok(!plan.is_empty())
}

fn failure(stage: FailureStage, error: &ViewSyncError) -> Outcome {
    Outcome::Failed(FailureReason::new(stage, error.to_string()))
}
