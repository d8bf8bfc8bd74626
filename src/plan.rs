//! Sync decisions.
//!
//! Given a declared definition and what the catalog holds for it, decide
//! what to do with the object and, for materialized views, which indexes
//! to add or drop. Nothing here touches the database.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::catalog::{CatalogState, LiveIndex};
use crate::definition::{IndexSpec, ViewDefinition};

/// What to do with one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Object absent; create it
    Create,
    /// Object present with an equivalent definition
    Exists,
    /// Definitions differ and the run is not forced
    ForceRequired,
    /// Definitions differ and the run is forced: drop and recreate
    ForceReplace,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Create => "CREATE",
            Decision::Exists => "EXISTS",
            Decision::ForceRequired => "FORCE_REQUIRED",
            Decision::ForceReplace => "FORCE_REPLACE",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index changes needed to make the live set equal the declared set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPlan {
    /// Live indexes that are undeclared or whose shape changed
    pub drop: Vec<String>,
    /// Declared indexes that are missing or whose shape changed
    pub create: Vec<IndexSpec>,
    /// Names in both `drop` and `create`: same name, new columns or uniqueness
    pub changed: Vec<String>,
}

impl IndexPlan {
    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.create.is_empty()
    }

    pub fn is_changed(&self, name: &str) -> bool {
        self.changed.iter().any(|c| c == name)
    }
}

/// Everything the executor needs to act on one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub decision: Decision,
    /// `None` when indexes are not reconciled for this decision
    pub indexes: Option<IndexPlan>,
}

/// Compare normalized definitions and pick a decision
pub fn decide(state: &CatalogState, declared: &str, force: bool) -> Decision {
    if !state.exists {
        return Decision::Create;
    }
    match &state.definition {
        Some(live) if live == declared => Decision::Exists,
        _ if force => Decision::ForceReplace,
        _ => Decision::ForceRequired,
    }
}

/// Declared indexes against live ones, matched by name.
///
/// A same-named index with different columns or uniqueness is dropped and
/// recreated. Drops come before creates so a changed index can keep its name.
pub fn plan_indexes(declared: &[IndexSpec], live: &[LiveIndex]) -> IndexPlan {
    let live_by_name: HashMap<&str, &LiveIndex> = live.iter().map(|i| (i.name.as_str(), i)).collect();
    let declared_by_name: HashMap<&str, &IndexSpec> = declared.iter().map(|i| (i.name.as_str(), i)).collect();

    let mut plan = IndexPlan::default();
    for index in live {
        match declared_by_name.get(index.name.as_str()) {
            Some(spec) if same_shape(spec, index) => {}
            _ => plan.drop.push(index.name.clone()),
        }
    }
    for spec in declared {
        match live_by_name.get(spec.name.as_str()) {
            Some(index) if same_shape(spec, index) => {}
            Some(_) => {
                plan.changed.push(spec.name.clone());
                plan.create.push(spec.clone());
            }
            None => plan.create.push(spec.clone()),
        }
    }
    plan
}

fn same_shape(spec: &IndexSpec, live: &LiveIndex) -> bool {
    spec.unique == live.unique && spec.columns == live.columns
}

/// Decision plus index work for one object
pub fn plan_view(definition: &ViewDefinition, state: &CatalogState, declared: &str, force: bool) -> SyncPlan {
    let decision = decide(state, declared, force);
    let indexes = if !definition.is_materialized() {
        None
    } else {
        match decision {
            Decision::Exists => Some(plan_indexes(&definition.indexes, &state.indexes)),
            Decision::Create | Decision::ForceReplace => Some(plan_indexes(&definition.indexes, &[])),
            Decision::ForceRequired => None,
        }
    };
    SyncPlan { decision, indexes }
}
