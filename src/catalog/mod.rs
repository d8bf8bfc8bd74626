//! Catalog Inspection and the Store Seam
//!
//! The sync engine never talks to SPI directly. Everything it needs from
//! the database goes through `ViewStore`:
//! - **inspect**: does the object exist, its live definition, its indexes,
//!   whether a materialized view is populated
//! - **canonical_definition**: the declared SELECT as the server would print it
//! - **execute / atomically**: DDL, with all-or-nothing groups
//! - **select_json**: rows of a view, for the populated-guarded reader
//!
//! `SpiStore` is the production implementation.

pub mod normalize;
pub mod spi;

pub use normalize::{DefinitionNormalizer, WhitespaceNormalizer};
pub use spi::SpiStore;

use crate::definition::{QualifiedName, ViewDefinition, ViewKind};
use crate::error::ViewSyncResult;

/// An index as it exists on a live materialized view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// What the catalog says about one declared object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogState {
    pub exists: bool,
    /// Normalized `pg_get_viewdef` text
    pub definition: Option<String>,
    /// Materialized views only
    pub indexes: Vec<LiveIndex>,
    /// `None` for plain views
    pub populated: Option<bool>,
}

impl CatalogState {
    pub fn absent() -> Self {
        Self::default()
    }

    /// A unique index whose columns are exactly `columns`, in any order
    pub fn has_unique_index_on(&self, columns: &[String]) -> bool {
        let mut wanted: Vec<&str> = columns.iter().map(String::as_str).collect();
        wanted.sort_unstable();
        self.indexes.iter().filter(|i| i.unique).any(|i| {
            let mut have: Vec<&str> = i.columns.iter().map(String::as_str).collect();
            have.sort_unstable();
            have == wanted
        })
    }
}

/// Database access used by sync, refresh, clear and query
pub trait ViewStore {
    /// Catalog snapshot of `name`, looked up as a relation of `kind`
    fn inspect(&mut self, name: &QualifiedName, kind: ViewKind) -> ViewSyncResult<CatalogState>;

    /// Declared SELECT in the same normalized form `inspect` reports
    fn canonical_definition(&mut self, definition: &ViewDefinition) -> ViewSyncResult<String>;

    /// Normalize text with the store's normalizer
    fn normalize(&self, sql: &str) -> String;

    /// Run one DDL statement on behalf of `name`
    fn execute(&mut self, name: &QualifiedName, statement: &str) -> ViewSyncResult<()>;

    /// Run `work` so that either all of its statements take effect or none do
    fn atomically<T, F>(&mut self, work: F) -> ViewSyncResult<T>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> ViewSyncResult<T>;

    /// Rows of `query`, each a JSON object
    fn select_json(&mut self, name: &QualifiedName, query: &str) -> ViewSyncResult<Vec<serde_json::Value>>;
}
