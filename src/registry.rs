//! In-memory registry of declared views.
//!
//! Keeps declaration order, which the dependency sort uses as its stable
//! tie-break, and rejects a second declaration for the same qualified name.

use std::collections::{BTreeSet, HashMap};

use crate::definition::{DeclaredView, QualifiedName, ViewDeclaration};
use crate::error::{ViewSyncError, ViewSyncResult};

/// Which registered views a run covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncFilter {
    #[default]
    All,
    Names(BTreeSet<QualifiedName>),
    Schema(String),
}

#[derive(Debug)]
pub struct ViewRegistry {
    default_schema: String,
    views: Vec<DeclaredView>,
    by_name: HashMap<QualifiedName, usize>,
}

impl ViewRegistry {
    pub fn new(default_schema: &str) -> Self {
        Self {
            default_schema: default_schema.to_string(),
            views: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    /// Add one declaration; returns its qualified name
    pub fn register(&mut self, declaration: ViewDeclaration) -> ViewSyncResult<QualifiedName> {
        let view = DeclaredView::qualify(declaration, &self.default_schema)?;
        if self.by_name.contains_key(&view.name) {
            return Err(ViewSyncError::RegistryConflict {
                name: view.name.to_string(),
            });
        }

        let name = view.name.clone();
        self.by_name.insert(name.clone(), self.views.len());
        self.views.push(view);
        Ok(name)
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&DeclaredView> {
        self.by_name.get(name).map(|&i| &self.views[i])
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.by_name.contains_key(name)
    }

    /// Qualify a user-supplied name against this registry's default schema
    pub fn resolve(&self, raw: &str) -> ViewSyncResult<QualifiedName> {
        let name = QualifiedName::parse(raw, &self.default_schema)?;
        if !self.contains(&name) {
            return Err(ViewSyncError::NotRegistered { name: name.to_string() });
        }
        Ok(name)
    }

    /// All declarations in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &DeclaredView> {
        self.views.iter()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Declarations the filter selects, in declaration order.
    ///
    /// Naming an unregistered view is an error, raised before any object is
    /// touched.
    pub fn select(&self, filter: &SyncFilter) -> ViewSyncResult<Vec<&DeclaredView>> {
        match filter {
            SyncFilter::All => Ok(self.views.iter().collect()),
            SyncFilter::Schema(schema) => Ok(self.views.iter().filter(|v| &v.name.schema == schema).collect()),
            SyncFilter::Names(names) => {
                if let Some(missing) = names.iter().find(|n| !self.contains(n)) {
                    return Err(ViewSyncError::NotRegistered {
                        name: missing.to_string(),
                    });
                }
                Ok(self.views.iter().filter(|v| names.contains(&v.name)).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ViewRegistry {
        let mut reg = ViewRegistry::new("public");
        reg.register(ViewDeclaration::view("v_b", "SELECT 1")).unwrap();
        reg.register(ViewDeclaration::view("reporting.v_a", "SELECT 1")).unwrap();
        reg.register(ViewDeclaration::view("v_c", "SELECT 1").depends_on("v_b")).unwrap();
        reg
    }

    #[test]
    fn test_register_keeps_declaration_order() {
        let reg = registry();
        let names: Vec<String> = reg.iter().map(|v| v.name.to_string()).collect();
        assert_eq!(names, vec!["public.v_b", "reporting.v_a", "public.v_c"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut reg = registry();
        let err = reg.register(ViewDeclaration::materialized("public.v_b", "SELECT 2")).unwrap_err();
        assert_eq!(err, ViewSyncError::RegistryConflict { name: "public.v_b".to_string() });
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_select_by_schema() {
        let reg = registry();
        let selected = reg.select(&SyncFilter::Schema("reporting".to_string())).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name.to_string(), "reporting.v_a");
    }

    #[test]
    fn test_select_unknown_name_is_error() {
        let reg = registry();
        let names = BTreeSet::from([QualifiedName::new("public", "missing")]);
        let err = reg.select(&SyncFilter::Names(names)).unwrap_err();
        assert_eq!(err.sqlstate(), "42704");
    }

    #[test]
    fn test_resolve_uses_default_schema() {
        let reg = registry();
        assert_eq!(reg.resolve("v_c").unwrap(), QualifiedName::new("public", "v_c"));
        crate::error::testing::assert_error_contains(reg.resolve("v_a"), "'public.v_a' is not registered");
    }
}
