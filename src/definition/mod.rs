//! View Declarations and Normalized Definitions
//!
//! A `ViewDeclaration` is what an application states about one view: its
//! name, kind, SQL source, dependencies and indexes. `extract()` turns a
//! registered declaration into a `ViewDefinition`, the normalized record the
//! sync engine works on.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pg_viewsync::definition::{IndexSpec, ViewDeclaration};
//!
//! let decl = ViewDeclaration::materialized("reporting.daily_totals",
//!         "SELECT day, sum(amount) AS total FROM payments GROUP BY day")
//!     .depends_on("reporting.payments_clean")
//!     .concurrent_index("day")
//!     .with_data(false)
//!     .index(IndexSpec::new("daily_totals_total_idx", &["total"]));
//! ```

pub mod extract;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ViewSyncError, ViewSyncResult};
use crate::validation::validate_sql_identifier;

pub use extract::{extract, parse_concurrent_index};

/// Schema-qualified relation name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name` or `name`, filling in `default_schema` for the latter
    pub fn parse(raw: &str, default_schema: &str) -> ViewSyncResult<Self> {
        let raw = raw.trim();
        let (schema, name) = match raw.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => (default_schema, raw),
        };

        validate_sql_identifier(schema, "schema_name")?;
        validate_sql_identifier(name, "view_name")?;

        Ok(Self::new(schema, name))
    }

    /// Rendered for use in DDL
    pub fn to_sql(&self) -> String {
        format!(
            "{}.{}",
            crate::ddl::quote_ident(&self.schema),
            crate::ddl::quote_ident(&self.name)
        )
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// What kind of relation a declaration produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    View,
    Materialized,
}

impl ViewKind {
    /// Keyword(s) between CREATE/DROP and the name
    pub fn sql_keyword(self) -> &'static str {
        match self {
            ViewKind::View => "VIEW",
            ViewKind::Materialized => "MATERIALIZED VIEW",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViewKind::View => "view",
            ViewKind::Materialized => "materialized view",
        }
    }

    /// `pg_class.relkind` for this kind
    pub fn relkind(self) -> &'static str {
        match self {
            ViewKind::View => "v",
            ViewKind::Materialized => "m",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared index on a materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// One bind value for a parameterized view definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Produces `(select_sql, params)` at extraction time.
///
/// `params` must be JSON `null` or a flat array of scalars.
pub type SqlProvider = Box<dyn Fn() -> ViewSyncResult<(String, serde_json::Value)>>;

/// Where a declaration's SELECT comes from
pub enum SqlSource {
    Static(String),
    Dynamic(SqlProvider),
}

impl fmt::Debug for SqlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlSource::Static(sql) => f.debug_tuple("Static").field(sql).finish(),
            SqlSource::Dynamic(_) => f.write_str("Dynamic(<provider>)"),
        }
    }
}

/// A view as declared by the application, before registration
#[derive(Debug)]
pub struct ViewDeclaration {
    pub name: String,
    pub kind: ViewKind,
    pub source: SqlSource,
    pub dependencies: Vec<String>,
    pub concurrent_index: Option<String>,
    pub with_data: bool,
    pub indexes: Vec<IndexSpec>,
}

impl ViewDeclaration {
    fn new(name: &str, kind: ViewKind, source: SqlSource) -> Self {
        Self {
            name: name.to_string(),
            kind,
            source,
            dependencies: Vec::new(),
            concurrent_index: None,
            with_data: true,
            indexes: Vec::new(),
        }
    }

    pub fn view(name: &str, sql: &str) -> Self {
        Self::new(name, ViewKind::View, SqlSource::Static(sql.to_string()))
    }

    pub fn materialized(name: &str, sql: &str) -> Self {
        Self::new(name, ViewKind::Materialized, SqlSource::Static(sql.to_string()))
    }

    /// Declaration whose SQL is computed by `provider` at extraction time
    pub fn dynamic(name: &str, kind: ViewKind, provider: SqlProvider) -> Self {
        Self::new(name, kind, SqlSource::Dynamic(provider))
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.push(name.to_string());
        self
    }

    /// Comma-separated columns of the unique index that enables concurrent refresh
    pub fn concurrent_index(mut self, columns: &str) -> Self {
        self.concurrent_index = Some(columns.to_string());
        self
    }

    pub fn with_data(mut self, with_data: bool) -> Self {
        self.with_data = with_data;
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// A declaration accepted by a `ViewRegistry`: names are qualified and valid
#[derive(Debug)]
pub struct DeclaredView {
    pub name: QualifiedName,
    pub dependencies: BTreeSet<QualifiedName>,
    pub declaration: ViewDeclaration,
}

impl DeclaredView {
    pub fn qualify(declaration: ViewDeclaration, default_schema: &str) -> ViewSyncResult<Self> {
        let name = QualifiedName::parse(&declaration.name, default_schema)?;
        let dependencies = declaration
            .dependencies
            .iter()
            .map(|dep| QualifiedName::parse(dep, default_schema))
            .collect::<ViewSyncResult<BTreeSet<_>>>()
            .map_err(|e| ViewSyncError::configuration(name.to_string(), format!("bad dependency: {e}")))?;

        Ok(Self {
            name,
            dependencies,
            declaration,
        })
    }
}

/// The normalized form of one view, consumed by planning and execution
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub name: QualifiedName,
    pub select_sql: String,
    pub params: Option<Vec<SqlParam>>,
    pub kind: ViewKind,
    pub dependencies: BTreeSet<QualifiedName>,
    pub concurrent_index_columns: Vec<String>,
    pub with_data: bool,
    /// Declared indexes, including the derived concurrent index
    pub indexes: Vec<IndexSpec>,
}

impl ViewDefinition {
    pub fn is_materialized(&self) -> bool {
        self.kind == ViewKind::Materialized
    }

    /// SELECT text with params rendered into its `$n` placeholders
    pub fn bound_sql(&self) -> ViewSyncResult<String> {
        crate::ddl::params::bind_params(&self.select_sql, self.params.as_deref())
            .map_err(|reason| ViewSyncError::configuration(self.name.to_string(), reason))
    }

    /// Name of the unique index backing concurrent refresh, if declared
    pub fn concurrent_index_name(&self) -> Option<String> {
        if self.concurrent_index_columns.is_empty() {
            return None;
        }
        Some(concurrent_index_name(&self.name, &self.concurrent_index_columns))
    }
}

/// `<schema>_<view>_<col>..._index`, cut to the identifier limit so it
/// matches what the server stores
pub fn concurrent_index_name(view: &QualifiedName, columns: &[String]) -> String {
    let mut name = format!("{}_{}_{}_index", view.schema, view.name, columns.join("_"));
    if name.len() > crate::config::MAX_IDENTIFIER_LENGTH {
        let cut = (0..=crate::config::MAX_IDENTIFIER_LENGTH)
            .rev()
            .find(|i| name.is_char_boundary(*i))
            .unwrap_or(0);
        name.truncate(cut);
    }
    name
}
