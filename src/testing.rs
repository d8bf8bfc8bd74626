//! Scripted in-memory `ViewStore` for exercising the sync engine without a
//! catalog: seeded objects, injectable inspection and DDL failures, and a
//! log of every statement executed.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::{CatalogState, DefinitionNormalizer, LiveIndex, ViewStore, WhitespaceNormalizer};
use crate::definition::{QualifiedName, ViewDefinition, ViewKind};
use crate::error::{ViewSyncError, ViewSyncResult};

static CREATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^CREATE (OR REPLACE )?(MATERIALIZED )?VIEW (\S+) AS (.*?)( WITH NO DATA)?$")
        .expect("create pattern is valid")
});
static DROP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^DROP (MATERIALIZED )?VIEW IF EXISTS (\S+)( CASCADE)?$").expect("drop pattern is valid")
});
static CREATE_INDEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^CREATE (UNIQUE )?INDEX (\S+) ON (\S+) \((.*)\)$").expect("index pattern is valid")
});
static DROP_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^DROP INDEX IF EXISTS (\S+)\.(\S+)$").expect("drop index pattern is valid"));
static REFRESH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^REFRESH MATERIALIZED VIEW (CONCURRENTLY )?(\S+)$").expect("refresh pattern is valid")
});

#[derive(Debug, Clone)]
struct ScriptedObject {
    kind: ViewKind,
    definition: String,
    indexes: Vec<LiveIndex>,
    populated: bool,
    rows: Vec<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct ScriptedStore {
    objects: BTreeMap<QualifiedName, ScriptedObject>,
    /// Every statement passed to `execute`, including rolled-back ones
    pub executed: Vec<String>,
    fail_inspect: HashSet<QualifiedName>,
    fail_statements: Vec<String>,
    fail_canonical: bool,
    normalizer: WhitespaceNormalizer,
}

fn qualified(raw: &str) -> QualifiedName {
    match raw.split_once('.') {
        Some((schema, name)) => QualifiedName::new(schema, name),
        None => QualifiedName::new("public", raw),
    }
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing, populated object
    pub fn with_view(mut self, name: &str, kind: ViewKind, definition: &str) -> Self {
        let definition = self.normalizer.normalize(definition);
        self.objects.insert(
            qualified(name),
            ScriptedObject {
                kind,
                definition,
                indexes: Vec::new(),
                populated: true,
                rows: Vec::new(),
            },
        );
        self
    }

    pub fn with_index(mut self, view: &str, name: &str, columns: &[&str], unique: bool) -> Self {
        if let Some(object) = self.objects.get_mut(&qualified(view)) {
            object.indexes.push(LiveIndex {
                name: name.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                unique,
            });
        }
        self
    }

    pub fn with_rows(mut self, view: &str, rows: Vec<serde_json::Value>) -> Self {
        if let Some(object) = self.objects.get_mut(&qualified(view)) {
            object.rows = rows;
        }
        self
    }

    pub fn unpopulated(mut self, view: &str) -> Self {
        if let Some(object) = self.objects.get_mut(&qualified(view)) {
            object.populated = false;
        }
        self
    }

    pub fn fail_inspect(mut self, view: &str) -> Self {
        self.fail_inspect.insert(qualified(view));
        self
    }

    /// Any statement containing `fragment` fails
    pub fn fail_on(mut self, fragment: &str) -> Self {
        self.fail_statements.push(fragment.to_string());
        self
    }

    pub fn fail_canonicalization(mut self) -> Self {
        self.fail_canonical = true;
        self
    }

    pub fn exists(&self, name: &str) -> bool {
        self.objects.contains_key(&qualified(name))
    }

    pub fn definition_of(&self, name: &str) -> Option<&str> {
        self.objects.get(&qualified(name)).map(|o| o.definition.as_str())
    }

    pub fn index_names(&self, name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .get(&qualified(name))
            .map(|o| o.indexes.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn is_populated(&self, name: &str) -> Option<bool> {
        self.objects.get(&qualified(name)).map(|o| o.populated)
    }

    /// Executed statements starting with `prefix`
    pub fn statements(&self, prefix: &str) -> Vec<&str> {
        self.executed
            .iter()
            .filter(|s| s.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }

    fn apply(&mut self, statement: &str) -> Result<(), String> {
        if let Some(caps) = CREATE_RE.captures(statement) {
            let replace = caps.get(1).is_some();
            let kind = if caps.get(2).is_some() { ViewKind::Materialized } else { ViewKind::View };
            let name = qualified(&caps[3]);
            let definition = self.normalizer.normalize(&caps[4]);
            let populated = caps.get(5).is_none();

            match self.objects.get_mut(&name) {
                Some(existing) if replace && existing.kind == ViewKind::View => {
                    existing.definition = definition;
                    return Ok(());
                }
                Some(_) => return Err(format!("relation \"{}\" already exists", name.name)),
                None => {}
            }
            self.objects.insert(
                name,
                ScriptedObject {
                    kind,
                    definition,
                    indexes: Vec::new(),
                    populated,
                    rows: Vec::new(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = DROP_RE.captures(statement) {
            let kind = if caps.get(1).is_some() { ViewKind::Materialized } else { ViewKind::View };
            let name = qualified(&caps[2]);
            match self.objects.get(&name).map(|o| o.kind) {
                Some(existing) if existing != kind => {
                    return Err(format!("\"{}\" is not a {}", name.name, kind));
                }
                Some(_) => {
                    self.objects.remove(&name);
                }
                None => {}
            }
            return Ok(());
        }

        if let Some(caps) = CREATE_INDEX_RE.captures(statement) {
            let index_name = caps[2].to_string();
            let object = self
                .objects
                .get_mut(&qualified(&caps[3]))
                .ok_or_else(|| format!("relation \"{}\" does not exist", &caps[3]))?;
            if object.kind != ViewKind::Materialized {
                return Err(format!("cannot create index on view \"{}\"", &caps[3]));
            }
            if object.indexes.iter().any(|i| i.name == index_name) {
                return Err(format!("relation \"{index_name}\" already exists"));
            }
            object.indexes.push(LiveIndex {
                name: index_name,
                columns: caps[4].split(", ").map(str::to_string).collect(),
                unique: caps.get(1).is_some(),
            });
            return Ok(());
        }

        if let Some(caps) = DROP_INDEX_RE.captures(statement) {
            let schema = &caps[1];
            let index_name = &caps[2];
            for (name, object) in self.objects.iter_mut() {
                if name.schema == schema {
                    object.indexes.retain(|i| i.name != index_name);
                }
            }
            return Ok(());
        }

        if let Some(caps) = REFRESH_RE.captures(statement) {
            let concurrently = caps.get(1).is_some();
            let object = self
                .objects
                .get_mut(&qualified(&caps[2]))
                .ok_or_else(|| format!("relation \"{}\" does not exist", &caps[2]))?;
            if concurrently && !object.populated {
                return Err("CONCURRENTLY cannot be used when the materialized view is not populated".to_string());
            }
            object.populated = true;
            return Ok(());
        }

        Err(format!("unsupported statement: {statement}"))
    }
}

impl ViewStore for ScriptedStore {
    fn inspect(&mut self, name: &QualifiedName, kind: ViewKind) -> ViewSyncResult<CatalogState> {
        if self.fail_inspect.contains(name) {
            return Err(ViewSyncError::Inspection {
                name: name.to_string(),
                reason: "permission denied for table pg_class".to_string(),
            });
        }
        Ok(match self.objects.get(name) {
            Some(object) if object.kind == kind => CatalogState {
                exists: true,
                definition: Some(object.definition.clone()),
                indexes: object.indexes.clone(),
                populated: (kind == ViewKind::Materialized).then_some(object.populated),
            },
            _ => CatalogState::absent(),
        })
    }

    fn canonical_definition(&mut self, definition: &ViewDefinition) -> ViewSyncResult<String> {
        if self.fail_canonical {
            return Err(ViewSyncError::Inspection {
                name: definition.name.to_string(),
                reason: "could not canonicalize declared definition".to_string(),
            });
        }
        Ok(self.normalizer.normalize(&definition.bound_sql()?))
    }

    fn normalize(&self, sql: &str) -> String {
        self.normalizer.normalize(sql)
    }

    fn execute(&mut self, name: &QualifiedName, statement: &str) -> ViewSyncResult<()> {
        self.executed.push(statement.to_string());
        let ddl_error = |error: String| ViewSyncError::Ddl {
            name: name.to_string(),
            statement: statement.to_string(),
            error,
            code: None,
        };
        if let Some(fragment) = self.fail_statements.iter().find(|f| statement.contains(f.as_str())) {
            return Err(ddl_error(format!("scripted failure on '{fragment}'")));
        }
        self.apply(statement).map_err(ddl_error)
    }

    fn atomically<T, F>(&mut self, work: F) -> ViewSyncResult<T>
    where
        F: FnOnce(&mut Self) -> ViewSyncResult<T>,
    {
        let snapshot = self.objects.clone();
        let result = work(self);
        if result.is_err() {
            self.objects = snapshot;
        }
        result
    }

    fn select_json(&mut self, name: &QualifiedName, query: &str) -> ViewSyncResult<Vec<serde_json::Value>> {
        match self.objects.get(name) {
            Some(object) if object.kind == ViewKind::Materialized && !object.populated => {
                Err(ViewSyncError::NotPopulated { name: name.to_string() })
            }
            Some(object) => Ok(object.rows.clone()),
            None => Err(ViewSyncError::Spi {
                query: query.to_string(),
                error: format!("relation \"{name}\" does not exist"),
            }),
        }
    }
}
