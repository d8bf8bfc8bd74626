//! `ViewStore` over SPI
//!
//! Every call runs in its own subtransaction so that a failing statement
//! only poisons the object it belongs to. `atomically` wraps a group of
//! statements in one more subtransaction around those.

use pgrx::prelude::*;

use super::{CatalogState, DefinitionNormalizer, LiveIndex, ViewStore, WhitespaceNormalizer};
use crate::config::PROBE_VIEW_NAME;
use crate::definition::{QualifiedName, ViewDefinition, ViewKind};
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::utils::{subtransaction, text_arg, DbError};

const DEFINITION_QUERY: &str = "\
    SELECT pg_get_viewdef(c.oid) AS definition, \
           CASE WHEN c.relkind = 'm' THEN c.relispopulated END AS populated \
    FROM pg_class c \
    JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind::text = $3";

const INDEX_QUERY: &str = "\
    SELECT i.relname::text AS index_name, ix.indisunique AS is_unique, \
           array_agg(a.attname::text ORDER BY k.ord) AS columns \
    FROM pg_index ix \
    JOIN pg_class t ON t.oid = ix.indrelid \
    JOIN pg_class i ON i.oid = ix.indexrelid \
    JOIN pg_namespace n ON n.oid = t.relnamespace \
    CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
    WHERE n.nspname = $1 AND t.relname = $2 \
    GROUP BY i.relname, ix.indisunique \
    ORDER BY i.relname";

pub struct SpiStore {
    normalizer: Box<dyn DefinitionNormalizer>,
}

impl Default for SpiStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiStore {
    pub fn new() -> Self {
        Self::with_normalizer(Box::new(WhitespaceNormalizer))
    }

    pub fn with_normalizer(normalizer: Box<dyn DefinitionNormalizer>) -> Self {
        Self { normalizer }
    }

    fn read_definition(name: &QualifiedName, kind: ViewKind) -> ViewSyncResult<Option<(Option<String>, Option<bool>)>> {
        let found: spi::Result<Option<(Option<String>, Option<bool>)>> = Spi::connect(|client| {
            let args = [text_arg(&name.schema), text_arg(&name.name), text_arg(kind.relkind())];
            let mut rows = client.select(DEFINITION_QUERY, None, &args)?;
            match rows.next() {
                Some(row) => {
                    let definition: Option<String> = row["definition"].value()?;
                    let populated: Option<bool> = row["populated"].value()?;
                    Ok(Some((definition, populated)))
                }
                None => Ok(None),
            }
        });
        found.map_err(|e| ViewSyncError::Spi {
            query: DEFINITION_QUERY.to_string(),
            error: e.to_string(),
        })
    }

    fn read_indexes(name: &QualifiedName) -> ViewSyncResult<Vec<LiveIndex>> {
        let found: spi::Result<Vec<LiveIndex>> = Spi::connect(|client| {
            let args = [text_arg(&name.schema), text_arg(&name.name)];
            let rows = client.select(INDEX_QUERY, None, &args)?;
            let mut indexes = Vec::new();
            for row in rows {
                let index_name: Option<String> = row["index_name"].value()?;
                let unique: Option<bool> = row["is_unique"].value()?;
                let columns: Option<Vec<String>> = row["columns"].value()?;
                if let Some(index_name) = index_name {
                    indexes.push(LiveIndex {
                        name: index_name,
                        columns: columns.unwrap_or_default(),
                        unique: unique.unwrap_or(false),
                    });
                }
            }
            Ok(indexes)
        });
        found.map_err(|e| ViewSyncError::Spi {
            query: INDEX_QUERY.to_string(),
            error: e.to_string(),
        })
    }
}

fn inspection_error(name: &QualifiedName, e: DbError) -> ViewSyncError {
    ViewSyncError::Inspection {
        name: name.to_string(),
        reason: e.message,
    }
}

impl ViewStore for SpiStore {
    fn inspect(&mut self, name: &QualifiedName, kind: ViewKind) -> ViewSyncResult<CatalogState> {
        let found = subtransaction(true, || {
            let Some((definition, populated)) = Self::read_definition(name, kind)? else {
                return Ok(CatalogState::absent());
            };
            let indexes = match kind {
                ViewKind::Materialized => Self::read_indexes(name)?,
                ViewKind::View => Vec::new(),
            };
            Ok(CatalogState {
                exists: true,
                definition,
                indexes,
                populated,
            })
        })
        .map_err(|e| inspection_error(name, e))?;

        let mut state = found.map_err(|e| ViewSyncError::Inspection {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        state.definition = state.definition.map(|d| self.normalizer.normalize(&d));
        debug1!(
            "pg_viewsync: inspected {} (exists={}, indexes={})",
            name,
            state.exists,
            state.indexes.len()
        );
        Ok(state)
    }

    /// Create a temporary probe view from the declared SELECT, read back its
    /// `pg_get_viewdef`, and always roll the probe away
    fn canonical_definition(&mut self, definition: &ViewDefinition) -> ViewSyncResult<String> {
        let select = definition.bound_sql()?;
        let create = format!("CREATE TEMPORARY VIEW {PROBE_VIEW_NAME} AS {select}");
        let read = format!("SELECT pg_get_viewdef('pg_temp.{PROBE_VIEW_NAME}'::regclass)");

        let probed = subtransaction(false, || {
            Spi::run(&create).map_err(|e| ViewSyncError::Spi {
                query: create.clone(),
                error: e.to_string(),
            })?;
            Spi::get_one::<String>(&read)
                .map_err(|e| ViewSyncError::Spi {
                    query: read.clone(),
                    error: e.to_string(),
                })?
                .ok_or_else(|| crate::internal_error!("probe view has no definition"))
        })
        .map_err(|e| ViewSyncError::Inspection {
            name: definition.name.to_string(),
            reason: format!("could not canonicalize declared definition: {}", e.message),
        })??;

        Ok(self.normalizer.normalize(&probed))
    }

    fn normalize(&self, sql: &str) -> String {
        self.normalizer.normalize(sql)
    }

    fn execute(&mut self, name: &QualifiedName, statement: &str) -> ViewSyncResult<()> {
        debug1!("pg_viewsync: {}", statement);
        let ddl_error = |error: String, code: Option<PgSqlErrorCode>| ViewSyncError::Ddl {
            name: name.to_string(),
            statement: statement.to_string(),
            error,
            code,
        };
        subtransaction(true, || Spi::run(statement).map_err(|e| ddl_error(e.to_string(), None)))
            .map_err(|e| ddl_error(e.message, Some(e.code)))?
    }

    fn atomically<T, F>(&mut self, work: F) -> ViewSyncResult<T>
    where
        F: FnOnce(&mut Self) -> ViewSyncResult<T>,
    {
        subtransaction(true, || work(self)).map_err(|e| ViewSyncError::Spi {
            query: "subtransaction".to_string(),
            error: e.message,
        })?
    }

    fn select_json(&mut self, name: &QualifiedName, query: &str) -> ViewSyncResult<Vec<serde_json::Value>> {
        subtransaction(true, || {
            let rows: spi::Result<Vec<serde_json::Value>> = Spi::connect(|client| {
                let rows = client.select(query, None, &[])?;
                let mut out = Vec::new();
                for row in rows {
                    if let Some(pgrx::JsonB(value)) = row["row"].value::<pgrx::JsonB>()? {
                        out.push(value);
                    }
                }
                Ok(out)
            });
            rows.map_err(|e| ViewSyncError::Spi {
                query: query.to_string(),
                error: e.to_string(),
            })
        })
        .map_err(|e| {
            if e.code == PgSqlErrorCode::ERRCODE_OBJECT_NOT_IN_PREREQUISITE_STATE {
                ViewSyncError::NotPopulated { name: name.to_string() }
            } else {
                ViewSyncError::Spi {
                    query: query.to_string(),
                    error: e.message,
                }
            }
        })?
    }
}
