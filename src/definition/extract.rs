//! Turns a registered declaration into a `ViewDefinition`.
//!
//! All checks that need no database happen here, so a broken declaration
//! fails with a Configuration error for that one object before any DDL runs.

use std::collections::HashSet;

use serde_json::Value;

use super::{DeclaredView, IndexSpec, SqlParam, SqlSource, ViewDefinition, ViewKind};
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::validation::{validate_column_list, validate_sql_identifier};

/// Extract the normalized definition of one registered view
pub fn extract(view: &DeclaredView) -> ViewSyncResult<ViewDefinition> {
    let name = view.name.to_string();
    let decl = &view.declaration;

    let (raw_sql, raw_params) = match &decl.source {
        SqlSource::Static(sql) => (sql.clone(), Value::Null),
        SqlSource::Dynamic(provider) => provider().map_err(|e| {
            ViewSyncError::configuration(&name, format!("SQL provider failed: {e}"))
        })?,
    };

    let select_sql = trim_statement(&raw_sql);
    if select_sql.is_empty() {
        return Err(ViewSyncError::configuration(&name, "definition SQL is empty"));
    }

    let params = params_from_json(&raw_params).map_err(|reason| ViewSyncError::configuration(&name, reason))?;

    let concurrent_index_columns = match &decl.concurrent_index {
        Some(raw) => parse_concurrent_index(raw),
        None => Vec::new(),
    };

    if decl.kind == ViewKind::View {
        if !concurrent_index_columns.is_empty() {
            return Err(ViewSyncError::configuration(
                &name,
                "concurrent_index is only valid on materialized views",
            ));
        }
        if !decl.indexes.is_empty() {
            return Err(ViewSyncError::configuration(&name, "indexes are only valid on materialized views"));
        }
    }

    if !concurrent_index_columns.is_empty() {
        validate_column_list(&concurrent_index_columns, "concurrent_index")
            .map_err(|e| ViewSyncError::configuration(&name, e.to_string()))?;
    }

    let mut seen = HashSet::new();
    let mut indexes = Vec::with_capacity(decl.indexes.len() + 1);
    for index in &decl.indexes {
        validate_sql_identifier(&index.name, "index_name")
            .and_then(|_| validate_column_list(&index.columns, "index_columns"))
            .map_err(|e| ViewSyncError::configuration(&name, e.to_string()))?;
        if !seen.insert(index.name.clone()) {
            return Err(ViewSyncError::configuration(
                &name,
                format!("index '{}' is declared more than once", index.name),
            ));
        }
        indexes.push(index.clone());
    }

    let mut definition = ViewDefinition {
        name: view.name.clone(),
        select_sql,
        params,
        kind: decl.kind,
        dependencies: view.dependencies.clone(),
        concurrent_index_columns,
        with_data: decl.kind == ViewKind::View || decl.with_data,
        indexes,
    };

    if let Some(index_name) = definition.concurrent_index_name() {
        let derived = IndexSpec {
            name: index_name,
            columns: definition.concurrent_index_columns.clone(),
            unique: true,
        };
        match definition.indexes.iter().find(|i| i.name == derived.name) {
            Some(existing) if *existing != derived => {
                return Err(ViewSyncError::configuration(
                    &name,
                    format!("index '{}' collides with the concurrent index", derived.name),
                ));
            }
            Some(_) => {}
            None => definition.indexes.push(derived),
        }
    }

    // Placeholders and params must agree before anything reaches the server
    definition.bound_sql()?;

    Ok(definition)
}

/// Split `"id, day"` into `["id", "day"]`; an empty string means none
pub fn parse_concurrent_index(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn trim_statement(sql: &str) -> String {
    let mut sql = sql.trim();
    while let Some(rest) = sql.strip_suffix(';') {
        sql = rest.trim_end();
    }
    sql.to_string()
}

/// `null` or a flat array of scalars
fn params_from_json(value: &Value) -> Result<Option<Vec<SqlParam>>, String> {
    let items = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => items,
        other => {
            return Err(format!(
                "params must be a flat ordered sequence or null, got {}",
                json_type(other)
            ))
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Null => Ok(SqlParam::Null),
            Value::Bool(b) => Ok(SqlParam::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(v) => Ok(SqlParam::Int(v)),
                None => n
                    .as_f64()
                    .map(SqlParam::Float)
                    .ok_or_else(|| format!("param ${} is not a representable number", i + 1)),
            },
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            other => Err(format!("param ${} must be a scalar, got {}", i + 1, json_type(other))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
