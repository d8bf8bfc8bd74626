use pgrx::prelude::*;

use crate::definition::{IndexSpec, QualifiedName, SqlProvider, ViewDeclaration, ViewKind};
use crate::error::{ViewSyncError, ViewSyncResult};
use crate::registry::ViewRegistry;
use crate::utils::{bool_arg, jsonb_arg, nullable_text_arg, subtransaction, text_arg, text_array_arg};

// Registry and sync log tables, created with the extension
extension_sql!(
    r"
    CREATE TABLE IF NOT EXISTS public.pg_viewsync_registry (
        name TEXT NOT NULL PRIMARY KEY,
        materialized BOOLEAN NOT NULL DEFAULT FALSE,
        definition TEXT,
        params JSONB,
        provider TEXT,
        dependencies TEXT[] NOT NULL DEFAULT '{}',
        concurrent_index TEXT,
        with_data BOOLEAN NOT NULL DEFAULT TRUE,
        indexes JSONB NOT NULL DEFAULT '[]',
        position BIGSERIAL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK (definition IS NOT NULL OR provider IS NOT NULL)
    );

    CREATE TABLE IF NOT EXISTS public.pg_viewsync_sync_log (
        id BIGSERIAL PRIMARY KEY,
        view_name TEXT NOT NULL,
        decision TEXT,
        outcome TEXT NOT NULL,
        forced BOOLEAN NOT NULL DEFAULT FALSE,
        changed BOOLEAN NOT NULL DEFAULT FALSE,
        performed_by TEXT NOT NULL DEFAULT current_user,
        details JSONB NOT NULL DEFAULT '{}',
        logged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    COMMENT ON TABLE public.pg_viewsync_registry IS 'Declared views managed by pg_viewsync';
    COMMENT ON TABLE public.pg_viewsync_sync_log IS 'One row per view per pg_viewsync_sync run';
    ",
    name = "create_metadata_tables",
);

const LOAD_QUERY: &str = "\
    SELECT name, materialized, definition, params, provider, dependencies, \
           concurrent_index, with_data, indexes \
    FROM public.pg_viewsync_registry \
    ORDER BY position";

/// One row of `pg_viewsync_registry`
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRow {
    pub name: String,
    pub materialized: bool,
    pub definition: Option<String>,
    pub params: Option<serde_json::Value>,
    pub provider: Option<String>,
    pub dependencies: Vec<String>,
    pub concurrent_index: Option<String>,
    pub with_data: bool,
    pub indexes: Vec<IndexSpec>,
}

impl RegistryRow {
    /// Declaration for this row; `provider` rows call their SQL function at
    /// extraction time
    pub fn into_declaration(self) -> ViewSyncResult<ViewDeclaration> {
        let kind = if self.materialized { ViewKind::Materialized } else { ViewKind::View };

        let mut decl = match (self.provider, self.definition) {
            (Some(provider), _) => ViewDeclaration::dynamic(&self.name, kind, sql_function_provider(&provider)?),
            (None, Some(definition)) => match self.params {
                Some(params) if !params.is_null() => {
                    let provider: SqlProvider = Box::new(move || Ok((definition.clone(), params.clone())));
                    ViewDeclaration::dynamic(&self.name, kind, provider)
                }
                _ if self.materialized => ViewDeclaration::materialized(&self.name, &definition),
                _ => ViewDeclaration::view(&self.name, &definition),
            },
            (None, None) => {
                return Err(ViewSyncError::configuration(self.name, "neither definition nor provider given"));
            }
        };

        decl.dependencies = self.dependencies;
        decl.concurrent_index = self.concurrent_index;
        decl.with_data = self.with_data;
        decl.indexes = self.indexes;
        Ok(decl)
    }
}

/// Provider backed by a SQL function returning `(query text, params jsonb)`
fn sql_function_provider(function: &str) -> ViewSyncResult<SqlProvider> {
    let function = QualifiedName::parse(function, "public")?;
    let query = format!("SELECT query, params FROM {}()", function.to_sql());

    Ok(Box::new(move || -> ViewSyncResult<(String, serde_json::Value)> {
        let outcome = subtransaction(true, || {
            let row: spi::Result<(Option<String>, Option<pgrx::JsonB>)> = Spi::connect(|client| {
                let mut rows = client.select(&query, Some(1), &[])?;
                match rows.next() {
                    Some(row) => Ok((row["query"].value::<String>()?, row["params"].value::<pgrx::JsonB>()?)),
                    None => Ok((None, None)),
                }
            });
            row.map_err(|e| ViewSyncError::Spi {
                query: query.clone(),
                error: e.to_string(),
            })
        })
        .map_err(|e| ViewSyncError::configuration(function.to_string(), e.message))??;

        match outcome {
            (Some(sql), params) => Ok((sql, params.map_or(serde_json::Value::Null, |p| p.0))),
            (None, _) => Err(ViewSyncError::configuration(function.to_string(), "provider returned no query")),
        }
    }))
}

/// All registry rows in registration order
pub fn load_rows() -> ViewSyncResult<Vec<RegistryRow>> {
    let rows: spi::Result<Vec<(RegistryRow, Option<pgrx::JsonB>)>> = Spi::connect(|client| {
        let mut out = Vec::new();
        for row in client.select(LOAD_QUERY, None, &[])? {
            let registry_row = RegistryRow {
                name: row["name"].value::<String>()?.unwrap_or_default(),
                materialized: row["materialized"].value::<bool>()?.unwrap_or(false),
                definition: row["definition"].value::<String>()?,
                params: row["params"].value::<pgrx::JsonB>()?.map(|p| p.0),
                provider: row["provider"].value::<String>()?,
                dependencies: row["dependencies"].value::<Vec<String>>()?.unwrap_or_default(),
                concurrent_index: row["concurrent_index"].value::<String>()?,
                with_data: row["with_data"].value::<bool>()?.unwrap_or(true),
                indexes: Vec::new(),
            };
            out.push((registry_row, row["indexes"].value::<pgrx::JsonB>()?));
        }
        Ok(out)
    });

    rows.map_err(|e| ViewSyncError::Spi {
        query: LOAD_QUERY.to_string(),
        error: e.to_string(),
    })?
    .into_iter()
    .map(|(mut row, indexes)| -> ViewSyncResult<RegistryRow> {
        if let Some(pgrx::JsonB(indexes)) = indexes {
            row.indexes = serde_json::from_value(indexes)?;
        }
        Ok(row)
    })
    .collect()
}

/// Build a `ViewRegistry` from `pg_viewsync_registry`
pub fn load_registry(default_schema: &str) -> ViewSyncResult<ViewRegistry> {
    let mut registry = ViewRegistry::new(default_schema);
    for row in load_rows()? {
        registry.register(row.into_declaration()?)?;
    }
    Ok(registry)
}

pub fn is_registered(name: &QualifiedName) -> ViewSyncResult<bool> {
    Spi::get_one_with_args::<bool>(
        "SELECT EXISTS (SELECT 1 FROM public.pg_viewsync_registry WHERE name = $1)",
        &[text_arg(&name.to_string())],
    )
    .map(|found| found.unwrap_or(false))
    .map_err(|e| ViewSyncError::Spi {
        query: "check registry entry".to_string(),
        error: e.to_string(),
    })
}

/// Insert one validated row; `row.name` must already be qualified
pub fn insert_row(row: &RegistryRow) -> ViewSyncResult<()> {
    let indexes = serde_json::to_value(&row.indexes)?;
    let args = [
        text_arg(&row.name),
        bool_arg(row.materialized),
        nullable_text_arg(row.definition.as_deref()),
        unsafe {
            pgrx::datum::DatumWithOid::new(
                row.params.clone().map(pgrx::JsonB),
                PgOid::BuiltIn(PgBuiltInOids::JSONBOID).value(),
            )
        },
        nullable_text_arg(row.provider.as_deref()),
        text_array_arg(row.dependencies.clone()),
        nullable_text_arg(row.concurrent_index.as_deref()),
        bool_arg(row.with_data),
        jsonb_arg(indexes),
    ];

    Spi::run_with_args(
        "INSERT INTO public.pg_viewsync_registry \
         (name, materialized, definition, params, provider, dependencies, concurrent_index, with_data, indexes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        &args,
    )
    .map_err(|e| ViewSyncError::Spi {
        query: "insert registry entry".to_string(),
        error: e.to_string(),
    })
}

/// Remove a registry row; true if one existed
pub fn delete_row(name: &QualifiedName) -> ViewSyncResult<bool> {
    Spi::get_one_with_args::<bool>(
        "WITH gone AS (DELETE FROM public.pg_viewsync_registry WHERE name = $1 RETURNING 1) \
         SELECT count(*) > 0 FROM gone",
        &[text_arg(&name.to_string())],
    )
    .map(|found| found.unwrap_or(false))
    .map_err(|e| ViewSyncError::Spi {
        query: "delete registry entry".to_string(),
        error: e.to_string(),
    })
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    fn row(name: &str) -> RegistryRow {
        RegistryRow {
            name: name.to_string(),
            materialized: false,
            definition: Some("SELECT 1 AS one".to_string()),
            params: None,
            provider: None,
            dependencies: Vec::new(),
            concurrent_index: None,
            with_data: true,
            indexes: Vec::new(),
        }
    }

    #[pg_test]
    fn test_registry_tables_exist() {
        let exists = Spi::get_one::<bool>(
            "SELECT COUNT(*) = 2 FROM information_schema.tables
             WHERE table_schema = 'public'
               AND table_name IN ('pg_viewsync_registry', 'pg_viewsync_sync_log')",
        )
        .unwrap()
        .unwrap();
        assert!(exists);
    }

    #[pg_test]
    fn test_insert_and_load_round_trip_keeps_order() {
        let mut second = row("public.v_second");
        second.materialized = true;
        second.concurrent_index = Some("one".to_string());
        second.indexes = vec![IndexSpec::new("v_second_one_idx", &["one"])];
        second.dependencies = vec!["public.v_first".to_string()];

        insert_row(&row("public.v_first")).unwrap();
        insert_row(&second).unwrap();

        let loaded = load_rows().unwrap();
        assert_eq!(loaded, vec![row("public.v_first"), second]);

        let registry = load_registry("public").unwrap();
        let names: Vec<String> = registry.iter().map(|v| v.name.to_string()).collect();
        assert_eq!(names, vec!["public.v_first", "public.v_second"]);
    }

    #[pg_test]
    fn test_delete_row() {
        insert_row(&row("public.v_gone")).unwrap();
        let name = QualifiedName::new("public", "v_gone");
        assert!(is_registered(&name).unwrap());
        assert!(delete_row(&name).unwrap());
        assert!(!delete_row(&name).unwrap());
    }

    #[pg_test]
    fn test_sql_function_provider() {
        Spi::run(
            "CREATE FUNCTION public.recent_orders_sql(OUT query text, OUT params jsonb) AS $$
                SELECT 'SELECT g AS n FROM generate_series(1, 10) g WHERE g > $1', '[7]'::jsonb
             $$ LANGUAGE sql",
        )
        .unwrap();

        let mut dynamic = row("public.v_dynamic");
        dynamic.definition = None;
        dynamic.provider = Some("public.recent_orders_sql".to_string());
        let mut registry = ViewRegistry::new("public");
        registry.register(dynamic.into_declaration().unwrap()).unwrap();

        let view = registry.get(&QualifiedName::new("public", "v_dynamic")).unwrap();
        let def = crate::definition::extract(view).unwrap();
        assert_eq!(def.bound_sql().unwrap(), "SELECT g AS n FROM generate_series(1, 10) g WHERE g > 7");
    }

    #[pg_test]
    fn test_missing_provider_is_configuration_error() {
        let mut dynamic = row("public.v_nowhere");
        dynamic.definition = None;
        dynamic.provider = Some("public.no_such_function".to_string());
        let mut registry = ViewRegistry::new("public");
        registry.register(dynamic.into_declaration().unwrap()).unwrap();

        let view = registry.get(&QualifiedName::new("public", "v_nowhere")).unwrap();
        crate::error::testing::assert_error_sqlstate(crate::definition::extract(view), "42P17");
    }
}
