//! DDL Statement Builders
//!
//! Every statement the sync engine executes is rendered here:
//! - **CREATE**: `CREATE [MATERIALIZED] VIEW .. AS ..`, honoring `WITH NO DATA`
//! - **REPLACE**: `CREATE OR REPLACE VIEW` for compatible plain-view changes
//! - **DROP**: views and indexes, `CASCADE` only when asked for
//! - **INDEX**: `CREATE [UNIQUE] INDEX` on a materialized view
//! - **REFRESH**: plain or `CONCURRENTLY`
//!
//! Builders are pure. Names have been validated as plain identifiers before
//! they get here; `quote_ident` still quotes the ones the server would fold
//! or reject unquoted.

pub mod params;

use crate::definition::{IndexSpec, QualifiedName, ViewDefinition, ViewKind};
use crate::error::ViewSyncResult;

/// Keywords that cannot stand as a bare relation or column name
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both", "case", "cast",
    "check", "collate", "column", "constraint", "create", "current_catalog", "current_date", "current_role",
    "current_time", "current_timestamp", "current_user", "default", "deferrable", "desc", "distinct", "do",
    "else", "end", "except", "false", "fetch", "for", "foreign", "from", "grant", "group", "having", "in",
    "initially", "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references", "returning", "select",
    "session_user", "some", "symmetric", "table", "then", "to", "trailing", "true", "union", "unique", "user",
    "using", "variadic", "when", "where", "window", "with",
];

/// Quote an identifier if it would not survive unquoted
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
        && !RESERVED.contains(&ident);

    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// `CREATE [MATERIALIZED] VIEW name AS select [WITH NO DATA]`
pub fn create_view(def: &ViewDefinition) -> ViewSyncResult<String> {
    let select = def.bound_sql()?;
    let mut sql = format!("CREATE {} {} AS {}", def.kind.sql_keyword(), def.name.to_sql(), select);
    if def.kind == ViewKind::Materialized && !def.with_data {
        sql.push_str(" WITH NO DATA");
    }
    Ok(sql)
}

/// `CREATE OR REPLACE VIEW`; plain views only
pub fn replace_view(def: &ViewDefinition) -> ViewSyncResult<String> {
    Ok(format!("CREATE OR REPLACE VIEW {} AS {}", def.name.to_sql(), def.bound_sql()?))
}

pub fn drop_view(name: &QualifiedName, kind: ViewKind, cascade: bool) -> String {
    let mut sql = format!("DROP {} IF EXISTS {}", kind.sql_keyword(), name.to_sql());
    if cascade {
        sql.push_str(" CASCADE");
    }
    sql
}

pub fn create_index(view: &QualifiedName, index: &IndexSpec) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        view.to_sql(),
        column_list(&index.columns)
    )
}

/// Indexes live in the view's schema
pub fn drop_index(view: &QualifiedName, index_name: &str) -> String {
    format!(
        "DROP INDEX IF EXISTS {}.{}",
        quote_ident(&view.schema),
        quote_ident(index_name)
    )
}

pub fn refresh_view(name: &QualifiedName, concurrently: bool) -> String {
    format!(
        "REFRESH MATERIALIZED VIEW {}{}",
        if concurrently { "CONCURRENTLY " } else { "" },
        name.to_sql()
    )
}

/// Row reader used by the populated-guarded query helper
pub fn select_rows_as_json(name: &QualifiedName) -> String {
    format!("SELECT to_jsonb(r) AS row FROM {} AS r", name.to_sql())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{extract, DeclaredView, ViewDeclaration};

    fn def(decl: ViewDeclaration) -> ViewDefinition {
        extract(&DeclaredView::qualify(decl, "public").unwrap()).unwrap()
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("v_users"), "v_users");
        assert_eq!(quote_ident("Users"), "\"Users\"");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("col$1"), "col$1");
    }

    #[test]
    fn test_create_materialized_with_no_data() {
        let d = def(ViewDeclaration::materialized("mv", "SELECT 1 AS a").with_data(false));
        assert_eq!(
            create_view(&d).unwrap(),
            "CREATE MATERIALIZED VIEW public.mv AS SELECT 1 AS a WITH NO DATA"
        );
    }

    #[test]
    fn test_create_plain_view() {
        let d = def(ViewDeclaration::view("reporting.v", "SELECT 1"));
        assert_eq!(create_view(&d).unwrap(), "CREATE VIEW reporting.v AS SELECT 1");
        assert_eq!(replace_view(&d).unwrap(), "CREATE OR REPLACE VIEW reporting.v AS SELECT 1");
    }

    #[test]
    fn test_drop_statements() {
        let name = QualifiedName::new("public", "mv");
        assert_eq!(
            drop_view(&name, ViewKind::Materialized, false),
            "DROP MATERIALIZED VIEW IF EXISTS public.mv"
        );
        assert_eq!(drop_view(&name, ViewKind::View, true), "DROP VIEW IF EXISTS public.mv CASCADE");
        assert_eq!(drop_index(&name, "mv_a_idx"), "DROP INDEX IF EXISTS public.mv_a_idx");
    }

    #[test]
    fn test_create_index() {
        let name = QualifiedName::new("public", "mv");
        let idx = IndexSpec::new("mv_id_day_index", &["id", "day"]).unique();
        assert_eq!(
            create_index(&name, &idx),
            "CREATE UNIQUE INDEX mv_id_day_index ON public.mv (id, day)"
        );
    }

    #[test]
    fn test_refresh() {
        let name = QualifiedName::new("public", "mv");
        assert_eq!(refresh_view(&name, false), "REFRESH MATERIALIZED VIEW public.mv");
        assert_eq!(refresh_view(&name, true), "REFRESH MATERIALIZED VIEW CONCURRENTLY public.mv");
    }
}
