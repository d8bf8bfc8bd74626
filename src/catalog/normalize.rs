//! Definition text normalization.
//!
//! Both sides of a definition comparison go through the same normalizer:
//! the live `pg_get_viewdef` text and the declared SQL after the server has
//! canonicalized it (or the raw declared SQL when canonicalization failed).

/// Strategy for making two definitions comparable
pub trait DefinitionNormalizer {
    fn normalize(&self, sql: &str) -> String;
}

/// Collapses whitespace outside quoted text and drops trailing semicolons.
///
/// Case is preserved; the server already folds unquoted identifiers and
/// keywords when it canonicalizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceNormalizer;

impl DefinitionNormalizer for WhitespaceNormalizer {
    fn normalize(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut quote: Option<char> = None;
        let mut pending_space = false;

        for c in sql.trim().chars() {
            if let Some(q) = quote {
                out.push(c);
                if c == q {
                    quote = None;
                }
                continue;
            }

            if c.is_whitespace() {
                pending_space = true;
                continue;
            }

            if pending_space {
                if !out.is_empty() && !out.ends_with('(') && c != ')' {
                    out.push(' ');
                }
                pending_space = false;
            }
            if c == '\'' || c == '"' {
                quote = Some(c);
            }
            out.push(c);
        }

        while out.ends_with(';') {
            out.pop();
            while out.ends_with(' ') {
                out.pop();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(sql: &str) -> String {
        WhitespaceNormalizer.normalize(sql)
    }

    #[test]
    fn test_collapses_whitespace() {
        assert_eq!(norm(" SELECT  a,\n\t b\n FROM t; "), "SELECT a, b FROM t");
    }

    #[test]
    fn test_parentheses_spacing() {
        assert_eq!(norm("SELECT count( * ) FROM ( SELECT 1 ) s"), "SELECT count(*) FROM (SELECT 1) s");
    }

    #[test]
    fn test_quoted_text_preserved() {
        assert_eq!(norm("SELECT 'a   b' AS \"x  y\""), "SELECT 'a   b' AS \"x  y\"");
    }

    #[test]
    fn test_pg_get_viewdef_layout_matches_flat_text() {
        let live = " SELECT t.id,\n    t.name\n   FROM t\n  WHERE (t.id > 1);";
        let declared = "SELECT t.id, t.name FROM t WHERE (t.id > 1)";
        assert_eq!(norm(live), norm(declared));
    }

    #[test]
    fn test_case_is_preserved() {
        assert_ne!(norm("SELECT A FROM t"), norm("select a from t"));
    }
}
