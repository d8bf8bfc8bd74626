//! Input Validation Module
//!
//! Every name that ends up spliced into generated DDL passes through here:
//! schema and view names, index names and index/concurrent-index columns.
//! Only plain PostgreSQL identifiers are accepted, so generated statements
//! never need to carry user-supplied quoting.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pg_viewsync::validation::validate_sql_identifier;
//!
//! validate_sql_identifier("v_user_stats", "view_name")?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MAX_IDENTIFIER_LENGTH;
use crate::error::{ViewSyncError, ViewSyncResult};

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
});

/// Validate a `PostgreSQL` identifier (schema, view, index or column name)
///
/// # Security
///
/// Prevents SQL injection by ensuring only safe identifier characters.
/// Allows: ASCII letters, digits, underscore and `$` (not leading)
/// Rejects: quotes, semicolons, dots, dashes, spaces, everything else
///
/// # Examples
///
/// ```rust,ignore
/// validate_sql_identifier("v_user", "view_name")?;          // ✓
/// validate_sql_identifier("user_data", "column")?;          // ✓
///
/// validate_sql_identifier("users; DROP TABLE", "view")?;    // ✗ SQL injection
/// validate_sql_identifier("my view", "view")?;              // ✗ Contains space
/// validate_sql_identifier("1st", "column")?;                // ✗ Leading digit
/// ```
pub fn validate_sql_identifier(identifier: &str, param_name: &str) -> ViewSyncResult<()> {
    if identifier.is_empty() {
        return Err(ViewSyncError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: identifier.to_string(),
            reason: "Identifier cannot be empty".to_string(),
        });
    }

    if identifier.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ViewSyncError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: format!("{} ({} chars)", sanitize_for_logging(identifier), identifier.len()),
            reason: format!("Identifier too long (max {MAX_IDENTIFIER_LENGTH} characters)"),
        });
    }

    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ViewSyncError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(identifier),
            reason: "Identifier cannot start with a digit".to_string(),
        });
    }

    if !IDENTIFIER_RE.is_match(identifier) {
        return Err(ViewSyncError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(identifier),
            reason: "Identifier must contain only letters, digits, '_' and '$'".to_string(),
        });
    }

    Ok(())
}

/// Validate every column of an index or concurrent-index column list
pub fn validate_column_list(columns: &[String], param_name: &str) -> ViewSyncResult<()> {
    if columns.is_empty() {
        return Err(ViewSyncError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: String::new(),
            reason: "Column list cannot be empty".to_string(),
        });
    }
    for column in columns {
        validate_sql_identifier(column, param_name)?;
    }
    Ok(())
}

/// Sanitize string for logging (truncate, remove control chars)
pub(crate) fn sanitize_for_logging(s: &str) -> String {
    let max_len = 50;
    let truncated = if s.len() > max_len {
        let cut = (0..=max_len).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &s[..cut])
    } else {
        s.to_string()
    };

    truncated
        .replace('\0', "\\0")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_sql_identifier("my_view", "test").is_ok());
        assert!(validate_sql_identifier("_hidden", "test").is_ok());
        assert!(validate_sql_identifier("UserStats", "test").is_ok());
        assert!(validate_sql_identifier("v1$archive", "test").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(validate_sql_identifier("", "test").is_err());
        assert!(validate_sql_identifier("view; DROP", "test").is_err());
        assert!(validate_sql_identifier("user-data", "test").is_err());
        assert!(validate_sql_identifier("my view", "test").is_err());
        assert!(validate_sql_identifier("\"quoted\"", "test").is_err());
        assert!(validate_sql_identifier("public.v", "test").is_err());
        assert!(validate_sql_identifier("123view", "test").is_err());
        assert!(validate_sql_identifier("$dollar", "test").is_err());
    }

    #[test]
    fn test_identifier_length_limit() {
        let ok = "a".repeat(63);
        let too_long = "a".repeat(64);
        assert!(validate_sql_identifier(&ok, "test").is_ok());
        let err = validate_sql_identifier(&too_long, "test").unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_column_list() {
        let cols = vec!["id".to_string(), "day".to_string()];
        assert!(validate_column_list(&cols, "concurrent_index").is_ok());
        assert!(validate_column_list(&[], "concurrent_index").is_err());
        let bad = vec!["id".to_string(), "lower(name)".to_string()];
        assert!(validate_column_list(&bad, "concurrent_index").is_err());
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("a\nb"), "a\\nb");
        let long = "x".repeat(80);
        assert!(sanitize_for_logging(&long).ends_with("..."));
    }
}
