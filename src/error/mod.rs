use std::borrow::Cow;
use std::fmt;

use pgrx::prelude::PgSqlErrorCode;

#[cfg(any(test, feature = "pg_test"))]
pub mod testing;

/// Main error type for pg_viewsync
#[derive(Debug, Clone, PartialEq)]
pub enum ViewSyncError {
    // ============ Declaration Errors (42xxx) ============
    /// Malformed view declaration (bad SQL provider output, kind/index conflict)
    Configuration {
        name: String,
        reason: String,
    },

    /// Invalid identifier in a view, schema, column or index name
    InvalidIdentifier {
        parameter: String,
        value: String,
        reason: String,
    },

    /// The same qualified name was registered twice
    RegistryConflict {
        name: String,
    },

    /// No declaration with that name is registered
    NotRegistered {
        name: String,
    },

    // ============ Dependency Errors (55xxx) ============
    /// Dependency cycle among declared views
    CyclicDependency {
        cycle: Vec<String>,
    },

    // ============ Catalog Errors ============
    /// Catalog query for one object failed
    Inspection {
        name: String,
        reason: String,
    },

    /// DDL statement rejected by the database
    Ddl {
        name: String,
        statement: String,
        error: String,
        /// Server error code, when the server raised one
        code: Option<PgSqlErrorCode>,
    },

    // ============ Refresh Errors (55xxx) ============
    /// Concurrent refresh requested without a covering unique index
    ConcurrentRefreshUnsupported {
        name: String,
        columns: Vec<String>,
    },

    /// Materialized view created WITH NO DATA and never refreshed
    NotPopulated {
        name: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// SPI operation failed
    Spi {
        query: String,
        error: String,
    },

    /// Serialization/deserialization failed
    Serialization {
        message: String,
    },

    /// Internal error (bug in extension)
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl ViewSyncError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> Cow<'static, str> {
        use ViewSyncError::*;
        if let Ddl { code: Some(code), .. } = self {
            return Cow::Owned(sqlstate_of(*code));
        }
        Cow::Borrowed(match self {
            Configuration { .. } => "42P17", // Invalid object definition
            InvalidIdentifier { .. } => "42602", // Invalid name
            RegistryConflict { .. } => "42710", // Duplicate object
            NotRegistered { .. } => "42704", // Undefined object

            CyclicDependency { .. } => "55P03", // Lock not available (cycle)

            Inspection { .. } => "58000", // System error
            Ddl { .. } => "2BP01", // DDL failure without a server code

            ConcurrentRefreshUnsupported { .. } => "0A000", // Feature not supported
            NotPopulated { .. } => "55000", // Object not in prerequisite state

            Spi { .. } => "XX000",
            Serialization { .. } => "22P02", // Invalid text representation
            Internal { .. } => "XX001",
        })
    }

    /// Error code to raise at the SQL boundary; matches `sqlstate()`
    pub fn error_code(&self) -> PgSqlErrorCode {
        use PgSqlErrorCode::*;
        use ViewSyncError::*;
        match self {
            Configuration { .. } => ERRCODE_INVALID_OBJECT_DEFINITION,
            InvalidIdentifier { .. } => ERRCODE_INVALID_NAME,
            RegistryConflict { .. } => ERRCODE_DUPLICATE_OBJECT,
            NotRegistered { .. } => ERRCODE_UNDEFINED_OBJECT,
            CyclicDependency { .. } => ERRCODE_LOCK_NOT_AVAILABLE,
            Inspection { .. } => ERRCODE_SYSTEM_ERROR,
            Ddl { code: Some(code), .. } => *code,
            Ddl { code: None, .. } => ERRCODE_DEPENDENT_OBJECTS_STILL_EXIST,
            ConcurrentRefreshUnsupported { .. } => ERRCODE_FEATURE_NOT_SUPPORTED,
            NotPopulated { .. } => ERRCODE_OBJECT_NOT_IN_PREREQUISITE_STATE,
            Spi { .. } => ERRCODE_INTERNAL_ERROR,
            Serialization { .. } => ERRCODE_INVALID_TEXT_REPRESENTATION,
            Internal { .. } => ERRCODE_DATA_CORRUPTED,
        }
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        ViewSyncError::Internal { message, file, line }
    }

    /// Shorthand for a configuration error on one declaration
    pub fn configuration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ViewSyncError::Configuration {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Name of the object the error is attached to, if any
    pub fn object_name(&self) -> Option<&str> {
        use ViewSyncError::*;
        match self {
            Configuration { name, .. }
            | RegistryConflict { name }
            | NotRegistered { name }
            | Inspection { name, .. }
            | Ddl { name, .. }
            | ConcurrentRefreshUnsupported { name, .. }
            | NotPopulated { name } => Some(name),
            _ => None,
        }
    }
}

/// Five-character SQLSTATE packed into `code` six bits per character
fn sqlstate_of(code: PgSqlErrorCode) -> String {
    let packed = code as i32;
    (0..5)
        .map(|i| char::from(((packed >> (6 * i)) & 0x3F) as u8 + b'0'))
        .collect()
}

/// Prefix of `s` no longer than `max` bytes, cut on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl fmt::Display for ViewSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ViewSyncError::*;
        match self {
            Configuration { name, reason } => {
                write!(f, "Invalid view declaration '{}': {}", name, reason)
            }
            InvalidIdentifier { parameter, value, reason } => {
                write!(f, "Invalid identifier for '{}' ({}): {}", parameter, value, reason)
            }
            RegistryConflict { name } => {
                write!(f, "View '{}' is already registered", name)
            }
            NotRegistered { name } => {
                write!(f, "View '{}' is not registered", name)
            }
            CyclicDependency { cycle } => {
                write!(f, "Circular dependency detected: {}", cycle.join(" → "))
            }
            Inspection { name, reason } => {
                write!(f, "Catalog inspection of '{}' failed: {}", name, reason)
            }
            Ddl { name, statement, error, .. } => {
                write!(f, "DDL for '{}' failed: {}\nStatement: {}", name, error, truncate(statement, 200))
            }
            ConcurrentRefreshUnsupported { name, columns } => {
                if columns.is_empty() {
                    write!(f, "Materialized view '{}' has no concurrent index declared; \
                               cannot refresh concurrently", name)
                } else {
                    write!(f, "Materialized view '{}' has no unique index on ({}); \
                               cannot refresh concurrently", name, columns.join(", "))
                }
            }
            NotPopulated { name } => {
                write!(f, "Materialized view '{}' has not been populated. \
                           Run pg_viewsync_refresh first.", name)
            }
            Spi { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error, truncate(query, 100))
            }
            Serialization { message } => {
                write!(f, "Serialization error: {}", message)
            }
            Internal { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for ViewSyncError {}

/// Result type for view sync operations
pub type ViewSyncResult<T> = Result<T, ViewSyncError>;

/// Convert SpiError to ViewSyncError
impl From<pgrx::spi::Error> for ViewSyncError {
    fn from(e: pgrx::spi::Error) -> Self {
        ViewSyncError::Spi {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to ViewSyncError
impl From<serde_json::Error> for ViewSyncError {
    fn from(e: serde_json::Error) -> Self {
        ViewSyncError::Serialization {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ViewSyncError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ViewSyncError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

/// Helper macro for requiring a value or returning error
#[macro_export]
macro_rules! require {
    ($opt:expr, $err:expr) => {
        match $opt {
            Some(v) => v,
            None => return Err($err),
        }
    };
}
