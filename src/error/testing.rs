//! Assertions shared by the unit and `pg_test` suites.

use crate::definition::QualifiedName;
use crate::sync::{FailureReason, FailureStage, Outcome, SyncReport};

/// # Panics
/// Panics if the result is `Ok` or carries a different SQLSTATE.
pub fn assert_error_sqlstate<T>(result: crate::ViewSyncResult<T>, expected_sqlstate: &str) {
    match result {
        Err(e) => {
            assert_eq!(
                e.sqlstate(),
                expected_sqlstate,
                "Expected SQLSTATE {expected_sqlstate}, got {}: {e}",
                e.sqlstate()
            );
        }
        Ok(_) => {
            panic!("Expected error with SQLSTATE {expected_sqlstate}, but operation succeeded");
        }
    }
}

/// # Panics
/// Panics if the result is `Ok` or its message lacks `expected_substring`.
pub fn assert_error_contains<T>(result: crate::ViewSyncResult<T>, expected_substring: &str) {
    match result {
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains(expected_substring),
                "Error message '{message}' does not contain '{expected_substring}'"
            );
        }
        Ok(_) => {
            panic!("Expected error containing '{expected_substring}', but operation succeeded");
        }
    }
}

/// Outcome of `name` (unqualified names are taken as `public`)
///
/// # Panics
/// Panics if the report has no entry for `name`.
pub fn outcome_of<'r>(report: &'r SyncReport, name: &str) -> &'r Outcome {
    let qualified = match name.split_once('.') {
        Some((schema, view)) => QualifiedName::new(schema, view),
        None => QualifiedName::new("public", name),
    };
    report
        .outcome(&qualified)
        .unwrap_or_else(|| panic!("no report entry for {qualified}: {report:?}"))
}

/// Asserts that `name` failed at `stage` and returns the reason
///
/// # Panics
/// Panics if `name` did not fail, or failed at another stage.
pub fn assert_failed_at<'r>(report: &'r SyncReport, name: &str, stage: FailureStage) -> &'r FailureReason {
    match outcome_of(report, name) {
        Outcome::Failed(reason) => {
            assert_eq!(reason.stage, stage, "{name} failed at {} ({reason}), expected {stage}", reason.stage);
            reason
        }
        other => panic!("Expected {name} to fail at {stage}, got {other}"),
    }
}
