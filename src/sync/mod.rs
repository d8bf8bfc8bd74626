//! View Synchronization
//!
//! Drives declared views toward the catalog, one object at a time in
//! dependency order:
//!
//! ```text
//! registry ─► extract ─► build_order ─► for each view:
//!                                          inspect ─► plan ─► execute ─► event
//! ```
//!
//! A failure on one object is recorded in the report and the run moves on.
//! Only a dependency cycle, or a problem before the first object is touched,
//! makes `ViewSyncer::sync` return `Err`.

pub mod clear;
pub mod executor;
pub mod query;
pub mod refresh;

#[cfg(any(test, feature = "pg_test"))]
mod tests;

use std::fmt;

use chrono::{DateTime, Utc};
use pgrx::prelude::*;
use serde::Serialize;

use crate::definition::QualifiedName;
use crate::plan::Decision;

pub use clear::clear_views;
pub use executor::ViewSyncer;
pub use query::query_view;
pub use refresh::{refresh_view, refresh_views};

/// Per-run switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Drop and recreate views whose definition changed
    pub force: bool,
    /// Compare existing objects; when off, existing objects are left as
    /// they are and only missing ones are created
    pub update: bool,
    /// Drop with CASCADE
    pub cascade: bool,
    /// Try `CREATE OR REPLACE VIEW` on changed plain views first
    pub replace_compatible: bool,
    /// Skipped conflicts make the run fail
    pub fail_on_conflict: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            update: true,
            cascade: false,
            replace_compatible: false,
            fail_on_conflict: false,
        }
    }
}

impl SyncOptions {
    /// Options from the session's GUCs
    pub fn from_gucs(force: bool, update: bool) -> Self {
        Self {
            force,
            update,
            cascade: crate::config::cascade_drops(),
            replace_compatible: crate::config::replace_compatible(),
            fail_on_conflict: crate::config::fail_on_conflict(),
        }
    }
}

/// Step of an object's sync at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Configuration,
    Dependency,
    Inspection,
    Create,
    Index,
    Refresh,
    Drop,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStage::Configuration => "configuration",
            FailureStage::Dependency => "dependency",
            FailureStage::Inspection => "inspection",
            FailureStage::Create => "create",
            FailureStage::Index => "index",
            FailureStage::Refresh => "refresh",
            FailureStage::Drop => "drop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub stage: FailureStage,
    pub message: String,
    /// The old object had been dropped when the failure hit; the drop was
    /// rolled back and the old object kept
    pub after_drop: bool,
}

impl FailureReason {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            after_drop: false,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)?;
        if self.after_drop {
            f.write_str(" (replace rolled back, existing object kept)")?;
        }
        Ok(())
    }
}

/// Final status of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Created,
    /// Changed in place by `CREATE OR REPLACE VIEW`
    Updated,
    Unchanged,
    /// Existing materialized view whose indexes or data were reconciled
    Synced,
    SkippedConflict,
    Dropped,
    Failed(FailureReason),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "CREATED",
            Outcome::Updated => "UPDATED",
            Outcome::Unchanged => "UNCHANGED",
            Outcome::Synced => "SYNCED",
            Outcome::SkippedConflict => "SKIPPED_CONFLICT",
            Outcome::Dropped => "DROPPED",
            Outcome::Failed(_) => "FAILED",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Outcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object's line in the report; also the event sent to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncEvent {
    pub name: QualifiedName,
    /// `None` when the object failed before a decision was made
    pub decision: Option<Decision>,
    pub forced: bool,
    pub status: Outcome,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entries: Vec<SyncEvent>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn new(entries: Vec<SyncEvent>) -> Self {
        Self {
            entries,
            finished_at: Utc::now(),
        }
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&SyncEvent> {
        self.entries.iter().find(|e| &e.name == name)
    }

    pub fn outcome(&self, name: &QualifiedName) -> Option<&Outcome> {
        self.get(name).map(|e| &e.status)
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.status)).count()
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failure)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == Outcome::SkippedConflict)
    }

    /// Process-style status: 1 if anything failed, or anything was skipped
    /// and `fail_on_conflict` is set
    pub fn exit_code(&self, fail_on_conflict: bool) -> i32 {
        if self.failed() > 0 || (fail_on_conflict && self.skipped() > 0) {
            1
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} synced, {} unchanged, {} skipped, {} dropped, {} failed",
            self.count(|o| *o == Outcome::Created),
            self.count(|o| *o == Outcome::Updated),
            self.count(|o| *o == Outcome::Synced),
            self.count(|o| *o == Outcome::Unchanged),
            self.skipped(),
            self.count(|o| *o == Outcome::Dropped),
            self.failed(),
        )
    }
}

/// Receives per-object events and one end-of-run notification
pub trait SyncListener {
    fn view_synced(&mut self, event: &SyncEvent);

    /// Called once per run, after the last object, however the objects ended
    fn all_synced(&mut self, _report: &SyncReport) {}
}

/// Logs every event through the server log
#[derive(Debug, Default)]
pub struct LogListener;

impl SyncListener for LogListener {
    fn view_synced(&mut self, event: &SyncEvent) {
        let decision = event.decision.map_or("-", Decision::as_str);
        match &event.status {
            Outcome::Failed(reason) => {
                warning!("pg_viewsync: {} {} ({}): {}", event.name, event.status, decision, reason)
            }
            Outcome::SkippedConflict => warning!(
                "pg_viewsync: {} differs from its declaration; use force to replace it",
                event.name
            ),
            status => info!(
                "pg_viewsync: {} {} ({}{})",
                event.name,
                status,
                decision,
                if event.forced { ", forced" } else { "" }
            ),
        }
    }

    fn all_synced(&mut self, report: &SyncReport) {
        info!("pg_viewsync: sync finished: {}", report.summary());
    }
}
