//! Dependency ordering of declared views
//!
//! Declared dependencies only; the catalog's own `pg_depend` data is never
//! consulted, so ordering works before any view exists.

pub mod graph;

pub use graph::DependencyGraph;
