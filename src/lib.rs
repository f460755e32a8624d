//! sidemantic: a SQL-first semantic layer compiler.
//!
//! Translates a catalog of models, dimensions, metrics, and relationships
//! into physical SQL, either from a structured [`sql::SemanticQuery`] or by
//! rewriting user-authored SQL written against the semantic dialect.

pub mod core;
pub mod error;
pub mod sql;

pub use error::{Result, SidemanticError};
