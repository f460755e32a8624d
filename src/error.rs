//! Error types for sidemantic.
//!
//! One variant per entry in the error taxonomy; each carries enough context
//! to reconstruct the offending input without round-tripping through the
//! graph again.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SidemanticError {
    #[error("duplicate {kind}: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("unknown {kind} reference: {name}{}", in_model.as_ref().map(|m| format!(" (in model {m})")).unwrap_or_default())]
    UnknownReference {
        kind: &'static str,
        name: String,
        in_model: Option<String>,
    },

    #[error("ambiguous reference {name}: candidates {candidates:?}")]
    AmbiguousReference { name: String, candidates: Vec<String> },

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid numeric parameter value: {0}")]
    InvalidNumericParameter(String),

    #[error("unsafe identifier parameter value: {0}")]
    UnsafeIdentifierParameter(String),

    #[error("unparseable SQL: {message}{}", position.map(|p| format!(" at position {p}")).unwrap_or_default())]
    UnparseableSql { message: String, position: Option<usize> },

    #[error("aggregate function {function} must be defined as a metric (expression: {expression}). {suggestion}")]
    AggregatesMustBeMetrics {
        function: String,
        expression: String,
        suggestion: String,
    },

    #[error("explicit JOIN is not supported; joins are discovered from the semantic graph")]
    ExplicitJoinUnsupported,

    #[error("metric {metric} requires a time dimension in the request")]
    MissingTimeDimension { metric: String },

    #[error("unsupported granularity {requested} for dimension {dim} (allowed: {allowed:?})")]
    UnsupportedGranularity {
        dim: String,
        requested: String,
        allowed: Vec<String>,
    },

    #[error("unsupported symmetric aggregate {agg} on model {model}")]
    UnsupportedSymmetricAgg { agg: String, model: String },

    #[error("no join path found between {from} and {to}")]
    NoJoinPath { from: String, to: String },

    #[error("unsupported metric type: {0}")]
    UnsupportedMetricType(String),

    #[error("input SQL too large ({size} bytes, limit {limit} bytes)")]
    InputTooLarge { size: usize, limit: usize },

    #[error("unresolvable dependency: {0}")]
    UnresolvableDependency(String),

    #[error("unsupported metric composition: {0}")]
    UnsupportedMetricComposition(String),

    #[error("incompatible comparison granularity: {comparison_type} against {request_granularity}")]
    IncompatibleComparisonGranularity {
        comparison_type: String,
        request_granularity: String,
    },

    #[error("graph is sealed; mutation requires returning to Build phase")]
    GraphSealed,
}

pub type Result<T> = std::result::Result<T, SidemanticError>;
