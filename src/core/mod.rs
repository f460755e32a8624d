//! Core catalog types, the semantic graph, dependency resolution, and the
//! small self-contained helpers the generator and rewriter lean on.

pub mod dependency;
pub mod graph;
pub mod model;
pub mod parameter;
pub mod relative_date;
pub mod symmetric_aggregate;

pub use dependency::{extract_dependencies, extract_dependencies_in_model};
pub use graph::{JoinHop, JoinPath, SemanticGraph};
pub use model::{
    Aggregation, Calculation, ComparisonType, Dimension, DimensionType, Granularity, Metric, MetricType, Model,
    ModelSource, Relationship, RelationshipType, Segment,
};
pub use parameter::{Parameter, ParameterSet, ParameterType, ParameterValue};
