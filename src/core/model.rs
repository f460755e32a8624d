//! Core catalog types: models, dimensions, metrics, relationships.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SidemanticError};

/// Time granularity, ordered coarsest-last for the default allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 8] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Quarter,
        Granularity::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Granularity> {
        Self::ALL.iter().copied().find(|g| g.as_str() == s.to_lowercase())
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Variant on a dimension's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionType {
    Categorical,
    Numeric,
    Boolean,
    Time,
}

/// Named attribute on a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: DimensionType,
    pub sql: Option<String>,
    pub granularity: Option<Granularity>,
    pub supported_granularities: Option<Vec<Granularity>>,
    pub parent: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Dimension {
    pub fn new(name: impl Into<String>, r#type: DimensionType) -> Self {
        Dimension {
            name: name.into(),
            r#type,
            sql: None,
            granularity: None,
            supported_granularities: None,
            parent: None,
            label: None,
            description: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn with_supported_granularities(mut self, granularities: Vec<Granularity>) -> Self {
        self.supported_granularities = Some(granularities);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The SQL expression for this dimension, defaulting to its name.
    pub fn sql_expr(&self) -> String {
        self.sql.clone().unwrap_or_else(|| self.name.clone())
    }

    /// Whether `granularity` is an allowed granularity for this dimension.
    pub fn allows_granularity(&self, granularity: Granularity) -> bool {
        match &self.supported_granularities {
            Some(allowed) => allowed.contains(&granularity),
            None => Granularity::ALL.contains(&granularity),
        }
    }

    /// A `DATE_TRUNC`-wrapped view of this dimension at the given granularity.
    /// Dialect-adjusted: BigQuery takes `DATE_TRUNC(expr, UNIT)`, others
    /// `DATE_TRUNC('unit', expr)`.
    pub fn with_granularity_sql(&self, granularity: Granularity, dialect: &str) -> Result<String> {
        if !self.allows_granularity(granularity) {
            let allowed = self
                .supported_granularities
                .as_ref()
                .map(|g| g.iter().map(|x| x.as_str().to_string()).collect())
                .unwrap_or_else(|| Granularity::ALL.iter().map(|x| x.as_str().to_string()).collect());
            return Err(SidemanticError::UnsupportedGranularity {
                dim: self.name.clone(),
                requested: granularity.as_str().to_string(),
                allowed,
            });
        }
        let expr = self.sql_expr();
        Ok(if dialect == "bigquery" {
            format!("DATE_TRUNC({}, {})", expr, granularity.as_str().to_uppercase())
        } else {
            format!("DATE_TRUNC('{}', {})", granularity.as_str(), expr)
        })
    }
}

/// Aggregation function for a simple/aggregation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
    Median,
}

impl Aggregation {
    pub fn as_sql_fn(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Count => "COUNT",
            Aggregation::CountDistinct => "COUNT",
            Aggregation::Avg => "AVG",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Median => "MEDIAN",
        }
    }

    pub fn is_distinct(&self) -> bool {
        matches!(self, Aggregation::CountDistinct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    Yoy,
    Mom,
    Wow,
    Dod,
    Qoq,
    PriorPeriod,
}

impl ComparisonType {
    /// Default LAG offset in units of the comparison's natural period.
    pub fn default_lag_offset(&self) -> i64 {
        match self {
            ComparisonType::Yoy => 12,
            ComparisonType::Qoq => 4,
            ComparisonType::Mom | ComparisonType::Wow | ComparisonType::Dod => 1,
            ComparisonType::PriorPeriod => 1,
        }
    }

    /// The request granularity this comparison type expects, if any.
    pub fn expected_granularity(&self) -> Option<Granularity> {
        match self {
            ComparisonType::Yoy => Some(Granularity::Month),
            ComparisonType::Qoq => Some(Granularity::Quarter),
            ComparisonType::Mom => Some(Granularity::Month),
            ComparisonType::Wow => Some(Granularity::Week),
            ComparisonType::Dod => Some(Granularity::Day),
            ComparisonType::PriorPeriod => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    Difference,
    PercentChange,
    Ratio,
}

/// Variant on a metric's `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricType {
    Aggregation { agg: Aggregation, sql: String },
    Ratio {
        numerator: String,
        denominator: String,
        offset_window: Option<String>,
    },
    Derived { sql: String },
    Cumulative {
        sql: String,
        window: Option<String>,
        grain_to_date: Option<Granularity>,
    },
    TimeComparison {
        base_metric: String,
        comparison_type: ComparisonType,
        calculation: Calculation,
        time_offset: Option<String>,
    },
    Conversion {
        model: String,
        entity: String,
        base_event: String,
        conversion_event: String,
        conversion_window: String,
    },
}

impl MetricType {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricType::Aggregation { .. } => "aggregation",
            MetricType::Ratio { .. } => "ratio",
            MetricType::Derived { .. } => "derived",
            MetricType::Cumulative { .. } => "cumulative",
            MetricType::TimeComparison { .. } => "time_comparison",
            MetricType::Conversion { .. } => "conversion",
        }
    }

    pub fn needs_window(&self) -> bool {
        matches!(
            self,
            MetricType::Cumulative { .. } | MetricType::TimeComparison { .. } | MetricType::Conversion { .. }
        ) || matches!(self, MetricType::Ratio { offset_window: Some(_), .. })
    }
}

/// Named business calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(flatten)]
    pub r#type: MetricType,
    #[serde(default)]
    pub filters: Vec<String>,
    pub fill_nulls_with: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, r#type: MetricType) -> Self {
        Metric {
            name: name.into(),
            r#type,
            filters: Vec::new(),
            fill_nulls_with: None,
            label: None,
            description: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<String>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_fill_nulls_with(mut self, value: impl Into<String>) -> Self {
        self.fill_nulls_with = Some(value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn wrap_fill_nulls(&self, expr: String) -> String {
        match &self.fill_nulls_with {
            None => expr,
            Some(v) => {
                let literal = if v.parse::<f64>().is_ok() { v.clone() } else { format!("'{}'", v.replace('\'', "''")) };
                format!("COALESCE({}, {})", expr, literal)
            }
        }
    }
}

/// Variant on a relationship's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl RelationshipType {
    /// The inverse relationship type, as seen from the target model.
    pub fn inverse(&self) -> RelationshipType {
        match self {
            RelationshipType::ManyToOne => RelationshipType::OneToMany,
            RelationshipType::OneToMany => RelationshipType::ManyToOne,
            RelationshipType::OneToOne => RelationshipType::OneToOne,
            RelationshipType::ManyToMany => RelationshipType::ManyToMany,
        }
    }
}

/// Directed join definition attached to the owning model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Target model name.
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: RelationshipType,
    pub foreign_key: Option<Vec<String>>,
    pub primary_key: Option<Vec<String>>,
    pub through: Option<String>,
    pub through_foreign_key: Option<Vec<String>>,
    pub related_foreign_key: Option<Vec<String>>,
}

impl Relationship {
    pub fn new(name: impl Into<String>, r#type: RelationshipType) -> Self {
        Relationship {
            name: name.into(),
            r#type,
            foreign_key: None,
            primary_key: None,
            through: None,
            through_foreign_key: None,
            related_foreign_key: None,
        }
    }

    pub fn with_foreign_key(mut self, fk: impl Into<String>) -> Self {
        self.foreign_key = Some(vec![fk.into()]);
        self
    }

    pub fn with_composite_foreign_key(mut self, fk: Vec<String>) -> Self {
        self.foreign_key = Some(fk);
        self
    }

    pub fn with_primary_key(mut self, pk: impl Into<String>) -> Self {
        self.primary_key = Some(vec![pk.into()]);
        self
    }

    pub fn with_through(mut self, through: impl Into<String>, through_fk: impl Into<String>, related_fk: impl Into<String>) -> Self {
        self.through = Some(through.into());
        self.through_foreign_key = Some(vec![through_fk.into()]);
        self.related_foreign_key = Some(vec![related_fk.into()]);
        self
    }

    /// Foreign key column(s), defaulting per spec: many_to_one defaults to
    /// `{name}_id`; other relationship types default to `"id"`.
    pub fn fk_columns(&self) -> Vec<String> {
        self.foreign_key.clone().unwrap_or_else(|| {
            if self.r#type == RelationshipType::ManyToOne {
                vec![format!("{}_id", self.name)]
            } else {
                vec!["id".to_string()]
            }
        })
    }

    /// Primary key column(s) on the target side, defaulting to `"id"`.
    pub fn pk_columns(&self) -> Vec<String> {
        self.primary_key.clone().unwrap_or_else(|| vec!["id".to_string()])
    }

    pub fn fk_column(&self) -> String {
        self.fk_columns().first().cloned().unwrap_or_else(|| "id".to_string())
    }

    pub fn pk_column(&self) -> String {
        self.pk_columns().first().cloned().unwrap_or_else(|| "id".to_string())
    }
}

/// Named SQL predicate attached to a model, consumed by adapters and filter
/// references only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub sql: String,
}

impl Segment {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Segment { name: name.into(), sql: sql.into() }
    }

    /// This segment's predicate, qualified with a CTE alias.
    pub fn get_sql(&self, alias: &str) -> String {
        self.sql.replace("{model}", alias)
    }
}

/// Either a qualified table name or an inline SELECT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelSource {
    Table(String),
    Sql(String),
}

/// A named logical relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub source: ModelSource,
    pub primary_key: String,
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<Metric>,
    pub relationships: Vec<Relationship>,
    pub segments: Vec<Segment>,
    pub default_time_dimension: Option<String>,
    pub default_grain: Option<Granularity>,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Model {
    pub fn table(name: impl Into<String>, table: impl Into<String>) -> Self {
        Model {
            name: name.into(),
            source: ModelSource::Table(table.into()),
            primary_key: "id".to_string(),
            dimensions: Vec::new(),
            metrics: Vec::new(),
            relationships: Vec::new(),
            segments: Vec::new(),
            default_time_dimension: None,
            default_grain: None,
            label: None,
            description: None,
        }
    }

    pub fn sql(name: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut m = Model::table(name, "");
        m.source = ModelSource::Sql(sql.into());
        m
    }

    pub fn with_primary_key(mut self, pk: impl Into<String>) -> Self {
        self.primary_key = pk.into();
        self
    }

    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn with_default_time_dimension(mut self, name: impl Into<String>) -> Self {
        self.default_time_dimension = Some(name.into());
        self
    }

    pub fn with_default_grain(mut self, grain: Granularity) -> Self {
        self.default_grain = Some(grain);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn get_dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn get_metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn get_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn get_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// The FROM-clause source expression for this model's CTE.
    pub fn from_expr(&self) -> String {
        match &self.source {
            ModelSource::Table(t) => t.clone(),
            ModelSource::Sql(s) => format!("({}) AS t", s),
        }
    }

    /// Walks dimension `parent` links from `name` up to the root, root-first.
    pub fn get_hierarchy_path(&self, name: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            path.push(n.clone());
            current = self.get_dimension(&n).and_then(|d| d.parent.clone());
        }
        path.reverse();
        path
    }

    /// The dimension one level below `name` in the hierarchy, if any.
    pub fn get_drill_down(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.parent.as_deref() == Some(name))
    }

    /// The dimension one level above `name` in the hierarchy, if any.
    pub fn get_drill_up(&self, name: &str) -> Option<&Dimension> {
        self.get_dimension(name).and_then(|d| d.parent.as_ref()).and_then(|p| self.get_dimension(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_sql_expr_defaults_to_name() {
        let d = Dimension::new("status", DimensionType::Categorical);
        assert_eq!(d.sql_expr(), "status");
        let d2 = Dimension::new("status", DimensionType::Categorical).with_sql("orders.status_code");
        assert_eq!(d2.sql_expr(), "orders.status_code");
    }

    #[test]
    fn test_dimension_with_granularity_sql() {
        let d = Dimension::new("order_date", DimensionType::Time);
        assert_eq!(d.with_granularity_sql(Granularity::Month, "duckdb").unwrap(), "DATE_TRUNC('month', order_date)");
        assert_eq!(
            d.with_granularity_sql(Granularity::Month, "bigquery").unwrap(),
            "DATE_TRUNC(order_date, MONTH)"
        );
    }

    #[test]
    fn test_dimension_granularity_rejection() {
        let d = Dimension::new("order_date", DimensionType::Time)
            .with_supported_granularities(vec![Granularity::Day, Granularity::Month]);
        let err = d.with_granularity_sql(Granularity::Hour, "duckdb").unwrap_err();
        assert!(matches!(err, SidemanticError::UnsupportedGranularity { .. }));
    }

    #[test]
    fn test_relationship_defaults() {
        let r = Relationship::new("customers", RelationshipType::ManyToOne);
        assert_eq!(r.fk_columns(), vec!["customers_id".to_string()]);
        assert_eq!(r.pk_columns(), vec!["id".to_string()]);

        let r2 = Relationship::new("order_items", RelationshipType::OneToMany);
        assert_eq!(r2.fk_columns(), vec!["id".to_string()]);
    }

    #[test]
    fn test_model_builder() {
        let model = Model::table("orders", "orders")
            .with_primary_key("id")
            .with_dimension(Dimension::new("status", DimensionType::Categorical))
            .with_metric(Metric::new(
                "revenue",
                MetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".to_string() },
            ));

        assert_eq!(model.name, "orders");
        assert!(model.get_dimension("status").is_some());
        assert!(model.get_metric("revenue").is_some());
    }

    #[test]
    fn test_hierarchy_path() {
        let model = Model::table("products", "products")
            .with_dimension(Dimension::new("category", DimensionType::Categorical))
            .with_dimension(Dimension::new("subcategory", DimensionType::Categorical).with_parent("category"));

        assert_eq!(model.get_hierarchy_path("subcategory"), vec!["category".to_string(), "subcategory".to_string()]);
        assert_eq!(model.get_drill_down("category").unwrap().name, "subcategory");
        assert_eq!(model.get_drill_up("subcategory").unwrap().name, "category");
    }

    #[test]
    fn test_fill_nulls_wrap() {
        let m = Metric::new("revenue", MetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".to_string() })
            .with_fill_nulls_with("0");
        assert_eq!(m.wrap_fill_nulls("SUM(x)".to_string()), "COALESCE(SUM(x), 0)");

        let m2 = Metric::new("status_label", MetricType::Derived { sql: "status".to_string() })
            .with_fill_nulls_with("unknown");
        assert_eq!(m2.wrap_fill_nulls("status".to_string()), "COALESCE(status, 'unknown')");
    }
}
