//! Metric dependency extraction.
//!
//! Resolves the set of other metrics/measures a metric's SQL expression
//! refers to, so the generator can walk dependency chains and the graph can
//! detect cycles.

use std::collections::HashSet;

use polyglot_sql::{DialectType, Expression, ExpressionWalk};

use super::model::{Metric, MetricType};
use super::SemanticGraph;
use crate::error::Result;

const AGGREGATE_FUNCTIONS: [&str; 6] = ["SUM", "AVG", "COUNT", "MIN", "MAX", "MEDIAN"];

/// Extract the dependency references for `metric`.
///
/// - `ratio` → `{numerator, denominator}`.
/// - `cumulative` / `time_comparison` → the stored base reference.
/// - `derived` → if the SQL is a single qualified identifier (`model.field`,
///   no operators), that identifier; else if the SQL contains an inline
///   aggregate call, the metric is self-contained (no dependencies); else
///   every column reference in the SQL, resolved against the graph.
/// - `aggregation` / `conversion` → no metric dependencies.
pub fn extract_dependencies(metric: &Metric, graph: Option<&SemanticGraph>) -> Result<Vec<String>> {
    extract_dependencies_in_model(metric, graph, None)
}

/// As `extract_dependencies`, but resolves bare names against `model_context`
/// before falling back to a graph-wide search.
pub fn extract_dependencies_in_model(
    metric: &Metric,
    graph: Option<&SemanticGraph>,
    model_context: Option<&str>,
) -> Result<Vec<String>> {
    let mut deps: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |deps: &mut Vec<String>, seen: &mut HashSet<String>, s: String| {
        if seen.insert(s.clone()) {
            deps.push(s);
        }
    };

    match &metric.r#type {
        MetricType::Ratio { numerator, denominator, .. } => {
            push(&mut deps, &mut seen, numerator.clone());
            push(&mut deps, &mut seen, denominator.clone());
        }
        MetricType::Cumulative { sql, .. } => {
            push(&mut deps, &mut seen, sql.clone());
        }
        MetricType::TimeComparison { base_metric, .. } => {
            push(&mut deps, &mut seen, base_metric.clone());
        }
        MetricType::Derived { sql } => {
            if is_simple_reference(sql) {
                push(&mut deps, &mut seen, sql.trim().to_string());
            } else if contains_inline_aggregate(sql) {
                // Self-contained expression metric; inline aggregates are its
                // own children, not metric dependencies.
            } else {
                for reference in extract_column_references(sql) {
                    let resolved = resolve_reference(&reference, graph, model_context);
                    push(&mut deps, &mut seen, resolved);
                }
            }
        }
        MetricType::Aggregation { .. } | MetricType::Conversion { .. } => {}
    }

    Ok(deps)
}

fn is_simple_reference(sql: &str) -> bool {
    let trimmed = sql.trim();
    trimmed.contains('.') && !trimmed.contains(char::is_whitespace) && !has_operators(trimmed)
}

fn has_operators(s: &str) -> bool {
    ['+', '-', '*', '/', '(', ')', ',', '>', '<', '=']
        .iter()
        .any(|&op| s.contains(op))
}

fn contains_inline_aggregate(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    AGGREGATE_FUNCTIONS.iter().any(|f| upper.contains(&format!("{f}(")))
}

/// Parse `sql` (wrapped in a SELECT) with `polyglot-sql` and collect every
/// column/identifier reference it contains. Falls back to a quote-aware
/// token scan if the expression doesn't parse as a standalone SELECT list.
fn extract_column_references(sql: &str) -> HashSet<String> {
    let wrapped = format!("SELECT {sql}");
    let Ok(expressions) = polyglot_sql::parse(&wrapped, DialectType::Generic) else {
        return extract_simple_references(sql);
    };

    let mut refs = HashSet::new();
    for expr in expressions {
        if let Expression::Select(select) = expr {
            for item in &select.expressions {
                extract_refs_from_expr(item, &mut refs);
            }
        }
    }
    refs
}

fn extract_refs_from_expr(expr: &Expression, refs: &mut HashSet<String>) {
    for node in expr.dfs() {
        match node {
            Expression::Identifier(ident) => {
                refs.insert(ident.name.clone());
            }
            Expression::Column(col) => {
                if let Some(table) = &col.table {
                    refs.insert(format!("{}.{}", table.name, col.name.name));
                } else {
                    refs.insert(col.name.name.clone());
                }
            }
            _ => {}
        }
    }
}

fn extract_simple_references(sql: &str) -> HashSet<String> {
    let mut refs = HashSet::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut prev_char = ' ';

    for c in sql.chars() {
        if c == '\'' && prev_char != '\\' {
            in_string = !in_string;
        }
        if !in_string {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                current.push(c);
            } else {
                if !current.is_empty() && !is_keyword(&current) && !is_number(&current) {
                    refs.insert(current.clone());
                }
                current.clear();
            }
        }
        prev_char = c;
    }
    if !current.is_empty() && !is_keyword(&current) && !is_number(&current) {
        refs.insert(current);
    }
    refs
}

fn is_keyword(s: &str) -> bool {
    let keywords = [
        "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "NULLIF", "CASE", "WHEN", "THEN", "ELSE", "END", "AS",
        "SUM", "COUNT", "AVG", "MIN", "MAX", "MEDIAN", "DISTINCT",
    ];
    keywords.iter().any(|k| k.eq_ignore_ascii_case(s))
}

fn is_number(s: &str) -> bool {
    s.parse::<f64>().is_ok()
}

/// Resolve a bare or qualified reference against the graph: qualified names
/// pass through; bare names try graph-level metrics first, then metrics on
/// `model_context`, then a search across all models; unresolved names are
/// returned as-is for error-surfacing downstream.
fn resolve_reference(reference: &str, graph: Option<&SemanticGraph>, model_context: Option<&str>) -> String {
    if reference.contains('.') {
        return reference.to_string();
    }
    let Some(graph) = graph else { return reference.to_string() };

    if graph.get_metric(reference).is_ok() {
        return reference.to_string();
    }
    if let Some(model_name) = model_context {
        if let Ok(model) = graph.get_model(model_name) {
            if model.get_metric(reference).is_some() {
                return format!("{model_name}.{reference}");
            }
        }
    }
    for model in graph.models() {
        if model.get_metric(reference).is_some() {
            return format!("{}.{}", model.name, reference);
        }
    }
    reference.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Aggregation;

    #[test]
    fn test_ratio_dependencies() {
        let metric = Metric::new(
            "profit_margin",
            MetricType::Ratio { numerator: "profit".into(), denominator: "revenue".into(), offset_window: None },
        );
        let deps = extract_dependencies(&metric, None).unwrap();
        assert_eq!(deps, vec!["profit".to_string(), "revenue".to_string()]);
    }

    #[test]
    fn test_derived_simple_reference() {
        let metric = Metric::new("total_revenue", MetricType::Derived { sql: "orders.revenue".into() });
        let deps = extract_dependencies(&metric, None).unwrap();
        assert_eq!(deps, vec!["orders.revenue".to_string()]);
    }

    #[test]
    fn test_derived_expression() {
        let metric = Metric::new("avg_order_value", MetricType::Derived { sql: "revenue / order_count".into() });
        let deps = extract_dependencies(&metric, None).unwrap();
        assert!(deps.contains(&"revenue".to_string()));
        assert!(deps.contains(&"order_count".to_string()));
    }

    #[test]
    fn test_derived_self_contained_inline_aggregate() {
        let metric = Metric::new("rate", MetricType::Derived { sql: "SUM(amount) / SUM(count)".into() });
        let deps = extract_dependencies(&metric, None).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_simple_aggregation_no_deps() {
        let metric = Metric::new("revenue", MetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".into() });
        let deps = extract_dependencies(&metric, None).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_derived_bare_reference_resolves_via_graph() {
        use crate::core::model::Model;
        use crate::core::SemanticGraph;

        let mut graph = SemanticGraph::new();
        let orders = Model::table("orders", "orders")
            .with_metric(Metric::new("revenue", MetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".into() }));
        graph.add_model(orders).unwrap();

        let metric = Metric::new("total_revenue", MetricType::Derived { sql: "revenue".into() });
        let deps = extract_dependencies_in_model(&metric, Some(&graph), Some("orders")).unwrap();
        assert_eq!(deps, vec!["orders.revenue".to_string()]);
    }

    #[test]
    fn test_cumulative_dependency() {
        let metric =
            Metric::new("mtd_revenue", MetricType::Cumulative { sql: "orders.revenue".into(), window: None, grain_to_date: None });
        let deps = extract_dependencies(&metric, None).unwrap();
        assert_eq!(deps, vec!["orders.revenue".to_string()]);
    }
}
