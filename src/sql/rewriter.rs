//! SQL query rewriter: parses user-authored SQL in the semantic dialect into
//! a [`SemanticQuery`] and hands it to [`SqlGenerator`] for compilation.

use sqlparser::ast::{
    Cte, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, ObjectName, Offset,
    OrderByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::dialect::Dialect;
use super::generator::{SemanticQuery, SqlGenerator, MAX_REQUEST_BYTES};
use crate::core::model::MetricType;
use crate::error::{Result, SidemanticError};

const AGGREGATE_FUNCTIONS: [&str; 6] = ["SUM", "COUNT", "AVG", "MIN", "MAX", "MEDIAN"];
const METRICS_TABLE: &str = "metrics";

/// Resolved FROM target: either a single model or the virtual `metrics`
/// cross-model view.
enum FromTarget {
    Model(String),
    MetricsView,
}

/// Rewrites user-authored SQL against the semantic dialect into physical
/// SQL, by parsing it into a [`SemanticQuery`] and delegating to
/// [`SqlGenerator`].
pub struct QueryRewriter<'a> {
    graph: &'a crate::core::SemanticGraph,
    strict: bool,
}

impl<'a> QueryRewriter<'a> {
    pub fn new(graph: &'a crate::core::SemanticGraph) -> Self {
        QueryRewriter { graph, strict: true }
    }

    /// Non-strict mode: a statement that references no semantic model and no
    /// semantic metric is returned unchanged instead of erroring.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Rewrite a single SQL statement, returning physical SQL.
    pub fn rewrite(&self, sql: &str) -> Result<String> {
        if sql.len() > MAX_REQUEST_BYTES {
            return Err(SidemanticError::InputTooLarge { size: sql.len(), limit: MAX_REQUEST_BYTES });
        }

        let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
            Ok(s) => s,
            Err(e) => {
                if !self.strict {
                    return Ok(sql.to_string());
                }
                return Err(SidemanticError::UnparseableSql { message: e.to_string(), position: None });
            }
        };

        if statements.len() != 1 {
            if !self.strict {
                return Ok(sql.to_string());
            }
            return Err(SidemanticError::UnparseableSql {
                message: "expected exactly one SQL statement".to_string(),
                position: None,
            });
        }

        let query = match &statements[0] {
            Statement::Query(q) => q.as_ref().clone(),
            _ => {
                if !self.strict {
                    return Ok(sql.to_string());
                }
                return Err(SidemanticError::UnparseableSql {
                    message: "only SELECT statements are supported".to_string(),
                    position: None,
                });
            }
        };

        if !self.strict && !self.references_semantic(&query) {
            return Ok(sql.to_string());
        }

        self.rewrite_query(&query)
    }

    /// Whether the outermost SELECT's FROM names a model or `metrics`.
    fn references_semantic(&self, query: &Query) -> bool {
        let SetExpr::Select(select) = query.body.as_ref() else { return false };
        select.from.iter().any(|twj| match &twj.relation {
            TableFactor::Table { name, .. } => {
                let table_name = name.0.first().map(|i| i.value.as_str()).unwrap_or_default();
                table_name.eq_ignore_ascii_case(METRICS_TABLE) || self.graph.get_model(table_name).is_ok()
            }
            _ => false,
        })
    }

    fn rewrite_query(&self, query: &Query) -> Result<String> {
        let with = query.with.as_ref().map(|w| self.rewrite_with(w));

        match query.body.as_ref() {
            SetExpr::Select(select) => {
                if let Some(passthrough) = self.try_rewrite_derived_from(select, query, with.as_ref())? {
                    return Ok(passthrough);
                }
                let semantic_query = self.select_to_semantic_query(select, query)?;
                SqlGenerator::new(self.graph).generate(&semantic_query)
            }
            _ => {
                if self.strict {
                    Err(SidemanticError::UnparseableSql {
                        message: "only a single SELECT body is supported".to_string(),
                        position: None,
                    })
                } else {
                    Ok(query.to_string())
                }
            }
        }
    }

    /// Rewrites each CTE body that looks like a semantic query, leaving the
    /// rest untouched. Returns the possibly-modified `With` clause text
    /// rendered as a standalone prefix isn't needed by callers directly;
    /// instead we return the rewritten CTE list for splicing back in.
    fn rewrite_with(&self, with: &sqlparser::ast::With) -> Vec<Cte> {
        with.cte_tables
            .iter()
            .map(|cte| {
                if !self.references_semantic(&cte.query) {
                    return cte.clone();
                }
                match self.rewrite_query(&cte.query) {
                    Ok(rewritten_sql) => match Parser::parse_sql(&GenericDialect {}, &rewritten_sql) {
                        Ok(stmts) => match stmts.into_iter().next() {
                            Some(Statement::Query(new_query)) => Cte { query: new_query, ..cte.clone() },
                            _ => cte.clone(),
                        },
                        Err(_) => cte.clone(),
                    },
                    Err(_) => cte.clone(),
                }
            })
            .collect()
    }

    /// If the FROM clause is a derived subquery, the outer query is passed
    /// through unmodified and only the inner subquery is rewritten.
    fn try_rewrite_derived_from(
        &self,
        select: &Select,
        query: &Query,
        rewritten_ctes: Option<&Vec<Cte>>,
    ) -> Result<Option<String>> {
        if select.from.len() != 1 {
            return Ok(None);
        }
        let TableFactor::Derived { subquery, alias, lateral } = &select.from[0].relation else {
            return Ok(None);
        };

        let rewritten_inner = self.rewrite_query(subquery)?;
        let inner_query = match Parser::parse_sql(&GenericDialect {}, &rewritten_inner) {
            Ok(stmts) => match stmts.into_iter().next() {
                Some(Statement::Query(q)) => q,
                _ => return Ok(Some(query.to_string())),
            },
            Err(_) => return Ok(Some(query.to_string())),
        };

        let new_from = vec![TableWithJoins {
            relation: TableFactor::Derived { lateral: *lateral, subquery: inner_query, alias: alias.clone() },
            joins: select.from[0].joins.clone(),
        }];

        let new_select = Select { from: new_from, ..select.clone() };
        let mut new_query = Query { body: Box::new(SetExpr::Select(Box::new(new_select))), ..query.clone() };
        if let Some(ctes) = rewritten_ctes {
            if let Some(with) = new_query.with.as_mut() {
                with.cte_tables = ctes.clone();
            }
        }
        Ok(Some(new_query.to_string()))
    }

    fn select_to_semantic_query(&self, select: &Select, query: &Query) -> Result<SemanticQuery> {
        if select.from.len() != 1 {
            return Err(SidemanticError::UnparseableSql {
                message: "expected exactly one FROM source".to_string(),
                position: None,
            });
        }
        let twj = &select.from[0];
        if !twj.joins.is_empty() {
            return Err(SidemanticError::ExplicitJoinUnsupported);
        }

        let target = match &twj.relation {
            TableFactor::Table { name, .. } => {
                let table_name = name.0.first().map(|i| i.value.clone()).unwrap_or_default();
                if table_name.eq_ignore_ascii_case(METRICS_TABLE) {
                    FromTarget::MetricsView
                } else {
                    self.graph.get_model(&table_name)?;
                    FromTarget::Model(table_name)
                }
            }
            _ => {
                return Err(SidemanticError::UnparseableSql {
                    message: "FROM must be a model name or `metrics`".to_string(),
                    position: None,
                })
            }
        };

        let mut metrics = Vec::new();
        let mut dimensions = Vec::new();

        if matches!(select.projection.as_slice(), [SelectItem::Wildcard(_)]) {
            match &target {
                FromTarget::MetricsView => {
                    return Err(SidemanticError::UnparseableSql {
                        message: "SELECT * is not supported against FROM metrics".to_string(),
                        position: None,
                    })
                }
                FromTarget::Model(model_name) => {
                    let model = self.graph.get_model(model_name)?;
                    for dim in &model.dimensions {
                        dimensions.push(format!("{model_name}.{}", dim.name));
                    }
                    for metric in &model.metrics {
                        metrics.push(format!("{model_name}.{}", metric.name));
                    }
                }
            }
        } else {
            for item in &select.projection {
                let expr = match item {
                    SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
                    _ => continue,
                };
                self.classify_select_expr(expr, &target, &mut metrics, &mut dimensions)?;
            }
        }

        let default_model = match &target {
            FromTarget::Model(m) => Some(m.clone()),
            FromTarget::MetricsView => None,
        };

        let mut filters = Vec::new();
        if let Some(selection) = &select.selection {
            for predicate in flatten_and(selection.clone()) {
                let qualified = qualify_expr(predicate, default_model.as_deref());
                filters.push(qualified.to_string());
            }
        }

        let order_by = query
            .order_by
            .as_ref()
            .map(|ob| ob.exprs.iter().map(order_by_to_reference).collect())
            .unwrap_or_default();

        let limit = query.limit.as_ref().and_then(expr_as_u64);
        let offset = query.offset.as_ref().and_then(offset_as_u64);

        Ok(SemanticQuery {
            metrics,
            dimensions,
            filters,
            order_by,
            limit,
            offset,
            parameters: Default::default(),
            dialect: Dialect::default(),
        })
    }

    fn classify_select_expr(
        &self,
        expr: &Expr,
        target: &FromTarget,
        metrics: &mut Vec<String>,
        dimensions: &mut Vec<String>,
    ) -> Result<()> {
        if let Expr::Function(f) = expr {
            let fn_name = f.name.0.first().map(|i| i.value.to_uppercase()).unwrap_or_default();
            if AGGREGATE_FUNCTIONS.contains(&fn_name.as_str()) {
                return Err(SidemanticError::AggregatesMustBeMetrics {
                    function: fn_name.clone(),
                    expression: expr.to_string(),
                    suggestion: format!(
                        "declare a metric instead, e.g. a model metric with type \"aggregation\", agg \"{}\"",
                        fn_name.to_lowercase()
                    ),
                });
            }
        }

        match expr {
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                let model_name = &parts[0].value;
                let field_name = &parts[1].value;
                self.classify_field(model_name, field_name, metrics, dimensions)
            }
            Expr::Identifier(ident) => match target {
                FromTarget::Model(model_name) => self.classify_field(model_name, &ident.value, metrics, dimensions),
                FromTarget::MetricsView => {
                    self.graph.get_metric(&ident.value).map_err(|_| SidemanticError::AmbiguousReference {
                        name: ident.value.clone(),
                        candidates: self.graph.metrics().map(|m| m.name.clone()).collect(),
                    })?;
                    metrics.push(ident.value.clone());
                    Ok(())
                }
            },
            _ => Err(SidemanticError::UnknownReference { kind: "select item", name: expr.to_string(), in_model: None }),
        }
    }

    fn classify_field(&self, model_name: &str, field_name: &str, metrics: &mut Vec<String>, dimensions: &mut Vec<String>) -> Result<()> {
        let model = self.graph.get_model(model_name)?;
        if model.get_metric(field_name).is_some() {
            metrics.push(format!("{model_name}.{field_name}"));
            Ok(())
        } else if model.get_dimension(field_name).is_some() {
            dimensions.push(format!("{model_name}.{field_name}"));
            Ok(())
        } else {
            Err(SidemanticError::UnknownReference {
                kind: "field",
                name: format!("{model_name}.{field_name}"),
                in_model: Some(model_name.to_string()),
            })
        }
    }
}

/// Splits an expression across top-level `AND` nodes; `OR`-connected
/// subtrees stay grouped as a single predicate.
fn flatten_and(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp { left, op: sqlparser::ast::BinaryOperator::And, right } => {
            let mut out = flatten_and(*left);
            out.extend(flatten_and(*right));
            out
        }
        Expr::Nested(inner) => flatten_and(*inner),
        other => vec![other],
    }
}

/// Rewrites bare column identifiers to `model.field` when a single default
/// model is in scope. Recurses through the common boolean/arithmetic AST
/// shapes; unrecognized nodes are returned unchanged.
fn qualify_expr(expr: Expr, default_model: Option<&str>) -> Expr {
    match expr {
        Expr::Identifier(ident) => match default_model {
            Some(model) => Expr::CompoundIdentifier(vec![Ident::new(model.to_string()), ident]),
            None => Expr::Identifier(ident),
        },
        Expr::BinaryOp { left, op, right } => {
            Expr::BinaryOp { left: Box::new(qualify_expr(*left, default_model)), op, right: Box::new(qualify_expr(*right, default_model)) }
        }
        Expr::UnaryOp { op, expr } => Expr::UnaryOp { op, expr: Box::new(qualify_expr(*expr, default_model)) },
        Expr::Nested(inner) => Expr::Nested(Box::new(qualify_expr(*inner, default_model))),
        Expr::IsNull(inner) => Expr::IsNull(Box::new(qualify_expr(*inner, default_model))),
        Expr::IsNotNull(inner) => Expr::IsNotNull(Box::new(qualify_expr(*inner, default_model))),
        Expr::Between { expr, negated, low, high } => Expr::Between {
            expr: Box::new(qualify_expr(*expr, default_model)),
            negated,
            low: Box::new(qualify_expr(*low, default_model)),
            high: Box::new(qualify_expr(*high, default_model)),
        },
        Expr::InList { expr, list, negated } => Expr::InList {
            expr: Box::new(qualify_expr(*expr, default_model)),
            list: list.into_iter().map(|e| qualify_expr(e, default_model)).collect(),
            negated,
        },
        Expr::Like { negated, expr, pattern, escape_char, any } => Expr::Like {
            negated,
            expr: Box::new(qualify_expr(*expr, default_model)),
            pattern: Box::new(qualify_expr(*pattern, default_model)),
            escape_char,
            any,
        },
        other => other,
    }
}

fn order_by_to_reference(order: &OrderByExpr) -> String {
    let name = match &order.expr {
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()).unwrap_or_default(),
        Expr::Identifier(ident) => ident.value.clone(),
        other => other.to_string(),
    };
    match order.asc {
        Some(true) => format!("{name} ASC"),
        Some(false) => format!("{name} DESC"),
        None => name,
    }
}

fn expr_as_u64(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(s, _)) => s.parse().ok(),
        _ => None,
    }
}

fn offset_as_u64(offset: &Offset) -> Option<u64> {
    expr_as_u64(&offset.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Aggregation, Dimension, DimensionType, Metric, MetricType as CoreMetricType, Model, Relationship, RelationshipType};
    use crate::core::SemanticGraph;

    fn test_graph() -> SemanticGraph {
        let mut graph = SemanticGraph::new();
        let orders = Model::table("orders", "orders")
            .with_dimension(Dimension::new("status", DimensionType::Categorical))
            .with_metric(Metric::new("revenue", CoreMetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".into() }))
            .with_relationship(Relationship::new("customers", RelationshipType::ManyToOne).with_foreign_key("customer_id"));
        let customers = Model::table("customers", "customers").with_dimension(Dimension::new("country", DimensionType::Categorical));
        graph.add_model(orders).unwrap();
        graph.add_model(customers).unwrap();
        graph
    }

    #[test]
    fn test_simple_rewrite() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let sql = rewriter.rewrite("SELECT orders.revenue, orders.status FROM orders").unwrap();
        assert!(sql.contains("SUM(orders_cte.revenue_raw)"));
        assert!(sql.contains("orders_cte.status"));
        assert!(sql.contains("GROUP BY 1"));
    }

    #[test]
    fn test_rewrite_with_filter() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let sql = rewriter.rewrite("SELECT orders.revenue FROM orders WHERE orders.status = 'completed'").unwrap();
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("orders_cte.status"));
    }

    #[test]
    fn test_explicit_join_rejected() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let err = rewriter
            .rewrite("SELECT orders.revenue FROM orders JOIN customers ON orders.customer_id = customers.id")
            .unwrap_err();
        assert!(matches!(err, SidemanticError::ExplicitJoinUnsupported));
    }

    #[test]
    fn test_aggregate_in_select_rejected() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let err = rewriter.rewrite("SELECT SUM(orders.amount) FROM orders").unwrap_err();
        assert!(matches!(err, SidemanticError::AggregatesMustBeMetrics { .. }));
    }

    #[test]
    fn test_select_star_expands_model() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let sql = rewriter.rewrite("SELECT * FROM orders").unwrap();
        assert!(sql.contains("orders_cte.status"));
        assert!(sql.contains("revenue"));
    }

    #[test]
    fn test_from_metrics_requires_graph_level_metric() {
        let mut graph = test_graph();
        graph
            .add_metric(Metric::new("total_revenue", CoreMetricType::Derived { sql: "orders.revenue".into() }))
            .unwrap();
        let rewriter = QueryRewriter::new(&graph);
        let sql = rewriter.rewrite("SELECT total_revenue FROM metrics").unwrap();
        assert!(sql.contains("AS total_revenue"));
    }

    #[test]
    fn test_from_metrics_ambiguous_field_rejected() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let err = rewriter.rewrite("SELECT status FROM metrics").unwrap_err();
        assert!(matches!(err, SidemanticError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_non_strict_passthrough_for_unrelated_query() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph).with_strict(false);
        let sql = "SELECT 1";
        assert_eq!(rewriter.rewrite(sql).unwrap(), sql);
    }

    #[test]
    fn test_strict_mode_errors_on_unrelated_query() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let err = rewriter.rewrite("SELECT nonexistent_table.x FROM nonexistent_table").unwrap_err();
        assert!(matches!(err, SidemanticError::NotFound { .. }));
    }

    #[test]
    fn test_order_by_limit_offset() {
        let graph = test_graph();
        let rewriter = QueryRewriter::new(&graph);
        let sql = rewriter
            .rewrite("SELECT orders.revenue, orders.status FROM orders ORDER BY orders.status ASC LIMIT 10 OFFSET 5")
            .unwrap();
        assert!(sql.contains("ORDER BY status ASC"));
        assert!(sql.contains("LIMIT 10"));
        assert!(sql.contains("OFFSET 5"));
    }
}
