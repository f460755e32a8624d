//! Dialect-specific symmetric aggregates: aggregation expressions invariant
//! under row duplication caused by fan-out joins.
//!
//! `SUM(DISTINCT H(pk)*K + v) - SUM(DISTINCT H(pk)*K)` counts each base row
//! exactly once regardless of how many child rows it was joined against.

use crate::core::model::Aggregation;
use crate::error::{Result, SidemanticError};

struct HashSpec {
    hash_fn: &'static str,
    multiplier: &'static str,
}

fn hash_spec(dialect: &str) -> HashSpec {
    match dialect {
        "bigquery" => HashSpec { hash_fn: "FARM_FINGERPRINT(CAST({pk} AS STRING))", multiplier: "1048576" },
        "postgres" => HashSpec { hash_fn: "hashtext({pk}::text)::bigint", multiplier: "1024" },
        "snowflake" => HashSpec { hash_fn: "HASH({pk}) % 1000000000", multiplier: "100" },
        "clickhouse" => HashSpec { hash_fn: "halfMD5(CAST({pk} AS String))", multiplier: "1048576" },
        "databricks" | "spark" => HashSpec { hash_fn: "xxhash64(CAST({pk} AS STRING))", multiplier: "1048576" },
        _ => HashSpec { hash_fn: "HASH({pk})::HUGEINT", multiplier: "1::HUGEINT << 20" },
    }
}

fn hashed_pk(dialect: &str, pk: &str) -> String {
    hash_spec(dialect).hash_fn.replace("{pk}", pk)
}

/// Whether `needs_symmetric_aggregate` should apply: only when the base
/// model sits on the "one" side of at least two `one_to_many` hops in the
/// current request's required model set (see the generator's fan-out
/// detection).
pub fn needs_symmetric_aggregate(fanout_count: usize) -> bool {
    fanout_count >= 2
}

/// Build the symmetric-aggregate SQL for `measure_expr` (the `{measure}_raw`
/// column reference), keyed by `pk` (the base model's primary-key column
/// reference), for the given dialect and aggregation.
pub fn build_symmetric_aggregate_sql(
    measure_expr: &str,
    pk: &str,
    agg: Aggregation,
    dialect: &str,
    model: &str,
) -> Result<String> {
    let hashed = hashed_pk(dialect, pk);
    let k = hash_spec(dialect).multiplier;

    match agg {
        Aggregation::Sum => Ok(format!(
            "(SUM(DISTINCT ({hashed} * ({k})) + {measure_expr}) - SUM(DISTINCT ({hashed} * ({k}))))"
        )),
        Aggregation::Avg => {
            let sum = format!("(SUM(DISTINCT ({hashed} * ({k})) + {measure_expr}) - SUM(DISTINCT ({hashed} * ({k}))))");
            Ok(format!("({sum} / NULLIF(COUNT(DISTINCT {pk}), 0))"))
        }
        Aggregation::Count => Ok(format!("COUNT(DISTINCT {pk})")),
        Aggregation::CountDistinct => Ok(format!("COUNT(DISTINCT {measure_expr})")),
        Aggregation::Min | Aggregation::Max | Aggregation::Median => Err(SidemanticError::UnsupportedSymmetricAgg {
            agg: format!("{:?}", agg).to_lowercase(),
            model: model.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duckdb_sum() {
        let sql = build_symmetric_aggregate_sql("orders_cte.revenue_raw", "orders_cte.id", Aggregation::Sum, "duckdb", "orders").unwrap();
        assert!(sql.contains("HASH(orders_cte.id)::HUGEINT"));
        assert!(sql.contains("1::HUGEINT << 20"));
        assert!(sql.contains("orders_cte.revenue_raw"));
    }

    #[test]
    fn test_bigquery_sum() {
        let sql = build_symmetric_aggregate_sql("t.revenue_raw", "t.id", Aggregation::Sum, "bigquery", "orders").unwrap();
        assert!(sql.contains("FARM_FINGERPRINT(CAST(t.id AS STRING))"));
        assert!(sql.contains("1048576"));
    }

    #[test]
    fn test_postgres_sum() {
        let sql = build_symmetric_aggregate_sql("t.revenue_raw", "t.id", Aggregation::Sum, "postgres", "orders").unwrap();
        assert!(sql.contains("hashtext(t.id::text)::bigint"));
        assert!(sql.contains("1024"));
    }

    #[test]
    fn test_count_distinct_ignores_fanout() {
        let sql =
            build_symmetric_aggregate_sql("t.customer_id_raw", "t.id", Aggregation::CountDistinct, "duckdb", "orders").unwrap();
        assert_eq!(sql, "COUNT(DISTINCT t.customer_id_raw)");
    }

    #[test]
    fn test_min_unsupported() {
        let err = build_symmetric_aggregate_sql("t.amount_raw", "t.id", Aggregation::Min, "duckdb", "orders").unwrap_err();
        assert!(matches!(err, SidemanticError::UnsupportedSymmetricAgg { .. }));
    }

    #[test]
    fn test_needs_symmetric_aggregate_threshold() {
        assert!(!needs_symmetric_aggregate(0));
        assert!(!needs_symmetric_aggregate(1));
        assert!(needs_symmetric_aggregate(2));
    }
}
