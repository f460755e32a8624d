//! Single-pass pattern matcher for relative date expressions, e.g.
//! "last 7 days" or "this month", producing dialect-aware SQL.

use once_cell::sync::Lazy;
use regex::Regex;

fn date_trunc(granularity: &str, column_expr: &str, dialect: &str) -> String {
    if dialect == "bigquery" {
        format!("DATE_TRUNC({}, {})", column_expr, granularity.to_uppercase())
    } else {
        format!("DATE_TRUNC('{}', {})", granularity, column_expr)
    }
}

static TODAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^today$").unwrap());
static YESTERDAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^yesterday$").unwrap());
static TOMORROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tomorrow$").unwrap());
static LAST_N_DAYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last (\d+) day(?:s)?$").unwrap());
static LAST_N_WEEKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last (\d+) week(?:s)?$").unwrap());
static LAST_N_MONTHS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last (\d+) month(?:s)?$").unwrap());
static LAST_N_YEARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last (\d+) year(?:s)?$").unwrap());
static THIS_WEEK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^this week$").unwrap());
static LAST_WEEK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last week$").unwrap());
static NEXT_WEEK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^next week$").unwrap());
static THIS_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^this month$").unwrap());
static LAST_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last month$").unwrap());
static NEXT_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^next month$").unwrap());
static THIS_QUARTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^this quarter$").unwrap());
static LAST_QUARTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last quarter$").unwrap());
static NEXT_QUARTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^next quarter$").unwrap());
static THIS_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^this year$").unwrap());
static LAST_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^last year$").unwrap());
static NEXT_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^next year$").unwrap());

/// Parse a relative date expression to a scalar SQL expression.
///
/// ```
/// # use sidemantic::core::relative_date::parse;
/// assert_eq!(parse("last 7 days", "duckdb").unwrap(), "CURRENT_DATE - 7");
/// assert_eq!(parse("this month", "duckdb").unwrap(), "DATE_TRUNC('month', CURRENT_DATE)");
/// ```
pub fn parse(expr: &str, dialect: &str) -> Option<String> {
    let expr = expr.to_lowercase();
    let expr = expr.trim();

    if TODAY.is_match(expr) {
        return Some("CURRENT_DATE".to_string());
    }
    if YESTERDAY.is_match(expr) {
        return Some("CURRENT_DATE - 1".to_string());
    }
    if TOMORROW.is_match(expr) {
        return Some("CURRENT_DATE + 1".to_string());
    }
    if let Some(caps) = LAST_N_DAYS.captures(expr) {
        return Some(format!("CURRENT_DATE - {}", &caps[1]));
    }
    if let Some(caps) = LAST_N_WEEKS.captures(expr) {
        let n: i64 = caps[1].parse().ok()?;
        return Some(format!("CURRENT_DATE - {}", n * 7));
    }

    if let Some(caps) = LAST_N_MONTHS.captures(expr) {
        let trunc = date_trunc("month", "CURRENT_DATE", dialect);
        return Some(format!("{} - INTERVAL '{} months'", trunc, &caps[1]));
    }
    if let Some(caps) = LAST_N_YEARS.captures(expr) {
        let trunc = date_trunc("year", "CURRENT_DATE", dialect);
        return Some(format!("{} - INTERVAL '{} years'", trunc, &caps[1]));
    }
    if THIS_WEEK.is_match(expr) {
        return Some(date_trunc("week", "CURRENT_DATE", dialect));
    }
    if LAST_WEEK.is_match(expr) {
        return Some(format!("{} - INTERVAL '1 week'", date_trunc("week", "CURRENT_DATE", dialect)));
    }
    if NEXT_WEEK.is_match(expr) {
        return Some(format!("{} + INTERVAL '1 week'", date_trunc("week", "CURRENT_DATE", dialect)));
    }
    if THIS_MONTH.is_match(expr) {
        return Some(date_trunc("month", "CURRENT_DATE", dialect));
    }
    if LAST_MONTH.is_match(expr) {
        return Some(format!("{} - INTERVAL '1 month'", date_trunc("month", "CURRENT_DATE", dialect)));
    }
    if NEXT_MONTH.is_match(expr) {
        return Some(format!("{} + INTERVAL '1 month'", date_trunc("month", "CURRENT_DATE", dialect)));
    }
    if THIS_QUARTER.is_match(expr) {
        return Some(date_trunc("quarter", "CURRENT_DATE", dialect));
    }
    if LAST_QUARTER.is_match(expr) {
        return Some(format!("{} - INTERVAL '3 months'", date_trunc("quarter", "CURRENT_DATE", dialect)));
    }
    if NEXT_QUARTER.is_match(expr) {
        return Some(format!("{} + INTERVAL '3 months'", date_trunc("quarter", "CURRENT_DATE", dialect)));
    }
    if THIS_YEAR.is_match(expr) {
        return Some(date_trunc("year", "CURRENT_DATE", dialect));
    }
    if LAST_YEAR.is_match(expr) {
        return Some(format!("{} - INTERVAL '1 year'", date_trunc("year", "CURRENT_DATE", dialect)));
    }
    if NEXT_YEAR.is_match(expr) {
        return Some(format!("{} + INTERVAL '1 year'", date_trunc("year", "CURRENT_DATE", dialect)));
    }

    None
}

/// Convert a relative date expression into a SQL range/scalar filter on `column`.
pub fn to_range(expr: &str, column: &str, dialect: &str) -> Option<String> {
    let lower = expr.to_lowercase();
    let lower = lower.trim();

    if lower.starts_with("last ") && (lower.contains("day") || lower.contains("week")) {
        let sql_expr = parse(lower, dialect)?;
        return Some(format!("{} >= {}", column, sql_expr));
    }

    if (lower.contains("month") || lower.contains("quarter") || lower.contains("year"))
        && (lower.starts_with("this ") || lower.starts_with("last ") || lower.starts_with("next "))
    {
        let start_sql = parse(lower, dialect)?;
        let interval = if lower.contains("month") {
            "1 month"
        } else if lower.contains("quarter") {
            "3 months"
        } else if lower.contains("year") {
            "1 year"
        } else {
            "1 day"
        };
        return Some(format!("{column} >= {start_sql} AND {column} < {start_sql} + INTERVAL '{interval}'"));
    }

    if matches!(lower, "today" | "yesterday" | "tomorrow") {
        let sql_expr = parse(lower, dialect)?;
        return Some(format!("{column} = {sql_expr}"));
    }

    None
}

pub fn is_relative_date(expr: &str) -> bool {
    parse(expr, "duckdb").is_some()
}
