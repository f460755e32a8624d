//! Typed `{{ name }}` parameter substitution.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SidemanticError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Date,
    Unquoted,
    Yesno,
}

/// A scalar value supplied for a parameter at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Text(String),
    Bool(bool),
}

impl ParameterValue {
    fn as_text(&self) -> String {
        match self {
            ParameterValue::Text(s) => s.clone(),
            ParameterValue::Bool(b) => b.to_string(),
        }
    }

    fn as_bool(&self) -> bool {
        match self {
            ParameterValue::Bool(b) => *b,
            ParameterValue::Text(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        }
    }
}

static UNQUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap());

/// Typed named value used for `{{ name }}` substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: ParameterType,
    pub default_value: Option<ParameterValue>,
    pub allowed_values: Option<Vec<String>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, r#type: ParameterType) -> Self {
        Parameter { name: name.into(), r#type, default_value: None, allowed_values: None }
    }

    pub fn with_default(mut self, value: ParameterValue) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_allowed_values(mut self, values: Vec<String>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    /// Format `value` (or, if `None`, this parameter's default) as a SQL
    /// literal per its type. `allowed_values` is informational only;
    /// runtime substitution does not reject out-of-list values.
    pub fn format_value(&self, value: Option<&ParameterValue>) -> Result<String> {
        let value = match value.or(self.default_value.as_ref()) {
            Some(v) => v,
            None => return Err(SidemanticError::MissingParameter(self.name.clone())),
        };

        match self.r#type {
            ParameterType::String => {
                let text = value.as_text();
                Ok(format!("'{}'", text.replace('\'', "''")))
            }
            ParameterType::Number => {
                let text = value.as_text();
                if text.trim().parse::<f64>().is_err() {
                    return Err(SidemanticError::InvalidNumericParameter(text));
                }
                Ok(text.trim().to_string())
            }
            ParameterType::Date => {
                let text = value.as_text();
                Ok(format!("'{}'", text.replace('\'', "''")))
            }
            ParameterType::Unquoted => {
                let text = value.as_text();
                if !UNQUOTED_RE.is_match(&text) {
                    return Err(SidemanticError::UnsafeIdentifierParameter(text));
                }
                Ok(text)
            }
            ParameterType::Yesno => Ok(if value.as_bool() { "TRUE".to_string() } else { "FALSE".to_string() }),
        }
    }
}

/// A resolved set of parameter definitions plus caller-supplied overrides,
/// used to interpolate `{{ name }}` tokens in filter strings.
#[derive(Debug, Default)]
pub struct ParameterSet<'a> {
    params: HashMap<String, &'a Parameter>,
    values: HashMap<String, ParameterValue>,
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

impl<'a> ParameterSet<'a> {
    pub fn new(params: impl IntoIterator<Item = &'a Parameter>, values: HashMap<String, ParameterValue>) -> Self {
        let params = params.into_iter().map(|p| (p.name.clone(), p)).collect();
        ParameterSet { params, values }
    }

    pub fn format(&self, name: &str) -> Result<String> {
        let param = self.params.get(name).ok_or_else(|| SidemanticError::UnknownParameter(name.to_string()))?;
        param.format_value(self.values.get(name))
    }

    /// Replace every `{{ name }}` token in `sql` with its formatted value.
    /// Tokens naming an unknown parameter are left untouched verbatim, so
    /// that SQL-level templating unrelated to this parameter set survives.
    pub fn interpolate(&self, sql: &str) -> Result<String> {
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;
        for caps in TOKEN_RE.captures_iter(sql) {
            let m = caps.get(0).unwrap();
            let name = &caps[1];
            out.push_str(&sql[last..m.start()]);
            if self.params.contains_key(name) {
                out.push_str(&self.format(name)?);
            } else {
                out.push_str(m.as_str());
            }
            last = m.end();
        }
        out.push_str(&sql[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_format() {
        let p = Parameter::new("order_status", ParameterType::String);
        assert_eq!(p.format_value(Some(&ParameterValue::Text("completed".into()))).unwrap(), "'completed'");
    }

    #[test]
    fn test_string_escapes_quotes() {
        let p = Parameter::new("order_status", ParameterType::String);
        let malicious = ParameterValue::Text("'; DROP TABLE x; --".into());
        assert_eq!(p.format_value(Some(&malicious)).unwrap(), "'''; DROP TABLE x; --'");
    }

    #[test]
    fn test_number_rejects_non_numeric() {
        let p = Parameter::new("limit_n", ParameterType::Number);
        let err = p.format_value(Some(&ParameterValue::Text("10; DROP TABLE x".into()))).unwrap_err();
        assert!(matches!(err, SidemanticError::InvalidNumericParameter(_)));
        assert_eq!(p.format_value(Some(&ParameterValue::Text("10".into()))).unwrap(), "10");
    }

    #[test]
    fn test_unquoted_validates_identifier_path() {
        let p = Parameter::new("sort_col", ParameterType::Unquoted);
        assert_eq!(p.format_value(Some(&ParameterValue::Text("orders.revenue".into()))).unwrap(), "orders.revenue");
        let err = p.format_value(Some(&ParameterValue::Text("revenue; DROP TABLE x".into()))).unwrap_err();
        assert!(matches!(err, SidemanticError::UnsafeIdentifierParameter(_)));
    }

    #[test]
    fn test_yesno() {
        let p = Parameter::new("active_only", ParameterType::Yesno);
        assert_eq!(p.format_value(Some(&ParameterValue::Bool(true))).unwrap(), "TRUE");
        assert_eq!(p.format_value(Some(&ParameterValue::Bool(false))).unwrap(), "FALSE");
    }

    #[test]
    fn test_default_value_used_when_missing() {
        let p = Parameter::new("order_status", ParameterType::String).with_default(ParameterValue::Text("pending".into()));
        assert_eq!(p.format_value(None).unwrap(), "'pending'");
    }

    #[test]
    fn test_missing_without_default_errors() {
        let p = Parameter::new("order_status", ParameterType::String);
        assert!(matches!(p.format_value(None).unwrap_err(), SidemanticError::MissingParameter(_)));
    }

    #[test]
    fn test_parameter_set_interpolate() {
        let p = Parameter::new("order_status", ParameterType::String);
        let mut values = HashMap::new();
        values.insert("order_status".to_string(), ParameterValue::Text("completed".into()));
        let set = ParameterSet::new(vec![&p], values);

        let out = set.interpolate("orders.status = {{ order_status }}").unwrap();
        assert_eq!(out, "orders.status = 'completed'");
        assert!(!out.contains("{{"));
    }

    #[test]
    fn test_parameter_set_leaves_unknown_tokens() {
        let set = ParameterSet::new(Vec::new(), HashMap::new());
        let out = set.interpolate("orders.region = {{ region }}").unwrap();
        assert_eq!(out, "orders.region = {{ region }}");
    }

    #[test]
    fn test_parameter_set_flexible_whitespace() {
        let p = Parameter::new("n", ParameterType::Number);
        let mut values = HashMap::new();
        values.insert("n".to_string(), ParameterValue::Text("5".into()));
        let set = ParameterSet::new(vec![&p], values);
        assert_eq!(set.interpolate("x = {{n}}").unwrap(), "x = 5");
        assert_eq!(set.interpolate("x = {{  n  }}").unwrap(), "x = 5");
    }
}
