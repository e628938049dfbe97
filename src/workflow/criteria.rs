//! Completion criteria evaluation.
//!
//! A criterion is a tiny expression checked against a step's result map:
//!
//! - `name` passes if `name` is present and truthy
//! - `not name` passes if `name` is absent or falsy
//! - `name OP value` with `OP` one of `==`, `!=`, `>`, `>=`, `<`, `<=`
//!
//! Anything else fails closed.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static COMPARISON: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*(==|!=|>=|<=|>|<)\s*(.+)$").ok());
static NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\w+$").ok());
static NEGATION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^not\s+(\w+)$").ok());

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    /// Integer if it parses as one, float if it has a decimal point and
    /// parses, otherwise a string with surrounding quotes removed.
    fn parse(raw: &str) -> Self {
        let parsed = if raw.contains('.') {
            raw.trim().parse::<f64>().ok().map(Self::Float)
        } else {
            raw.trim().parse::<i64>().ok().map(Self::Int)
        };
        parsed.unwrap_or_else(|| Self::Str(raw.trim_matches(|c| c == '"' || c == '\'').to_string()))
    }
}

/// A parsed criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// `name`
    Truthy(String),
    /// `not name`
    Falsy(String),
    /// `name OP value`
    Compare { name: String, op: Operator, value: Literal },
}

impl Criterion {
    /// Parse a criterion string. Returns `None` when no form matches.
    pub fn parse(criterion: &str) -> Option<Self> {
        let criterion = criterion.trim();

        if let Some(caps) = COMPARISON.as_ref().and_then(|re| re.captures(criterion)) {
            let op = Operator::parse(&caps[2])?;
            return Some(Self::Compare {
                name: caps[1].to_string(),
                op,
                value: Literal::parse(&caps[3]),
            });
        }

        if NAME.as_ref().is_some_and(|re| re.is_match(criterion)) {
            return Some(Self::Truthy(criterion.to_string()));
        }

        NEGATION
            .as_ref()
            .and_then(|re| re.captures(criterion))
            .map(|caps| Self::Falsy(caps[1].to_string()))
    }

    /// Evaluate against a result context.
    pub fn matches(&self, context: &Map<String, Value>) -> bool {
        match self {
            Self::Truthy(name) => context.get(name).is_some_and(is_truthy),
            Self::Falsy(name) => !context.get(name).is_some_and(is_truthy),
            Self::Compare { name, op, value } => {
                context.get(name).is_some_and(|actual| compare(actual, *op, value))
            }
        }
    }
}

/// Outcome of evaluating a list of criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaOutcome {
    /// True when every criterion passed
    pub all_passed: bool,
    /// The criteria that did not pass, as written
    pub failed_criteria: Vec<String>,
}

/// Evaluates completion criteria.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaEvaluator;

impl CriteriaEvaluator {
    /// Evaluate one criterion. Never panics; unknown forms evaluate to false.
    pub fn evaluate(criterion: &str, context: &Map<String, Value>) -> bool {
        Criterion::parse(criterion).is_some_and(|c| c.matches(context))
    }

    /// Evaluate every criterion. An empty list always passes.
    pub fn evaluate_all<S: AsRef<str>>(
        criteria: &[S],
        context: &Map<String, Value>,
    ) -> CriteriaOutcome {
        let failed_criteria: Vec<String> = criteria
            .iter()
            .map(AsRef::as_ref)
            .filter(|criterion| !Self::evaluate(criterion, context))
            .map(str::to_string)
            .collect();

        CriteriaOutcome { all_passed: failed_criteria.is_empty(), failed_criteria }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Numeric view of a value; booleans count as 0 and 1.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare(actual: &Value, op: Operator, expected: &Literal) -> bool {
    let ordering = match expected {
        Literal::Int(i) => match actual.as_i64() {
            Some(a) => Some(a.cmp(i)),
            None => as_number(actual).and_then(|a| a.partial_cmp(&(*i as f64))),
        },
        Literal::Float(f) => as_number(actual).and_then(|a| a.partial_cmp(f)),
        Literal::Str(s) => actual.as_str().map(|a| a.cmp(s.as_str())),
    };

    match (op, ordering) {
        (Operator::Eq, Some(ord)) => ord == Ordering::Equal,
        (Operator::Ne, Some(ord)) => ord != Ordering::Equal,
        (Operator::Gt, Some(ord)) => ord == Ordering::Greater,
        (Operator::Ge, Some(ord)) => ord != Ordering::Less,
        (Operator::Lt, Some(ord)) => ord == Ordering::Less,
        (Operator::Le, Some(ord)) => ord != Ordering::Greater,
        // Mismatched types are never equal and never ordered
        (Operator::Ne, None) => true,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(CriteriaEvaluator::evaluate("x > 0", &ctx(json!({"x": 5}))));
        assert!(!CriteriaEvaluator::evaluate("x > 0", &ctx(json!({"x": 0}))));
        assert!(CriteriaEvaluator::evaluate("x >= 5", &ctx(json!({"x": 5}))));
        assert!(CriteriaEvaluator::evaluate("x<10", &ctx(json!({"x": 5}))));
        assert!(CriteriaEvaluator::evaluate("x <= 5.5", &ctx(json!({"x": 5}))));
        assert!(CriteriaEvaluator::evaluate("score == 0.75", &ctx(json!({"score": 0.75}))));
        assert!(CriteriaEvaluator::evaluate("count == 3", &ctx(json!({"count": 3.0}))));
    }

    #[test]
    fn test_string_comparisons() {
        let context = ctx(json!({"status": "done"}));
        assert!(CriteriaEvaluator::evaluate("status == done", &context));
        assert!(CriteriaEvaluator::evaluate("status == \"done\"", &context));
        assert!(CriteriaEvaluator::evaluate("status != 'pending'", &context));
        assert!(!CriteriaEvaluator::evaluate("status == pending", &context));
    }

    #[test]
    fn test_mismatched_types() {
        let context = ctx(json!({"x": "5"}));
        assert!(!CriteriaEvaluator::evaluate("x == 5", &context));
        assert!(CriteriaEvaluator::evaluate("x != 5", &context));
        assert!(!CriteriaEvaluator::evaluate("x > 1", &context));
    }

    #[test]
    fn test_missing_variable_fails() {
        assert!(!CriteriaEvaluator::evaluate("x", &Map::new()));
        assert!(!CriteriaEvaluator::evaluate("x == 1", &Map::new()));
        assert!(!CriteriaEvaluator::evaluate("x != 1", &Map::new()));
    }

    #[test]
    fn test_truthiness() {
        let context = ctx(json!({
            "yes": true,
            "no": false,
            "zero": 0,
            "empty": "",
            "list": [1],
            "nothing": null
        }));
        assert!(CriteriaEvaluator::evaluate("yes", &context));
        assert!(!CriteriaEvaluator::evaluate("no", &context));
        assert!(!CriteriaEvaluator::evaluate("zero", &context));
        assert!(!CriteriaEvaluator::evaluate("empty", &context));
        assert!(CriteriaEvaluator::evaluate("list", &context));
        assert!(!CriteriaEvaluator::evaluate("nothing", &context));
    }

    #[test]
    fn test_negation() {
        assert!(CriteriaEvaluator::evaluate("not x", &ctx(json!({"x": false}))));
        assert!(CriteriaEvaluator::evaluate("not x", &Map::new()));
        assert!(!CriteriaEvaluator::evaluate("not x", &ctx(json!({"x": 1}))));
    }

    #[test]
    fn test_unrecognised_forms_fail_closed() {
        let context = ctx(json!({"x": 1}));
        assert!(!CriteriaEvaluator::evaluate("", &context));
        assert!(!CriteriaEvaluator::evaluate("x in [1, 2]", &context));
        assert!(!CriteriaEvaluator::evaluate("not x > 0", &context));
        assert!(!CriteriaEvaluator::evaluate("x.y == 1", &context));
    }

    #[test]
    fn test_whitespace_is_ignored() {
        assert!(CriteriaEvaluator::evaluate("  x   ==   1  ", &ctx(json!({"x": 1}))));
    }

    #[test]
    fn test_evaluate_all() {
        let context = ctx(json!({"files": 3, "tests_passed": true}));

        let outcome = CriteriaEvaluator::evaluate_all(&["files > 0", "tests_passed"], &context);
        assert!(outcome.all_passed);
        assert!(outcome.failed_criteria.is_empty());

        let outcome =
            CriteriaEvaluator::evaluate_all(&["files > 5", "tests_passed", "reviewed"], &context);
        assert!(!outcome.all_passed);
        assert_eq!(outcome.failed_criteria, vec!["files > 5", "reviewed"]);

        let empty: [&str; 0] = [];
        assert!(CriteriaEvaluator::evaluate_all(&empty, &context).all_passed);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Criterion::parse("ready"), Some(Criterion::Truthy("ready".to_string())));
        assert_eq!(Criterion::parse("not ready"), Some(Criterion::Falsy("ready".to_string())));
        assert_eq!(
            Criterion::parse("n >= 2"),
            Some(Criterion::Compare { name: "n".to_string(), op: Operator::Ge, value: Literal::Int(2) })
        );
        assert_eq!(Criterion::parse("a b c"), None);
    }
}
