//! Condition expression evaluation.
//!
//! Edge conditions and condition nodes use a minimal grammar:
//! `"<dotted.path> <op> <literal>"` with ops `== != > >= < <=`, or a bare
//! `"<dotted.path>"` meaning truthiness. Literals are JSON scalars; an
//! unquoted word literal is treated as a string. A malformed expression
//! evaluates to false (logged at warn) so a bad edge condition degrades to
//! the declared-order fallback instead of failing the run.

use serde_json::Value;
use tessera_state::get_path;
use tracing::warn;

/// Evaluates a condition expression against the execution state.
pub fn evaluate_condition(expression: &str, state: &Value) -> bool {
    let expr = expression.trim();
    if expr.is_empty() {
        warn!(expression, "Empty condition expression");
        return false;
    }

    // Two-char operators must be tried before their one-char prefixes.
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(idx) = find_operator(expr, op) {
            let path = expr[..idx].trim();
            let literal = expr[idx + op.len()..].trim();
            if path.is_empty() || literal.is_empty() {
                warn!(expression, "Malformed condition expression");
                return false;
            }
            let actual = get_path(state, path);
            let expected = parse_literal(literal);
            return compare(actual, &expected, op);
        }
    }

    // Bare path: truthiness.
    truthy(get_path(state, expr))
}

fn find_operator(expr: &str, op: &str) -> Option<usize> {
    // Skip matches inside quoted literals.
    let mut in_quote = false;
    let bytes = expr.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => in_quote = !in_quote,
            _ if !in_quote && bytes[i..].starts_with(op.as_bytes()) => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_literal(literal: &str) -> Value {
    let trimmed = literal.trim();
    let unquoted = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(s) = unquoted {
        return Value::String(s.to_string());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn compare(actual: Option<&Value>, expected: &Value, op: &str) -> bool {
    match op {
        "==" => actual == Some(expected),
        "!=" => actual != Some(expected),
        _ => {
            let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), expected.as_f64()) else {
                return false;
            };
            match op {
                ">" => a > b,
                ">=" => a >= b,
                "<" => a < b,
                "<=" => a <= b,
                _ => false,
            }
        }
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}
