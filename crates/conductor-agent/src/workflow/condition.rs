use std::collections::HashMap;

use serde_json::Value;

/// Evaluate a guard expression against context data.
///
/// Supported forms:
/// - `key == "value"`, `key != "value"`, `key contains "substr"`
/// - numeric `key > 3`, `>=`, `<`, `<=`
/// - `true` / `false`, bare `key` (truthiness), `!key`
/// - `a && b`, `a || b` (`||` binds loosest)
///
/// Keys may be dotted paths into JSON objects. Unparseable expressions and
/// missing keys evaluate to `false`.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, Value>) -> bool {
    split_outside_quotes(expr, "||")
        .iter()
        .any(|clause| {
            split_outside_quotes(clause, "&&")
                .iter()
                .all(|term| evaluate_term(term, context))
        })
}

const OPERATORS: &[&str] = &[" contains ", "!=", "==", ">=", "<=", ">", "<"];

fn evaluate_term(term: &str, context: &HashMap<String, Value>) -> bool {
    let term = term.trim();
    if term.is_empty() {
        return false;
    }

    for op in OPERATORS {
        if let Some(pos) = find_outside_quotes(term, op) {
            let key = term[..pos].trim();
            let literal = term[pos + op.len()..].trim();
            if key.is_empty() || literal.is_empty() {
                return false;
            }
            let Some(value) = lookup(context, key) else {
                return false;
            };
            return compare(value, op.trim(), literal);
        }
    }

    match term {
        "true" => return true,
        "false" => return false,
        _ => {}
    }

    if let Some(rest) = term.strip_prefix('!') {
        return is_identifier(rest.trim()) && !lookup(context, rest.trim()).is_some_and(truthy);
    }

    is_identifier(term) && lookup(context, term).is_some_and(truthy)
}

fn compare(value: &Value, op: &str, literal: &str) -> bool {
    match op {
        "contains" => {
            let needle = unquote(literal);
            match value {
                Value::String(s) => s.contains(needle),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, literal)),
                _ => false,
            }
        }
        "==" => loose_eq(value, literal),
        "!=" => !loose_eq(value, literal),
        _ => {
            let (Some(lhs), Ok(rhs)) = (as_number(value), unquote(literal).parse::<f64>()) else {
                return false;
            };
            match op {
                ">" => lhs > rhs,
                ">=" => lhs >= rhs,
                "<" => lhs < rhs,
                "<=" => lhs <= rhs,
                _ => false,
            }
        }
    }
}

/// Compare a JSON value with a literal written in an expression.
fn loose_eq(value: &Value, literal: &str) -> bool {
    let text = unquote(literal);
    match value {
        Value::String(s) => s == text,
        Value::Bool(b) => text.parse::<bool>().is_ok_and(|l| l == *b),
        Value::Number(n) => match (n.as_f64(), text.parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => false,
        },
        Value::Null => text == "null",
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn lookup<'a>(context: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(v) = context.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

/// Byte offset of the first `pat` not inside double quotes.
fn find_outside_quotes(s: &str, pat: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && s[i..].starts_with(pat) {
            return Some(i);
        }
    }
    None
}

fn split_outside_quotes<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(pos) = find_outside_quotes(rest, sep) {
        parts.push(&rest[..pos]);
        rest = &rest[pos + sep.len()..];
    }
    parts.push(rest);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> HashMap<String, Value> {
        let mut ctx = HashMap::new();
        ctx.insert("status".into(), json!("success"));
        ctx.insert("output".into(), json!("The file was created successfully."));
        ctx.insert("score".into(), json!(0.82));
        ctx.insert("count".into(), json!("7"));
        ctx.insert("approved".into(), json!(true));
        ctx.insert("empty".into(), json!(""));
        ctx.insert("tags".into(), json!(["urgent", "billing"]));
        ctx.insert("review".into(), json!({"verdict": "pass", "issues": 0}));
        ctx
    }

    #[test]
    fn equality() {
        let c = ctx();
        assert!(evaluate_condition(r#"status == "success""#, &c));
        assert!(!evaluate_condition(r#"status == "failure""#, &c));
        assert!(evaluate_condition(r#"status != "failure""#, &c));
        assert!(!evaluate_condition(r#"status != "success""#, &c));
        assert!(evaluate_condition("approved == true", &c));
        assert!(evaluate_condition("score == 0.82", &c));
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let c = ctx();
        assert!(evaluate_condition(r#"output contains "created""#, &c));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &c));
        assert!(evaluate_condition(r#"tags contains "billing""#, &c));
        assert!(!evaluate_condition(r#"tags contains "sales""#, &c));
    }

    #[test]
    fn numeric_comparisons() {
        let c = ctx();
        assert!(evaluate_condition("score > 0.8", &c));
        assert!(evaluate_condition("score >= 0.82", &c));
        assert!(!evaluate_condition("score < 0.5", &c));
        assert!(evaluate_condition("count <= 7", &c));
        assert!(!evaluate_condition("status > 1", &c));
    }

    #[test]
    fn literals_and_truthiness() {
        let c = ctx();
        assert!(evaluate_condition("true", &c));
        assert!(!evaluate_condition("false", &c));
        assert!(evaluate_condition("approved", &c));
        assert!(!evaluate_condition("empty", &c));
        assert!(evaluate_condition("!empty", &c));
        assert!(evaluate_condition("!missing", &c));
        assert!(!evaluate_condition("!approved", &c));
    }

    #[test]
    fn boolean_combinations() {
        let c = ctx();
        assert!(evaluate_condition(r#"approved && status == "success""#, &c));
        assert!(!evaluate_condition(r#"approved && status == "failure""#, &c));
        assert!(evaluate_condition(r#"status == "failure" || score > 0.5"#, &c));
        // && binds tighter than ||
        assert!(evaluate_condition(r#"false && missing || approved"#, &c));
    }

    #[test]
    fn operators_inside_quotes_are_literal() {
        let mut c = HashMap::new();
        c.insert("msg".into(), json!("a || b"));
        assert!(evaluate_condition(r#"msg == "a || b""#, &c));
    }

    #[test]
    fn dotted_paths() {
        let c = ctx();
        assert!(evaluate_condition(r#"review.verdict == "pass""#, &c));
        assert!(evaluate_condition("review.issues < 1", &c));
        assert!(!evaluate_condition("review.missing", &c));
    }

    #[test]
    fn missing_key_and_garbage_are_false() {
        let c = ctx();
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
        assert!(!evaluate_condition(r#"missing != "value""#, &c));
        assert!(!evaluate_condition("this is not valid", &c));
        assert!(!evaluate_condition("", &c));
        assert!(!evaluate_condition("== \"x\"", &c));
    }
}
