//! Structural JSON comparison with matcher tokens.
//!
//! An expected document is walked recursively against an actual document.
//! Expected string leaves starting with `@` are matcher tokens (type checks,
//! emptiness, regex, substring, numeric bounds, length) instead of literal
//! values. Two modes exist: strict (extra keys in actual objects fail) and
//! partial (extra keys are ignored). Mismatch diagnostics always name the
//! JSON path at which the comparison diverged, plus both values.

use regex::Regex;
use serde_json::Value;

use crate::error::StepError;

/// Compare `expected` against `actual` in strict mode: actual objects may
/// not carry keys the expected document does not mention.
///
/// # Errors
///
/// Returns `StepError::AssertionFailed` naming the diverging path.
pub fn json_matches(expected: &Value, actual: &Value) -> Result<(), StepError> {
    compare(expected, actual, "", false)
}

/// Compare `expected` against `actual` in partial mode: extra keys in
/// actual objects are permitted.
///
/// # Errors
///
/// Returns `StepError::AssertionFailed` naming the diverging path.
pub fn json_contains(expected: &Value, actual: &Value) -> Result<(), StepError> {
    compare(expected, actual, "", true)
}

fn compare(expected: &Value, actual: &Value, path: &str, partial: bool) -> Result<(), StepError> {
    match expected {
        Value::Object(expected_map) => {
            let Value::Object(actual_map) = actual else {
                return Err(mismatch(path, "object", &type_name(actual)));
            };
            if !partial {
                for key in actual_map.keys() {
                    if !expected_map.contains_key(key) {
                        return Err(StepError::assertion(format!(
                            "at {}: unexpected key \"{key}\"",
                            child_path(path, key)
                        )));
                    }
                }
            }
            for (key, expected_value) in expected_map {
                let next = child_path(path, key);
                let Some(actual_value) = actual_map.get(key) else {
                    return Err(StepError::assertion(format!(
                        "at {path}: key \"{key}\" not found"
                    )));
                };
                compare(expected_value, actual_value, &next, partial)?;
            }
            Ok(())
        }
        Value::Array(expected_items) => {
            let Value::Array(actual_items) = actual else {
                return Err(mismatch(path, "array", &type_name(actual)));
            };
            if expected_items.len() != actual_items.len() {
                return Err(StepError::assertion(format!(
                    "at {path}: expected array length {}, got {}",
                    expected_items.len(),
                    actual_items.len()
                )));
            }
            for (index, (expected_item, actual_item)) in
                expected_items.iter().zip(actual_items).enumerate()
            {
                compare(expected_item, actual_item, &format!("{path}[{index}]"), partial)?;
            }
            Ok(())
        }
        Value::String(text) if text.starts_with('@') => match_token(text, actual, path),
        _ => {
            if render(expected) == render(actual) {
                Ok(())
            } else {
                Err(StepError::assertion(format!(
                    "at {path}: expected {}, got {}",
                    render(expected),
                    render(actual)
                )))
            }
        }
    }
}

/// Evaluate one `@` matcher token against an actual value.
///
/// # Errors
///
/// Returns `StepError::AssertionFailed` when the predicate does not hold or
/// the token is unknown.
pub fn match_token(token: &str, actual: &Value, path: &str) -> Result<(), StepError> {
    if let Some(pattern) = token.strip_prefix("@regex:") {
        return match_regex(pattern, actual, path);
    }
    if let Some(needle) = token.strip_prefix("@contains:") {
        let text = require_string(actual, path, "@contains")?;
        return if text.contains(needle) {
            Ok(())
        } else {
            Err(StepError::assertion(format!(
                "at {path}: value \"{text}\" does not contain \"{needle}\""
            )))
        };
    }
    if let Some(prefix) = token.strip_prefix("@startswith:") {
        let text = require_string(actual, path, "@startswith")?;
        return if text.starts_with(prefix) {
            Ok(())
        } else {
            Err(StepError::assertion(format!(
                "at {path}: value \"{text}\" does not start with \"{prefix}\""
            )))
        };
    }
    if let Some(suffix) = token.strip_prefix("@endswith:") {
        let text = require_string(actual, path, "@endswith")?;
        return if text.ends_with(suffix) {
            Ok(())
        } else {
            Err(StepError::assertion(format!(
                "at {path}: value \"{text}\" does not end with \"{suffix}\""
            )))
        };
    }
    if let Some(bound) = token.strip_prefix("@gt:") {
        return match_numeric(bound, actual, path, "@gt", |value, limit| value > limit);
    }
    if let Some(bound) = token.strip_prefix("@gte:") {
        return match_numeric(bound, actual, path, "@gte", |value, limit| value >= limit);
    }
    if let Some(bound) = token.strip_prefix("@lt:") {
        return match_numeric(bound, actual, path, "@lt", |value, limit| value < limit);
    }
    if let Some(bound) = token.strip_prefix("@lte:") {
        return match_numeric(bound, actual, path, "@lte", |value, limit| value <= limit);
    }
    if let Some(length) = token.strip_prefix("@len:") {
        return match_length(length, actual, path);
    }

    match token {
        "@string" => require_kind(actual, path, "string", Value::is_string),
        "@number" => require_kind(actual, path, "number", Value::is_number),
        "@boolean" => require_kind(actual, path, "boolean", Value::is_boolean),
        "@array" => require_kind(actual, path, "array", Value::is_array),
        "@object" => require_kind(actual, path, "object", Value::is_object),
        "@any" => Ok(()),
        "@null" => {
            if actual.is_null() {
                Ok(())
            } else {
                Err(StepError::assertion(format!(
                    "at {path}: expected null, got {}",
                    render(actual)
                )))
            }
        }
        "@notnull" => {
            if actual.is_null() {
                Err(StepError::assertion(format!(
                    "at {path}: expected non-null value"
                )))
            } else {
                Ok(())
            }
        }
        "@empty" => match_empty(actual, path),
        "@notempty" => match_not_empty(actual, path),
        _ => Err(StepError::assertion(format!("unknown matcher: {token}"))),
    }
}

/// Extract a value at a dot-separated path with `[N]` array indexing,
/// e.g. `data.users[0].name`.
///
/// # Errors
///
/// Returns `StepError::AssertionFailed` when a key is absent, a segment has
/// the wrong shape, or an index is out of bounds.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value, StepError> {
    let mut current = root;

    for part in path.split('.') {
        if let Some(bracket) = part.find('[') {
            let key = &part[..bracket];
            let index_text = part
                .get(bracket + 1..part.len().saturating_sub(1))
                .unwrap_or_default();
            let index: usize = index_text.parse().map_err(|_| {
                StepError::assertion(format!("invalid array index: {index_text}"))
            })?;

            if !key.is_empty() {
                current = current
                    .as_object()
                    .and_then(|object| object.get(key))
                    .ok_or_else(|| StepError::assertion(format!("key not found: {key}")))?;
            }
            let items = current
                .as_array()
                .ok_or_else(|| StepError::assertion(format!("expected array at {part}")))?;
            current = items.get(index).ok_or_else(|| {
                StepError::assertion(format!("array index out of bounds: {index}"))
            })?;
        } else {
            current = current
                .as_object()
                .ok_or_else(|| StepError::assertion(format!("expected object at {part}")))?
                .get(part)
                .ok_or_else(|| StepError::assertion(format!("key not found: {part}")))?;
        }
    }

    Ok(current)
}

/// Render a JSON leaf the way step assertions compare it: strings without
/// quotes, everything else in its JSON form.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn match_regex(pattern: &str, actual: &Value, path: &str) -> Result<(), StepError> {
    let text = require_string(actual, path, "@regex")?;
    let regex = Regex::new(pattern).map_err(|e| {
        StepError::assertion(format!("at {path}: invalid regex pattern \"{pattern}\": {e}"))
    })?;
    if regex.is_match(text) {
        Ok(())
    } else {
        Err(StepError::assertion(format!(
            "at {path}: value \"{text}\" does not match pattern \"{pattern}\""
        )))
    }
}

fn match_numeric(
    bound: &str,
    actual: &Value,
    path: &str,
    token: &str,
    holds: fn(f64, f64) -> bool,
) -> Result<(), StepError> {
    let limit: f64 = bound.parse().map_err(|_| {
        StepError::assertion(format!("at {path}: {token} requires a numeric bound"))
    })?;
    let value = actual.as_f64().ok_or_else(|| {
        StepError::assertion(format!(
            "at {path}: {token} requires numeric actual value, got {}",
            type_name(actual)
        ))
    })?;
    if holds(value, limit) {
        Ok(())
    } else {
        Err(StepError::assertion(format!(
            "at {path}: expected value {token} {limit}, got {value}"
        )))
    }
}

fn match_length(raw: &str, actual: &Value, path: &str) -> Result<(), StepError> {
    let expected: usize = raw
        .parse()
        .map_err(|_| StepError::assertion(format!("at {path}: @len requires an integer")))?;
    let actual_len = match actual {
        Value::String(text) => text.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(StepError::assertion(format!(
                "at {path}: @len requires string, array, or object, got {}",
                type_name(other)
            )));
        }
    };
    if actual_len == expected {
        Ok(())
    } else {
        Err(StepError::assertion(format!(
            "at {path}: expected length {expected}, got {actual_len}"
        )))
    }
}

fn match_empty(actual: &Value, path: &str) -> Result<(), StepError> {
    let empty = match actual {
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        other => {
            return Err(StepError::assertion(format!(
                "at {path}: @empty requires string, array, object, or null, got {}",
                type_name(other)
            )));
        }
    };
    if empty {
        Ok(())
    } else {
        Err(StepError::assertion(format!(
            "at {path}: expected empty value, got {}",
            render(actual)
        )))
    }
}

fn match_not_empty(actual: &Value, path: &str) -> Result<(), StepError> {
    match match_empty(actual, path) {
        Ok(()) => Err(StepError::assertion(format!(
            "at {path}: expected non-empty value"
        ))),
        Err(_) if !matches!(actual, Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Null) => {
            Err(StepError::assertion(format!(
                "at {path}: @notempty requires string, array, object, or null, got {}",
                type_name(actual)
            )))
        }
        Err(_) => Ok(()),
    }
}

fn require_string<'a>(actual: &'a Value, path: &str, token: &str) -> Result<&'a str, StepError> {
    actual.as_str().ok_or_else(|| {
        StepError::assertion(format!(
            "at {path}: {token} requires string value, got {}",
            type_name(actual)
        ))
    })
}

fn require_kind(
    actual: &Value,
    path: &str,
    kind: &str,
    check: fn(&Value) -> bool,
) -> Result<(), StepError> {
    if check(actual) {
        Ok(())
    } else {
        Err(mismatch(path, kind, &type_name(actual)))
    }
}

fn mismatch(path: &str, expected: &str, actual: &str) -> StepError {
    StepError::assertion(format!("at {path}: expected {expected}, got {actual}"))
}

fn type_name(value: &Value) -> String {
    String::from(match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    })
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        String::from(key)
    } else {
        format!("{path}.{key}")
    }
}
