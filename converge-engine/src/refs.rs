//! Reference expression resolution.
//!
//! Resource bodies may embed `resource:<name>.<path>` tokens pointing at
//! attributes of other resources. Resolution substitutes each token with the
//! value found by navigating the realized-state map, once the referenced
//! resource has completed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Matches `resource:<name>.<path>` tokens. Group 1 is the full
/// `<name>.<path>` expression, group 2 the leading name.
static REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"resource:((\w+)\S+)").expect("reference pattern is valid"));

/// Errors raised while resolving reference expressions.
#[derive(Debug, Error)]
pub enum RefError {
    /// The referenced resource has no entry in the realized state.
    #[error("reference '{reference}' points at unknown resource '{name}'")]
    UnknownResource { reference: String, name: String },

    /// The referenced resource exists but the attribute path does not.
    #[error("reference '{reference}' does not match any attribute")]
    MissingAttribute { reference: String },

    /// The reference resolves to a non-scalar inside a longer string.
    #[error("reference '{reference}' is not a scalar and cannot be interpolated")]
    NotInterpolable { reference: String },
}

/// Resolve every reference expression in `node` against `context`.
///
/// Maps are resolved per value (keys untouched), sequences per element.
/// A string that consists of exactly one token is replaced wholesale by the
/// referenced value, preserving its type; tokens embedded in longer strings
/// are interpolated and must resolve to scalars. Non-string scalars pass
/// through unchanged.
///
/// With `check_mode` a string whose references cannot be resolved yet keeps
/// its original literal; otherwise the resolution fails.
pub fn resolve_refs(
    node: &Value,
    context: &Map<String, Value>,
    check_mode: bool,
) -> Result<Value, RefError> {
    match node {
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_refs(value, context, check_mode)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_refs(item, context, check_mode))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::String(s) => resolve_string(s, context, check_mode),
        other => Ok(other.clone()),
    }
}

/// Collect the names of resources referenced anywhere inside `body`.
///
/// The body is scanned in serialized form, so tokens are found wherever they
/// sit: map values, sequence elements, nested strings. Serialization is
/// pretty-printed so that each scalar ends a line and the greedy token
/// pattern cannot run across neighbouring values.
pub fn referenced_names(body: &Value) -> BTreeSet<String> {
    let serialized = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
    REF_PATTERN
        .captures_iter(&serialized)
        .filter_map(|caps| caps.get(2).map(|name| name.as_str().to_owned()))
        .collect()
}

fn resolve_string(s: &str, context: &Map<String, Value>, check_mode: bool) -> Result<Value, RefError> {
    if !REF_PATTERN.is_match(s) {
        return Ok(Value::String(s.to_owned()));
    }
    match substitute(s, context) {
        Ok(value) => Ok(value),
        Err(_) if check_mode => Ok(Value::String(s.to_owned())),
        Err(err) => Err(err),
    }
}

fn substitute(s: &str, context: &Map<String, Value>) -> Result<Value, RefError> {
    // A string that is exactly one token takes the referenced value as-is,
    // whatever its type.
    if let Some(caps) = REF_PATTERN.captures(s) {
        if let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) {
            if whole.start() == 0 && whole.end() == s.len() {
                return navigate(expr.as_str(), context).cloned();
            }
        }
    }

    // Embedded tokens interpolate into the surrounding text.
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REF_PATTERN.captures_iter(s) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        match navigate(expr.as_str(), context)? {
            Value::String(text) => out.push_str(text),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            _ => {
                return Err(RefError::NotInterpolable {
                    reference: expr.as_str().to_owned(),
                });
            }
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Walk `context` along a `<name>.<path>` expression.
fn navigate<'a>(expr: &str, context: &'a Map<String, Value>) -> Result<&'a Value, RefError> {
    let mut segments = expr.split('.');
    let name = segments.next().unwrap_or(expr);
    let mut current = context.get(name).ok_or_else(|| RefError::UnknownResource {
        reference: expr.to_owned(),
        name: name.to_owned(),
    })?;
    for segment in segments {
        current = current.get(segment).ok_or_else(|| RefError::MissingAttribute {
            reference: expr.to_owned(),
        })?;
    }
    Ok(current)
}
