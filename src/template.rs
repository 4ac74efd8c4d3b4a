//! Single-pass config resolver
//!
//! Rewrites `$nodes.*` references inside node configs from prior node
//! outputs before a token is dispatched. Three forms are recognized inside
//! string values:
//!
//! - `$nodes.{id}` - the entire recorded output of `{id}`
//! - `$nodes.{id}.{dotted.path}` - a field extracted from the recorded output
//! - `${ $nodes.{id}.{path} }` - interpolation; the resolved value is
//!   stringified (JSON-encoded when it is not already a string)
//!
//! A string that is exactly one bare reference resolves to the referenced
//! value itself (an object stays an object); references embedded in larger
//! strings are stringified in place. Configs containing no reference syntax
//! pass through untouched.
//!
//! The resolver is a textual substitution producing worker input; routing
//! predicates live in the condition evaluator. The two share only the
//! structured-path extraction semantics.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::jsonpath::{self, PathError};

/// Resolution failure
#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("unresolved reference: node '{node_id}' has no recorded output")]
    UnresolvedReference { node_id: String },

    #[error("cannot interpolate '{snippet}': only $nodes references are supported")]
    UnsupportedInterpolation { snippet: String },

    #[error("{0}")]
    Path(#[from] PathError),
}

/// Source of recorded node outputs
///
/// The coordinator prefetches referenced outputs from the hot store and CAS
/// into a map before resolving; tests feed maps directly.
pub trait OutputSource {
    fn output(&self, node_id: &str) -> Option<Arc<Value>>;
}

impl OutputSource for HashMap<String, Arc<Value>> {
    fn output(&self, node_id: &str) -> Option<Arc<Value>> {
        self.get(node_id).cloned()
    }
}

// ============================================================================
// TOKENIZATION
// ============================================================================

/// A parsed fragment of a config string
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal text (range into the original string)
    Literal(Range<usize>),
    /// `$nodes.{id}` or `$nodes.{id}.{path}`
    NodeRef {
        node_id: String,
        path: Option<String>,
    },
    /// `${ ... }` interpolation around an inner reference
    Interp { inner: String },
}

const NODES_PREFIX: &str = "$nodes.";

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn is_path_char(c: char) -> bool {
    is_ident_char(c) || c == '.' || c == '[' || c == ']'
}

/// Single-pass scan of a string into literal and reference tokens
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if text[i..].starts_with(NODES_PREFIX) {
            if let Some((token, end)) = parse_node_ref(text, i) {
                if i > literal_start {
                    tokens.push(Token::Literal(literal_start..i));
                }
                tokens.push(token);
                literal_start = end;
                i = end;
                continue;
            }
        } else if text[i..].starts_with("${") {
            if let Some(close) = text[i + 2..].find('}') {
                let inner = text[i + 2..i + 2 + close].trim().to_string();
                if i > literal_start {
                    tokens.push(Token::Literal(literal_start..i));
                }
                tokens.push(Token::Interp { inner });
                literal_start = i + 2 + close + 1;
                i = literal_start;
                continue;
            }
        }
        // advance one char (not one byte)
        i += text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
    }

    if literal_start < text.len() {
        tokens.push(Token::Literal(literal_start..text.len()));
    }

    tokens
}

/// Parse `$nodes.{id}[.{path}]` starting at `start`; returns token and the
/// byte offset one past the reference
fn parse_node_ref(text: &str, start: usize) -> Option<(Token, usize)> {
    let after_prefix = start + NODES_PREFIX.len();
    let rest = &text[after_prefix..];

    let id_len = rest.chars().take_while(|c| is_ident_char(*c)).count();
    if id_len == 0 {
        return None;
    }
    let id_end: usize = rest.chars().take(id_len).map(char::len_utf8).sum();
    let node_id = rest[..id_end].to_string();

    // optional dotted path; trailing dots (sentence punctuation) back off
    let mut path_end = id_end;
    if rest[id_end..].starts_with('.') {
        let tail = &rest[id_end..];
        let mut consumed: usize = 0;
        for c in tail.chars() {
            if is_path_char(c) {
                consumed += c.len_utf8();
            } else {
                break;
            }
        }
        let mut path = &tail[..consumed];
        while path.ends_with('.') {
            path = &path[..path.len() - 1];
        }
        if path.len() > 1 {
            path_end = id_end + path.len();
        }
    }

    let path = if path_end > id_end {
        Some(rest[id_end + 1..path_end].to_string())
    } else {
        None
    };

    Some((Token::NodeRef { node_id, path }, after_prefix + path_end))
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Look up a reference, extracting the dotted path when present
///
/// A recorded output with a missing field resolves to `null`, matching the
/// condition evaluator's missing-field semantics; a node with no recorded
/// output at all is an error.
fn lookup(
    node_id: &str,
    path: Option<&str>,
    outputs: &dyn OutputSource,
) -> Result<Value, ResolveError> {
    let output = outputs
        .output(node_id)
        .ok_or_else(|| ResolveError::UnresolvedReference {
            node_id: node_id.to_string(),
        })?;
    match path {
        None => Ok((*output).clone()),
        Some(p) => Ok(jsonpath::resolve(&output, p)?.unwrap_or(Value::Null)),
    }
}

/// JSON-encode a value for embedding in a string (strings stay bare)
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve the inner expression of a `${ ... }` interpolation
fn resolve_interp(inner: &str, outputs: &dyn OutputSource) -> Result<Value, ResolveError> {
    if let Some(rest) = inner.strip_prefix(NODES_PREFIX) {
        let (node_id, path) = match rest.split_once('.') {
            Some((id, p)) => (id, Some(p)),
            None => (rest, None),
        };
        lookup(node_id, path, outputs)
    } else {
        Err(ResolveError::UnsupportedInterpolation {
            snippet: inner.to_string(),
        })
    }
}

fn resolve_string(text: &str, outputs: &dyn OutputSource) -> Result<Value, ResolveError> {
    let tokens = tokenize(text);

    // fast path: no reference syntax at all
    if tokens.len() == 1 {
        match &tokens[0] {
            Token::Literal(_) => return Ok(Value::String(text.to_string())),
            // a bare reference keeps its JSON type
            Token::NodeRef { node_id, path } => {
                return lookup(node_id, path.as_deref(), outputs)
            }
            Token::Interp { inner } => {
                let value = resolve_interp(inner, outputs)?;
                return Ok(Value::String(stringify(&value)));
            }
        }
    }

    let mut result = String::with_capacity(text.len());
    for token in &tokens {
        match token {
            Token::Literal(range) => result.push_str(&text[range.clone()]),
            Token::NodeRef { node_id, path } => {
                let value = lookup(node_id, path.as_deref(), outputs)?;
                result.push_str(&stringify(&value));
            }
            Token::Interp { inner } => {
                let value = resolve_interp(inner, outputs)?;
                result.push_str(&stringify(&value));
            }
        }
    }
    Ok(Value::String(result))
}

/// Recursively resolve every string inside a config value
pub fn resolve(config: &Value, outputs: &dyn OutputSource) -> Result<Value, ResolveError> {
    match config {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve(item, outputs)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// Collect every node id a config references (for output prefetching)
pub fn referenced_nodes(config: &Value, into: &mut std::collections::HashSet<String>) {
    match config {
        Value::String(s) => {
            for token in tokenize(s) {
                match token {
                    Token::NodeRef { node_id, .. } => {
                        into.insert(node_id);
                    }
                    Token::Interp { inner } => {
                        if let Some(rest) = inner.strip_prefix(NODES_PREFIX) {
                            let id: String =
                                rest.chars().take_while(|c| is_ident_char(*c)).collect();
                            if !id.is_empty() {
                                into.insert(id);
                            }
                        }
                    }
                    Token::Literal(_) => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                referenced_nodes(item, into);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                referenced_nodes(v, into);
            }
        }
        _ => {}
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn outputs(pairs: &[(&str, Value)]) -> HashMap<String, Arc<Value>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Arc::new(v.clone())))
            .collect()
    }

    #[test]
    fn reference_free_config_passes_through() {
        let out = outputs(&[]);
        let config = json!({
            "url": "https://example.com",
            "retries": 3,
            "flags": [true, null, "plain $ text"]
        });
        assert_eq!(resolve(&config, &out).unwrap(), config);
    }

    #[test]
    fn bare_reference_keeps_json_type() {
        let out = outputs(&[("fetch", json!({"status": 200, "body": {"id": 7}}))]);
        let config = json!({"upstream": "$nodes.fetch"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["upstream"], json!({"status": 200, "body": {"id": 7}}));
    }

    #[test]
    fn dotted_path_extracts_field() {
        let out = outputs(&[("fetch", json!({"body": {"items": [{"id": 42}]}}))]);
        let config = json!({"target": "$nodes.fetch.body.items[0].id"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["target"], json!(42));
    }

    #[test]
    fn embedded_reference_is_stringified() {
        let out = outputs(&[("fetch", json!({"status": 200}))]);
        let config = json!({"msg": "upstream returned $nodes.fetch.status today"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["msg"], json!("upstream returned 200 today"));
    }

    #[test]
    fn embedded_object_is_json_encoded() {
        let out = outputs(&[("fetch", json!({"a": 1}))]);
        let config = json!({"msg": "payload: $nodes.fetch"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["msg"], json!("payload: {\"a\":1}"));
    }

    #[test]
    fn interpolation_stringifies() {
        let out = outputs(&[("score", json!({"value": 91.5}))]);
        let config = json!({"prompt": "Score was ${ $nodes.score.value }."});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["prompt"], json!("Score was 91.5."));
    }

    #[test]
    fn whole_string_interpolation_is_still_a_string() {
        let out = outputs(&[("fetch", json!({"status": 200}))]);
        let config = json!({"code": "${ $nodes.fetch.status }"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["code"], json!("200"));
    }

    #[test]
    fn missing_output_is_unresolved_reference() {
        let out = outputs(&[]);
        let config = json!({"target": "$nodes.ghost.id"});
        let err = resolve(&config, &out).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnresolvedReference {
                node_id: "ghost".to_string()
            }
        );
    }

    #[test]
    fn missing_field_resolves_to_null() {
        let out = outputs(&[("fetch", json!({"status": 200}))]);
        let config = json!({"x": "$nodes.fetch.body"});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["x"], Value::Null);
    }

    #[test]
    fn trailing_sentence_dot_is_not_a_path() {
        let out = outputs(&[("a", json!("done"))]);
        let config = json!({"msg": "finished $nodes.a."});
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved["msg"], json!("finished done."));
    }

    #[test]
    fn unsupported_interpolation_errors() {
        let out = outputs(&[]);
        let config = json!({"x": "${ env.HOME }"});
        let err = resolve(&config, &out).unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedInterpolation { .. }));
    }

    #[test]
    fn nested_arrays_and_objects_resolve() {
        let out = outputs(&[("a", json!(1)), ("b", json!(2))]);
        let config = json!({
            "list": ["$nodes.a", {"inner": "$nodes.b"}],
        });
        let resolved = resolve(&config, &out).unwrap();
        assert_eq!(resolved, json!({"list": [1, {"inner": 2}]}));
    }

    #[test]
    fn scan_collects_referenced_nodes() {
        let config = json!({
            "a": "$nodes.fetch.status",
            "b": ["${ $nodes.score.value }", "plain"],
            "c": {"d": "$nodes.fetch"}
        });
        let mut refs = HashSet::new();
        referenced_nodes(&config, &mut refs);
        let mut sorted: Vec<_> = refs.into_iter().collect();
        sorted.sort();
        assert_eq!(sorted, vec!["fetch", "score"]);
    }
}
