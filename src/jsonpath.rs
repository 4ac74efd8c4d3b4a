//! Structured-path extraction over recorded node outputs
//!
//! Shared semantics for the two places a dotted path reaches into JSON: the
//! expression resolver (`$nodes.fetch.body.items[0]`) and the condition
//! evaluator (`output.score`, `ctx.fetch.status`).
//!
//! Supports:
//! - `$.a.b.c` and `a.b.c` (dot notation, optional `$.` prefix)
//! - `a[0].b` (array index)
//! - `a.0.b` (numeric segment treated as index)
//!
//! Does NOT support filters, wildcards, or slices.

use serde_json::Value;
use thiserror::Error;

/// A path that cannot be parsed into segments
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported structured path '{path}'")]
pub struct PathError {
    pub path: String,
}

/// A parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field access: `.field`
    Field(String),
    /// Array index access: `[0]`
    Index(usize),
}

/// Parse a dotted path into segments
///
/// `$` alone refers to the root (empty segment list).
pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let path = if let Some(rest) = path.strip_prefix("$.") {
        rest
    } else if path == "$" {
        return Ok(vec![]);
    } else {
        path
    };

    if path.is_empty() {
        return Ok(vec![]);
    }

    let err = || PathError {
        path: path.to_string(),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(err());
        }

        // field[0][1] style: field name, then bracketed indices
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            let field = &rest[..bracket];
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']').ok_or_else(err)?;
                let index: usize = stripped[..close].parse().map_err(|_| err())?;
                segments.push(Segment::Index(index));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(err());
            }
        } else if let Ok(index) = rest.parse::<usize>() {
            // "items.0" is equivalent to "items[0]"
            segments.push(Segment::Index(index));
        } else {
            segments.push(Segment::Field(rest.to_string()));
        }
    }

    Ok(segments)
}

/// Walk segments into a value without cloning
pub fn extract<'v>(value: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    let mut current = value;
    for segment in segments {
        current = match segment {
            Segment::Field(name) => current.get(name)?,
            Segment::Index(idx) => current.get(*idx)?,
        };
    }
    Some(current)
}

/// Parse and extract in one step
pub fn resolve(value: &Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    Ok(extract(value, &segments).cloned())
}
