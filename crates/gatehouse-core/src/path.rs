//! URL path templates with named captures.
//!
//! Templates follow the `{param}` syntax used by axum 0.8+:
//!
//! ```text
//! /orders/view                 exact path
//! /orders/{id}                 captures `id`
//! /orders/{user}/{id}          captures `user` and `id`
//! /static/{*rest}              trailing wildcard, captures the remainder
//! ```
//!
//! A wildcard segment must be the last segment and may match zero or more
//! path segments. Matching is segment-wise; trailing slashes are ignored on
//! both sides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Parameters captured from the path during a successful match.
pub type PathParams = HashMap<String, String>;

// ─────────────────────────────────────────────────────────────────────────────
// Parse errors
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons a path template fails to parse.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatternError {
    /// The template is empty.
    #[error("path template cannot be empty")]
    Empty,

    /// The template does not start with `/`.
    #[error("path template must start with '/'")]
    NoLeadingSlash,

    /// A `{}` or `{*}` segment has no parameter name.
    #[error("segment {0} has an empty parameter name")]
    EmptyParamName(usize),

    /// A segment mixes literal text with a `{param}` capture.
    #[error("segment '{0}' mixes literal text and a capture")]
    PartialCapture(String),

    /// The same parameter name appears twice.
    #[error("parameter '{0}' appears more than once")]
    DuplicateParam(String),

    /// A `{*rest}` wildcard is followed by further segments.
    #[error("wildcard segment must be the last segment")]
    WildcardNotLast,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed segment of a path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Literal text that must match exactly.
    Static(String),
    /// `{name}`: captures exactly one path segment.
    Param(String),
    /// `{*name}`: captures the remaining segments (possibly none).
    Wildcard(String),
}

/// A parsed, matchable path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PathSegment>,
}

impl PathPattern {
    /// Parse a template string into a matchable pattern.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.trim().is_empty() {
            return Err(PatternError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PatternError::NoLeadingSlash);
        }

        let mut segments = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        for (idx, part) in parts.iter().enumerate() {
            if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let (wildcard, name) = match inner.strip_prefix('*') {
                    Some(rest) => (true, rest),
                    None => (false, inner),
                };
                if name.is_empty() {
                    return Err(PatternError::EmptyParamName(idx));
                }
                if seen.contains(&name) {
                    return Err(PatternError::DuplicateParam(name.to_string()));
                }
                seen.push(name);
                if wildcard {
                    if idx + 1 != parts.len() {
                        return Err(PatternError::WildcardNotLast);
                    }
                    segments.push(PathSegment::Wildcard(name.to_string()));
                } else {
                    segments.push(PathSegment::Param(name.to_string()));
                }
            } else if part.contains('{') || part.contains('}') {
                return Err(PatternError::PartialCapture(part.to_string()));
            } else {
                segments.push(PathSegment::Static(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original template text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed segments.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Names of all capture parameters, in template order.
    pub fn param_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                PathSegment::Param(n) | PathSegment::Wildcard(n) => Some(n.as_str()),
                PathSegment::Static(_) => None,
            })
            .collect()
    }

    /// Match a concrete request path against this template.
    ///
    /// Returns the captured parameters on success, `None` on mismatch.
    /// A trailing wildcard captures the joined remainder (`""` when the
    /// path ends exactly where the wildcard starts).
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let given: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = PathParams::new();

        let mut gi = 0;
        for segment in &self.segments {
            match segment {
                PathSegment::Static(lit) => {
                    if given.get(gi) != Some(&lit.as_str()) {
                        return None;
                    }
                    gi += 1;
                }
                PathSegment::Param(name) => {
                    let value = given.get(gi)?;
                    params.insert(name.clone(), (*value).to_string());
                    gi += 1;
                }
                PathSegment::Wildcard(name) => {
                    params.insert(name.clone(), given[gi..].join("/"));
                    gi = given.len();
                }
            }
        }
        if gi != given.len() {
            return None;
        }
        Some(params)
    }

    /// Ranking score for overlapping templates: more static segments beat
    /// more captures, and an otherwise-equal template without a wildcard
    /// beats one with a wildcard.
    ///
    /// `/orders/view` outranks `/orders/{id}` outranks `/orders/{*rest}`
    /// outranks `/{*rest}`.
    pub fn specificity(&self) -> u32 {
        let mut statics = 0u32;
        let mut captures = 0u32;
        let mut wildcard = false;
        for segment in &self.segments {
            match segment {
                PathSegment::Static(_) => statics += 1,
                PathSegment::Param(_) => captures += 1,
                PathSegment::Wildcard(_) => wildcard = true,
            }
        }
        statics * 1_000 + captures + if wildcard { 0 } else { 1 }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for PathPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
