//! Route predicate language: the declarative form and its compiled evaluator.
//!
//! A [`Predicate`] is what config documents carry: a small boolean tree over
//! path templates, methods, header matchers, and query matchers.
//!
//! ```yaml
//! predicate:
//!   all:
//!     - path: /api/orders/{id}
//!     - method: GET
//!     - header: { name: x-tenant, equals: acme }
//! ```
//!
//! [`CompiledPredicate`] is the runtime form: path templates parsed, regexes
//! compiled, ready for allocation-light evaluation on the hot path. The
//! split mirrors the config/compiled pattern used throughout this crate;
//! validate and compile once at table build, evaluate per request.

use crate::path::{PathParams, PathPattern, PatternError};
use crate::request::{HttpMethod, RequestHead};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Declarative form
// ─────────────────────────────────────────────────────────────────────────────

/// A single header or query matcher.
///
/// At most one of `equals` / `matches` may be set. With neither, the
/// predicate checks for presence only: `{ name: x-debug }` matches any
/// request that carries the parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMatch {
    /// Header name (matched case-insensitively) or query parameter name.
    pub name: String,
    /// The value must equal this string exactly (case-sensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,
    /// The value must match this regex (compiled at table build).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
}

impl ParamMatch {
    /// Presence-only matcher.
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            equals: None,
            matches: None,
        }
    }

    /// Exact-value matcher.
    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            equals: Some(value.into()),
            matches: None,
        }
    }

    /// Regex matcher.
    pub fn matches(name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            equals: None,
            matches: Some(regex.into()),
        }
    }
}

/// Declarative predicate tree, as carried by route configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Path template match, `{param}` captures included.
    Path(String),
    /// HTTP method match.
    Method(HttpMethod),
    /// Header match (name compared case-insensitively).
    Header(ParamMatch),
    /// Query parameter match.
    Query(ParamMatch),
    /// Conjunction: every child must match.
    All(Vec<Predicate>),
    /// Disjunction: at least one child must match.
    Any(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for a path predicate.
    pub fn path(template: impl Into<String>) -> Self {
        Predicate::Path(template.into())
    }

    /// Shorthand for a method predicate.
    pub fn method(method: HttpMethod) -> Self {
        Predicate::Method(method)
    }

    /// Shorthand for a header-equals predicate.
    pub fn header_equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Header(ParamMatch::equals(name, value))
    }

    /// Shorthand for a query-equals predicate.
    pub fn query_equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Query(ParamMatch::equals(name, value))
    }

    /// Shorthand for a conjunction.
    pub fn all(preds: Vec<Predicate>) -> Self {
        Predicate::All(preds)
    }

    /// Shorthand for a disjunction.
    pub fn any(preds: Vec<Predicate>) -> Self {
        Predicate::Any(preds)
    }

    /// Shorthand for a negation.
    pub fn not(pred: Predicate) -> Self {
        Predicate::Not(Box::new(pred))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compile errors
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons a predicate fails to compile.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PredicateError {
    /// A path template inside the predicate does not parse.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// A `matches` regex inside the predicate does not compile.
    #[error("invalid regex for '{name}': {reason}")]
    Regex { name: String, reason: String },

    /// A matcher sets both `equals` and `matches`.
    #[error("matcher for '{0}' sets both equals and matches")]
    ConflictingMatcher(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled form
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum CompiledMatcher {
    Present,
    Equals(String),
    Matches(Regex),
}

impl CompiledMatcher {
    fn accepts(&self, value: &str) -> bool {
        match self {
            CompiledMatcher::Present => true,
            CompiledMatcher::Equals(expected) => value == expected,
            CompiledMatcher::Matches(re) => re.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledNode {
    Path(PathPattern),
    Method(HttpMethod),
    Header(String, CompiledMatcher),
    Query(String, CompiledMatcher),
    All(Vec<CompiledNode>),
    Any(Vec<CompiledNode>),
    Not(Box<CompiledNode>),
}

/// A predicate compiled for per-request evaluation.
///
/// Evaluation is pure and synchronous: no I/O, no interior mutability, no
/// allocation beyond the captured path parameters.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    node: CompiledNode,
}

impl CompiledPredicate {
    /// Compile a declarative predicate, parsing templates and regexes.
    pub fn compile(spec: &Predicate) -> Result<Self, PredicateError> {
        Ok(Self {
            node: compile_node(spec)?,
        })
    }

    /// Evaluate against a request head, returning captured path parameters.
    ///
    /// `None` means no match. On a match, the captures are the union of all
    /// path templates satisfied along the way; for an `any`, the first
    /// matching branch contributes its captures.
    pub fn capture(&self, head: &RequestHead) -> Option<PathParams> {
        capture_node(&self.node, head)
    }

    /// Evaluate against a request head.
    pub fn matches(&self, head: &RequestHead) -> bool {
        self.capture(head).is_some()
    }

    /// The highest path-template specificity reachable in this predicate,
    /// ignoring negated subtrees. `0` when the predicate has no path atom,
    /// so path-less routes rank below any path-bearing route.
    pub fn specificity(&self) -> u32 {
        node_specificity(&self.node)
    }
}

fn compile_node(spec: &Predicate) -> Result<CompiledNode, PredicateError> {
    Ok(match spec {
        Predicate::Path(raw) => CompiledNode::Path(PathPattern::parse(raw)?),
        Predicate::Method(m) => CompiledNode::Method(*m),
        Predicate::Header(pm) => {
            CompiledNode::Header(pm.name.to_lowercase(), compile_matcher(pm)?)
        }
        Predicate::Query(pm) => CompiledNode::Query(pm.name.clone(), compile_matcher(pm)?),
        Predicate::All(children) => CompiledNode::All(compile_children(children)?),
        Predicate::Any(children) => CompiledNode::Any(compile_children(children)?),
        Predicate::Not(inner) => CompiledNode::Not(Box::new(compile_node(inner)?)),
    })
}

fn compile_children(children: &[Predicate]) -> Result<Vec<CompiledNode>, PredicateError> {
    children.iter().map(compile_node).collect()
}

fn compile_matcher(pm: &ParamMatch) -> Result<CompiledMatcher, PredicateError> {
    Ok(match (&pm.equals, &pm.matches) {
        (Some(_), Some(_)) => {
            return Err(PredicateError::ConflictingMatcher(pm.name.clone()));
        }
        (Some(v), None) => CompiledMatcher::Equals(v.clone()),
        (None, Some(src)) => {
            let re = Regex::new(src).map_err(|e| PredicateError::Regex {
                name: pm.name.clone(),
                reason: e.to_string(),
            })?;
            CompiledMatcher::Matches(re)
        }
        (None, None) => CompiledMatcher::Present,
    })
}

fn capture_node(node: &CompiledNode, head: &RequestHead) -> Option<PathParams> {
    match node {
        CompiledNode::Path(pattern) => pattern.matches(&head.path),
        CompiledNode::Method(m) => (head.method == *m).then(PathParams::new),
        CompiledNode::Header(name, matcher) => head
            .headers
            .get(name)
            .filter(|v| matcher.accepts(v))
            .map(|_| PathParams::new()),
        CompiledNode::Query(name, matcher) => head
            .query
            .get(name)
            .filter(|v| matcher.accepts(v))
            .map(|_| PathParams::new()),
        CompiledNode::All(children) => {
            let mut params = PathParams::new();
            for child in children {
                params.extend(capture_node(child, head)?);
            }
            Some(params)
        }
        CompiledNode::Any(children) => {
            children.iter().find_map(|child| capture_node(child, head))
        }
        CompiledNode::Not(inner) => capture_node(inner, head).is_none().then(PathParams::new),
    }
}

fn node_specificity(node: &CompiledNode) -> u32 {
    match node {
        CompiledNode::Path(pattern) => pattern.specificity(),
        CompiledNode::All(children) | CompiledNode::Any(children) => {
            children.iter().map(node_specificity).max().unwrap_or(0)
        }
        _ => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================
