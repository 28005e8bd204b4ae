//! Path rewriting.
//!
//! Replaces the forwarded path with a template that may reference
//! parameters captured by the route's path predicate: a route matching
//! `/api/orders/{id}` with template `/internal/orders/{id}` forwards
//! `/api/orders/42` as `/internal/orders/42`. Placeholders with no
//! captured value are left verbatim so a misconfigured template is
//! visible in the upstream's logs rather than silently swallowed.

use async_trait::async_trait;

use crate::context::{ProxyResponse, RequestContext};
use crate::error::ProxyError;
use crate::pipeline::{FilterAction, RouteFilter};

#[derive(Debug, Clone)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

/// Rewrites `ctx.head.path` on the request phase.
#[derive(Debug, Clone)]
pub struct RewritePathFilter {
    segments: Vec<TemplateSegment>,
}

impl RewritePathFilter {
    pub fn new(template: &str) -> Self {
        let segments = template
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| {
                match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    // `{*rest}` and `{rest}` both reference the capture
                    // named `rest`, matching the pattern spelling.
                    Some(name) if !name.is_empty() => {
                        let name = name.strip_prefix('*').unwrap_or(name);
                        TemplateSegment::Param(name.to_string())
                    }
                    _ => TemplateSegment::Literal(seg.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    fn render(&self, ctx: &RequestContext) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            match seg {
                TemplateSegment::Literal(s) => parts.push(s.clone()),
                TemplateSegment::Param(name) => match ctx.path_params.get(name) {
                    // A wildcard capture may be empty; drop the segment
                    // rather than emit a trailing slash.
                    Some(value) if value.is_empty() => {}
                    Some(value) => parts.push(value.clone()),
                    None => parts.push(format!("{{{name}}}")),
                },
            }
        }
        format!("/{}", parts.join("/"))
    }
}

#[async_trait]
impl RouteFilter for RewritePathFilter {
    fn name(&self) -> &str {
        "rewrite_path"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<FilterAction, ProxyError> {
        let rewritten = self.render(ctx);
        tracing::debug!(
            request_id = %ctx.id,
            from = %ctx.head.path,
            to = %rewritten,
            "path rewritten"
        );
        ctx.head.path = rewritten;
        Ok(FilterAction::Continue)
    }

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut ProxyResponse,
    ) -> Result<(), ProxyError> {
        Ok(())
    }
}

// ===== Tests =====
