//! Static header stamping on either phase.

use async_trait::async_trait;
use gatehouse_core::{AddHeaderSpec, HeaderPhase};

use crate::context::{ProxyResponse, RequestContext};
use crate::error::ProxyError;
use crate::pipeline::{FilterAction, RouteFilter};

/// Adds one configured header to the request (before forwarding) or to
/// the response (before returning), depending on the configured phase.
#[derive(Debug, Clone)]
pub struct AddHeaderFilter {
    spec: AddHeaderSpec,
}

impl AddHeaderFilter {
    pub fn new(spec: AddHeaderSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl RouteFilter for AddHeaderFilter {
    fn name(&self) -> &str {
        "add_header"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<FilterAction, ProxyError> {
        if self.spec.phase == HeaderPhase::Request {
            ctx.head
                .headers
                .insert(self.spec.name.to_lowercase(), self.spec.value.clone());
        }
        Ok(FilterAction::Continue)
    }

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        response: &mut ProxyResponse,
    ) -> Result<(), ProxyError> {
        if self.spec.phase == HeaderPhase::Response {
            response.set_header(&self.spec.name, &self.spec.value);
        }
        Ok(())
    }
}

// ===== Tests =====
