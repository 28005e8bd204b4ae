//! Bearer-token validation.
//!
//! Verifies HS256-signed bearer tokens against a per-route shared
//! secret, optionally pinning issuer and audience. On success the token
//! subject becomes the request's principal, visible to later filters
//! (the rate limiter can key on it). Rejections carry a reason category
//! but never echo token contents.

use async_trait::async_trait;
use gatehouse_core::AuthCheckSpec;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::Deserialize;

use crate::context::{ProxyResponse, RequestContext};
use crate::error::ProxyError;
use crate::pipeline::{FilterAction, RouteFilter};

/// The claims the gateway itself reads. Registered claims (`exp`,
/// `iss`, `aud`) are enforced by the decoder, not deserialized here.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

/// Validates `Authorization: Bearer <token>` on the request phase.
pub struct BearerAuthFilter {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl BearerAuthFilter {
    pub fn new(spec: &AuthCheckSpec) -> Self {
        let decoding_key = DecodingKey::from_secret(spec.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &spec.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &spec.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Self {
            decoding_key,
            validation,
        }
    }

    fn reject(reason: impl Into<String>) -> FilterAction {
        FilterAction::Reject(ProxyError::Unauthorized {
            reason: reason.into(),
        })
    }
}

#[async_trait]
impl RouteFilter for BearerAuthFilter {
    fn name(&self) -> &str {
        "auth_check"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<FilterAction, ProxyError> {
        let Some(header) = ctx.head.header("authorization") else {
            return Ok(Self::reject("missing bearer token"));
        };
        let Some(token) = header.strip_prefix("Bearer ").map(str::trim) else {
            return Ok(Self::reject("authorization header is not a bearer token"));
        };
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                ctx.principal = data.claims.sub;
                tracing::debug!(
                    request_id = %ctx.id,
                    principal = ctx.principal.as_deref().unwrap_or("-"),
                    "bearer token accepted"
                );
                Ok(FilterAction::Continue)
            }
            Err(err) => {
                let reason = match err.kind() {
                    ErrorKind::ExpiredSignature => "token expired".to_string(),
                    ErrorKind::InvalidSignature => "invalid token signature".to_string(),
                    ErrorKind::InvalidIssuer => "token issuer not accepted".to_string(),
                    ErrorKind::InvalidAudience => "token audience not accepted".to_string(),
                    _ => "invalid token".to_string(),
                };
                tracing::debug!(request_id = %ctx.id, reason = %reason, "bearer token rejected");
                Ok(Self::reject(reason))
            }
        }
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
