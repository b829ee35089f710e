use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use hyper::Request as HttpRequest;
use tower_http::trace::MakeSpan;
use tracing::{warn, Span};

use crate::{fleet::error::FleetError, http_objects::FleetAPIError, routes::RouteState};

#[derive(Clone)]
pub struct InstanceRequestSpan {
    env: String,
    instance_id: String,
}

impl InstanceRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for InstanceRequestSpan {
    fn make_span(&mut self, req: &HttpRequest<B>) -> Span {
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %req.method(),
            uri = %req.uri(),
        )
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Rejects operator requests the [`crate::acl::Authorizer`] does not allow.
pub async fn authorize(
    State(state): State<RouteState>,
    req: Request,
    next: Next,
) -> Result<Response, FleetAPIError> {
    let identity = bearer_token(&req);
    let path = req.uri().path();
    if !state.authorizer.is_authorized(identity, req.method(), path) {
        warn!(method = %req.method(), path = path, "request rejected by acl");
        return Err(FleetError::NotAuthorized {
            identity: identity.unwrap_or("anonymous").to_string(),
            path: path.to_string(),
        }
        .into());
    }
    Ok(next.run(req).await)
}
