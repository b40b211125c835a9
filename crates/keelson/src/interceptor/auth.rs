use super::{Interceptor, Next, Request, RequestContext, Response};
use crate::auth::{AuthError, AuthStrategy};
use futures::future::BoxFuture;
use tonic::{Status, metadata::MetadataMap};

/// Rejects unauthenticated calls with `Code::Unauthenticated`.
///
/// Health probes are always let through.
#[derive(Clone, Debug)]
pub struct Authenticate {
    strategy: AuthStrategy,
}

impl Authenticate {
    pub fn new(strategy: AuthStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &AuthStrategy {
        &self.strategy
    }

    fn check(&self, request: &Request) -> Result<(), AuthError> {
        let metadata = grpc_metadata(request);
        self.strategy.authenticate(metadata.as_ref())
    }
}

impl Interceptor for Authenticate {
    fn intercept(&self, request: Request, next: Next) -> BoxFuture<'static, Response> {
        let context = RequestContext::of(&request);
        if context.is_health_check() {
            return next.run(request);
        }

        match self.check(&request) {
            Ok(()) => next.run(request),
            Err(err) => {
                tracing::warn!(
                    req_id = context.request_id(),
                    method = context.method(),
                    strategy = self.strategy.name(),
                    reason = ?err,
                    "rejected unauthenticated rpc request"
                );
                Box::pin(async move { Status::from(err).into_http() })
            }
        }
    }

    fn name(&self) -> &'static str {
        "Authenticate"
    }
}

/// The call's gRPC metadata, or `None` if the request is not a gRPC call.
fn grpc_metadata(request: &Request) -> Option<MetadataMap> {
    let is_grpc = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/grpc"));
    is_grpc.then(|| MetadataMap::from_headers(request.headers().clone()))
}
