//! The per-call interceptor chain.
//!
//! Every inbound call goes through the same ordered list of [`Interceptor`]
//! stages before it reaches the handler registered with tonic. The standard
//! chain is
//!
//! ```text
//! metrics -> authentication -> panic guard -> request logger -> handler
//! ```
//!
//! - [`CallMetrics`] runs first so rejected calls are counted too.
//! - [`Authenticate`] rejects calls before any handler code runs.
//! - [`RecoverPanics`] wraps everything downstream of authentication.
//! - [`RequestLogger`] sits directly around the handler so the elapsed time
//!   it reports is handler time only.
//!
//! A chain is built once and shared behind an `Arc`; it cannot be changed
//! while it serves traffic. Applications that need a different pipeline
//! build their own [`InterceptorChain`] from any list of stages and hand it
//! to [`Server::with_interceptors`](crate::Server::with_interceptors).
//!
//! The chain is installed on the tonic server as a tower layer
//! ([`InterceptLayer`]), so it sees each call as an HTTP/2 request and
//! stays independent of the message types of the registered services.

mod auth;
mod logging;
mod metrics;
mod recover;

pub use auth::Authenticate;
pub use logging::{DEFAULT_PAYLOAD_LIMIT, RequestLogger};
pub use metrics::CallMetrics;
pub use recover::RecoverPanics;

use crate::{auth::AuthStrategy, config::ServerConfig, error::BoxError, panic::PanicGuard};
use core::{
    fmt,
    task::{Context, Poll},
};
use futures::future::BoxFuture;
use std::{sync::Arc, time::Instant};
use tonic::{Status, body::Body};
use tower::{Layer, Service};
use uuid::Uuid;

/// An inbound call as seen by the chain.
pub type Request = http::Request<Body>;

/// The response produced for a call.
pub type Response = http::Response<Body>;

/// Method prefix of the standard gRPC health-checking protocol.
pub const HEALTH_CHECK_PREFIX: &str = "/grpc.health.";

/// Per-call state created at the top of the chain.
///
/// Stages read it from the request extensions. It lives exactly as long as
/// the call.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: Arc<str>,
    method: Arc<str>,
    started_at: Instant,
}

impl RequestContext {
    pub fn new(method: &str) -> Self {
        Self {
            request_id: Arc::from(Uuid::new_v4().to_string()),
            method: Arc::from(method),
            started_at: Instant::now(),
        }
    }

    /// Returns the context attached by [`InterceptLayer`], or a fresh one
    /// when the request did not come through the layer.
    pub fn of(request: &Request) -> Self {
        request
            .extensions()
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self::new(request.uri().path()))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The full gRPC method path, e.g. `/pkg.Service/Method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn method_arc(&self) -> Arc<str> {
        Arc::clone(&self.method)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Splits the method path into `(service, method)`.
    pub fn service_and_method(&self) -> (&str, &str) {
        let path = self.method.trim_start_matches('/');
        path.split_once('/').unwrap_or(("unknown", path))
    }

    /// Health probes skip authentication and request logging.
    pub fn is_health_check(&self) -> bool {
        self.method.starts_with(HEALTH_CHECK_PREFIX)
    }
}

/// One stage of the chain.
///
/// A stage either answers the call itself or hands it on with
/// [`Next::run`]. Stages are shared by every concurrent call and must not
/// hold per-call state.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, request: Request, next: Next) -> BoxFuture<'static, Response>;

    fn name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

type Endpoint = Box<dyn FnOnce(Request) -> BoxFuture<'static, Response> + Send>;

/// The remainder of the chain, ending in the handler.
pub struct Next {
    stages: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    endpoint: Endpoint,
}

impl Next {
    pub fn run(self, request: Request) -> BoxFuture<'static, Response> {
        match self.stages.get(self.index).cloned() {
            Some(stage) => {
                let next = Self {
                    index: self.index + 1,
                    ..self
                };
                stage.intercept(request, next)
            }
            None => (self.endpoint)(request),
        }
    }
}

/// An ordered, immutable list of stages.
#[derive(Clone)]
pub struct InterceptorChain {
    stages: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    /// Builds a chain that runs `stages` in the given order.
    pub fn new(stages: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    /// The standard chain for `config`.
    pub fn standard(config: &ServerConfig) -> Self {
        let guard = PanicGuard::new(config.environment);
        Self::new([
            Arc::new(CallMetrics::new()) as Arc<dyn Interceptor>,
            Arc::new(Authenticate::new(AuthStrategy::from_config(
                &config.authentication,
            ))),
            Arc::new(RecoverPanics::new(guard)),
            Arc::new(RequestLogger::new(config.environment)),
        ])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn layer(&self) -> InterceptLayer {
        InterceptLayer {
            chain: self.clone(),
        }
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

/// Tower layer installing an [`InterceptorChain`] in front of a service.
#[derive(Clone, Debug)]
pub struct InterceptLayer {
    chain: InterceptorChain,
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Service produced by [`InterceptLayer`].
#[derive(Clone, Debug)]
pub struct InterceptService<S> {
    inner: S,
    chain: InterceptorChain,
}

impl<S> Service<Request> for InterceptService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
{
    type Response = Response;
    type Error = core::convert::Infallible;
    type Future = BoxFuture<'static, Result<Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The inner router is always ready; a failure here has nowhere to
        // go but the call, which `call` reports.
        match self.inner.poll_ready(cx) {
            Poll::Ready(_) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let context = RequestContext::new(request.uri().path());
        request.extensions_mut().insert(context);

        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);
        let endpoint: Endpoint = Box::new(move |request| -> BoxFuture<'static, Response> {
            Box::pin(async move {
                match inner.call(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        let err: BoxError = err.into();
                        tracing::error!(error = %err, "inner service failed");
                        Status::internal("internal server error").into_http()
                    }
                }
            })
        });

        let next = Next {
            stages: Arc::clone(&self.chain.stages),
            index: 0,
            endpoint,
        };
        Box::pin(async move { Ok(next.run(request).await) })
    }
}
