use super::{Interceptor, Next, Request, RequestContext, Response};
use crate::{body::GuardedBody, panic::PanicGuard};
use futures::future::BoxFuture;
use tonic::{Status, body::Body};

/// Runs the rest of the chain under a [`PanicGuard`].
///
/// Both the handler future and the response body are guarded, so a panic in
/// a streaming handler's message stream is caught as well.
#[derive(Clone, Debug)]
pub struct RecoverPanics {
    guard: PanicGuard,
}

impl RecoverPanics {
    pub fn new(guard: PanicGuard) -> Self {
        Self { guard }
    }
}

impl Interceptor for RecoverPanics {
    fn intercept(&self, request: Request, next: Next) -> BoxFuture<'static, Response> {
        let method = RequestContext::of(&request).method_arc();
        let guard = self.guard.clone();

        Box::pin(async move {
            // `next.run` is called inside the guarded future so synchronous
            // work done while building the handler future is covered too.
            let downstream = async move { next.run(request).await };
            match guard.guard(method.clone(), downstream).await {
                Ok(response) => {
                    response.map(|body| Body::new(GuardedBody::new(body, guard, method)))
                }
                Err(panic) => Status::from(panic).into_http(),
            }
        })
    }

    fn name(&self) -> &'static str {
        "RecoverPanics"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{body::grpc_code, env::Environment, interceptor::InterceptorChain};
    use std::sync::Arc;
    use tonic::Code;

    #[tokio::test]
    async fn handler_panic_becomes_internal_status() {
        let chain = InterceptorChain::new([
            Arc::new(RecoverPanics::new(PanicGuard::new(Environment::Staging)))
                as Arc<dyn Interceptor>,
        ]);
        let next = Next {
            stages: Arc::clone(&chain.stages),
            index: 0,
            endpoint: Box::new(|_request| -> BoxFuture<'static, Response> {
                Box::pin(async {
                    if true {
                        panic!("handler blew up");
                    }
                    http::Response::new(Body::empty())
                })
            }),
        };
        let request = http::Request::builder()
            .uri("http://localhost/pkg.Svc/Boom")
            .body(Body::empty())
            .unwrap();
        let response = next.run(request).await;
        assert_eq!(grpc_code(response.headers()), Some(Code::Internal));
    }

    #[tokio::test]
    async fn synchronous_panic_in_endpoint_is_caught() {
        let chain = InterceptorChain::new([
            Arc::new(RecoverPanics::new(PanicGuard::new(Environment::Development)))
                as Arc<dyn Interceptor>,
        ]);
        let next = Next {
            stages: Arc::clone(&chain.stages),
            index: 0,
            endpoint: Box::new(|_request| -> BoxFuture<'static, Response> {
                panic!("routing blew up")
            }),
        };
        let request = http::Request::builder()
            .uri("http://localhost/pkg.Svc/Boom")
            .body(Body::empty())
            .unwrap();
        let response = next.run(request).await;
        assert_eq!(grpc_code(response.headers()), Some(Code::Internal));
    }
}
