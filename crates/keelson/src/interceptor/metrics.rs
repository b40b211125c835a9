use super::{Interceptor, Next, Request, RequestContext, Response};
use crate::{
    body::{ObservedBody, grpc_code},
    metrics::{record_handled, record_started},
};
use futures::future::BoxFuture;
use tonic::{Code, body::Body};

/// Counts every call and records its final code and latency.
///
/// This stage sits at the top of the chain and therefore also sees health
/// probes and calls rejected by authentication.
#[derive(Clone, Debug, Default)]
pub struct CallMetrics;

impl CallMetrics {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for CallMetrics {
    fn intercept(&self, request: Request, next: Next) -> BoxFuture<'static, Response> {
        let context = RequestContext::of(&request);
        record_started(&context);

        Box::pin(async move {
            let response = next.run(request).await;
            match grpc_code(response.headers()) {
                Some(code) => {
                    record_handled(&context, code);
                    response
                }
                None => response.map(|body| {
                    Body::new(ObservedBody::new(body, move |outcome| {
                        record_handled(&context, outcome.code.unwrap_or(Code::Cancelled));
                    }))
                }),
            }
        })
    }

    fn name(&self) -> &'static str {
        "CallMetrics"
    }
}
