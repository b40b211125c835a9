use super::{Interceptor, Next, Request, RequestContext, Response};
use crate::{
    body::{BodyOutcome, ObservedBody, Payload, TappedBody, grpc_code, grpc_message},
    env::Environment,
};
use core::time::Duration;
use futures::future::BoxFuture;
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};
use tonic::{Code, body::Body};

/// Bytes of each payload kept for the log by default.
pub const DEFAULT_PAYLOAD_LIMIT: usize = 1024;

/// Emits one record when a call starts and one when it finishes.
///
/// The start record carries the first request message and goes out as soon
/// as that message has been read, which for unary calls is before the
/// handler runs. The success record carries the first response message.
/// Messages are logged as escaped bytes cut to a limit, so the logger works
/// with any message type. Health probes are not logged.
#[derive(Clone, Debug)]
pub struct RequestLogger {
    env: Environment,
    payload_limit: usize,
}

impl RequestLogger {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
        }
    }

    /// Keeps at most `limit` bytes of each logged message.
    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }
}

impl Interceptor for RequestLogger {
    fn intercept(&self, request: Request, next: Next) -> BoxFuture<'static, Response> {
        let context = RequestContext::of(&request);
        if context.is_health_check() {
            return next.run(request);
        }

        let start = PendingStart::new(StartRecord::new(&context, self.env, &request));
        let request_bytes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&request_bytes);
        let first_message = start.clone();
        let limit = self.payload_limit;
        let request = request.map(|body| {
            Body::new(TappedBody::new(body, counter, limit, move |payload| {
                first_message.emit(payload);
            }))
        });
        let env = self.env;

        Box::pin(async move {
            let started = Instant::now();
            let response = next.run(request).await;
            let took = started.elapsed();

            let record = ResponseRecord {
                context,
                env,
                took,
                request_bytes,
                start,
            };
            match grpc_code(response.headers()) {
                // Trailers-only response, the outcome is already known.
                Some(code) => {
                    let message = grpc_message(response.headers());
                    record.emit(BodyOutcome {
                        code: Some(code),
                        message,
                        bytes: 0,
                        payload: Payload::default(),
                    });
                    response
                }
                None => response.map(|body| {
                    Body::new(ObservedBody::capturing(body, limit, move |outcome| {
                        record.emit(outcome)
                    }))
                }),
            }
        })
    }

    fn name(&self) -> &'static str {
        "RequestLogger"
    }
}

struct StartRecord {
    request_id: Arc<str>,
    method: Arc<str>,
    env: Environment,
    content_type: String,
    grpc_encoding: String,
    grpc_timeout: String,
}

impl StartRecord {
    fn new(context: &RequestContext, env: Environment, request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };
        Self {
            request_id: Arc::from(context.request_id()),
            method: Arc::from(context.method()),
            env,
            content_type: header("content-type"),
            grpc_encoding: header("grpc-encoding"),
            grpc_timeout: header("grpc-timeout"),
        }
    }

    fn emit(self, payload: &Payload) {
        tracing::info!(
            req_id = &*self.request_id,
            method = &*self.method,
            env = %self.env,
            content_type = %self.content_type,
            grpc_encoding = %self.grpc_encoding,
            grpc_timeout = %self.grpc_timeout,
            request = %payload,
            "incoming rpc request"
        );
    }
}

/// The start record of a call, written at most once by whichever side gets
/// there first: the request body or the end of the call.
#[derive(Clone)]
struct PendingStart(Arc<Mutex<Option<StartRecord>>>);

impl PendingStart {
    fn new(record: StartRecord) -> Self {
        Self(Arc::new(Mutex::new(Some(record))))
    }

    fn emit(&self, payload: Payload) {
        let record = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(record) = record {
            record.emit(&payload);
        }
    }
}

struct ResponseRecord {
    context: RequestContext,
    env: Environment,
    took: Duration,
    request_bytes: Arc<AtomicUsize>,
    start: PendingStart,
}

impl ResponseRecord {
    fn emit(self, outcome: BodyOutcome) {
        // The handler answered without reading the request.
        self.start.emit(Payload::default());

        let req_bytes = self.request_bytes.load(Ordering::Relaxed);
        // A stream dropped before its trailers was abandoned by the peer.
        let code = outcome.code.unwrap_or(Code::Cancelled);
        if code == Code::Ok {
            tracing::info!(
                req_id = self.context.request_id(),
                method = self.context.method(),
                env = %self.env,
                took = ?self.took,
                code = ?code,
                req_bytes,
                resp_bytes = outcome.bytes,
                response = %outcome.payload,
                "rpc request succeeded"
            );
        } else {
            tracing::error!(
                req_id = self.context.request_id(),
                method = self.context.method(),
                env = %self.env,
                took = ?self.took,
                code = ?code,
                error = outcome.message.as_deref().unwrap_or_default(),
                req_bytes,
                "rpc request failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use core::{
        pin::Pin,
        task::{Context, Poll},
    };
    use futures::future::poll_fn;
    use http_body::{Body as _, Frame};

    /// A request body made of the given data frames.
    struct Frames(Vec<Bytes>);

    impl http_body::Body for Frames {
        type Data = Bytes;
        type Error = tonic::Status;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, tonic::Status>>> {
            if self.0.is_empty() {
                return Poll::Ready(None);
            }
            Poll::Ready(Some(Ok(Frame::data(self.0.remove(0)))))
        }
    }

    fn framed(message: &[u8]) -> Bytes {
        let mut out = vec![0];
        out.extend_from_slice(&u32::try_from(message.len()).unwrap().to_be_bytes());
        out.extend_from_slice(message);
        Bytes::from(out)
    }

    #[tokio::test]
    async fn handler_sees_the_request_body_unchanged() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let next = Next {
            stages: Arc::from(Vec::<Arc<dyn Interceptor>>::new()),
            index: 0,
            endpoint: Box::new(move |request: Request| -> BoxFuture<'static, Response> {
                Box::pin(async move {
                    let mut body = Box::pin(request.into_body());
                    while let Some(Ok(frame)) =
                        poll_fn(|cx| body.as_mut().poll_frame(cx)).await
                    {
                        if let Ok(data) = frame.into_data() {
                            sink.lock().unwrap().push(data);
                        }
                    }
                    http::Response::new(Body::empty())
                })
            }),
        };
        let wire = framed(b"hello");
        let request = http::Request::builder()
            .uri("http://localhost/pkg.Svc/Call")
            .body(Body::new(Frames(vec![wire.slice(..3), wire.slice(3..)])))
            .unwrap();
        let logger = RequestLogger::new(Environment::Development).with_payload_limit(2);
        logger.intercept(request, next).await;
        assert_eq!(*seen.lock().unwrap(), vec![wire.slice(..3), wire.slice(3..)]);
    }
}
