//! A hand-rolled unary echo service plus a log capture layer, shared by the
//! integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use keelson::{MockTransport, RoutesBuilder, Server, ServerConfig};
use std::{
    collections::BTreeMap,
    convert::Infallible,
    fmt,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tonic::{
    IntoRequest, Status,
    body::Body,
    client::GrpcService,
    codegen::StdError,
    server::{NamedService, UnaryService},
    transport::Channel,
};
use tracing::{Event, Level, Subscriber, field::Field};
use tracing_subscriber::{Layer, layer::Context as LayerContext, prelude::*};

pub const ECHO: &str = "/keelson.test.Echo/Echo";
pub const PANIC: &str = "/keelson.test.Echo/Panic";
pub const REJECT: &str = "/keelson.test.Echo/Reject";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

pub fn echo_request(message: &str) -> EchoRequest {
    EchoRequest {
        message: message.to_owned(),
    }
}

type Handler = fn(EchoRequest) -> Result<EchoResponse, Status>;

fn echo(request: EchoRequest) -> Result<EchoResponse, Status> {
    Ok(EchoResponse {
        message: request.message,
    })
}

fn explode(_: EchoRequest) -> Result<EchoResponse, Status> {
    panic!("handler exploded")
}

fn reject(_: EchoRequest) -> Result<EchoResponse, Status> {
    Err(Status::invalid_argument("rejected by handler"))
}

struct Unary(Handler);

impl UnaryService<EchoRequest> for Unary {
    type Response = EchoResponse;
    type Future = BoxFuture<'static, Result<tonic::Response<EchoResponse>, Status>>;

    fn call(&mut self, request: tonic::Request<EchoRequest>) -> Self::Future {
        let handler = self.0;
        Box::pin(async move { handler(request.into_inner()).map(tonic::Response::new) })
    }
}

/// Server half of `keelson.test.Echo`.
#[derive(Clone, Debug, Default)]
pub struct EchoServer;

impl NamedService for EchoServer {
    const NAME: &'static str = "keelson.test.Echo";
}

impl tower::Service<http::Request<Body>> for EchoServer {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let handler: Handler = match request.uri().path() {
            ECHO => echo,
            PANIC => explode,
            REJECT => reject,
            _ => return Box::pin(async { Ok(Status::unimplemented("").into_http()) }),
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(tonic_prost::ProstCodec::default());
            Ok(grpc.unary(Unary(handler), request).await)
        })
    }
}

/// Client half of `keelson.test.Echo`.
#[derive(Clone, Debug)]
pub struct EchoClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl EchoClient<Channel> {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }
}

impl<I> EchoClient<tonic::service::interceptor::InterceptedService<Channel, I>>
where
    I: tonic::service::Interceptor,
{
    pub fn with_interceptor(channel: Channel, interceptor: I) -> Self {
        Self {
            inner: tonic::client::Grpc::new(
                tonic::service::interceptor::InterceptedService::new(channel, interceptor),
            ),
        }
    }
}

impl<T> EchoClient<T>
where
    T: GrpcService<Body>,
    T::Error: Into<StdError>,
    T::ResponseBody: http_body::Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as http_body::Body>::Error: Into<StdError> + Send,
{
    pub async fn call(
        &mut self,
        method: &'static str,
        request: impl IntoRequest<EchoRequest>,
    ) -> Result<tonic::Response<EchoResponse>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|err| Status::unknown(format!("Service was not ready: {}", err.into())))?;
        let path = http::uri::PathAndQuery::from_static(method);
        self.inner
            .unary(
                request.into_request(),
                path,
                tonic_prost::ProstCodec::default(),
            )
            .await
    }
}

fn register_echo(routes: &mut RoutesBuilder) {
    routes.add_service(EchoServer);
}

/// Starts the full server stack with the echo service over in-memory pipes.
pub async fn mock_server(config: ServerConfig) -> MockTransport {
    Server::new(config, register_echo)
        .run_mock()
        .await
        .expect("mock server starts")
}

pub async fn mock_client(config: ServerConfig) -> EchoClient<Channel> {
    let transport = mock_server(config).await;
    EchoClient::new(transport.channel().await.expect("mock channel connects"))
}

/// One captured log record.
#[derive(Clone, Debug)]
pub struct Record {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<&'static str, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Collects every event into memory.
#[derive(Clone, Default)]
pub struct Capture {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Capture {
    /// Captures events emitted on the current thread until the guard drops.
    ///
    /// Tests using this must run on the current-thread runtime so spawned
    /// server tasks log on the same thread.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));
        (capture, guard)
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.message == message)
            .collect()
    }

    pub fn with_message_prefix(&self, prefix: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.message.starts_with(prefix))
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = Visitor::default();
        event.record(&mut visitor);
        self.records.lock().unwrap().push(Record {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct Visitor {
    message: String,
    fields: BTreeMap<&'static str, String>,
}

impl tracing::field::Visit for Visitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields.insert(field.name(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.insert(field.name(), format!("{value:?}"));
        }
    }
}
