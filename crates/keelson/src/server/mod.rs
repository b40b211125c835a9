//! Server assembly and lifecycle.
//!
//! A [`Server`] owns two listeners: the gRPC service listener, fronted by an
//! [`InterceptorChain`] and always carrying the standard health and
//! reflection services, and a plain HTTP listener exposing Prometheus
//! metrics. [`Server::run`] blocks until a termination signal or a fatal
//! serving error; [`Server::run_mock`] serves the same stack over in-memory
//! pipes for tests.

mod lifecycle;
mod mock;
mod signal;

pub use lifecycle::{LifecycleState, ShutdownHandle, Trigger};
pub use mock::MockTransport;

use crate::{
    Error, Result,
    config::ServerConfig,
    error::Listener,
    interceptor::{InterceptLayer, InterceptorChain},
    metrics,
};
use lifecycle::Supervisor;
use tokio::{net::TcpListener, sync::{mpsc, watch}};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{
    service::RoutesBuilder,
    transport::server::Router,
};
use tonic_health::{ServingStatus, server::HealthReporter};
use tower::layer::util::{Identity, Stack};

/// Registers application services on the gRPC listener.
///
/// Invoked exactly once, before either listener starts accepting. Any
/// `FnOnce(&mut RoutesBuilder)` closure qualifies:
///
/// ```ignore
/// let server = Server::new(config, |routes: &mut RoutesBuilder| {
///     routes.add_service(EchoServer::new(MyEcho));
/// });
/// ```
pub trait ServiceRegistrar: Send + 'static {
    fn register(self, routes: &mut RoutesBuilder);
}

impl<F> ServiceRegistrar for F
where
    F: FnOnce(&mut RoutesBuilder) + Send + 'static,
{
    fn register(self, routes: &mut RoutesBuilder) {
        self(routes);
    }
}

type InterceptedRouter = Router<Stack<InterceptLayer, Identity>>;

/// A configured but not yet running server.
pub struct Server<R> {
    config: ServerConfig,
    registrar: R,
    interceptors: InterceptorChain,
    descriptor_sets: Vec<&'static [u8]>,
    shutdown: ShutdownHandle,
    state: watch::Sender<LifecycleState>,
}

impl<R: ServiceRegistrar> Server<R> {
    /// Builds a server running the standard interceptor chain for `config`.
    pub fn new(config: ServerConfig, registrar: R) -> Self {
        let interceptors = InterceptorChain::standard(&config);
        let (state, _) = watch::channel(LifecycleState::Constructed);
        Self {
            config,
            registrar,
            interceptors,
            descriptor_sets: Vec::new(),
            shutdown: ShutdownHandle::default(),
            state,
        }
    }

    /// Replaces the interceptor chain.
    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Publishes an encoded `FileDescriptorSet` through server reflection,
    /// alongside the built-in health and reflection descriptors.
    pub fn register_file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.descriptor_sets.push(encoded);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// A handle that starts a graceful shutdown of [`run`](Self::run).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Observes lifecycle transitions, including the bound addresses once
    /// running.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Binds both listeners, serves until SIGINT, SIGTERM or the shutdown
    /// handle fires, then stops gracefully.
    ///
    /// Returns `Ok(())` after a clean shutdown. A bind failure is returned
    /// before anything is served; a serving loop that fails or exits on its
    /// own ends the whole server with that error.
    pub async fn run(self) -> Result<()> {
        let termination = signal::termination(self.shutdown.clone());

        let Self {
            config,
            registrar,
            interceptors,
            descriptor_sets,
            shutdown: _,
            state,
        } = self;

        log_startup_info(&config, &interceptors);

        let metrics_listener =
            bind(Listener::Metrics, &config.metrics_host, config.metrics_port).await?;
        let rpc_listener = bind(Listener::Rpc, &config.host, config.port).await?;
        let metrics_addr = local_addr(Listener::Metrics, &metrics_listener, &config.metrics_addr())?;
        let service_addr = local_addr(Listener::Rpc, &rpc_listener, &config.service_addr())?;

        let (router, health) =
            assemble(&config, registrar, &interceptors, &descriptor_sets, true).await?;
        let prometheus = metrics::install_recorder()?;

        let metrics_stop = CancellationToken::new();
        let metrics_task = {
            let stop = metrics_stop.clone();
            tokio::spawn(async move {
                metrics::serve(metrics_listener, prometheus, stop)
                    .await
                    .map_err(|err| Error::Serve {
                        listener: Listener::Metrics,
                        source: Box::new(err),
                    })
            })
        };

        let rpc_stop = CancellationToken::new();
        let rpc_task = {
            let stop = rpc_stop.clone();
            let incoming = TcpListenerStream::new(rpc_listener);
            tokio::spawn(async move {
                router
                    .serve_with_incoming_shutdown(incoming, stop.cancelled_owned())
                    .await
                    .map_err(|err| Error::Serve {
                        listener: Listener::Rpc,
                        source: Box::new(err),
                    })
            })
        };

        state.send_replace(LifecycleState::Running {
            service: service_addr,
            metrics: metrics_addr,
        });
        tracing::info!(%service_addr, "gRPC server listening");
        tracing::info!(%metrics_addr, "Metrics server listening");

        Supervisor {
            rpc: rpc_task,
            metrics: metrics_task,
            rpc_stop,
            metrics_stop,
            metrics_grace: config.metrics_graceful_timeout,
            health: Some(health),
            state,
        }
        .supervise(termination)
        .await
    }

    /// Serves the assembled stack over in-memory pipes and returns at once.
    ///
    /// Registration, health, reflection and the interceptor chain behave as
    /// under [`run`](Self::run). No sockets are bound, TLS is not applied
    /// and the metrics endpoint is not started, though call metrics are
    /// still recorded if a recorder is installed.
    pub async fn run_mock(self) -> Result<MockTransport> {
        let Self {
            config,
            registrar,
            interceptors,
            descriptor_sets,
            ..
        } = self;

        let (router, health) =
            assemble(&config, registrar, &interceptors, &descriptor_sets, false).await?;
        let (sender, receiver) = mpsc::channel(mock::MOCK_BACKLOG);

        tokio::spawn(async move {
            let result = router
                .serve_with_incoming(ReceiverStream::new(receiver))
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "mock gRPC server failed");
            }
            drop(health);
        });

        Ok(MockTransport::new(sender))
    }
}

impl<R> core::fmt::Debug for Server<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Builds the router: application services, then health and reflection,
/// all behind the interceptor layer.
async fn assemble<R: ServiceRegistrar>(
    config: &ServerConfig,
    registrar: R,
    interceptors: &InterceptorChain,
    descriptor_sets: &[&'static [u8]],
    use_tls: bool,
) -> Result<(InterceptedRouter, HealthReporter)> {
    let mut routes = RoutesBuilder::default();
    registrar.register(&mut routes);

    let (health, health_service) = tonic_health::server::health_reporter();
    health.set_service_status("", ServingStatus::Serving).await;

    let mut reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
    for &encoded in descriptor_sets {
        reflection = reflection.register_encoded_file_descriptor_set(encoded);
    }
    routes
        .add_service(health_service)
        .add_service(reflection.build_v1()?);

    let mut builder = tonic::transport::Server::builder().http2_adaptive_window(Some(true));
    if use_tls {
        if let Some(files) = &config.tls {
            builder = apply_tls(builder, files).await?;
        }
    }

    Ok((
        builder
            .layer(interceptors.layer())
            .add_routes(routes.routes()),
        health,
    ))
}

#[cfg(feature = "tls")]
async fn apply_tls(
    builder: tonic::transport::Server,
    files: &crate::config::TlsFiles,
) -> Result<tonic::transport::Server> {
    use tonic::transport::ServerTlsConfig;

    let read = |path: &std::path::Path| {
        let path = path.to_owned();
        async move {
            tokio::fs::read(&path).await.map_err(|err| Error::Tls {
                context: format!("failed to read {}", path.display()),
                source: Some(Box::new(err)),
            })
        }
    };
    let cert = read(&files.cert_file).await?;
    let key = read(&files.key_file).await?;

    builder
        .tls_config(ServerTlsConfig::new().identity(tonic::transport::Identity::from_pem(cert, key)))
        .map_err(|err| Error::Tls {
            context: "failed to apply server certificate".to_owned(),
            source: Some(Box::new(err)),
        })
}

#[cfg(not(feature = "tls"))]
async fn apply_tls(
    _builder: tonic::transport::Server,
    _files: &crate::config::TlsFiles,
) -> Result<tonic::transport::Server> {
    Err(Error::Tls {
        context: "TLS was requested but keelson was built without the `tls` feature".to_owned(),
        source: None,
    })
}

async fn bind(listener: Listener, host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| Error::Bind {
            listener,
            addr: crate::config::join_host_port(host, port),
            source,
        })
}

fn local_addr(
    listener: Listener,
    socket: &TcpListener,
    configured: &str,
) -> Result<std::net::SocketAddr> {
    socket.local_addr().map_err(|source| Error::Bind {
        listener,
        addr: configured.to_owned(),
        source,
    })
}

fn log_startup_info(config: &ServerConfig, interceptors: &InterceptorChain) {
    tracing::info!(
        service_addr = %config.service_addr(),
        metrics_addr = %config.metrics_addr(),
        env = %config.environment,
        tls = config.tls.is_some(),
        "Starting server"
    );
    tracing::debug!(interceptors = ?interceptors, "Interceptor chain");
    #[cfg(debug_assertions)]
    tracing::debug!("{config:#?}");
}
