//! Lifecycle state and shutdown supervision.
//!
//! ```text
//! Constructed --run--> Running --signal--> ShuttingDown --> Stopped
//!                         \--fatal serve error--/
//! ```
//!
//! Shutdown is asymmetric on purpose. An operator-driven shutdown drains the
//! RPC listener with no deadline, then gives the metrics endpoint a bounded
//! grace period before force-closing it. A fatal serving error skips the RPC
//! drain altogether and is returned to the caller of `run`.

use crate::{Error, Result, error::Listener};
use core::{fmt, time::Duration};
use std::net::SocketAddr;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tonic_health::{ServingStatus, server::HealthReporter};

/// Where a server is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    /// Both listeners accept connections.
    Running {
        service: SocketAddr,
        metrics: SocketAddr,
    },
    ShuttingDown,
    /// Terminal. A server cannot be restarted.
    Stopped,
}

/// What started the shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Requested => f.write_str("shutdown handle"),
        }
    }
}

/// Starts a graceful shutdown from code, exactly as a termination signal
/// would. Triggering more than once has no further effect.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn requested(&self) {
        self.token.cancelled().await;
    }
}

/// Owns the two serving tasks once the server is running.
pub(crate) struct Supervisor {
    pub(crate) rpc: JoinHandle<Result<()>>,
    pub(crate) metrics: JoinHandle<Result<()>>,
    pub(crate) rpc_stop: CancellationToken,
    pub(crate) metrics_stop: CancellationToken,
    pub(crate) metrics_grace: Duration,
    pub(crate) health: Option<HealthReporter>,
    pub(crate) state: watch::Sender<LifecycleState>,
}

impl Supervisor {
    /// Waits for `termination` or a serving failure, whichever comes first,
    /// and performs the matching shutdown.
    pub(crate) async fn supervise(mut self, termination: impl Future<Output = Trigger>) -> Result<()> {
        let outcome = tokio::select! {
            trigger = termination => {
                tracing::info!(%trigger, "Received terminating signal, preparing for shutdown");
                self.state.send_replace(LifecycleState::ShuttingDown);
                self.drain().await
            }
            joined = &mut self.rpc => {
                let err = serve_failure(Listener::Rpc, joined);
                tracing::error!(error = %err, "gRPC server failed, exiting without graceful stop");
                self.state.send_replace(LifecycleState::ShuttingDown);
                self.metrics_stop.cancel();
                self.metrics.abort();
                Err(err)
            }
            joined = &mut self.metrics => {
                let err = serve_failure(Listener::Metrics, joined);
                tracing::error!(error = %err, "metrics server failed, exiting without graceful stop");
                self.state.send_replace(LifecycleState::ShuttingDown);
                self.rpc.abort();
                Err(err)
            }
        };
        self.state.send_replace(LifecycleState::Stopped);
        outcome
    }

    async fn drain(&mut self) -> Result<()> {
        if let Some(health) = &self.health {
            health
                .set_service_status("", ServingStatus::NotServing)
                .await;
        }

        tracing::info!("Trying to terminate gRPC server");
        self.rpc_stop.cancel();
        let rpc = match (&mut self.rpc).await {
            Ok(result) => result,
            Err(source) => Err(Error::Task {
                listener: Listener::Rpc,
                source,
            }),
        };
        match &rpc {
            Ok(()) => tracing::info!("Successfully stopped gRPC server"),
            Err(err) => tracing::error!(error = %err, "gRPC server failed while draining"),
        }

        tracing::info!("Trying to terminate metrics server");
        self.metrics_stop.cancel();
        match tokio::time::timeout(self.metrics_grace, &mut self.metrics).await {
            Ok(Ok(Ok(()))) => tracing::info!("Successfully stopped metrics server"),
            Ok(Ok(Err(err))) => tracing::warn!(error = %err, "metrics server stopped with an error"),
            Ok(Err(err)) => tracing::warn!(error = %err, "metrics server task failed"),
            Err(_) => {
                tracing::warn!(
                    grace = ?self.metrics_grace,
                    "Metrics server did not stop in time, forcing shutdown"
                );
                self.metrics.abort();
            }
        }

        rpc
    }
}

fn serve_failure(
    listener: Listener,
    joined: core::result::Result<Result<()>, tokio::task::JoinError>,
) -> Error {
    match joined {
        Ok(Ok(())) => Error::ServeExited { listener },
        Ok(Err(err)) => err,
        Err(source) => Error::Task { listener, source },
    }
}
