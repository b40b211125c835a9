//! Error types for the server lifecycle.
//!
//! This module defines the central [`Error`] enum, which captures every
//! failure that is surfaced to the caller of [`Server::run`] or
//! [`Server::run_mock`]. Per-call failures (authentication rejections and
//! recovered handler panics) never reach this type: they are turned into a
//! [`tonic::Status`] inside the interceptor chain and answered on the call
//! itself.
//!
//! ## Error Cases
//! - `Bind`: a listener could not be bound. Nothing has started yet.
//! - `Serve`: a listener's serving loop failed after a successful bind.
//! - `ServeExited`: a serving loop returned without being asked to stop.
//! - `Task`: a serving task panicked or was aborted.
//! - `Reflection`: the reflection service could not be built.
//! - `MetricsRecorder`: the Prometheus recorder could not be installed.
//! - `Tls`: certificate or key material could not be loaded.
//! - `Config`: the configuration failed validation.
//! - `Transport`: the in-memory transport could not be dialled.
//!
//! [`Server::run`]: crate::Server::run
//! [`Server::run_mock`]: crate::Server::run_mock

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error type used for failures bubbling out of a serving loop.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The two listeners owned by a running server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Listener {
    /// The gRPC service listener.
    Rpc,
    /// The Prometheus scrape listener.
    Metrics,
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc => f.write_str("rpc"),
            Self::Metrics => f.write_str("metrics"),
        }
    }
}

/// Unified error type for the server lifecycle.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A listener could not be bound to its configured address.
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: Listener,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A serving loop failed after the listener was bound.
    #[error("{listener} server failed: {source}")]
    Serve {
        listener: Listener,
        #[source]
        source: BoxError,
    },

    /// A serving loop returned without a shutdown having been requested.
    #[error("{listener} server stopped unexpectedly")]
    ServeExited { listener: Listener },

    /// The task driving a serving loop panicked or was cancelled.
    #[error("{listener} server task failed: {source}")]
    Task {
        listener: Listener,
        #[source]
        source: tokio::task::JoinError,
    },

    /// The reflection service rejected a registered file descriptor set.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// The Prometheus recorder could not be built or installed.
    #[error("failed to install metrics recorder: {0}")]
    MetricsRecorder(#[from] metrics_exporter_prometheus::BuildError),

    /// TLS material could not be read or applied.
    #[error("tls error: {context}")]
    Tls {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The configuration failed validation.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The in-memory test transport could not be dialled.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
