use crate::{Error, env::Environment};
use core::{fmt, time::Duration};
use std::path::PathBuf;

/// Runtime configuration for a keelson server.
///
/// All values are parsed from CLI arguments or environment variables. The
/// struct derives [`clap::Args`] rather than [`clap::Parser`] so an embedding
/// application can `#[command(flatten)]` it into its own command line.
#[derive(clap::Args, Debug, Clone)]
pub struct CliArgs {
    /// Host the gRPC listener binds to.
    ///
    /// Environment variable: `GRPC_HOST`
    #[arg(long = "host", env = "GRPC_HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,

    /// Port the gRPC listener binds to. `0` picks an ephemeral port.
    ///
    /// Environment variable: `GRPC_PORT`
    #[arg(long = "port", env = "GRPC_PORT", default_value_t = 50051)]
    pub port: u16,

    /// Host the Prometheus scrape endpoint binds to.
    ///
    /// Environment variable: `METRICS_HOST`
    #[arg(long, env = "METRICS_HOST", default_value_t = String::from("0.0.0.0"))]
    pub metrics_host: String,

    /// Port the Prometheus scrape endpoint binds to.
    ///
    /// Environment variable: `METRICS_PORT`
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Seconds the metrics endpoint is given to drain on shutdown before it
    /// is force-closed.
    ///
    /// Environment variable: `METRICS_GRACEFUL_TIMEOUT`
    #[arg(long, env = "METRICS_GRACEFUL_TIMEOUT", default_value_t = 5)]
    pub metrics_graceful_timeout: u64,

    /// Serve gRPC over TLS. Requires `--server-cert-file` and
    /// `--server-key-file`, and a build with the `tls` feature.
    ///
    /// Environment variable: `USE_TLS`
    #[arg(long, env = "USE_TLS", default_value_t = false)]
    pub use_tls: bool,

    /// PEM encoded server certificate chain.
    ///
    /// Environment variable: `SERVER_CERT_FILE`
    #[arg(long, env = "SERVER_CERT_FILE")]
    pub server_cert_file: Option<PathBuf>,

    /// PEM encoded private key matching `--server-cert-file`.
    ///
    /// Environment variable: `SERVER_KEY_FILE`
    #[arg(long, env = "SERVER_KEY_FILE")]
    pub server_key_file: Option<PathBuf>,

    /// How inbound calls are authenticated.
    ///
    /// Environment variable: `AUTHENTICATION_TYPE`
    #[arg(long, env = "AUTHENTICATION_TYPE", value_enum, default_value_t = AuthenticationType::None)]
    pub authentication_type: AuthenticationType,

    /// Pre-shared key expected by the `shared_secret_key` strategy.
    ///
    /// Environment variable: `CLIENT_KEY`
    #[arg(long, env = "CLIENT_KEY", hide_env_values = true)]
    pub client_key: Option<String>,

    /// Deployment stage, used to tag panic reports and pick the log format.
    ///
    /// Environment variable: `STAGE`
    #[arg(long, env = "STAGE", value_enum, default_value_t = Environment::Development)]
    pub stage: Environment,
}

/// Selector for the authentication strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AuthenticationType {
    /// Every call is accepted.
    #[default]
    #[value(name = "none")]
    None,
    /// Calls must carry the pre-shared client key in `x-authorization`.
    #[value(name = "shared_secret_key", alias = "client_secret_key")]
    SharedSecretKey,
}

/// A secret that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientKey(<redacted>)")
    }
}

/// The validated authentication settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Authentication {
    #[default]
    None,
    SharedSecretKey { client_key: ClientKey },
}

/// Certificate and key paths for the gRPC listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Immutable server configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub metrics_graceful_timeout: Duration,
    pub tls: Option<TlsFiles>,
    pub authentication: Authentication,
    pub environment: Environment,
}

impl ServerConfig {
    /// `host:port` of the gRPC listener, as used in logs and bind errors.
    pub fn service_addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// `host:port` of the metrics listener.
    pub fn metrics_addr(&self) -> String {
        join_host_port(&self.metrics_host, self.metrics_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 50051,
            metrics_host: "127.0.0.1".to_owned(),
            metrics_port: 9090,
            metrics_graceful_timeout: Duration::from_secs(5),
            tls: None,
            authentication: Authentication::None,
            environment: Environment::Development,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let authentication = match args.authentication_type {
            AuthenticationType::None => Authentication::None,
            AuthenticationType::SharedSecretKey => match args.client_key {
                Some(key) if !key.is_empty() => Authentication::SharedSecretKey {
                    client_key: ClientKey::new(key),
                },
                _ => {
                    return Err(Error::config(
                        "CLIENT_KEY must be set when AUTHENTICATION_TYPE is shared_secret_key",
                    ));
                }
            },
        };

        let tls = if args.use_tls {
            if !cfg!(feature = "tls") {
                return Err(Error::config(
                    "USE_TLS requires keelson to be built with the `tls` feature",
                ));
            }
            match (args.server_cert_file, args.server_key_file) {
                (Some(cert_file), Some(key_file)) => Some(TlsFiles {
                    cert_file,
                    key_file,
                }),
                _ => {
                    return Err(Error::config(
                        "USE_TLS requires both SERVER_CERT_FILE and SERVER_KEY_FILE",
                    ));
                }
            }
        } else {
            None
        };

        Ok(Self {
            host: args.host,
            port: args.port,
            metrics_host: args.metrics_host,
            metrics_port: args.metrics_port,
            metrics_graceful_timeout: Duration::from_secs(args.metrics_graceful_timeout),
            tls,
            authentication,
            environment: args.stage,
        })
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
