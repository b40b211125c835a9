#![doc = include_str!("../README.md")]

pub mod auth;
mod body;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod panic;
pub mod server;

pub use auth::{AuthError, AuthStrategy};
pub use config::{CliArgs, ServerConfig};
pub use env::Environment;
pub use error::{Error, Result};
pub use interceptor::{Interceptor, InterceptorChain, Next, RequestContext};
pub use panic::{HandlerPanic, PanicGuard};
pub use server::{LifecycleState, MockTransport, Server, ServiceRegistrar, ShutdownHandle};

// Re-exported so registrars can name the routes builder without a direct
// tonic dependency.
pub use tonic::service::RoutesBuilder;
