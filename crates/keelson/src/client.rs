//! Outbound gRPC helpers: dialling with retry, and the client half of the
//! shared-secret token scheme.

use crate::{Result, auth::AUTHORIZATION_HEADER};
use base64::{Engine, engine::general_purpose::STANDARD};
use core::time::Duration;
use rand::Rng;
use tonic::{
    Request, Status,
    metadata::AsciiMetadataValue,
    service::Interceptor,
    transport::{Channel, Endpoint},
};

/// Byte appended to the secret before encoding, unless overridden.
pub const DEFAULT_TOKEN_DELIMITER: u8 = b'\n';

/// Dial behaviour for [`connect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Delay before the second attempt. Doubles on every further attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt connect deadline.
    pub connect_timeout: Duration,
    /// Total attempts, the first included. Zero is treated as one.
    pub max_attempts: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(20),
            max_attempts: 5,
        }
    }
}

/// Connects to `endpoint` (for example `http://127.0.0.1:50051`), retrying
/// failed attempts with capped exponential backoff plus jitter.
pub async fn connect(endpoint: impl Into<String>, options: ConnectOptions) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(endpoint.into())?.connect_timeout(options.connect_timeout);
    let max_attempts = options.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match endpoint.connect().await {
            Ok(channel) => {
                tracing::info!(uri = %endpoint.uri(), attempt, "Successfully connected to gRPC server");
                return Ok(channel);
            }
            Err(err) if attempt < max_attempts => {
                let delay = backoff_delay(attempt, &options);
                tracing::warn!(
                    uri = %endpoint.uri(),
                    attempt,
                    retry_in = ?delay,
                    error = %err,
                    "Error when creating the gRPC connection"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::error!(
                    uri = %endpoint.uri(),
                    attempt,
                    error = %err,
                    "Giving up on the gRPC connection"
                );
                return Err(err.into());
            }
        }
    }
}

/// Delay after the `attempt`-th failure: `base * 2^(attempt-1)` capped at
/// `max_delay`, plus up to 10% jitter.
fn backoff_delay(attempt: u32, options: &ConnectOptions) -> Duration {
    let base_ms = u64::try_from(options.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(options.max_delay.as_millis()).unwrap_or(u64::MAX);

    let exponential = 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::rng().random_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

/// Stamps every outgoing call with a shared-secret token.
///
/// The token is `base64(secret || delimiter)`, carried in the
/// `x-authorization` metadata entry; servers configured with the same key
/// accept it.
///
/// ```ignore
/// let creds = SharedSecretCredentials::new("secret");
/// let client = EchoClient::with_interceptor(channel, creds);
/// ```
#[derive(Clone)]
pub struct SharedSecretCredentials {
    token: String,
}

impl SharedSecretCredentials {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_delimiter(secret, DEFAULT_TOKEN_DELIMITER)
    }

    pub fn with_delimiter(secret: impl AsRef<[u8]>, delimiter: u8) -> Self {
        let mut raw = secret.as_ref().to_vec();
        raw.push(delimiter);
        Self {
            token: STANDARD.encode(raw),
        }
    }

    /// The encoded metadata value.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl core::fmt::Debug for SharedSecretCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedSecretCredentials(..)")
    }
}

impl Interceptor for SharedSecretCredentials {
    fn call(&mut self, mut request: Request<()>) -> core::result::Result<Request<()>, Status> {
        let value = AsciiMetadataValue::try_from(self.token.as_str())
            .map_err(|_| Status::internal("credential is not valid metadata"))?;
        request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
        Ok(request)
    }
}
