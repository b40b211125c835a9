//! Call authentication.
//!
//! A server authenticates every non-health call with exactly one
//! [`AuthStrategy`], chosen from the configuration when the server is built
//! and fixed for its lifetime. Strategies only hold the expected credential
//! and are freely shared between concurrent calls.
//!
//! ## Shared-secret wire format
//!
//! Callers put `base64(<client key><one trailing byte>)` in the
//! `x-authorization` metadata entry. The server decodes the value and drops
//! the final byte before comparing it to the configured key. Issuing clients
//! append that delimiter byte; see [`client::SharedSecretCredentials`] for
//! the matching encoder.
//!
//! [`client::SharedSecretCredentials`]: crate::client::SharedSecretCredentials

use crate::config::{Authentication, ClientKey};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use tonic::{Status, metadata::MetadataMap};

/// Metadata key carrying the shared-secret token.
pub const AUTHORIZATION_HEADER: &str = "x-authorization";

/// Reasons a call is rejected before it reaches its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The call carried no gRPC metadata at all.
    #[error("Failed when extract metadata")]
    MetadataMissing,

    /// `x-authorization` was absent or empty.
    #[error("Authorization token is not present")]
    TokenAbsent,

    /// `x-authorization` was not valid base64.
    #[error("Authorization token is not valid")]
    TokenMalformed,

    /// The decoded token did not match the configured key.
    #[error("Authorization token is not valid")]
    TokenInvalid,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

/// How inbound calls are authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Every call is accepted.
    None,
    /// Calls must present the pre-shared client key.
    SharedSecretToken { expected_key: ClientKey },
}

impl AuthStrategy {
    pub fn from_config(authentication: &Authentication) -> Self {
        match authentication {
            Authentication::None => Self::None,
            Authentication::SharedSecretKey { client_key } => Self::SharedSecretToken {
                expected_key: client_key.clone(),
            },
        }
    }

    /// Validates the credential carried by a call.
    ///
    /// `metadata` is `None` when the call context carried no metadata block.
    pub fn authenticate(&self, metadata: Option<&MetadataMap>) -> Result<(), AuthError> {
        match self {
            Self::None => Ok(()),
            Self::SharedSecretToken { expected_key } => {
                let metadata = metadata.ok_or(AuthError::MetadataMissing)?;
                verify_token(metadata, expected_key)
            }
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SharedSecretToken { .. } => "shared_secret_key",
        }
    }
}

fn verify_token(metadata: &MetadataMap, expected_key: &ClientKey) -> Result<(), AuthError> {
    let token = metadata
        .get(AUTHORIZATION_HEADER)
        .ok_or(AuthError::TokenAbsent)?
        .to_str()
        .map_err(|_| AuthError::TokenMalformed)?;
    if token.is_empty() {
        return Err(AuthError::TokenAbsent);
    }

    let decoded = STANDARD
        .decode(token)
        .map_err(|_| AuthError::TokenMalformed)?;

    // The issuer appends one delimiter byte to the key before encoding.
    let (_, presented) = decoded.split_last().ok_or(AuthError::TokenInvalid)?;
    if presented == expected_key.expose().as_bytes() {
        Ok(())
    } else {
        Err(AuthError::TokenInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn shared(key: &str) -> AuthStrategy {
        AuthStrategy::from_config(&Authentication::SharedSecretKey {
            client_key: ClientKey::new(key),
        })
    }

    fn with_token(token: &str) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        metadata.insert(AUTHORIZATION_HEADER, token.parse().unwrap());
        metadata
    }

    #[test]
    fn none_accepts_everything() {
        let strategy = AuthStrategy::from_config(&Authentication::None);
        assert_eq!(strategy.authenticate(None), Ok(()));
        assert_eq!(strategy.authenticate(Some(&MetadataMap::new())), Ok(()));
    }

    #[test]
    fn accepts_key_with_any_trailing_byte() {
        let strategy = shared("secret");
        for suffix in ["X", "0", "\n", "~"] {
            let token = STANDARD.encode(format!("secret{suffix}"));
            assert_eq!(strategy.authenticate(Some(&with_token(&token))), Ok(()));
        }
    }

    #[test]
    fn rejects_missing_metadata() {
        assert_eq!(
            shared("secret").authenticate(None),
            Err(AuthError::MetadataMissing)
        );
    }

    #[test]
    fn rejects_absent_or_empty_token() {
        let strategy = shared("secret");
        assert_eq!(
            strategy.authenticate(Some(&MetadataMap::new())),
            Err(AuthError::TokenAbsent)
        );
        assert_eq!(
            strategy.authenticate(Some(&with_token(""))),
            Err(AuthError::TokenAbsent)
        );
    }

    #[test]
    fn rejects_non_base64_token() {
        assert_eq!(
            shared("secret").authenticate(Some(&with_token("%%not-base64%%"))),
            Err(AuthError::TokenMalformed)
        );
    }

    #[test]
    fn rejects_wrong_key() {
        let strategy = shared("secret");
        for raw in ["wrong0", "secret", "secretXY", "Xsecret"] {
            let token = STANDARD.encode(raw);
            assert_eq!(
                strategy.authenticate(Some(&with_token(&token))),
                Err(AuthError::TokenInvalid),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn empty_decoded_token_is_invalid_not_a_panic() {
        // A single byte decodes to an empty key once the delimiter is dropped.
        let token = STANDARD.encode("X");
        assert_eq!(
            shared("secret").authenticate(Some(&with_token(&token))),
            Err(AuthError::TokenInvalid)
        );
    }

    #[test]
    fn errors_map_to_unauthenticated() {
        for err in [
            AuthError::MetadataMissing,
            AuthError::TokenAbsent,
            AuthError::TokenMalformed,
            AuthError::TokenInvalid,
        ] {
            let status = Status::from(err);
            assert_eq!(status.code(), Code::Unauthenticated);
            assert!(!status.message().contains("secret"));
        }
    }
}
