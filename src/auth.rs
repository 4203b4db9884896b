//! Connection Authentication
//!
//! Bearer credentials arrive with the WebSocket handshake and are checked by a
//! [`TokenVerifier`] before a connection is registered.
//!
//! # Credential channels
//!
//! - **Subprotocol** (preferred): `Sec-WebSocket-Protocol: <token>[, other]`,
//!   the first comma-separated value is the token.
//! - **Query parameter** (deprecated): `/ws?token=<token>`, only consulted when
//!   no subprotocol was offered.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No token supplied")]
    Missing,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token")]
    Invalid,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Authenticated user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Principal {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Validates an opaque bearer credential
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Where the credential was found during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Subprotocol,
    Query,
}

/// Credential extracted from a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

/// Transport-agnostic view of the handshake fields that may carry a token
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Raw `Sec-WebSocket-Protocol` header value
    pub protocols: Option<String>,
    /// `token` query parameter
    pub query_token: Option<String>,
}

impl Handshake {
    pub fn new(protocols: Option<String>, query_token: Option<String>) -> Self {
        Self {
            protocols,
            query_token,
        }
    }

    /// Pick the bearer credential, subprotocol first
    pub fn credential(&self) -> Option<Credential> {
        let from_protocol = self
            .protocols
            .as_deref()
            .and_then(|p| p.split(',').next())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        if let Some(token) = from_protocol {
            return Some(Credential {
                token: token.to_string(),
                source: CredentialSource::Subprotocol,
            });
        }

        let token = self
            .query_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())?;

        debug!("Credential taken from deprecated query parameter");
        Some(Credential {
            token: token.to_string(),
            source: CredentialSource::Query,
        })
    }
}

/// `sub` may be issued as a number or a string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Subject {
    Numeric(i64),
    Text(String),
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: Subject,
    #[serde(default)]
    iat: i64,
    exp: i64,
}

/// HS256 JWT verifier
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `sub` is often numeric; `Claims` enforces its presence
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Issue a token for `principal` valid for `ttl`
    pub fn issue(&self, principal: &Principal, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let sub = match principal.as_str().parse::<i64>() {
            Ok(n) => Subject::Numeric(n),
            Err(_) => Subject::Text(principal.as_str().to_string()),
        };
        let claims = Claims {
            sub,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to encode token: {}", e)))
    }

    fn decode(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;

        let principal = match data.claims.sub {
            Subject::Numeric(n) => Principal::from(n),
            Subject::Text(s) if !s.is_empty() => Principal::new(s),
            Subject::Text(_) => return Err(AuthError::Invalid),
        };

        Ok(principal)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.decode(token)
    }
}
