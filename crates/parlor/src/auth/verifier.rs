//! Credential verification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};

use super::{AuthConfig, AuthError, Claims, ConfigValidationError, Identity};
use crate::store::StoreError;

/// Verifies an opaque credential and derives the identity it names.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Resolves user ids carried in credentials to known identities.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find_identity(&self, user_id: &str) -> Result<Option<Identity>, StoreError>;
}

/// HS256 JWT verifier backed by an identity directory.
///
/// In dev mode, credentials of the form `dev:<user_id>` skip the signature
/// check but are still resolved through the directory.
pub struct JwtVerifier {
    directory: Arc<dyn IdentityDirectory>,
    decoding_key: Option<DecodingKey>,
    encoding_key: Option<EncodingKey>,
    dev_mode: bool,
    token_ttl_secs: i64,
}

impl JwtVerifier {
    /// Build a verifier, resolving `env:VAR_NAME` in the secret.
    pub fn new(
        config: &AuthConfig,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Result<Self, ConfigValidationError> {
        let secret = config.resolve_jwt_secret()?;

        Ok(Self {
            directory,
            decoding_key: secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            encoding_key: secret
                .as_ref()
                .map(|s| EncodingKey::from_secret(s.as_bytes())),
            dev_mode: config.dev_mode,
            token_ttl_secs: config.token_ttl_secs,
        })
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            debug!("JWT validation failed: {:?}", e);
            AuthError::InvalidOrExpiredCredential
        })?;

        Ok(token_data.claims)
    }

    /// Issue a signed token for a user.
    pub fn issue(&self, user_id: &str, email: Option<&str>) -> Result<String, AuthError> {
        let encoding_key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            email: email.map(str::to_string),
            exp: now + self.token_ttl_secs,
            iat: Some(now),
        };

        encode(&Header::default(), &claims, encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let user_id = match credential.strip_prefix("dev:") {
            Some(user_id) if self.dev_mode => user_id.to_string(),
            _ => self.decode_claims(credential)?.user_id,
        };

        if user_id.is_empty() {
            return Err(AuthError::InvalidOrExpiredCredential);
        }

        match self.directory.find_identity(&user_id).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                warn!("Credential names unknown user {}", user_id);
                Err(AuthError::UnknownIdentity)
            }
            Err(e) => Err(AuthError::Internal(e.to_string())),
        }
    }
}

/// Runs credential verification at connection-open time.
///
/// Nothing is registered until this returns an identity.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
    verifier: Arc<dyn AuthVerifier>,
}

impl ConnectionAuthenticator {
    pub fn new(verifier: Arc<dyn AuthVerifier>) -> Self {
        Self { verifier }
    }

    /// Verify the credential presented with a connection, if any.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        let identity = self.verifier.verify(credential).await?;
        debug!("Authenticated connection for {}", identity);
        Ok(identity)
    }
}
