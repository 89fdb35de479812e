//! Connection authentication: bearer-token verification and the user
//! directory collaborator.
//!
//! Tokens are consumed, never minted here. A verified token must also match
//! the `tokenVersion` on the user record, so revoking a user's sessions is
//! a single counter bump in the directory.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{ListenError, ListenResult};

/// Claims extracted from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: String,
    pub username: String,
    pub token_version: u64,
}

/// Authenticated context attached to a connection after the handshake.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
}

/// External auth collaborator: verifies a bearer token.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> ListenResult<AuthClaims>;
}

/// A user row as known to the external directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub token_version: u64,
}

/// External user directory collaborator.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> ListenResult<Option<UserRecord>>;
}

/// JWT claims wire shape (HS256).
#[derive(Deserialize)]
struct JwtClaims {
    sub: String,
    username: String,
    #[serde(rename = "tokenVersion", default)]
    token_version: u64,
    #[allow(dead_code)]
    exp: u64,
}

/// HS256 verifier keyed by `JWT_SECRET` / `SESSION_SECRET`.
pub struct JwtAuthVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl AuthVerifier for JwtAuthVerifier {
    async fn verify_token(&self, token: &str) -> ListenResult<AuthClaims> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|e| ListenError::AuthFailed(format!("invalid token: {e}")))?;
        Ok(AuthClaims {
            user_id: data.claims.sub,
            username: data.claims.username,
            token_version: data.claims.token_version,
        })
    }
}

/// In-memory user directory for tests and the standalone server.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, UserRecord>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: UserRecord) {
        self.users.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, user_id: &str) -> ListenResult<Option<UserRecord>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }
}

/// Full handshake authentication: verify the token, then check the token
/// version against the user record.
pub async fn authenticate(
    verifier: &dyn AuthVerifier,
    directory: &dyn UserDirectory,
    token: &str,
) -> ListenResult<AuthContext> {
    let claims = verifier.verify_token(token).await?;
    let record = directory
        .find_user(&claims.user_id)
        .await?
        .ok_or_else(|| ListenError::AuthFailed("unknown user".into()))?;
    if record.token_version != claims.token_version {
        return Err(ListenError::AuthFailed("stale token version".into()));
    }
    Ok(AuthContext {
        user_id: record.id,
        username: record.username,
    })
}
