use std::fmt::Formatter;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::headers::authorization::Bearer;
use axum::headers::Authorization;
use axum::http::request::Parts;
use axum::TypedHeader;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::distributions::{Alphanumeric, DistString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{trace, warn};

use enclii_common::claims::{Claim, CredentialSource, Role};
use enclii_common::models::error::ErrorKind;
use enclii_common::{API_TOKEN_PREFIX, TOKEN_AUDIENCE};

use crate::persistence::Persistence;
use crate::{Error, Result};

const JWKS_TTL: Duration = Duration::from_secs(3600);
const API_TOKEN_LENGTH: usize = 40;

/// A bearer credential as pulled off the wire, not yet verified.
#[derive(Clone)]
pub struct Key(String);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Mint a fresh API token together with the hash we store.
    pub fn generate() -> (String, String) {
        let token = format!(
            "{API_TOKEN_PREFIX}{}",
            Alphanumeric.sample_string(&mut rand::thread_rng(), API_TOKEN_LENGTH)
        );
        let hash = hash_token(&token);
        (token, hash)
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Never print the credential itself.
        write!(f, "<bearer>")
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(s.to_string()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Key
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| Error::from_kind(ErrorKind::Unauthenticated))
            .and_then(|TypedHeader(Authorization(bearer))| bearer.token().trim().parse())
    }
}

/// A guard that verifies the bearer credential and resolves it to a
/// [`Claim`]. Handlers consult the claim against the authorization matrix.
#[derive(Clone)]
pub struct User {
    pub claim: Claim,
}

#[async_trait]
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let key = Key::from_request_parts(parts, state).await?;
        let authenticator = parts
            .extensions
            .get::<Arc<Authenticator>>()
            .expect("authenticator extension missing")
            .clone();

        let claim = authenticator.authenticate(&key).await?;
        trace!(sub = %claim.sub, "authenticated principal");

        Ok(User { claim })
    }
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

#[derive(Clone, Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    n: String,
    e: String,
}

#[derive(Clone, Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    jwks: Jwks,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct OidcTokenClaims {
    sub: String,
    email: Option<String>,
}

/// Verifies bearer credentials: OIDC JWTs against the issuer's key set,
/// API tokens against their hashed records.
pub struct Authenticator {
    persistence: Persistence,
    http: reqwest::Client,
    issuer: String,
    client_id: String,
    jwks: RwLock<Option<CachedJwks>>,
}

impl Authenticator {
    pub fn new(persistence: Persistence, issuer: String, client_id: String) -> Self {
        Self {
            persistence,
            http: reqwest::Client::new(),
            issuer,
            client_id,
            jwks: RwLock::new(None),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn authenticate(&self, key: &Key) -> Result<Claim> {
        if key.as_str().starts_with(API_TOKEN_PREFIX) {
            self.authenticate_api_token(key.as_str()).await
        } else {
            self.authenticate_jwt(key.as_str()).await
        }
    }

    async fn authenticate_api_token(&self, token: &str) -> Result<Claim> {
        let (name, grant) = self
            .persistence
            .find_api_token(&hash_token(token))
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::Unauthenticated))?;

        Ok(Claim {
            sub: format!("token:{name}"),
            email: None,
            role: grant.role,
            projects: grant.projects,
            scopes: grant.scopes,
            source: CredentialSource::ApiToken,
        })
    }

    async fn authenticate_jwt(&self, token: &str) -> Result<Claim> {
        let header =
            decode_header(token).map_err(|e| Error::source(ErrorKind::Unauthenticated, e))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_nbf = true;

        let key = self.decoding_key(header.kid.as_deref()).await?;
        let data = decode::<OidcTokenClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::source(ErrorKind::TokenExpired, e)
                }
                _ => Error::source(ErrorKind::Unauthenticated, e),
            }
        })?;

        let grant = self
            .persistence
            .find_platform_user(&data.claims.sub, data.claims.email.as_deref())
            .await?;

        let (role, projects) = match grant {
            Some(grant) => (grant.role, grant.projects),
            // Authenticated but unprovisioned: a viewer of nothing.
            None => (Role::Viewer, Vec::new()),
        };

        Ok(Claim {
            sub: data.claims.sub,
            email: data.claims.email,
            role,
            projects,
            scopes: Vec::new(),
            source: CredentialSource::Oidc,
        })
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        self.refresh_jwks().await?;

        self.cached_key(kid)
            .await
            .ok_or_else(|| Error::custom(ErrorKind::Unauthenticated, "no matching signing key"))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let guard = self.jwks.read().await;
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() > JWKS_TTL {
            return None;
        }

        let jwk = match kid {
            Some(kid) => cached
                .jwks
                .keys
                .iter()
                .find(|key| key.kid.as_deref() == Some(kid))?,
            None => cached.jwks.keys.first()?,
        };

        DecodingKey::from_rsa_components(&jwk.n, &jwk.e).ok()
    }

    /// Exchange a refresh token at the issuer's token endpoint. The body
    /// passes through untouched so clients see the issuer's own shape.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<serde_json::Value> {
        let token_url = format!("{}/oauth/token", self.issuer.trim_end_matches('/'));
        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(Error::from_kind(ErrorKind::Unauthenticated));
        }

        response
            .json()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))
    }

    async fn refresh_jwks(&self) -> Result<()> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        );
        let discovery: OidcDiscovery = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?
            .json()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?;

        let jwks: Jwks = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?
            .json()
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?;

        if jwks.keys.is_empty() {
            warn!("issuer returned an empty key set");
        }

        *self.jwks.write().await = Some(CachedJwks {
            jwks,
            fetched_at: Instant::now(),
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use enclii_common::claims::TokenScope;

    use super::*;

    #[test]
    fn generated_tokens_carry_the_prefix_and_hash_deterministically() {
        let (token, hash) = Key::generate();
        assert!(token.starts_with(API_TOKEN_PREFIX));
        assert_eq!(hash, hash_token(&token));
        assert_ne!(hash, hash_token("enclii_other"));
    }

    #[tokio::test]
    async fn api_token_resolves_to_claim() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let (token, hash) = Key::generate();
        let project = uuid::Uuid::new_v4();
        persistence
            .create_api_token(
                "ci",
                &hash,
                Role::Developer,
                &[TokenScope::Read, TokenScope::Deploy],
                &[project],
                "tester",
            )
            .await
            .unwrap();

        let authenticator = Authenticator::new(
            persistence,
            "https://issuer.example.com".to_string(),
            "enclii".to_string(),
        );

        let claim = authenticator
            .authenticate(&token.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(claim.sub, "token:ci");
        assert_eq!(claim.role, Role::Developer);
        assert_eq!(claim.source, CredentialSource::ApiToken);
        assert!(claim.may_deploy(project, false));
        assert!(!claim.may_deploy(project, true));
    }

    #[tokio::test]
    async fn unknown_tokens_are_unauthenticated() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let authenticator = Authenticator::new(
            persistence,
            "https://issuer.example.com".to_string(),
            "enclii".to_string(),
        );

        let err = authenticator
            .authenticate(&"enclii_bogus".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }
}
