//! Session to bearer-token bridge
//!
//! Sits in front of the proxy handler. Application-bound requests carrying an
//! active provider session get a freshly minted, one-minute ES256 token in
//! `Authorization`; every other application-bound request has client supplied
//! credentials removed. Provider-bound requests pass through untouched.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proxy::route::Routing;
use crate::session::{SessionDocument, SessionResolver, SessionStatus, X_SESSION_TOKEN};
use crate::signer::Signer;
use crate::{Error, Result};

/// Lifetime of a minted token, in seconds
pub const TOKEN_LIFETIME_SECS: u64 = 60;

/// Claims of a minted bearer token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerClaims {
    /// Provider URL
    pub iss: String,
    /// Identity id
    pub sub: String,
    /// Issued at
    pub iat: u64,
    /// Not before
    pub nbf: u64,
    /// Expiry, always `iat + 60`
    pub exp: u64,
    /// Fresh per token
    pub jti: String,
    /// The full session document
    pub session: SessionDocument,
}

impl BearerClaims {
    /// Claims for `session` issued at `now` (unix seconds)
    #[must_use]
    pub fn new(issuer: &str, session: &SessionDocument, now: u64) -> Self {
        Self {
            iss: issuer.to_string(),
            sub: session.identity.id.clone(),
            iat: now,
            nbf: now,
            exp: now + TOKEN_LIFETIME_SECS,
            jti: Uuid::new_v4().to_string(),
            session: session.clone(),
        }
    }
}

/// State of the bridge middleware
pub struct TokenBridge {
    signer: Option<Arc<Signer>>,
    resolver: Arc<dyn SessionResolver>,
    routing: Routing,
    issuer: String,
}

impl TokenBridge {
    /// Create a bridge
    ///
    /// Without a `signer` no tokens are minted and the key set is empty.
    pub fn new(
        signer: Option<Arc<Signer>>,
        resolver: Arc<dyn SessionResolver>,
        routing: Routing,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            signer,
            resolver,
            routing,
            issuer: issuer.into().trim_end_matches('/').to_string(),
        }
    }

    /// Issuer written into every token
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Whether tokens are minted at all
    #[must_use]
    pub fn mints_tokens(&self) -> bool {
        self.signer.is_some()
    }

    /// The public key set served at the JWKS paths
    #[must_use]
    pub fn key_set(&self) -> JwkSet {
        self.signer
            .as_ref()
            .map_or_else(|| JwkSet { keys: Vec::new() }, |s| s.public_key_set().clone())
    }

    /// Mint a bearer token for `session`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if no signer is configured or signing fails.
    pub fn mint(&self, session: &SessionDocument) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::Signing("no signing key available".to_string()))?;
        let claims = BearerClaims::new(&self.issuer, session, jsonwebtoken::get_current_timestamp());
        signer.sign(&claims)
    }
}

/// Remove every credential a client could use to impersonate someone upstream
fn strip_credentials(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove(&X_SESSION_TOKEN);
}

/// Token bridge middleware
pub async fn token_bridge(
    State(bridge): State<Arc<TokenBridge>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if bridge.routing.is_jwks_path(&path) {
        debug!(path = %path, "Serving public key set");
        return Json(bridge.key_set()).into_response();
    }

    // The provider authenticates with its own scheme
    if bridge.routing.is_prefixed(&path) || bridge.routing.is_tunnel() {
        return next.run(request).await;
    }

    if !bridge.mints_tokens() {
        strip_credentials(request.headers_mut());
        return next.run(request).await;
    }

    match bridge.resolver.resolve(request.headers()).await {
        SessionStatus::NotAuthenticated => {
            strip_credentials(request.headers_mut());
            next.run(request).await
        }
        SessionStatus::Active(session) => {
            let token = match bridge.mint(&session) {
                Ok(token) => token,
                Err(e) => {
                    warn!(path = %path, error = %e, "Unable to mint bearer token");
                    return e.into_response();
                }
            };
            let value = match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => value,
                Err(e) => return Error::Signing(e.to_string()).into_response(),
            };

            let headers = request.headers_mut();
            strip_credentials(headers);
            headers.remove(header::COOKIE);
            headers.insert(header::AUTHORIZATION, value);

            debug!(path = %path, identity = %session.identity.id, "Forwarding with minted bearer token");
            next.run(request).await
        }
    }
}
