//! Session resolution against the identity provider.
//!
//! The resolver asks the provider's "who am I" endpoint whether the
//! credentials on an inbound request belong to an active session. It never
//! fails the request: every terminal failure degrades to
//! [`SessionStatus::NotAuthenticated`] so the proxy stays available while
//! the provider is not.

use std::fmt;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::{SessionCheckConfig, join_path};
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// `X-Session-Token` header used by native provider clients
pub static X_SESSION_TOKEN: HeaderName = HeaderName::from_static("x-session-token");

/// `X-Request-Id` header
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers copied from the inbound request onto the session check
pub fn forwarded_headers() -> [HeaderName; 4] {
    [
        header::COOKIE,
        header::AUTHORIZATION,
        X_SESSION_TOKEN.clone(),
        X_REQUEST_ID.clone(),
    ]
}

/// Session document returned by the provider
///
/// Only `active` and `identity.id` are interpreted; everything else is kept
/// verbatim and copied into the minted token's `session` claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    /// Whether the session is active
    pub active: bool,
    /// Identity the session belongs to
    pub identity: Identity,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity inside a [`SessionDocument`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Identity id, used as the token subject
    pub id: String,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of a session check
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// The request belongs to an active session
    Active(Box<SessionDocument>),
    /// Anonymous, expired, or the provider could not tell
    NotAuthenticated,
}

impl SessionStatus {
    /// The session document, if active
    #[must_use]
    pub fn session(&self) -> Option<&SessionDocument> {
        match self {
            Self::Active(session) => Some(session),
            Self::NotAuthenticated => None,
        }
    }
}

/// Resolves inbound request credentials into a session
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Resolve the session carried by `headers`
    async fn resolve(&self, headers: &HeaderMap) -> SessionStatus;
}

/// Why a single session-check attempt failed
#[derive(Debug)]
enum CheckError {
    Transport(reqwest::Error),
    Status(StatusCode),
    Decode(String),
}

impl CheckError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode(_) => false,
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "unable to call session checker: {e}"),
            Self::Status(status) => write!(f, "session checker returned {status}"),
            Self::Decode(e) => write!(f, "unable to decode session: {e}"),
        }
    }
}

/// Session resolver calling the provider over HTTP with bounded retries
pub struct HttpSessionResolver {
    client: reqwest::Client,
    endpoint: Url,
    policy: RetryPolicy,
}

impl HttpSessionResolver {
    /// Create a resolver for the provider at `provider_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL cannot be built or the HTTP
    /// client cannot be constructed.
    pub fn new(provider_url: &Url, config: &SessionCheckConfig) -> Result<Self> {
        let policy = RetryPolicy::new(&config.retry, config.connect_timeout);
        let endpoint = join_path(provider_url, &config.whoami_path)?;
        Self::with_policy(endpoint, policy)
    }

    /// Create a resolver for an explicit endpoint and retry policy
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_policy(endpoint: Url, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .timeout(policy.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("unable to build session client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            policy,
        })
    }

    /// The "who am I" endpoint being called
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn check_once(&self, headers: &HeaderMap) -> std::result::Result<SessionDocument, CheckError> {
        let mut request = self
            .client
            .get(self.endpoint.clone())
            .header(header::ACCEPT, HeaderValue::from_static("application/json"));

        for name in forwarded_headers() {
            if let Some(value) = headers.get(&name) {
                request = request.header(name, value.clone());
            }
        }

        let response = request.send().await.map_err(CheckError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status(status));
        }

        let body = response.bytes().await.map_err(CheckError::Transport)?;
        serde_json::from_slice(&body).map_err(|e| CheckError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SessionResolver for HttpSessionResolver {
    async fn resolve(&self, headers: &HeaderMap) -> SessionStatus {
        let result = with_retry(
            &self.policy,
            "session_check",
            || self.check_once(headers),
            CheckError::is_retryable,
        )
        .await;

        match result {
            Ok(session) if session.active => {
                debug!(identity = %session.identity.id, "Active session found");
                SessionStatus::Active(Box::new(session))
            }
            Ok(_) => {
                debug!("Session is not active");
                SessionStatus::NotAuthenticated
            }
            Err(CheckError::Status(status))
                if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS =>
            {
                debug!(status = status.as_u16(), "No session");
                SessionStatus::NotAuthenticated
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Session check failed, continuing anonymously");
                SessionStatus::NotAuthenticated
            }
        }
    }
}
