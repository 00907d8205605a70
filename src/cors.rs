//! CORS decision engine
//!
//! [`CorsPolicy`] decides whether an `Origin` may talk to the proxy;
//! [`CorsPolicy::layer`] turns the decision into a `tower_http` layer that
//! answers preflight requests itself, so they never reach the token bridge.

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method, header, request::Parts};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use url::Url;

use crate::config::ProxyConfig;
use crate::session::{X_REQUEST_ID, X_SESSION_TOKEN};
use crate::{Error, Result};

/// Methods allowed in cross-origin requests
pub const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// CORS-safelisted request headers
pub fn safelisted_request_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::ACCEPT_LANGUAGE,
        header::CONTENT_LANGUAGE,
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
    ]
}

/// Request headers needed by provider and application clients
pub fn extended_request_headers() -> Vec<HeaderName> {
    vec![
        header::AUTHORIZATION,
        header::COOKIE,
        X_SESSION_TOKEN.clone(),
        X_REQUEST_ID.clone(),
    ]
}

/// CORS-safelisted response headers, exposed to scripts
pub fn exposed_headers() -> Vec<HeaderName> {
    vec![
        header::CACHE_CONTROL,
        header::CONTENT_LANGUAGE,
        header::CONTENT_LENGTH,
        header::CONTENT_TYPE,
        header::EXPIRES,
        header::LAST_MODIFIED,
        header::PRAGMA,
    ]
}

/// A single `*` wildcard origin, split around the star
#[derive(Debug, Clone, PartialEq, Eq)]
struct Wildcard {
    prefix: String,
    suffix: String,
}

impl Wildcard {
    fn matches(&self, origin: &str) -> bool {
        origin.len() >= self.prefix.len() + self.suffix.len()
            && origin.starts_with(&self.prefix)
            && origin.ends_with(&self.suffix)
    }
}

/// Origin allow-list
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_all: bool,
    exact: Vec<String>,
    wildcards: Vec<Wildcard>,
    extra_headers: Vec<HeaderName>,
    debug: bool,
}

impl CorsPolicy {
    /// Create a policy
    ///
    /// The proxy's own origin is always allowed. An empty `origins` list, a
    /// bare `*` entry, or `dev` allows every origin.
    #[must_use]
    pub fn new(origins: &[String], self_origin: &Url, dev: bool) -> Self {
        let allow_all = dev || origins.is_empty() || origins.iter().any(|o| o == "*");

        let mut exact = vec![self_origin.origin().ascii_serialization()];
        let mut wildcards = Vec::new();
        for origin in origins {
            match origin.split_once('*') {
                Some((prefix, suffix)) => wildcards.push(Wildcard {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                }),
                None => exact.push(origin.clone()),
            }
        }

        Self {
            allow_all,
            exact,
            wildcards,
            extra_headers: Vec::new(),
            debug: false,
        }
    }

    /// Build the policy from the proxy configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an extra allowed header is not a valid
    /// header name or the public URL cannot be determined.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let extra_headers = config
            .cors_allowed_headers
            .iter()
            .map(|h| {
                HeaderName::try_from(h.as_str())
                    .map_err(|_| Error::Config(format!("invalid CORS header name {h:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut policy = Self::new(&config.cors_origins, &config.public_url()?, config.dev);
        policy.extra_headers = extra_headers;
        policy.debug = config.debug;
        Ok(policy)
    }

    /// Whether `origin` may make credentialed cross-origin requests
    #[must_use]
    pub fn is_allowed(&self, origin: &str) -> bool {
        let allowed = self.allow_all
            || self.exact.iter().any(|o| o == origin)
            || self.wildcards.iter().any(|w| w.matches(origin));

        if self.debug {
            info!(origin = %origin, allowed, "CORS origin check");
        }
        allowed
    }

    /// Request headers allowed in cross-origin requests
    #[must_use]
    pub fn allowed_headers(&self) -> Vec<HeaderName> {
        let mut headers = safelisted_request_headers();
        headers.extend(extended_request_headers());
        for extra in &self.extra_headers {
            if !headers.contains(extra) {
                headers.push(extra.clone());
            }
        }
        headers
    }

    /// Turn the policy into a layer
    ///
    /// Credentials are always allowed, so the allowed origin is echoed back
    /// rather than sent as `*`.
    #[must_use]
    pub fn layer(self) -> CorsLayer {
        let allowed_headers = self.allowed_headers();
        let policy = Arc::new(self);

        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &Parts| {
                    origin.to_str().is_ok_and(|o| policy.is_allowed(o))
                },
            ))
            .allow_methods(ALLOWED_METHODS.to_vec())
            .allow_headers(allowed_headers)
            .expose_headers(exposed_headers())
            .allow_credentials(true)
    }
}
