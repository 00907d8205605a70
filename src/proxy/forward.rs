//! Upstream dispatch
//!
//! The fallback handler of the proxy router. It picks the upstream, rewrites
//! the outgoing request, streams both bodies and rewrites the response
//! headers on the way back. Dispatch failures are not retried.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody as _},
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    response::Response,
};
use tracing::debug;
use url::Url;

use super::rewrite::{LocationRewriter, rewrite_cookie_domain};
use super::route::{Routing, Target, upstream_url};
use crate::config::ProxyConfig;
use crate::{Error, Result};

/// Tells the provider not to redirect to a custom domain
pub static ORY_NO_CUSTOM_DOMAIN_REDIRECT: HeaderName =
    HeaderName::from_static("ory-no-custom-domain-redirect");

/// Base URL the provider should generate links against
pub static ORY_BASE_URL_REWRITE: HeaderName = HeaderName::from_static("ory-base-url-rewrite");

/// API key authorising the base URL rewrite
pub static ORY_BASE_URL_REWRITE_TOKEN: HeaderName =
    HeaderName::from_static("ory-base-url-rewrite-token");

static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Connect timeout towards either upstream
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Remove hop-by-hop headers, including those named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        KEEP_ALIVE.clone(),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
}

/// State of the dispatch handler, built once per run
pub struct ProxyState {
    client: reqwest::Client,
    routing: Routing,
    provider: Url,
    upstream: Url,
    rewrite_host: bool,
    cookie_domain: Option<String>,
    base_url_rewrite: HeaderValue,
    api_key: Option<HeaderValue>,
    locations: LocationRewriter,
}

impl ProxyState {
    /// Build the dispatch state from the proxy configuration
    ///
    /// In tunnel mode the application upstream falls back to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an incomplete configuration or an API
    /// key that is not a valid header value.
    pub fn new(config: &ProxyConfig, api_key: Option<&str>) -> Result<Self> {
        let provider = config.provider()?.clone();
        let upstream = config.upstream.clone().unwrap_or_else(|| provider.clone());
        let routing = Routing::new(config.path_prefix.clone(), config.tunnel);
        let public_provider = config.public_provider_url()?;

        let base_url_rewrite = HeaderValue::from_str(public_provider.as_str())
            .map_err(|e| Error::Config(format!("invalid public URL: {e}")))?;
        let api_key = api_key
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|_| Error::Config("the API key is not a valid header value".to_string()))?;

        let locations = LocationRewriter::new(
            provider.clone(),
            public_provider,
            routing.welcome_path(),
            config.default_redirect_url()?,
        );

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("unable to build proxy client: {e}")))?;

        Ok(Self {
            client,
            routing,
            provider,
            upstream,
            rewrite_host: config.rewrite_host,
            cookie_domain: config.cookie_domain.clone(),
            base_url_rewrite,
            api_key,
            locations,
        })
    }

    /// Outgoing URL and headers for an inbound request
    fn outgoing(
        &self,
        request: &Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> (Target, Url, HeaderMap) {
        let path = request.uri().path();
        let query = request.uri().query();
        let target = self.routing.target(path);

        let mut headers = request.headers().clone();
        strip_hop_by_hop(&mut headers);
        let inbound_host = headers.remove(header::HOST);

        let url = match target {
            Target::Provider => {
                // Host is derived from the URL
                headers.insert(
                    ORY_NO_CUSTOM_DOMAIN_REDIRECT.clone(),
                    HeaderValue::from_static("true"),
                );
                headers.insert(ORY_BASE_URL_REWRITE.clone(), self.base_url_rewrite.clone());
                if let Some(key) = &self.api_key {
                    headers.insert(ORY_BASE_URL_REWRITE_TOKEN.clone(), key.clone());
                }
                upstream_url(&self.provider, self.routing.provider_path(path), query)
            }
            Target::Application => {
                // The application may be trying to talk to the provider directly
                for name in [
                    &ORY_NO_CUSTOM_DOMAIN_REDIRECT,
                    &ORY_BASE_URL_REWRITE,
                    &ORY_BASE_URL_REWRITE_TOKEN,
                ] {
                    headers.remove(name);
                }
                match inbound_host {
                    Some(host) if self.rewrite_host => {
                        headers.insert(X_FORWARDED_HOST.clone(), host);
                    }
                    Some(host) => {
                        headers.insert(header::HOST, host);
                    }
                    None => {}
                }
                upstream_url(&self.upstream, path, query)
            }
        };

        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
        }

        (target, url, headers)
    }

    /// Rewrite upstream response headers in place
    fn rewrite_response(&self, headers: &mut HeaderMap) {
        strip_hop_by_hop(headers);

        let cookies: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
        if !cookies.is_empty() {
            headers.remove(header::SET_COOKIE);
            for cookie in cookies {
                let rewritten = cookie
                    .to_str()
                    .ok()
                    .map(|c| rewrite_cookie_domain(c, self.cookie_domain.as_deref()))
                    .and_then(|c| HeaderValue::from_str(&c).ok())
                    .unwrap_or(cookie);
                headers.append(header::SET_COOKIE, rewritten);
            }
        }

        let location = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|l| self.locations.rewrite(l));
        if let Some(value) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
            headers.insert(header::LOCATION, value);
        }
    }
}

/// Forward a request to its upstream and stream the response back
///
/// # Errors
///
/// Returns [`Error::Upstream`] (502) if the upstream cannot be reached.
pub async fn forward(
    State(state): State<Arc<ProxyState>>,
    request: Request<Body>,
) -> Result<Response> {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (target, url, headers) = state.outgoing(&request, client_addr);
    let method = request.method().clone();

    debug!(method = %method, url = %url, ?target, "Forwarding request");

    // Empty bodies are sent without chunked framing
    let mut outgoing = state.client.request(method, url.clone()).headers(headers);
    if !request.body().is_end_stream() {
        outgoing = outgoing.body(reqwest::Body::wrap_stream(
            request.into_body().into_data_stream(),
        ));
    }
    let upstream_response = outgoing
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("{url}: {e}")))?;

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    state.rewrite_response(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
