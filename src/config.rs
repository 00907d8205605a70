//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Port used when neither `--port` nor `PORT` is set
pub const DEFAULT_PORT: u16 = 4000;

/// Path prefix reserved for the provider in proxy mode
pub const DEFAULT_PATH_PREFIX: &str = "/.ory";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reverse proxy configuration
    pub proxy: ProxyConfig,
    /// Session check (provider "whoami") configuration
    pub session_check: SessionCheckConfig,
    /// Interactive login configuration
    pub login: LoginConfig,
}

/// Reverse proxy configuration
///
/// Built once at startup and shared read-only for the lifetime of the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port to listen on
    pub port: u16,
    /// Application upstream. `None` together with `tunnel` routes everything
    /// to the provider.
    pub upstream: Option<Url>,
    /// Identity provider base URL
    pub provider_url: Option<Url>,
    /// Public URL the proxy is reachable at (defaults to `http://localhost:{port}`)
    pub public_url: Option<Url>,
    /// Path prefix routed to the provider
    pub path_prefix: String,
    /// Domain written into every `Set-Cookie` passing through
    pub cookie_domain: Option<String>,
    /// Where the provider's welcome page redirect is sent instead
    pub default_redirect_url: Option<Url>,
    /// Allowed CORS origins; `*` wildcards are supported
    pub cors_origins: Vec<String>,
    /// Extra request headers allowed in CORS requests
    pub cors_allowed_headers: Vec<String>,
    /// Lax development mode: any CORS origin is allowed
    pub dev: bool,
    /// Verbose CORS decision logging
    pub debug: bool,
    /// Do not mint bearer tokens from provider sessions
    pub skip_token_minting: bool,
    /// Rewrite the Host header of application-bound requests to the upstream host
    pub rewrite_host: bool,
    /// Tunnel mode: no application upstream
    pub tunnel: bool,
    /// Open the public URL in the browser once listening
    pub open: bool,
    /// How long in-flight requests may take to finish after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: port_from_env(),
            upstream: None,
            provider_url: None,
            public_url: None,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            cookie_domain: None,
            default_redirect_url: None,
            cors_origins: Vec::new(),
            cors_allowed_headers: Vec::new(),
            dev: false,
            debug: false,
            skip_token_minting: false,
            rewrite_host: false,
            tunnel: false,
            open: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Read the listen port from `PORT`, falling back to [`DEFAULT_PORT`]
fn port_from_env() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .filter(|p| *p != 0)
        .unwrap_or(DEFAULT_PORT)
}

impl ProxyConfig {
    /// Validate the configuration before the server starts
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let provider = self.provider()?;
        check_http_url("provider URL", provider)?;

        if !self.tunnel {
            let upstream = self
                .upstream
                .as_ref()
                .ok_or_else(|| Error::Config("an upstream URL is required unless running as a tunnel".to_string()))?;
            check_http_url("upstream URL", upstream)?;
        }

        if let Some(public) = &self.public_url {
            check_http_url("public URL", public)?;
            if public.path() != "/" && !public.path().is_empty() {
                return Err(Error::Config(format!(
                    "the public URL must not contain a path, got {public}"
                )));
            }
        }

        if !self.path_prefix.is_empty()
            && (!self.path_prefix.starts_with('/') || self.path_prefix.ends_with('/'))
        {
            return Err(Error::Config(format!(
                "path prefix must start with '/' and must not end with '/', got {:?}",
                self.path_prefix
            )));
        }

        Ok(())
    }

    /// The provider base URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no provider URL was configured.
    pub fn provider(&self) -> Result<&Url> {
        self.provider_url
            .as_ref()
            .ok_or_else(|| Error::Config("the identity provider URL is not set".to_string()))
    }

    /// Public URL of the proxy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no public URL is set and the default
    /// cannot be built from the port.
    pub fn public_url(&self) -> Result<Url> {
        match &self.public_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("http://localhost:{}", self.port))
                .map_err(|e| Error::Config(format!("invalid default public URL: {e}"))),
        }
    }

    /// Target of the rewritten welcome-page redirect
    ///
    /// # Errors
    ///
    /// See [`Self::public_url`].
    pub fn default_redirect_url(&self) -> Result<Url> {
        match &self.default_redirect_url {
            Some(url) => Ok(url.clone()),
            None => self.public_url(),
        }
    }

    /// Public URL with the path prefix appended; what the provider should
    /// treat as its own base URL.
    ///
    /// # Errors
    ///
    /// See [`Self::public_url`].
    pub fn public_provider_url(&self) -> Result<Url> {
        let mut url = self.public_url()?;
        if !self.path_prefix.is_empty() {
            url.set_path(&self.path_prefix);
        }
        Ok(url)
    }
}

fn check_http_url(what: &str, url: &Url) -> Result<()> {
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        _ => Err(Error::Config(format!(
            "{what} must be an absolute http(s) URL, got {url}"
        ))),
    }
}

/// Session check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCheckConfig {
    /// Path of the "who am I" endpoint, relative to the provider URL
    pub whoami_path: String,
    /// Connection timeout per attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl Default for SessionCheckConfig {
    fn default() -> Self {
        Self {
            whoami_path: "sessions/whoami".to_string(),
            connect_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }
}

/// Interactive OAuth2 login configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// OAuth2 issuer; endpoints default to Hydra-style paths below it
    pub issuer_url: Option<Url>,
    /// Authorization endpoint override
    pub authorization_endpoint: Option<Url>,
    /// Token endpoint override
    pub token_endpoint: Option<Url>,
    /// Revocation endpoint override
    pub revoke_endpoint: Option<Url>,
    /// Public OAuth2 client id
    pub client_id: Option<String>,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Candidate ports for the local callback listener
    pub callback_ports: Vec<u16>,
    /// Provider-hosted page shown after a successful login
    pub success_url: Option<Url>,
    /// Provider-hosted page shown after a failed login
    pub error_url: Option<Url>,
    /// Endpoint returning the caller's active project
    pub project_endpoint: Option<Url>,
    /// Collection URL for temporary API keys; `{project}` is replaced with
    /// the active project's id
    pub api_keys_endpoint: Option<String>,
    /// How long the callback handler waits for the exchange outcome
    #[serde(with = "humantime_serde")]
    pub outcome_timeout: Duration,
    /// Timeout of each request to the OAuth2 and project endpoints
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Directory the auth context is persisted in
    pub store_dir: Option<PathBuf>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            authorization_endpoint: None,
            token_endpoint: None,
            revoke_endpoint: None,
            client_id: None,
            scopes: vec!["openid".to_string(), "offline_access".to_string()],
            callback_ports: vec![4446, 4447, 4448, 4449, 4450, 4451, 4452, 4453],
            success_url: None,
            error_url: None,
            project_endpoint: None,
            api_keys_endpoint: None,
            outcome_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            store_dir: None,
        }
    }
}

/// Resolved OAuth2 endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    /// Authorization endpoint
    pub authorization: Url,
    /// Token endpoint
    pub token: Url,
    /// Revocation endpoint
    pub revoke: Url,
}

impl LoginConfig {
    /// Resolve the OAuth2 endpoints, deriving missing ones from the issuer
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an endpoint is neither set nor derivable.
    pub fn endpoints(&self) -> Result<OAuthEndpoints> {
        let derive = |explicit: &Option<Url>, path: &str| -> Result<Url> {
            if let Some(url) = explicit {
                return Ok(url.clone());
            }
            let issuer = self.issuer_url.as_ref().ok_or_else(|| {
                Error::Config(format!("no issuer URL configured to derive {path} from"))
            })?;
            join_path(issuer, path)
        };

        Ok(OAuthEndpoints {
            authorization: derive(&self.authorization_endpoint, "oauth2/auth")?,
            token: derive(&self.token_endpoint, "oauth2/token")?,
            revoke: derive(&self.revoke_endpoint, "oauth2/revoke")?,
        })
    }

    /// The configured client id
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no client id is configured.
    pub fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| Error::Config("no OAuth2 client id configured".to_string()))
    }

    /// Directory the auth context lives in
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no directory is configured and the home
    /// directory cannot be determined.
    pub fn store_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".session-proxy"))
            .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))
    }
}

/// Append `path` to the path of `base`, keeping any existing base path
///
/// # Errors
///
/// Returns [`Error::Config`] if the result is not a valid URL.
pub fn join_path(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("{base} cannot be used as a base URL")));
    }
    Ok(url)
}

impl Config {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment (`SESSION_PROXY_` prefix, `__` as the nesting separator)
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SESSION_PROXY_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}
