//! Session Proxy Library
//!
//! Reverse proxy that fronts a web application and bridges an identity
//! provider's session cookie into a short-lived signed bearer token.
//!
//! # Features
//!
//! - **Routing**: a reserved path prefix goes to the provider, everything else to the application
//! - **Token bridge**: active sessions become one-minute ES256 tokens, verifiable via JWKS
//! - **CORS**: allow-list with wildcards, or permissive development mode
//! - **Rewriting**: `Set-Cookie` domains and provider redirects
//! - **Login**: interactive OAuth2 Authorization Code + PKCE with a loopback callback

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod cli;
pub mod config;
pub mod cors;
pub mod credentials;
pub mod error;
pub mod login;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod signer;

pub use error::{Error, LoginError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("unable to install tracing subscriber: {e}")))
}
