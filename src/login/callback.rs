//! Loopback callback server
//!
//! A short-lived HTTP server receiving the provider's redirect after the user
//! authorised the login in the browser. It talks to the login flow through
//! three one-shot channels:
//!
//! - `code`: handler → flow, the authorization code
//! - `error`: handler → flow, a provider error or CSRF failure
//! - `outcome`: flow → handler, whether the code exchange succeeded
//!
//! The browser is only redirected to the success page once the exchange has
//! actually completed.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::pkce::state_matches;
use crate::LoginError;

/// Path the provider redirects back to
pub const CALLBACK_PATH: &str = "/callback";

/// How long closing waits for an in-flight browser response
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State parameter (CSRF binding)
    pub state: Option<String>,
    /// OAuth2 error code
    pub error: Option<String>,
    /// OAuth2 error description
    pub error_description: Option<String>,
}

/// Result of the code exchange, reported back to the browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Tokens were obtained
    Success,
    /// The exchange failed
    Failure(String),
}

/// Where the browser ends up after the callback
#[derive(Debug, Clone, Default)]
pub struct Pages {
    /// Provider-hosted success page; a built-in page is rendered otherwise
    pub success_url: Option<Url>,
    /// Provider-hosted error page; a built-in page is rendered otherwise
    pub error_url: Option<Url>,
}

impl Pages {
    fn success(&self) -> Response {
        match &self.success_url {
            Some(url) => Redirect::to(url.as_str()).into_response(),
            None => Html(success_page()).into_response(),
        }
    }

    fn error(&self, error: &str, description: &str) -> Response {
        match &self.error_url {
            Some(url) => {
                let mut url = url.clone();
                url.query_pairs_mut()
                    .append_pair("error", error)
                    .append_pair("error_description", description);
                Redirect::to(url.as_str()).into_response()
            }
            None => Html(error_page(error, description)).into_response(),
        }
    }
}

/// State shared with the callback handler
struct HandlerState {
    expected_state: String,
    code_tx: Option<oneshot::Sender<String>>,
    error_tx: Option<oneshot::Sender<LoginError>>,
    outcome_rx: Option<oneshot::Receiver<Outcome>>,
    pages: Pages,
    outcome_timeout: Duration,
}

impl HandlerState {
    /// Report `error` to the flow; only the first callback is honoured
    fn fail(&mut self, error: LoginError) {
        self.code_tx = None;
        if let Some(tx) = self.error_tx.take() {
            let _ = tx.send(error);
        }
    }
}

/// A running callback listener
pub struct CallbackServer {
    port: u16,
    redirect_uri: Url,
    code_rx: oneshot::Receiver<String>,
    error_rx: oneshot::Receiver<LoginError>,
    outcome_tx: Option<oneshot::Sender<Outcome>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Bind the first free port of `candidates`, tried in random order
///
/// # Errors
///
/// Returns [`LoginError::NoListener`] if none of the ports can be bound.
pub async fn bind_first(candidates: &[u16]) -> Result<(TcpListener, u16), LoginError> {
    let mut ports = candidates.to_vec();
    ports.shuffle(&mut rand::rng());

    for port in ports {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
            Ok(listener) => {
                let bound = listener.local_addr().map_or(port, |addr| addr.port());
                return Ok((listener, bound));
            }
            Err(e) => debug!(port, error = %e, "Callback port unavailable"),
        }
    }
    Err(LoginError::NoListener(candidates.to_vec()))
}

impl CallbackServer {
    /// Start listening on one of `candidates`
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::NoListener`] if no candidate port is free.
    pub async fn start(
        candidates: &[u16],
        expected_state: String,
        pages: Pages,
        outcome_timeout: Duration,
    ) -> Result<Self, LoginError> {
        let (listener, port) = bind_first(candidates).await?;
        let redirect_uri = Url::parse(&format!("http://{}:{port}{CALLBACK_PATH}", Ipv4Addr::LOCALHOST))
            .map_err(|e| LoginError::Exchange(format!("invalid callback URL: {e}")))?;

        let (code_tx, code_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let state = Arc::new(Mutex::new(HandlerState {
            expected_state,
            code_tx: Some(code_tx),
            error_tx: Some(error_tx),
            outcome_rx: Some(outcome_rx),
            pages,
            outcome_timeout,
        }));

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                warn!(error = %e, "Callback server error");
            }
        });

        info!(url = %redirect_uri, "Login callback server listening");

        Ok(Self {
            port,
            redirect_uri,
            code_rx,
            error_rx,
            outcome_tx: Some(outcome_tx),
            shutdown,
            task: Some(task),
        })
    }

    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `redirect_uri` to register with the authorization request
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Wait for the authorization code
    ///
    /// # Errors
    ///
    /// Returns the error reported by the callback handler, or
    /// [`LoginError::Cancelled`] if `cancel` fires first.
    pub async fn wait_for_code(&mut self, cancel: &CancellationToken) -> Result<String, LoginError> {
        tokio::select! {
            Ok(code) = &mut self.code_rx => Ok(code),
            Ok(error) = &mut self.error_rx => Err(error),
            () = cancel.cancelled() => Err(LoginError::Cancelled),
            else => Err(LoginError::Cancelled),
        }
    }

    /// Tell the waiting browser request how the exchange went
    pub fn report(&mut self, outcome: Outcome) {
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Stop the server and release the port
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        debug!(port = self.port, "Login callback server closed");
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Handle the provider's redirect
async fn handle_callback(
    State(state): State<Arc<Mutex<HandlerState>>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!(has_code = params.code.is_some(), error = ?params.error, "Received login callback");

    let (outcome_rx, pages, timeout) = {
        let mut state = state.lock().await;
        if state.error_tx.is_none() && state.code_tx.is_none() {
            return state.pages.error("already_handled", "This login attempt has already completed.");
        }

        // State binds both codes and errors to this attempt
        let received = params.state.unwrap_or_default();
        if !state_matches(&state.expected_state, &received) {
            warn!("Login callback state mismatch");
            state.fail(LoginError::StateMismatch);
            return state
                .pages
                .error("state_mismatch", "The login request could not be verified. Please try again.");
        }

        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            let response = state.pages.error(&error, &description);
            state.fail(LoginError::Provider { error, description });
            return response;
        }

        let Some(code) = params.code else {
            state.fail(LoginError::MissingCode);
            return state
                .pages
                .error("missing_code", "No authorization code was provided.");
        };

        state.error_tx = None;
        if let Some(tx) = state.code_tx.take() {
            let _ = tx.send(code);
        }
        (state.outcome_rx.take(), state.pages.clone(), state.outcome_timeout)
    };

    // Lock released: the flow is free to report while we wait
    let Some(outcome_rx) = outcome_rx else {
        return pages.error("already_handled", "This login attempt has already completed.");
    };
    match tokio::time::timeout(timeout, outcome_rx).await {
        Ok(Ok(Outcome::Success)) => pages.success(),
        Ok(Ok(Outcome::Failure(reason))) => pages.error("exchange_failed", &reason),
        Ok(Err(_)) => pages.error("aborted", "The login was aborted."),
        Err(_) => pages.error("timeout", "The login did not complete in time."),
    }
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Login Successful</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
        }
        .container { text-align: center; padding: 2rem; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Login Successful</h1>
        <p>You can close this window and return to your terminal.</p>
    </div>
    <script>setTimeout(() => window.close(), 3000);</script>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    let error = html_escape(error);
    let description = html_escape(description);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Login Failed</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
        }}
        .container {{ text-align: center; padding: 2rem; max-width: 400px; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Login Failed</h1>
        <p>{description}</p>
        <p class="error-code">Error: {error}</p>
    </div>
</body>
</html>"#
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
