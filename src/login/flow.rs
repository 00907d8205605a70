//! Interactive OAuth2 Authorization Code + PKCE login
//!
//! ```text
//! Idle → AwaitingCallback → Exchanging → Done
//!              │                 │
//!              └─────────────────┴──────→ Failed
//! ```
//!
//! The callback listener is closed on every exit path.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use super::callback::{CallbackServer, Outcome, Pages};
use super::client::{HttpProjectResolver, OAuthClient, ProjectResolver};
use super::pkce::{Pkce, generate_state};
use super::store::AuthContext;
use crate::{LoginError, Result};
use crate::config::LoginConfig;

/// Where a login attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Not started
    Idle,
    /// Listener bound, waiting for the browser
    AwaitingCallback,
    /// Code received, exchanging it for tokens
    Exchanging,
    /// Tokens obtained
    Done,
    /// Aborted with an error
    Failed,
}

/// Print the authorization URL and try to open it in the browser
pub fn present_in_browser(url: &Url) {
    eprintln!(
        "A browser should have opened for you to complete your login. If no browser opened, open the following URL:\n\n{url}\n"
    );
    if let Err(e) = open::that(url.as_str()) {
        warn!(error = %e, "Unable to open the browser");
    }
}

/// One interactive login attempt
pub struct LoginFlow {
    client: OAuthClient,
    projects: Arc<dyn ProjectResolver>,
    scopes: Vec<String>,
    callback_ports: Vec<u16>,
    pages: Pages,
    outcome_timeout: Duration,
    state: LoginState,
}

impl LoginFlow {
    /// Create a flow from the login configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if endpoints or client id are missing.
    pub fn new(config: &LoginConfig, http_client: Client) -> Result<Self> {
        let client = OAuthClient::new(http_client.clone(), config.endpoints()?, config.client_id()?);
        let projects = Arc::new(HttpProjectResolver::new(
            http_client,
            config.project_endpoint.clone(),
        ));
        Ok(Self::with_parts(client, projects, config))
    }

    /// Create a flow from explicit collaborators
    #[must_use]
    pub fn with_parts(
        client: OAuthClient,
        projects: Arc<dyn ProjectResolver>,
        config: &LoginConfig,
    ) -> Self {
        Self {
            client,
            projects,
            scopes: config.scopes.clone(),
            callback_ports: config.callback_ports.clone(),
            pages: Pages {
                success_url: config.success_url.clone(),
                error_url: config.error_url.clone(),
            },
            outcome_timeout: config.outcome_timeout,
            state: LoginState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LoginState {
        self.state
    }

    /// The OAuth2 client used for the exchange
    #[must_use]
    pub fn client(&self) -> &OAuthClient {
        &self.client
    }

    /// Run the login
    ///
    /// `present` receives the authorization URL once the listener is ready;
    /// [`present_in_browser`] is the interactive choice. `cancel` aborts the
    /// wait for the browser.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::LoginError`] describing why the login failed.
    pub async fn run<F>(&mut self, cancel: &CancellationToken, present: F) -> Result<AuthContext>
    where
        F: FnOnce(&Url),
    {
        let csrf_state = generate_state();
        let pkce = Pkce::generate();

        let mut server = match CallbackServer::start(
            &self.callback_ports,
            csrf_state.clone(),
            self.pages.clone(),
            self.outcome_timeout,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                self.state = LoginState::Failed;
                return Err(e.into());
            }
        };

        let result = self
            .drive(&mut server, &csrf_state, &pkce, cancel, present)
            .await;
        server.close().await;

        self.state = if result.is_ok() {
            LoginState::Done
        } else {
            LoginState::Failed
        };
        result
    }

    async fn drive<F>(
        &mut self,
        server: &mut CallbackServer,
        csrf_state: &str,
        pkce: &Pkce,
        cancel: &CancellationToken,
        present: F,
    ) -> Result<AuthContext>
    where
        F: FnOnce(&Url),
    {
        let redirect_uri = server.redirect_uri().clone();
        let authorization_url =
            self.client
                .authorization_url(&redirect_uri, csrf_state, &pkce.challenge, &self.scopes);

        self.state = LoginState::AwaitingCallback;
        present(&authorization_url);

        let code = server.wait_for_code(cancel).await?;

        self.state = LoginState::Exchanging;
        let exchange = self.client.exchange_code(&code, &redirect_uri, &pkce.verifier);
        let tokens = match tokio::select! {
            result = exchange => result,
            () = cancel.cancelled() => Err(LoginError::Cancelled.into()),
        } {
            Ok(tokens) => tokens,
            Err(e) => {
                server.report(Outcome::Failure(e.to_string()));
                return Err(e);
            }
        };
        server.report(Outcome::Success);

        let lookup = self.projects.active_project(&tokens.access_token);
        let project = tokio::select! {
            result = lookup => result.unwrap_or_else(|e| {
                warn!(error = %e, "Unable to fetch the active project");
                None
            }),
            () = cancel.cancelled() => return Err(LoginError::Cancelled.into()),
        };

        info!(project = ?project.as_ref().map(|p| p.id.as_str()), "Login completed");
        Ok(AuthContext {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: AuthContext::expiry_from(tokens.expires_in),
            project,
        })
    }
}
