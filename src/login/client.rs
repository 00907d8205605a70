//! OAuth2 public client: code exchange, refresh and revocation

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::store::{AuthContext, Project};
use crate::config::OAuthEndpoints;
use crate::{Error, LoginError, Result};

/// OAuth2 token response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type (usually "bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token, granted with `offline_access`
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth2 client without a secret; PKCE stands in for it
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http_client: Client,
    endpoints: OAuthEndpoints,
    client_id: String,
}

impl OAuthClient {
    /// Create a client
    #[must_use]
    pub fn new(http_client: Client, endpoints: OAuthEndpoints, client_id: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoints,
            client_id: client_id.into(),
        }
    }

    /// Client id
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Resolved endpoints
    #[must_use]
    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Build the authorization URL the user is sent to
    #[must_use]
    pub fn authorization_url(
        &self,
        redirect_uri: &Url,
        state: &str,
        code_challenge: &str,
        scopes: &[String],
    ) -> Url {
        let mut url = self.endpoints.authorization.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", super::pkce::CHALLENGE_METHOD)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("prompt", "login consent");
        url
    }

    async fn token_request(&self, params: &HashMap<&str, &str>) -> Result<TokenResponse> {
        let response = self
            .http_client
            .post(self.endpoints.token.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| LoginError::Exchange(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LoginError::Exchange(format!("HTTP {status} - {body}")).into());
        }

        Ok(response
            .json()
            .await
            .map_err(|e| LoginError::Exchange(format!("unable to parse token response: {e}")))?)
    }

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::Exchange`] if the provider rejects the code.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &Url,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri.as_str());
        params.insert("client_id", self.client_id.as_str());
        params.insert("code_verifier", code_verifier);

        let tokens = self.token_request(&params).await?;
        info!("Authorization code exchanged");
        Ok(tokens)
    }

    /// Refresh an expired auth context, keeping its project
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the context has no refresh token, or
    /// [`LoginError::Exchange`] if the provider rejects it.
    pub async fn refresh(&self, context: &AuthContext) -> Result<AuthContext> {
        let refresh_token = context
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Config("no refresh token stored, please log in again".to_string()))?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", self.client_id.as_str());

        let tokens = self.token_request(&params).await?;
        info!("Access token refreshed");
        Ok(AuthContext {
            access_token: tokens.access_token,
            // Providers may rotate or keep the refresh token
            refresh_token: tokens.refresh_token.or_else(|| context.refresh_token.clone()),
            expires_at: AuthContext::expiry_from(tokens.expires_in),
            project: context.project.clone(),
        })
    }

    /// Revoke a token (RFC 7009)
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be reached or rejects the
    /// request.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("token", token);
        params.insert("client_id", self.client_id.as_str());

        let response = self
            .http_client
            .post(self.endpoints.revoke.clone())
            .form(&params)
            .send()
            .await?;

        if response.status().is_success() {
            debug!("Token revoked");
            Ok(())
        } else {
            Err(Error::Upstream(format!(
                "token revocation failed: HTTP {}",
                response.status()
            )))
        }
    }
}

/// Resolves the caller's active project once logged in
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// Fetch the active project for `access_token`
    async fn active_project(&self, access_token: &str) -> Result<Option<Project>>;
}

/// Fetches the active project from an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpProjectResolver {
    http_client: Client,
    endpoint: Option<Url>,
}

impl HttpProjectResolver {
    /// Create a resolver; without an endpoint no project is selected
    #[must_use]
    pub fn new(http_client: Client, endpoint: Option<Url>) -> Self {
        Self {
            http_client,
            endpoint,
        }
    }
}

#[async_trait]
impl ProjectResolver for HttpProjectResolver {
    async fn active_project(&self, access_token: &str) -> Result<Option<Project>> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };

        let response = self
            .http_client
            .get(endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "unable to fetch active project: HTTP {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Form, Json, Router, routing::post};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    fn endpoints(base: &str) -> OAuthEndpoints {
        OAuthEndpoints {
            authorization: Url::parse(&format!("{base}/oauth2/auth")).unwrap(),
            token: Url::parse(&format!("{base}/oauth2/token")).unwrap(),
            revoke: Url::parse(&format!("{base}/oauth2/revoke")).unwrap(),
        }
    }

    #[test]
    fn authorization_url_carries_pkce_and_prompt() {
        let client = OAuthClient::new(Client::new(), endpoints("https://auth.example.com"), "cli");
        let redirect = Url::parse("http://localhost:4446/callback").unwrap();
        let url = client.authorization_url(
            &redirect,
            "st",
            "ch",
            &["openid".to_string(), "offline_access".to_string()],
        );

        let query: HashMap<String, String> =
            serde_urlencoded::from_str(url.query().unwrap()).unwrap();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "cli");
        assert_eq!(query["redirect_uri"], "http://localhost:4446/callback");
        assert_eq!(query["state"], "st");
        assert_eq!(query["code_challenge"], "ch");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["scope"], "openid offline_access");
        assert_eq!(query["prompt"], "login consent");
    }

    #[tokio::test]
    async fn exchange_sends_verifier_without_secret() {
        // GIVEN: a token endpoint recording the form it receives
        let seen: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let s = Arc::clone(&seen);
        let app = Router::new().route(
            "/oauth2/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let s = Arc::clone(&s);
                async move {
                    *s.lock() = form;
                    Json(json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600}))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        // WHEN: a code is exchanged
        let client = OAuthClient::new(Client::new(), endpoints(&format!("http://{addr}")), "cli");
        let redirect = Url::parse("http://localhost:4446/callback").unwrap();
        let tokens = client.exchange_code("the-code", &redirect, "the-verifier").await.unwrap();

        // THEN: PKCE replaces the client secret
        assert_eq!(tokens.access_token, "at");
        let form = seen.lock().clone();
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code_verifier"], "the-verifier");
        assert!(!form.contains_key("client_secret"));
    }

    #[tokio::test]
    async fn rejected_exchange_is_a_login_error() {
        let app = Router::new().route(
            "/oauth2/token",
            post(|| async { (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = OAuthClient::new(Client::new(), endpoints(&format!("http://{addr}")), "cli");
        let redirect = Url::parse("http://localhost:4446/callback").unwrap();
        let result = client.exchange_code("bad", &redirect, "v").await;

        assert!(matches!(result, Err(Error::Login(LoginError::Exchange(_)))));
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_and_project() {
        let app = Router::new().route(
            "/oauth2/token",
            post(|| async { Json(json!({"access_token": "new", "expires_in": 60})) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = OAuthClient::new(Client::new(), endpoints(&format!("http://{addr}")), "cli");
        let old = AuthContext {
            access_token: "old".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(0),
            project: Some(Project {
                id: "p".to_string(),
                slug: None,
                name: None,
            }),
        };

        let refreshed = client.refresh(&old).await.unwrap();
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("rt"));
        assert_eq!(refreshed.project, old.project);
    }

    #[tokio::test]
    async fn refresh_without_token_fails() {
        let client = OAuthClient::new(Client::new(), endpoints("http://127.0.0.1:9"), "cli");
        let ctx = AuthContext {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: None,
            project: None,
        };
        assert!(matches!(client.refresh(&ctx).await, Err(Error::Config(_))));
    }
}
