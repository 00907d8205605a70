//! Temporary API credentials used by the proxy to talk to the provider
//!
//! The provider honours `Ory-Base-URL-Rewrite` only when accompanied by an
//! API key. A key is obtained before the server starts and, if it was created
//! for this run, removed again after shutdown.

use std::env;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use crate::login::store::AuthContext;
use crate::{Error, Result};

/// Environment variable holding a pre-provisioned API key
pub const API_KEY_ENV: &str = "SESSION_PROXY_API_KEY";

/// An API key valid for the lifetime of one proxy run
#[derive(Clone, PartialEq, Eq)]
pub struct TemporaryApiKey {
    /// Provider-side id, needed to remove the key
    pub id: Option<String>,
    /// The secret sent to the provider
    pub secret: String,
    /// Whether this run created the key and must remove it
    pub owned: bool,
}

impl std::fmt::Debug for TemporaryApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryApiKey")
            .field("id", &self.id)
            .field("secret", &"***")
            .field("owned", &self.owned)
            .finish()
    }
}

/// Source of temporary API keys
#[async_trait]
pub trait ApiKeySource: Send + Sync {
    /// Obtain a key named `name`, or `None` if none is available
    async fn obtain(&self, name: &str) -> Result<Option<TemporaryApiKey>>;

    /// Remove a key obtained from this source
    async fn remove(&self, key: &TemporaryApiKey) -> Result<()>;
}

/// Remove `key` if this run owns it; failures are reported, never retried
pub async fn remove_best_effort(source: &dyn ApiKeySource, key: &TemporaryApiKey) {
    if !key.owned {
        return;
    }
    match source.remove(key).await {
        Ok(()) => info!(id = ?key.id, "Removed temporary API key"),
        Err(e) => warn!(
            id = ?key.id,
            error = %e,
            "Unable to remove temporary API key, please remove it manually"
        ),
    }
}

/// Key taken from [`API_KEY_ENV`]; never removed
#[derive(Debug, Clone, Default)]
pub struct EnvApiKeySource;

#[async_trait]
impl ApiKeySource for EnvApiKeySource {
    async fn obtain(&self, _name: &str) -> Result<Option<TemporaryApiKey>> {
        Ok(env::var(API_KEY_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(|secret| TemporaryApiKey {
                id: None,
                secret,
                owned: false,
            }))
    }

    async fn remove(&self, _key: &TemporaryApiKey) -> Result<()> {
        Ok(())
    }
}

/// Prefers [`API_KEY_ENV`], otherwise creates a key through the provider's
/// project API using the stored login
pub struct ProjectApiKeySource {
    client: reqwest::Client,
    endpoint: Option<Url>,
    context: Option<AuthContext>,
}

#[derive(Debug, Deserialize)]
struct CreatedKey {
    id: String,
    value: String,
}

impl ProjectApiKeySource {
    /// Create a source
    ///
    /// `endpoint_template` is the key collection URL; `{project}` is replaced
    /// with the selected project's id.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        endpoint_template: Option<&str>,
        context: Option<AuthContext>,
    ) -> Self {
        let endpoint = match (endpoint_template, context.as_ref().and_then(|c| c.project.as_ref())) {
            (Some(template), Some(project)) => Url::parse(&template.replace("{project}", &project.id))
                .map_err(|e| warn!(error = %e, "Invalid API key endpoint"))
                .ok(),
            _ => None,
        };
        Self {
            client,
            endpoint,
            context,
        }
    }

    fn access_token(&self) -> Result<&str> {
        self.context
            .as_ref()
            .map(|c| c.access_token.as_str())
            .ok_or_else(|| Error::Config("not logged in".to_string()))
    }
}

#[async_trait]
impl ApiKeySource for ProjectApiKeySource {
    async fn obtain(&self, name: &str) -> Result<Option<TemporaryApiKey>> {
        if let Some(key) = EnvApiKeySource.obtain(name).await? {
            return Ok(Some(key));
        }
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };

        let response = self
            .client
            .post(endpoint.clone())
            .bearer_auth(self.access_token()?)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "unable to create API key: provider returned {}",
                response.status()
            )));
        }

        let created: CreatedKey = response.json().await?;
        info!(id = %created.id, "Created temporary API key");
        Ok(Some(TemporaryApiKey {
            id: Some(created.id),
            secret: created.value,
            owned: true,
        }))
    }

    async fn remove(&self, key: &TemporaryApiKey) -> Result<()> {
        let (Some(endpoint), Some(id)) = (&self.endpoint, &key.id) else {
            return Ok(());
        };
        let url = crate::config::join_path(endpoint, id)?;

        let response = self
            .client
            .delete(url)
            .bearer_auth(self.access_token()?)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Upstream(format!(
                "provider returned {} while removing API key",
                response.status()
            )))
        }
    }
}
