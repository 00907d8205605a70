//! Interactive login against the identity provider
//!
//! - [`pkce`]: verifier, challenge and CSRF state
//! - [`callback`]: loopback listener receiving the provider redirect
//! - [`client`]: token exchange, refresh and revocation
//! - [`flow`]: the login state machine
//! - [`store`]: persisted [`store::AuthContext`]

pub mod callback;
pub mod client;
pub mod flow;
pub mod pkce;
pub mod store;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

pub use client::OAuthClient;
pub use flow::{LoginFlow, LoginState, present_in_browser};
pub use store::{AuthContext, AuthStore, Project};

use crate::Result;

/// Return a usable auth context, refreshing an expired one
///
/// Returns `Ok(None)` when nobody is logged in. A refreshed context is
/// written back to `store`.
///
/// # Errors
///
/// Returns an error if the access token expired and cannot be refreshed.
pub async fn current_context(client: &OAuthClient, store: &AuthStore) -> Result<Option<AuthContext>> {
    let Some(context) = store.load() else {
        return Ok(None);
    };
    if !context.is_expired() {
        return Ok(Some(context));
    }

    info!("Access token expired, refreshing");
    let refreshed = client.refresh(&context).await?;
    store.save(&refreshed)?;
    Ok(Some(refreshed))
}

/// Return a usable auth context, logging in interactively when needed
///
/// Runs `flow` when nobody is logged in or the stored context expired and
/// cannot be refreshed. The new context is written to `store`.
///
/// # Errors
///
/// Returns an error if the interactive login fails or its result cannot be
/// saved.
pub async fn ensure_context<F>(
    flow: &mut LoginFlow,
    store: &AuthStore,
    cancel: &CancellationToken,
    present: F,
) -> Result<AuthContext>
where
    F: FnOnce(&Url),
{
    match current_context(flow.client(), store).await {
        Ok(Some(context)) => return Ok(context),
        Ok(None) => info!("Not logged in, starting interactive login"),
        Err(e) => warn!(error = %e, "Stored login cannot be refreshed, logging in again"),
    }

    let context = flow.run(cancel, present).await?;
    store.save(&context)?;
    Ok(context)
}

/// Revoke the stored tokens and forget them
///
/// Revocation is best effort; the local context is removed regardless.
///
/// # Errors
///
/// Returns an error only if the stored context cannot be deleted.
pub async fn logout(client: &OAuthClient, store: &AuthStore) -> Result<()> {
    let Some(context) = store.load() else {
        info!("Not logged in");
        return Ok(());
    };

    let tokens = context
        .refresh_token
        .iter()
        .chain(std::iter::once(&context.access_token));
    for token in tokens {
        if let Err(e) = client.revoke(token).await {
            warn!(error = %e, "Unable to revoke token");
        }
    }

    store.delete()
}
