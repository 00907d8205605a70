//! Proxy server: middleware stack, listener and graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderValue, header},
    middleware,
    response::Response,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::forward::{ProxyState, forward};
use super::route::Routing;
use crate::bridge::{TokenBridge, token_bridge};
use crate::config::Config;
use crate::cors::CorsPolicy;
use crate::credentials::{ApiKeySource, TemporaryApiKey, remove_best_effort};
use crate::session::{HttpSessionResolver, SessionResolver};
use crate::signer::Signer;
use crate::{Error, Result};

/// Clear HSTS so browsers never pin `localhost` to HTTPS
async fn suppress_hsts(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=0;"),
    );
    response
}

/// Assemble the proxy router
///
/// Layers, outermost first: HSTS suppression, request id and tracing, CORS,
/// token bridge, then the dispatch handler.
///
/// # Errors
///
/// Returns [`Error::Config`] if the CORS configuration is invalid.
pub fn build_router(
    config: &Config,
    bridge: Arc<TokenBridge>,
    state: Arc<ProxyState>,
) -> Result<Router> {
    let cors = CorsPolicy::from_config(&config.proxy)?.layer();

    Ok(Router::new()
        .fallback(forward)
        .with_state(state)
        .layer(middleware::from_fn_with_state(bridge, token_bridge))
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new())
        .layer(middleware::map_response(suppress_hsts)))
}

/// The reverse proxy
pub struct ProxyServer {
    config: Config,
    signer: Option<Arc<Signer>>,
    resolver: Arc<dyn SessionResolver>,
    api_keys: Arc<dyn ApiKeySource>,
}

impl ProxyServer {
    /// Create the server, generating the signing key unless minting is off
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the signing key
    /// cannot be generated. Both are fatal: the proxy must not start.
    pub fn new(config: Config, api_keys: Arc<dyn ApiKeySource>) -> Result<Self> {
        config.proxy.validate()?;
        let resolver = Arc::new(HttpSessionResolver::new(
            config.proxy.provider()?,
            &config.session_check,
        )?);
        Self::with_resolver(config, resolver, api_keys)
    }

    /// Create the server with an explicit session resolver
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_resolver(
        config: Config,
        resolver: Arc<dyn SessionResolver>,
        api_keys: Arc<dyn ApiKeySource>,
    ) -> Result<Self> {
        config.proxy.validate()?;
        let signer = if config.proxy.skip_token_minting || config.proxy.tunnel {
            info!("Token minting disabled");
            None
        } else {
            Some(Arc::new(Signer::generate()?))
        };

        Ok(Self {
            config,
            signer,
            resolver,
            api_keys,
        })
    }

    /// The signer, if tokens are minted
    #[must_use]
    pub fn signer(&self) -> Option<&Arc<Signer>> {
        self.signer.as_ref()
    }

    /// Build the router for one run
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration cannot be turned into a
    /// router.
    pub fn router(&self, api_key: Option<&str>) -> Result<Router> {
        let proxy = &self.config.proxy;
        let routing = Routing::new(proxy.path_prefix.clone(), proxy.tunnel);
        let bridge = Arc::new(TokenBridge::new(
            self.signer.clone(),
            Arc::clone(&self.resolver),
            routing,
            proxy.provider()?.as_str(),
        ));
        let state = Arc::new(ProxyState::new(proxy, api_key)?);
        build_router(&self.config, bridge, state)
    }

    fn banner(&self) -> Result<()> {
        let public = self.config.proxy.public_url()?;
        if self.config.proxy.tunnel {
            eprintln!(
                "To access the identity provider's APIs, use URL\n\n\t{public}\n\nand configure your SDKs to point to it, with credentials included.\n"
            );
        } else {
            eprintln!("To access your application via the session proxy, open:\n\n\t{public}\n");
        }

        if self.config.proxy.open {
            if let Err(e) = open::that(public.as_str()) {
                warn!(error = %e, "Unable to open the browser, please open the URL manually");
            }
        }
        Ok(())
    }

    /// Run until a termination signal arrives or `shutdown` is cancelled
    ///
    /// In-flight requests get `shutdown_timeout` to finish. A temporary API
    /// key created for this run is removed afterwards, best effort.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key cannot be obtained, the listener
    /// cannot be bound, or the server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let api_key = self.api_keys.obtain("session-proxy temporary API key").await?;
        let result = self.serve(api_key.as_ref(), shutdown).await;

        if let Some(key) = &api_key {
            remove_best_effort(self.api_keys.as_ref(), key).await;
        }
        result
    }

    async fn serve(&self, api_key: Option<&TemporaryApiKey>, shutdown: CancellationToken) -> Result<()> {
        let app = self.router(api_key.map(|k| k.secret.as_str()))?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.proxy.port));
        let listener = TcpListener::bind(addr).await?;

        info!(
            addr = %addr,
            upstream = ?self.config.proxy.upstream.as_ref().map(url::Url::as_str),
            provider = %self.config.proxy.provider()?,
            tunnel = self.config.proxy.tunnel,
            "Session proxy listening"
        );
        self.banner()?;

        serve_until(listener, app, shutdown, self.config.proxy.shutdown_timeout).await
    }
}

/// Serve `app` until `shutdown` is cancelled or a signal arrives, then give
/// in-flight requests up to `grace` to complete
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_until(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let draining = CancellationToken::new();
    let drain_signal = draining.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { drain_signal.cancelled().await })
            .await
    });

    tokio::select! {
        () = shutdown_signal() => {},
        () = shutdown.cancelled() => {},
        finished = &mut server => {
            return finished
                .map_err(|e| Error::Internal(e.to_string()))?
                .map_err(Error::Io);
        }
    }

    info!(grace = ?grace, "Shutting down, draining in-flight requests");
    draining.cancel();

    if let Ok(finished) = tokio::time::timeout(grace, &mut server).await {
        finished
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(Error::Io)
    } else {
        warn!("In-flight requests did not finish in time, closing");
        server.abort();
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
