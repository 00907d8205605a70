//! Session Proxy - reverse proxy bridging provider sessions into signed tokens

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use session_proxy::{
    cli::{Cli, Command},
    config::Config,
    credentials::{API_KEY_ENV, ProjectApiKeySource},
    login::{self, AuthStore, LoginFlow, OAuthClient},
    proxy::ProxyServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("unable to load configuration")?;
    let http_client = reqwest::Client::builder()
        .timeout(config.login.request_timeout)
        .build()
        .context("unable to build HTTP client")?;

    match cli.command {
        Command::Proxy(args) => {
            args.apply(&mut config);
            serve(config, http_client).await
        }
        Command::Tunnel(args) => {
            args.apply(&mut config);
            serve(config, http_client).await
        }
        Command::Login(args) => {
            args.apply(&mut config);
            run_login(&config, http_client, args.no_browser).await
        }
        Command::Logout => {
            let client = oauth_client(&config, http_client)?;
            let store = AuthStore::new(&config.login.store_dir()?);
            login::logout(&client, &store).await?;
            eprintln!("You are now logged out.");
            Ok(())
        }
    }
}

fn oauth_client(config: &Config, http_client: reqwest::Client) -> anyhow::Result<OAuthClient> {
    Ok(OAuthClient::new(
        http_client,
        config.login.endpoints()?,
        config.login.client_id()?,
    ))
}

/// Cancelled on Ctrl+C, so a login in progress can be abandoned
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });
    cancel
}

fn present(no_browser: bool) -> impl FnOnce(&Url) {
    move |url| {
        if no_browser {
            eprintln!("Open the following URL to complete your login:\n\n{url}\n");
        } else {
            login::present_in_browser(url);
        }
    }
}

async fn run_login(
    config: &Config,
    http_client: reqwest::Client,
    no_browser: bool,
) -> anyhow::Result<()> {
    let store = AuthStore::new(&config.login.store_dir()?);
    let mut flow = LoginFlow::new(&config.login, http_client)?;

    let context = flow
        .run(&ctrl_c_token(), present(no_browser))
        .await
        .context("login failed")?;
    store.save(&context)?;

    match &context.project {
        Some(project) => eprintln!(
            "You are now logged in. Active project: {}",
            project.name.as_deref().unwrap_or(&project.id)
        ),
        None => eprintln!("You are now logged in."),
    }
    Ok(())
}

async fn serve(config: Config, http_client: reqwest::Client) -> anyhow::Result<()> {
    // Creating a temporary API key needs a login, unless one is given
    let needs_login = config.login.api_keys_endpoint.is_some()
        && env::var(API_KEY_ENV).map_or(true, |key| key.is_empty());
    let auth = if needs_login {
        let store = AuthStore::new(&config.login.store_dir()?);
        let mut flow = LoginFlow::new(&config.login, http_client.clone())?;
        let context = login::ensure_context(&mut flow, &store, &ctrl_c_token(), present(false))
            .await
            .context("login required to create a temporary API key failed")?;
        Some(context)
    } else {
        None
    };

    let api_keys = Arc::new(ProjectApiKeySource::new(
        http_client,
        config.login.api_keys_endpoint.as_deref(),
        auth,
    ));

    let server = ProxyServer::new(config, api_keys).context("unable to start the proxy")?;
    server.run(CancellationToken::new()).await?;
    info!("Session proxy stopped");
    Ok(())
}
