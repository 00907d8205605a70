//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::config::{Config, ProxyConfig};

/// Reverse proxy bridging identity provider sessions into signed tokens
#[derive(Parser, Debug)]
#[command(name = "session-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SESSION_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SESSION_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SESSION_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a reverse proxy in front of your application
    Proxy(ProxyArgs),

    /// Expose the identity provider's APIs on a local URL, without an application
    Tunnel(TunnelArgs),

    /// Log in interactively and store the tokens
    Login(LoginArgs),

    /// Revoke and forget the stored tokens
    Logout,
}

/// Flags shared by `proxy` and `tunnel`
#[derive(Args, Debug, Default)]
pub struct CommonArgs {
    /// Port to listen on (defaults to `PORT`, then 4000)
    #[arg(long)]
    pub port: Option<u16>,

    /// Identity provider base URL
    #[arg(long, env = "SESSION_PROXY_PROVIDER_URL")]
    pub provider_url: Option<Url>,

    /// Domain written into every `Set-Cookie`
    #[arg(long)]
    pub cookie_domain: Option<String>,

    /// Allowed CORS origins; `*` wildcards are supported
    #[arg(long = "allowed-cors-origins", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Allow any CORS origin
    #[arg(long)]
    pub dev: bool,

    /// Log every CORS decision
    #[arg(long)]
    pub debug: bool,

    /// Open the public URL in the browser once listening
    #[arg(long)]
    pub open: bool,
}

/// `proxy` arguments
#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// URL of your application
    pub application_url: Url,

    /// Public URL the proxy is reachable at
    pub publish_url: Option<Url>,

    /// Where the provider's welcome page redirect is sent instead
    #[arg(long)]
    pub default_redirect_url: Option<Url>,

    /// Do not mint bearer tokens from sessions
    #[arg(long = "no-jwt")]
    pub skip_token_minting: bool,

    /// Rewrite the Host header to the application's host
    #[arg(long)]
    pub rewrite_host: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// `tunnel` arguments
#[derive(Args, Debug)]
pub struct TunnelArgs {
    /// URL of your application; allowed as CORS origin and used as redirect target
    pub application_url: Url,

    /// Public URL the tunnel is reachable at
    pub tunnel_url: Option<Url>,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// `login` arguments
#[derive(Args, Debug, Default)]
pub struct LoginArgs {
    /// OAuth2 issuer URL
    #[arg(long, env = "SESSION_PROXY_ISSUER_URL")]
    pub issuer_url: Option<Url>,

    /// OAuth2 client id
    #[arg(long, env = "SESSION_PROXY_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Print the authorization URL without opening a browser
    #[arg(long)]
    pub no_browser: bool,
}

impl CommonArgs {
    fn apply(&self, proxy: &mut ProxyConfig) {
        if let Some(port) = self.port {
            proxy.port = port;
        }
        if let Some(url) = &self.provider_url {
            proxy.provider_url = Some(url.clone());
        }
        if let Some(domain) = &self.cookie_domain {
            proxy.cookie_domain = Some(domain.clone());
        }
        proxy.cors_origins.extend(self.cors_origins.iter().cloned());
        proxy.dev |= self.dev;
        proxy.debug |= self.debug;
        proxy.open |= self.open;
    }
}

impl ProxyArgs {
    /// Override `config` with the flags given
    pub fn apply(&self, config: &mut Config) {
        let proxy = &mut config.proxy;
        self.common.apply(proxy);
        proxy.tunnel = false;
        proxy.upstream = Some(self.application_url.clone());
        if let Some(url) = &self.publish_url {
            proxy.public_url = Some(url.clone());
        }
        if let Some(url) = &self.default_redirect_url {
            proxy.default_redirect_url = Some(url.clone());
        }
        proxy.skip_token_minting |= self.skip_token_minting;
        proxy.rewrite_host |= self.rewrite_host;
    }
}

impl TunnelArgs {
    /// Override `config` with the flags given
    ///
    /// A tunnel has no application upstream, reserves no path prefix and
    /// never mints tokens. The application is trusted as a CORS origin.
    pub fn apply(&self, config: &mut Config) {
        let proxy = &mut config.proxy;
        self.common.apply(proxy);
        proxy.tunnel = true;
        proxy.upstream = None;
        proxy.path_prefix = String::new();
        proxy.skip_token_minting = true;
        if let Some(url) = &self.tunnel_url {
            proxy.public_url = Some(url.clone());
        }
        if proxy.default_redirect_url.is_none() {
            proxy.default_redirect_url = Some(self.application_url.clone());
        }
        let origin = self.application_url.origin().ascii_serialization();
        if !proxy.cors_origins.contains(&origin) {
            proxy.cors_origins.push(origin);
        }
    }
}

impl LoginArgs {
    /// Override `config` with the flags given
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.issuer_url {
            config.login.issuer_url = Some(url.clone());
        }
        if let Some(id) = &self.client_id {
            config.login.client_id = Some(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn proxy_arguments_override_config() {
        let cli = parse(&[
            "session-proxy",
            "proxy",
            "http://localhost:3000",
            "https://auth.example.com",
            "--port",
            "4455",
            "--provider-url",
            "https://project.example.com",
            "--allowed-cors-origins",
            "https://a.example.com,https://*.b.example.com",
            "--no-jwt",
        ]);
        let Command::Proxy(args) = cli.command else {
            panic!("expected proxy command");
        };

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.proxy.port, 4455);
        assert_eq!(config.proxy.upstream.unwrap().as_str(), "http://localhost:3000/");
        assert_eq!(config.proxy.public_url.unwrap().as_str(), "https://auth.example.com/");
        assert_eq!(config.proxy.cors_origins.len(), 2);
        assert!(config.proxy.skip_token_minting);
        assert_eq!(config.proxy.path_prefix, "/.ory");
    }

    #[test]
    fn tunnel_has_no_prefix_and_trusts_the_application() {
        let cli = parse(&[
            "session-proxy",
            "tunnel",
            "http://localhost:3000/app",
            "--provider-url",
            "https://project.example.com",
        ]);
        let Command::Tunnel(args) = cli.command else {
            panic!("expected tunnel command");
        };

        let mut config = Config::default();
        args.apply(&mut config);

        assert!(config.proxy.tunnel);
        assert!(config.proxy.upstream.is_none());
        assert_eq!(config.proxy.path_prefix, "");
        assert!(config.proxy.skip_token_minting);
        assert_eq!(config.proxy.cors_origins, vec!["http://localhost:3000".to_string()]);
        assert_eq!(
            config.proxy.default_redirect_url().unwrap().as_str(),
            "http://localhost:3000/app"
        );
        assert!(config.proxy.validate().is_ok());
    }

    #[test]
    fn malformed_upstream_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["session-proxy", "proxy", "not a url"]).is_err());
    }

    #[test]
    fn logout_takes_no_arguments() {
        assert!(matches!(parse(&["session-proxy", "logout"]).command, Command::Logout));
    }
}
