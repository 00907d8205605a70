//! Per-request routing between the application and the provider

use url::Url;

/// Where a request is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The identity provider (reserved path prefix, or tunnel mode)
    Provider,
    /// The user's application
    Application,
}

/// Routing rule evaluated for every inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    path_prefix: String,
    tunnel: bool,
}

impl Routing {
    /// Create a routing rule
    ///
    /// An empty `path_prefix` reserves nothing; with `tunnel` set every
    /// request goes to the provider.
    #[must_use]
    pub fn new(path_prefix: impl Into<String>, tunnel: bool) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            tunnel,
        }
    }

    /// The reserved path prefix
    #[must_use]
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Whether this instance runs as a tunnel
    #[must_use]
    pub fn is_tunnel(&self) -> bool {
        self.tunnel
    }

    /// Whether `path` lies under the reserved prefix
    #[must_use]
    pub fn is_prefixed(&self, path: &str) -> bool {
        if self.path_prefix.is_empty() {
            return false;
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Decide the upstream for `path`
    #[must_use]
    pub fn target(&self, path: &str) -> Target {
        if self.tunnel || self.is_prefixed(path) {
            Target::Provider
        } else {
            Target::Application
        }
    }

    /// Path sent to the provider: `path` with the reserved prefix removed
    #[must_use]
    pub fn provider_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.is_prefixed(path) {
            return path;
        }
        match &path[self.path_prefix.len()..] {
            "" => "/",
            rest => rest,
        }
    }

    /// Paths answered with the public key set
    #[must_use]
    pub fn jwks_paths(&self) -> [String; 2] {
        [
            format!("{}/jwks.json", self.path_prefix),
            format!("{}/proxy/jwks.json", self.path_prefix),
        ]
    }

    /// Whether `path` is one of [`Self::jwks_paths`]
    #[must_use]
    pub fn is_jwks_path(&self, path: &str) -> bool {
        self.jwks_paths().iter().any(|p| p == path)
    }

    /// Path of the provider's post-login landing page, as seen by clients
    #[must_use]
    pub fn welcome_path(&self) -> String {
        format!("{}/ui/welcome", self.path_prefix)
    }
}

/// Build the outgoing URL: `base` with `path` appended to its path and
/// `query` carried over verbatim
#[must_use]
pub fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    let joined = match (base_path.is_empty(), path.starts_with('/')) {
        (true, true) => path.to_string(),
        (true, false) => format!("/{path}"),
        (false, true) => format!("{base_path}{path}"),
        (false, false) => format!("{base_path}/{path}"),
    };
    url.set_path(&joined);
    url.set_query(query);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Routing {
        Routing::new("/.ory", false)
    }

    #[test]
    fn prefixed_paths_go_to_the_provider() {
        let r = proxy();
        assert_eq!(r.target("/.ory/sessions/whoami"), Target::Provider);
        assert_eq!(r.target("/.ory"), Target::Provider);
        assert_eq!(r.target("/dashboard"), Target::Application);
        assert_eq!(r.target("/"), Target::Application);
    }

    #[test]
    fn prefix_must_match_a_whole_segment() {
        let r = proxy();
        assert_eq!(r.target("/.orybital/x"), Target::Application);
    }

    #[test]
    fn tunnel_routes_everything_to_the_provider() {
        let r = Routing::new("", true);
        assert_eq!(r.target("/dashboard"), Target::Provider);
        assert_eq!(r.provider_path("/self-service/login"), "/self-service/login");
    }

    #[test]
    fn provider_path_strips_the_prefix() {
        let r = proxy();
        assert_eq!(r.provider_path("/.ory/sessions/whoami"), "/sessions/whoami");
        assert_eq!(r.provider_path("/.ory"), "/");
        assert_eq!(r.provider_path("/dashboard"), "/dashboard");
    }

    #[test]
    fn jwks_paths_live_under_the_prefix() {
        let r = proxy();
        assert!(r.is_jwks_path("/.ory/jwks.json"));
        assert!(r.is_jwks_path("/.ory/proxy/jwks.json"));
        assert!(!r.is_jwks_path("/jwks.json"));

        let tunnel = Routing::new("", true);
        assert!(tunnel.is_jwks_path("/jwks.json"));
    }

    #[test]
    fn upstream_url_joins_paths_and_keeps_query() {
        let base = Url::parse("http://localhost:3000").unwrap();
        assert_eq!(
            upstream_url(&base, "/dashboard", Some("a=1&b=2")).as_str(),
            "http://localhost:3000/dashboard?a=1&b=2"
        );

        let with_path = Url::parse("https://app.example.com/base/").unwrap();
        assert_eq!(
            upstream_url(&with_path, "/x", None).as_str(),
            "https://app.example.com/base/x"
        );
    }
}
