//! Response header rewriting: `Set-Cookie` domains and redirect locations

use url::Url;

use super::route::upstream_url;

/// Rewrite the `Domain` attribute of a `Set-Cookie` value
///
/// Any existing `Domain` is dropped. With `domain` set, it is replaced;
/// without, the cookie becomes host-only for the proxy's own host.
#[must_use]
pub fn rewrite_cookie_domain(set_cookie: &str, domain: Option<&str>) -> String {
    let mut parts = set_cookie.split(';').map(str::trim).filter(|p| !p.is_empty());

    let mut rewritten: Vec<String> = Vec::new();
    if let Some(pair) = parts.next() {
        rewritten.push(pair.to_string());
    }
    rewritten.extend(
        parts
            .filter(|attr| {
                let name = attr.split('=').next().unwrap_or_default().trim();
                !name.eq_ignore_ascii_case("domain")
            })
            .map(ToString::to_string),
    );
    if let Some(domain) = domain {
        rewritten.push(format!("Domain={domain}"));
    }

    rewritten.join("; ")
}

/// Rewrites `Location` headers of upstream responses
#[derive(Debug, Clone)]
pub struct LocationRewriter {
    provider: Url,
    public_provider: Url,
    welcome_path: String,
    default_redirect: Url,
}

impl LocationRewriter {
    /// Create a rewriter
    ///
    /// * `provider`: the provider's real base URL
    /// * `public_provider`: where clients reach the provider through the proxy
    /// * `welcome_path`: client-visible path of the provider's landing page
    /// * `default_redirect`: where that landing page is replaced with
    #[must_use]
    pub fn new(
        provider: Url,
        public_provider: Url,
        welcome_path: impl Into<String>,
        default_redirect: Url,
    ) -> Self {
        Self {
            provider,
            public_provider,
            welcome_path: welcome_path.into(),
            default_redirect,
        }
    }

    /// Rewrite `location`, returning `None` when it stays as is
    #[must_use]
    pub fn rewrite(&self, location: &str) -> Option<String> {
        let mut current = location.to_string();
        let mut changed = false;

        // Absolute redirects onto the provider host go back through the proxy
        if let Ok(url) = Url::parse(location) {
            if url.origin() == self.provider.origin() {
                let mut public = upstream_url(&self.public_provider, url.path(), url.query());
                public.set_fragment(url.fragment());
                current = public.to_string();
                changed = true;
            }
        }

        if location_path(&current).is_some_and(|p| p == self.welcome_path) {
            current = self.default_redirect.to_string();
            changed = true;
        }

        changed.then_some(current)
    }
}

/// Path component of an absolute or relative `Location`
fn location_path(location: &str) -> Option<String> {
    match Url::parse(location) {
        Ok(url) => Some(url.path().to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse("http://relative.invalid/").ok()?;
            base.join(location).ok().map(|url| url.path().to_string())
        }
        Err(_) => None,
    }
}
