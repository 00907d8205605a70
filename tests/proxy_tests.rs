//! End-to-end proxy tests
//!
//! Every test runs the real proxy on a loopback port in front of two fake
//! upstreams: an application echoing what it receives, and a provider with a
//! session-check endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use jsonwebtoken::{TokenData, jwk::JwkSet};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use session_proxy::bridge::BearerClaims;
use session_proxy::config::{Config, ProxyConfig};
use session_proxy::credentials::EnvApiKeySource;
use session_proxy::proxy::{ProxyServer, serve_until};
use session_proxy::session::{HttpSessionResolver, SessionResolver, SessionStatus};
use session_proxy::signer;

/// Session resolver counting how often it is consulted
struct CountingResolver {
    inner: HttpSessionResolver,
    calls: AtomicUsize,
}

#[async_trait]
impl SessionResolver for CountingResolver {
    async fn resolve(&self, headers: &HeaderMap) -> SessionStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(headers).await
    }
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
        .collect();
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn whoami(State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if cookie.contains("session=valid") {
        Json(json!({
            "id": "sess-1",
            "active": true,
            "identity": {"id": "abc-123", "traits": {"email": "user@example.com"}}
        }))
        .into_response()
    } else if cookie.contains("session=broken") {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

struct Harness {
    proxy: SocketAddr,
    provider: SocketAddr,
    whoami_hits: Arc<AtomicUsize>,
    resolver: Arc<CountingResolver>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(customise: impl FnOnce(&mut ProxyConfig)) -> Self {
        let app = spawn(Router::new().fallback(echo)).await;

        let whoami_hits = Arc::new(AtomicUsize::new(0));
        let provider = spawn(
            Router::new()
                .route("/sessions/whoami", get(whoami))
                .route(
                    "/self-service/login/done",
                    get(|| async { (StatusCode::SEE_OTHER, [(header::LOCATION, "/.ory/ui/welcome")]) }),
                )
                .route(
                    "/cookie",
                    get(|| async {
                        (
                            [(header::SET_COOKIE, "ory_session=x; Domain=provider.invalid; Path=/; HttpOnly")],
                            "ok",
                        )
                    }),
                )
                .fallback(echo)
                .with_state(Arc::clone(&whoami_hits)),
        )
        .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();

        let mut config = Config::default();
        config.proxy.port = proxy.port();
        config.proxy.upstream = Some(Url::parse(&format!("http://{app}")).unwrap());
        config.proxy.provider_url = Some(Url::parse(&format!("http://{provider}")).unwrap());
        config.proxy.cookie_domain = Some("example.local".to_string());
        config.proxy.default_redirect_url = Some(Url::parse("http://localhost:3000/home").unwrap());
        config.session_check.retry.initial_backoff = Duration::from_millis(1);
        customise(&mut config.proxy);

        let resolver = Arc::new(CountingResolver {
            inner: HttpSessionResolver::new(
                config.proxy.provider_url.as_ref().unwrap(),
                &config.session_check,
            )
            .unwrap(),
            calls: AtomicUsize::new(0),
        });

        let server = ProxyServer::with_resolver(
            config,
            Arc::clone(&resolver) as Arc<dyn SessionResolver>,
            Arc::new(EnvApiKeySource),
        )
        .unwrap();
        let router = server.router(Some("temporary-key")).unwrap();

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            serve_until(listener, router, stop, Duration::from_secs(1))
                .await
                .unwrap();
        });

        Self {
            proxy,
            provider,
            whoami_hits,
            resolver,
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap(),
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.proxy)
    }

    fn issuer(&self) -> String {
        format!("http://{}", self.provider)
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Value {
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn jwks_is_public_and_never_resolves_a_session() {
    // GIVEN: a running proxy
    let h = Harness::start().await;

    // WHEN: the key set is fetched with a session cookie
    let response = h
        .client
        .get(h.url("/.ory/jwks.json"))
        .header(header::COOKIE, "session=valid")
        .send()
        .await
        .unwrap();

    // THEN: 200 with public key material only, no session check
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "EC");
    assert_eq!(key["alg"], "ES256");
    assert!(key.get("d").is_none());
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.whoami_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn active_session_reaches_the_application_with_a_bearer_token() {
    let h = Harness::start().await;

    // WHEN: the application is called with a valid session cookie
    let echoed = h
        .get_json(
            h.client
                .get(h.url("/dashboard"))
                .header(header::COOKIE, "session=valid"),
        )
        .await;

    // THEN: the cookie is replaced by a minted token for identity abc-123
    assert_eq!(echoed["path"], "/dashboard");
    assert!(echoed["headers"].get("cookie").is_none());
    let auth = echoed["headers"]["authorization"].as_str().unwrap();
    let token = auth.strip_prefix("Bearer ").unwrap();

    let jwks: JwkSet = h
        .client
        .get(h.url("/.ory/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let data: TokenData<BearerClaims> = signer::verify(token, &jwks, &h.issuer()).unwrap();
    assert_eq!(data.claims.sub, "abc-123");
    assert_eq!(data.claims.exp - data.claims.iat, 60);
    assert_eq!(data.claims.session.extra["id"], "sess-1");
    assert_eq!(
        data.claims.session.identity.extra["traits"]["email"],
        "user@example.com"
    );
}

#[tokio::test]
async fn every_request_gets_a_fresh_token() {
    let h = Harness::start().await;
    let mut ids = Vec::new();
    for _ in 0..2 {
        let echoed = h
            .get_json(h.client.get(h.url("/")).header(header::COOKIE, "session=valid"))
            .await;
        let token = echoed["headers"]["authorization"]
            .as_str()
            .unwrap()
            .trim_start_matches("Bearer ")
            .to_string();
        let jwt_header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(jwt_header.alg, jsonwebtoken::Algorithm::ES256);
        ids.push(token);
    }
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn anonymous_request_is_forwarded_without_credentials() {
    let h = Harness::start().await;

    // WHEN: a client without a session tries to smuggle credentials
    let echoed = h
        .get_json(
            h.client
                .post(h.url("/api/items?page=2"))
                .header(header::AUTHORIZATION, "Bearer forged")
                .header("x-session-token", "forged")
                .body("payload"),
        )
        .await;

    // THEN: the application sees the request unchanged, minus credentials
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/api/items");
    assert_eq!(echoed["query"], "page=2");
    assert_eq!(echoed["body"], "payload");
    assert!(echoed["headers"].get("authorization").is_none());
    assert!(echoed["headers"].get("x-session-token").is_none());
    assert!(echoed["headers"].get("ory-base-url-rewrite-token").is_none());
}

#[tokio::test]
async fn failing_provider_degrades_to_anonymous_after_retries() {
    let h = Harness::start().await;

    let echoed = h
        .get_json(
            h.client
                .get(h.url("/dashboard"))
                .header(header::COOKIE, "session=broken"),
        )
        .await;

    assert!(echoed["headers"].get("authorization").is_none());
    assert_eq!(h.whoami_hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn prefixed_requests_reach_the_provider_unprefixed() {
    let h = Harness::start().await;

    let echoed = h
        .get_json(
            h.client
                .get(h.url("/.ory/self-service/login/browser?return_to=x"))
                .header(header::COOKIE, "session=valid"),
        )
        .await;

    assert_eq!(echoed["path"], "/self-service/login/browser");
    assert_eq!(echoed["query"], "return_to=x");
    assert_eq!(echoed["headers"]["host"], h.provider.to_string());
    assert_eq!(echoed["headers"]["cookie"], "session=valid");
    assert!(echoed["headers"].get("authorization").is_none());
    assert_eq!(echoed["headers"]["ory-no-custom-domain-redirect"], "true");
    assert_eq!(
        echoed["headers"]["ory-base-url-rewrite"],
        format!("http://localhost:{}/.ory", h.proxy.port())
    );
    assert_eq!(echoed["headers"]["ory-base-url-rewrite-token"], "temporary-key");
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn application_keeps_client_host_unless_rewriting() {
    let h = Harness::start().await;
    let echoed = h.get_json(h.client.get(h.url("/"))).await;
    assert_eq!(echoed["headers"]["host"], h.proxy.to_string());

    let h = Harness::start_with(|proxy| proxy.rewrite_host = true).await;
    let echoed = h.get_json(h.client.get(h.url("/"))).await;
    assert_ne!(echoed["headers"]["host"], h.proxy.to_string());
    assert_eq!(echoed["headers"]["x-forwarded-host"], h.proxy.to_string());
}

#[tokio::test]
async fn welcome_redirect_goes_to_the_default_target() {
    let h = Harness::start().await;

    let response = h
        .client
        .get(h.url("/.ory/self-service/login/done"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "http://localhost:3000/home");
}

#[tokio::test]
async fn set_cookie_domain_is_rewritten() {
    let h = Harness::start().await;

    let response = h.client.get(h.url("/.ory/cookie")).send().await.unwrap();

    assert_eq!(
        response.headers()[header::SET_COOKIE],
        "ory_session=x; Path=/; HttpOnly; Domain=example.local"
    );
}

#[tokio::test]
async fn hsts_is_always_cleared() {
    let h = Harness::start().await;

    for path in ["/", "/.ory/jwks.json", "/.ory/anything"] {
        let response = h.client.get(h.url(path)).send().await.unwrap();
        assert_eq!(response.headers()[header::STRICT_TRANSPORT_SECURITY], "max-age=0;");
    }
}

#[tokio::test]
async fn preflight_is_answered_before_the_session_check() {
    let h = Harness::start_with(|proxy| {
        proxy.cors_origins = vec!["https://*.example.com".to_string()];
    })
    .await;

    let response = h
        .client
        .request(Method::OPTIONS, h.url("/api"))
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::COOKIE, "session=valid")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example.com"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    // Bind and drop to get a port nobody listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let h = Harness::start_with(|proxy| {
        proxy.upstream = Some(Url::parse(&format!("http://{dead}")).unwrap());
    })
    .await;

    let response = h.client.get(h.url("/dashboard")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], 502);
}

#[tokio::test]
async fn skip_token_minting_still_strips_credentials() {
    let h = Harness::start_with(|proxy| proxy.skip_token_minting = true).await;

    let echoed = h
        .get_json(
            h.client
                .get(h.url("/dashboard"))
                .header(header::COOKIE, "session=valid")
                .header(header::AUTHORIZATION, "Bearer forged"),
        )
        .await;

    assert!(echoed["headers"].get("authorization").is_none());
    assert_eq!(echoed["headers"]["cookie"], "session=valid");
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);

    let jwks: Value = h
        .client
        .get(h.url("/.ory/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(jwks, json!({"keys": []}));
}
