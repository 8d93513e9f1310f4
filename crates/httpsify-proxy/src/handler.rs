//! HTTP handler that upgrades requests and rewrites responses.
//!
//! ## Request Path
//!
//! ```text
//! GET http://example.com/ ─► rewrite_url ─► unchanged? ─► forward as is
//!                                               │ changed
//!                              ┌────────────────┴───────────────┐
//!                              │ Forward                        │ Redirect
//!                              ▼                                ▼
//!                    fetch https://example.com/          302 Location: https://...
//! ```
//!
//! Responses get their `Set-Cookie` headers secured where the engine allows
//! it and, for textual bodies, their embedded `http` links upgraded. Cookies
//! are only secured when the browser itself spoke https to the proxy.

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    LOCATION, SET_COOKIE, TRANSFER_ENCODING,
};
use hyper::{Method, StatusCode, Uri};

use httpsify_core::{Cookie, HttpsRewriter};

use crate::proxy::UpgradeMode;

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Handler settings derived from the proxy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Rewrite `http` links inside response bodies.
    pub rewrite_pages: bool,
    /// Rewrite bodies whatever their content type.
    pub aggressive: bool,
    /// What to do with a request whose URL can be upgraded.
    pub upgrade_mode: UpgradeMode,
    /// Append `Secure` to approved `Set-Cookie` headers.
    pub secure_cookies: bool,
    /// Decrypt CONNECT tunnels.
    pub intercept_https: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            rewrite_pages: true,
            aggressive: false,
            upgrade_mode: UpgradeMode::Forward,
            secure_cookies: true,
            intercept_https: false,
        }
    }
}

/// What the response phase needs to know about its request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Upstream {
    host: String,
    /// The upstream fetch went out over https.
    https: bool,
    /// The browser sent the request over https, i.e. inside an intercepted
    /// tunnel. Browsers drop `Secure` cookies set by plain http origins.
    client_https: bool,
}

/// Proxy handler. hudsucker clones it per request, so the request phase can
/// leave notes for the response phase.
#[derive(Debug, Clone)]
pub struct RewriteHandler {
    rewriter: HttpsRewriter,
    config: HandlerConfig,
    upstream: Option<Upstream>,
}

impl RewriteHandler {
    /// Creates a handler over a shared engine.
    pub fn new(rewriter: HttpsRewriter, config: HandlerConfig) -> Self {
        Self {
            rewriter,
            config,
            upstream: None,
        }
    }

    /// The handler settings.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Upgrades the request URL and records where it is going.
    fn prepare_request(&mut self, mut req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        // Bodies must arrive uncompressed to be rewritten
        req.headers_mut().remove(ACCEPT_ENCODING);

        let host = match extract_host(&req) {
            Some(h) => h,
            None => return RequestOrResponse::Request(req),
        };
        let https = req.uri().scheme_str() == Some("https");
        self.upstream = Some(Upstream {
            host,
            https,
            client_https: https,
        });

        if https {
            return RequestOrResponse::Request(req);
        }

        let original = req.uri().to_string();
        let upgraded = self.rewriter.rewrite_url(&original);
        if upgraded == original {
            return RequestOrResponse::Request(req);
        }

        match self.config.upgrade_mode {
            UpgradeMode::Redirect => match redirect_response(&upgraded) {
                Some(res) => {
                    tracing::info!("Redirecting {} to {}", original, upgraded);
                    RequestOrResponse::Response(res)
                }
                None => RequestOrResponse::Request(req),
            },
            UpgradeMode::Forward => {
                if let Err(e) = retarget(&mut req, &upgraded) {
                    tracing::warn!("Cannot forward {} to {}: {}", original, upgraded, e);
                    return RequestOrResponse::Request(req);
                }
                tracing::info!("Upgraded {} to {}", original, upgraded);
                self.upstream = extract_host(&req).map(|host| Upstream {
                    https: req.uri().scheme_str() == Some("https"),
                    client_https: false,
                    host,
                });
                RequestOrResponse::Request(req)
            }
        }
    }

    /// Secures cookies and rewrites the body of an upstream response.
    async fn finish_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(upstream) = self.upstream.take() else {
            return res;
        };

        let (mut parts, body) = res.into_parts();

        if self.config.secure_cookies && upstream.client_https {
            secure_cookie_headers(&self.rewriter, &mut parts.headers, &upstream);
        }

        if !self.config.rewrite_pages || !is_rewritable(&parts.headers, self.config.aggressive) {
            return Response::from_parts(parts, body);
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read response body from {}: {}", upstream.host, e);
                parts.headers.remove(TRANSFER_ENCODING);
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                return Response::from_parts(parts, Body::empty());
            }
        };

        // HEAD and 304 responses keep their original Content-Length
        if body_bytes.is_empty() {
            return Response::from_parts(parts, Body::empty());
        }

        let text = match std::str::from_utf8(&body_bytes) {
            Ok(text) => text,
            Err(_) => {
                tracing::debug!("Response body from {} is not UTF-8", upstream.host);
                return Response::from_parts(parts, bytes_to_body(body_bytes));
            }
        };

        let rewritten = self.rewriter.rewrite_page_content(text);
        parts.headers.remove(TRANSFER_ENCODING);
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        Response::from_parts(parts, bytes_to_body(Bytes::from(rewritten)))
    }
}

impl HttpHandler for RewriteHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        self.prepare_request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.finish_response(res).await
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, _req: &Request<Body>) -> bool {
        self.config.intercept_https
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Extracts host from request URI or Host header.
fn extract_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}

/// Points the request at `target`, keeping the Host header in step.
fn retarget(req: &mut Request<Body>, target: &str) -> Result<(), String> {
    let uri = target.parse::<Uri>().map_err(|e| e.to_string())?;
    let authority = uri
        .authority()
        .ok_or_else(|| "missing authority".to_string())?;
    let host = HeaderValue::from_str(authority.as_str()).map_err(|e| e.to_string())?;

    req.headers_mut().insert(HOST, host);
    *req.uri_mut() = uri;
    Ok(())
}

/// Builds a `302 Found` pointing at `location`.
///
/// Returns `None` if `location` is not a valid header value.
pub fn redirect_response(location: &str) -> Option<Response<Body>> {
    let location = HeaderValue::from_str(location).ok()?;

    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::FOUND;
    res.headers_mut().insert(LOCATION, location);
    res.headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    Some(res)
}

/// Returns true if a response body with these headers may be rewritten.
///
/// Encoded bodies never are. Untyped and `text/*` bodies are; anything else
/// only in aggressive mode.
pub fn is_rewritable(headers: &HeaderMap, aggressive: bool) -> bool {
    if let Some(encoding) = headers.get(CONTENT_ENCODING) {
        let identity = encoding
            .to_str()
            .map(|e| e.trim().eq_ignore_ascii_case("identity"))
            .unwrap_or(false);
        if !identity {
            return false;
        }
    }

    match headers.get(CONTENT_TYPE) {
        None => true,
        Some(content_type) => {
            aggressive
                || content_type
                    .to_str()
                    .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/"))
                    .unwrap_or(false)
        }
    }
}

/// The parts of a `Set-Cookie` header the cookie advisor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie<'a> {
    /// Cookie name.
    pub name: &'a str,
    /// `Domain` attribute, if present.
    pub domain: Option<&'a str>,
    /// Whether a `Secure` attribute is already present.
    pub secure: bool,
}

/// Parses a `Set-Cookie` header value.
pub fn parse_set_cookie(header: &str) -> Option<SetCookie<'_>> {
    let mut fields = header.split(';');
    let pair = fields.next()?;
    let (name, _) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = SetCookie {
        name,
        domain: None,
        secure: false,
    };
    for attribute in fields {
        let (key, value) = match attribute.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attribute.trim(), None),
        };
        if key.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        } else if key.eq_ignore_ascii_case("domain") {
            cookie.domain = value.filter(|v| !v.is_empty());
        }
    }
    Some(cookie)
}

/// Returns the header with `; Secure` appended if the engine approves it.
pub fn secure_set_cookie(
    rewriter: &HttpsRewriter,
    header: &str,
    request_host: &str,
    known_https: bool,
) -> Option<String> {
    let parsed = parse_set_cookie(header)?;
    if parsed.secure {
        return None;
    }

    let cookie = Cookie::new(parsed.domain.unwrap_or(request_host), parsed.name);
    rewriter.should_secure_cookie(&cookie, known_https)?;
    Some(format!("{}; Secure", header.trim_end().trim_end_matches(';')))
}

fn secure_cookie_headers(rewriter: &HttpsRewriter, headers: &mut HeaderMap, upstream: &Upstream) {
    if !headers.contains_key(SET_COOKIE) {
        return;
    }

    let originals: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    headers.remove(SET_COOKIE);

    for original in originals {
        let secured = original
            .to_str()
            .ok()
            .and_then(|h| secure_set_cookie(rewriter, h, &upstream.host, upstream.https))
            .and_then(|h| HeaderValue::from_str(&h).ok());
        headers.append(SET_COOKIE, secured.unwrap_or(original));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpsify_core::EngineConfig;

    const LIBRARY: &str = r#"
<rulesetlibrary>
  <ruleset name="Example">
    <target host="example.com" />
    <securecookie host="^example\.com$" name="^sid$" />
    <rule from="^http://example\.com/" to="https://example.com/" />
  </ruleset>
</rulesetlibrary>
"#;

    fn rewriter() -> HttpsRewriter {
        HttpsRewriter::from_xml(LIBRARY, EngineConfig::default())
            .unwrap()
            .0
    }

    fn handler(config: HandlerConfig) -> RewriteHandler {
        RewriteHandler::new(rewriter(), config)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(ACCEPT_ENCODING, "gzip, br")
            .body(Body::empty())
            .unwrap()
    }

    fn html(body: &str) -> Response<Body> {
        Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(bytes_to_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_text(res: Response<Body>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // ==================== Body Policy Tests ====================

    #[test]
    fn text_and_untyped_bodies_are_rewritable() {
        let mut headers = HeaderMap::new();
        assert!(is_rewritable(&headers, false));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(is_rewritable(&headers, false));
    }

    #[test]
    fn other_types_need_aggressive_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/javascript"));
        assert!(!is_rewritable(&headers, false));
        assert!(is_rewritable(&headers, true));
    }

    #[test]
    fn encoded_bodies_are_never_rewritable() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_rewritable(&headers, true));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(is_rewritable(&headers, false));
    }

    // ==================== Cookie Header Tests ====================

    #[test]
    fn parse_set_cookie_attributes() {
        let cookie = parse_set_cookie("sid=abc; Path=/; Domain=.example.com; HttpOnly").unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.domain, Some(".example.com"));
        assert!(!cookie.secure);

        assert!(parse_set_cookie("sid=abc; secure").unwrap().secure);
        assert!(parse_set_cookie("=abc").is_none());
        assert!(parse_set_cookie("garbage").is_none());
    }

    #[test]
    fn approved_cookie_gets_secure() {
        let rw = rewriter();
        assert_eq!(
            secure_set_cookie(&rw, "sid=abc; Path=/", "example.com", false),
            Some("sid=abc; Path=/; Secure".to_string())
        );
    }

    #[test]
    fn unapproved_cookies_are_left_alone() {
        let rw = rewriter();
        assert_eq!(secure_set_cookie(&rw, "other=1", "example.com", false), None);
        assert_eq!(secure_set_cookie(&rw, "sid=1", "unknown.test", false), None);
        assert_eq!(
            secure_set_cookie(&rw, "sid=1; Secure", "example.com", false),
            None
        );
    }

    #[test]
    fn redirect_response_has_location() {
        let res = redirect_response("https://example.com/").unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers()[LOCATION], "https://example.com/");
        assert!(redirect_response("bad\nvalue").is_none());
    }

    // ==================== Request Tests ====================

    #[test]
    fn forward_mode_retargets_request() {
        let mut handler = handler(HandlerConfig::default());
        let req = match handler.prepare_request(get("http://example.com/page")) {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("expected a request"),
        };

        assert_eq!(req.uri(), "https://example.com/page");
        assert_eq!(req.headers()[HOST], "example.com");
        assert!(req.headers().get(ACCEPT_ENCODING).is_none());
        assert_eq!(
            handler.upstream,
            Some(Upstream {
                host: "example.com".into(),
                https: true,
                client_https: false,
            })
        );
    }

    #[test]
    fn redirect_mode_answers_with_302() {
        let mut handler = handler(HandlerConfig {
            upgrade_mode: UpgradeMode::Redirect,
            ..HandlerConfig::default()
        });
        match handler.prepare_request(get("http://example.com/page")) {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::FOUND);
                assert_eq!(res.headers()[LOCATION], "https://example.com/page");
            }
            RequestOrResponse::Request(_) => panic!("expected a redirect"),
        }
    }

    #[test]
    fn unmatched_request_is_forwarded_unchanged() {
        let mut handler = handler(HandlerConfig::default());
        let req = match handler.prepare_request(get("http://unmatched.test/x")) {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("expected a request"),
        };
        assert_eq!(req.uri(), "http://unmatched.test/x");
        assert!(!handler.upstream.unwrap().https);
    }

    #[test]
    fn connect_is_passed_through() {
        let mut handler = handler(HandlerConfig::default());
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            handler.prepare_request(req),
            RequestOrResponse::Request(_)
        ));
        assert!(handler.upstream.is_none());
    }

    // ==================== Response Tests ====================

    #[test]
    fn text_response_is_rewritten() {
        let mut handler = handler(HandlerConfig::default());
        handler.prepare_request(get("http://unmatched.test/"));

        let res = tokio_test::block_on(
            handler.finish_response(html(r#"<a href="http://example.com/a">a</a>"#)),
        );
        let expected = r#"<a href="https://example.com/a">a</a>"#;
        assert_eq!(res.headers()[CONTENT_LENGTH], expected.len().to_string().as_str());
        assert_eq!(tokio_test::block_on(body_text(res)), expected);
    }

    #[tokio::test]
    async fn rewrite_pages_off_leaves_body() {
        let mut handler = handler(HandlerConfig {
            rewrite_pages: false,
            ..HandlerConfig::default()
        });
        handler.prepare_request(get("http://unmatched.test/"));

        let res = handler
            .finish_response(html("http://example.com/a"))
            .await;
        assert_eq!(body_text(res).await, "http://example.com/a");
    }

    #[tokio::test]
    async fn binary_response_is_untouched() {
        let mut handler = handler(HandlerConfig::default());
        handler.prepare_request(get("http://unmatched.test/"));

        let res = Response::builder()
            .header(CONTENT_TYPE, "image/png")
            .body(bytes_to_body(Bytes::from_static(b"http://example.com/a")))
            .unwrap();
        let res = handler.finish_response(res).await;
        assert_eq!(body_text(res).await, "http://example.com/a");
    }

    #[tokio::test]
    async fn cookies_are_secured_inside_intercepted_tunnels() {
        let mut handler = handler(HandlerConfig::default());
        handler.prepare_request(get("https://example.com/login"));

        let res = Response::builder()
            .header(SET_COOKIE, "sid=1; Path=/")
            .header(SET_COOKIE, "theme=dark")
            .body(Body::empty())
            .unwrap();
        let res = handler.finish_response(res).await;

        let cookies: Vec<&str> = res
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["sid=1; Path=/; Secure", "theme=dark"]);
    }

    #[tokio::test]
    async fn http_origin_cookies_stay_unsecured_after_upgrade() {
        let mut handler = handler(HandlerConfig::default());
        handler.prepare_request(get("http://example.com/login"));
        assert!(handler.upstream.as_ref().unwrap().https);

        let res = Response::builder()
            .header(SET_COOKIE, "sid=1")
            .body(Body::empty())
            .unwrap();
        let res = handler.finish_response(res).await;
        assert_eq!(res.headers()[SET_COOKIE], "sid=1");
    }

    #[tokio::test]
    async fn unreadable_body_is_sent_empty_with_zero_length() {
        let mut handler = handler(HandlerConfig::default());
        handler.prepare_request(get("http://unmatched.test/"));

        let chunks = futures::stream::iter(vec![Err::<Bytes, std::io::Error>(
            std::io::Error::other("connection reset"),
        )]);
        let res = Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, "512")
            .header(TRANSFER_ENCODING, "chunked")
            .body(Body::from_stream(chunks))
            .unwrap();
        let res = handler.finish_response(res).await;

        assert_eq!(res.headers()[CONTENT_LENGTH], "0");
        assert!(res.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(body_text(res).await, "");
    }

    #[tokio::test]
    async fn cookies_untouched_when_disabled() {
        let mut handler = handler(HandlerConfig {
            secure_cookies: false,
            ..HandlerConfig::default()
        });
        handler.prepare_request(get("https://example.com/login"));

        let res = Response::builder()
            .header(SET_COOKIE, "sid=1")
            .body(Body::empty())
            .unwrap();
        let res = handler.finish_response(res).await;
        assert_eq!(res.headers()[SET_COOKIE], "sid=1");
    }
}
