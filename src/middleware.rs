// Middleware: onion-model request/response processing
//
// A middleware wraps the downstream handler; the first middleware in the
// declared list is outermost. Middleware may short-circuit by not calling
// `next`, and may rebuild the request or response on the way through.

use crate::http::{ContextValue, CTX_DEADLINE, CTX_REQUEST_ID, CTX_USER};
use crate::router::{Handler, HandlerFuture};
use crate::{Error, Request, Response};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// The downstream continuation handed to a middleware.
pub type Next = Box<dyn FnOnce(Request) -> HandlerFuture + Send>;

/// Middleware trait; implementations wrap the downstream handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error>;
}

/// Ordered middleware list composed into an onion around a handler.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; earlier additions sit further out in the onion.
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        let mut list = (*self.middlewares).clone();
        list.push(Arc::new(middleware));
        self.middlewares = Arc::new(list);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run the chain around `handler` for one request.
    pub async fn apply(&self, req: Request, handler: Handler) -> Result<Response, Error> {
        self.execute_from(0, req, handler).await
    }

    fn execute_from(&self, index: usize, req: Request, handler: Handler) -> HandlerFuture {
        if index >= self.middlewares.len() {
            handler(req)
        } else {
            let middleware = self.middlewares[index].clone();
            let chain = self.clone();
            Box::pin(async move {
                middleware
                    .handle(
                        req,
                        Box::new(move |req| chain.execute_from(index + 1, req, handler)),
                    )
                    .await
            })
        }
    }

    /// Compose the chain onto a handler once, yielding a plain [`Handler`].
    pub fn compose(&self, handler: Handler) -> Handler {
        let chain = self.clone();
        Arc::new(move |req| {
            let chain = chain.clone();
            let handler = handler.clone();
            Box::pin(async move { chain.apply(req, handler).await })
        })
    }
}

// ========== Standard middleware library ==========

/// Logs method, path, status and elapsed milliseconds per request. A
/// downstream failure is logged and re-raised.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let start = Instant::now();
        let method = req.method.clone();
        let path = req.path.clone();

        let result = next(req).await;
        let elapsed_ms = start.elapsed().as_millis();

        match &result {
            Ok(response) => {
                info!(
                    method = %method,
                    path = %path,
                    status = response.status,
                    elapsed_ms = elapsed_ms as u64,
                    "request completed"
                );
            }
            Err(err) => {
                error!(
                    method = %method,
                    path = %path,
                    elapsed_ms = elapsed_ms as u64,
                    error = %err,
                    "request failed"
                );
            }
        }
        result
    }
}

/// Cross-origin resource sharing. Preflight `OPTIONS` requests are answered
/// with 204 and the configured headers; every other response gets the
/// origin/methods/headers appended.
pub struct CorsMiddleware {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub allow_credentials: bool,
}

impl CorsMiddleware {
    pub fn new() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            allow_headers: "content-type, authorization, accept".to_string(),
            allow_credentials: false,
        }
    }

    pub fn allow_origin(mut self, origin: &str) -> Self {
        self.allow_origin = origin.to_string();
        self
    }

    pub fn allow_methods(mut self, methods: &str) -> Self {
        self.allow_methods = methods.to_string();
        self
    }

    pub fn allow_headers(mut self, headers: &str) -> Self {
        self.allow_headers = headers.to_string();
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    fn apply_headers(&self, response: Response) -> Response {
        let response = response
            .with_header("access-control-allow-origin", &self.allow_origin)
            .with_header("access-control-allow-methods", &self.allow_methods)
            .with_header("access-control-allow-headers", &self.allow_headers);
        if self.allow_credentials {
            response.with_header("access-control-allow-credentials", "true")
        } else {
            response
        }
    }
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        if req.method == "OPTIONS" {
            return Ok(self.apply_headers(Response::empty()));
        }
        let response = next(req).await?;
        Ok(self.apply_headers(response))
    }
}

/// Converts downstream failures into canonical error responses:
/// `MalformedBody` to 400, `PayloadTooLarge` to 413, anything else to 500
/// (with the failure text when detail exposure is enabled).
pub struct ErrorTrapMiddleware {
    expose_details: bool,
}

impl ErrorTrapMiddleware {
    pub fn new() -> Self {
        Self { expose_details: false }
    }

    /// Include the failure text in 500 bodies. Development only.
    pub fn with_details(mut self) -> Self {
        self.expose_details = true;
        self
    }
}

impl Default for ErrorTrapMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ErrorTrapMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        match next(req).await {
            Ok(response) => Ok(response),
            Err(Error::MalformedBody(msg)) => Ok(Response::bad_request(msg)),
            Err(Error::PayloadTooLarge(msg)) => Ok(Response::json_error(413, &msg)),
            Err(err) => {
                error!(error = %err, "unhandled failure trapped");
                if self.expose_details {
                    Ok(Response::status(500)
                        .with_header("content-type", "text/plain; charset=utf-8")
                        .with_body(format!("Internal Server Error: {}", err)))
                } else {
                    Ok(Response::internal_server_error("Internal Server Error"))
                }
            }
        }
    }
}

/// Async bearer-token validator; returns the principal to stash under
/// `context["user"]`, or `None` to reject.
pub type TokenValidator =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<ContextValue>> + Send>> + Send + Sync>;

/// Extracts a bearer token, validates it, and either forwards the request
/// with the principal in context or answers 401.
pub struct AuthMiddleware {
    validator: TokenValidator,
}

impl AuthMiddleware {
    pub fn new<F, Fut>(validator: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ContextValue>> + Send + 'static,
    {
        Self {
            validator: Arc::new(move |token| Box::pin(validator(token))),
        }
    }

    fn bearer_token(req: &Request) -> Option<String> {
        let header = req.header("authorization")?;
        let (scheme, token) = header.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
            Some(token.to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let Some(token) = Self::bearer_token(&req) else {
            return Ok(Response::unauthorized("Missing bearer token"));
        };
        match (self.validator)(token).await {
            Some(principal) => next(req.with_context_value(CTX_USER, principal)).await,
            None => Ok(Response::unauthorized("Invalid token")),
        }
    }
}

/// Per-client rate limiting over a sliding timestamp window, keyed by a
/// configurable client-identifier header. Over the limit answers 429 with
/// `retry-after`; timestamps older than the window are evicted on touch.
pub struct RateLimitMiddleware {
    max_requests: usize,
    window: Duration,
    key_header: String,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            key_header: "x-forwarded-for".to_string(),
            hits: DashMap::new(),
        }
    }

    pub fn key_header(mut self, header: &str) -> Self {
        self.key_header = header.to_ascii_lowercase();
        self
    }

    fn check(&self, key: String) -> Option<u64> {
        let now = Instant::now();
        let mut entry = self.hits.entry(key).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_requests {
            let oldest = entry.first().copied();
            let retry_after = oldest
                .map(|t| {
                    let remaining = self.window.saturating_sub(now.duration_since(t));
                    let secs = remaining.as_secs();
                    if remaining.subsec_nanos() > 0 { secs + 1 } else { secs }
                })
                .unwrap_or(1)
                .max(1);
            return Some(retry_after);
        }
        entry.push(now);
        None
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let key = req
            .header(&self.key_header)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        if let Some(retry_after) = self.check(key) {
            return Ok(Response::json_error(429, "Too many requests")
                .with_header("retry-after", &retry_after.to_string()));
        }
        next(req).await
    }
}

/// Propagates an incoming `x-request-id` or generates a UUID v4; the id goes
/// into `context["requestId"]` and is echoed on the response.
pub struct RequestIdMiddleware;

#[async_trait]
impl Middleware for RequestIdMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let id = req
            .header("x-request-id")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let req = req
            .with_header("x-request-id", &id)
            .with_context(CTX_REQUEST_ID, id.clone());
        let response = next(req).await?;
        Ok(response.with_header("x-request-id", &id))
    }
}

/// Sets the standard browser-hardening headers on every response.
pub struct SecurityHeadersMiddleware {
    pub frame_options: String,
    pub content_type_options: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
    pub xss_protection: String,
}

impl SecurityHeadersMiddleware {
    pub fn new() -> Self {
        Self {
            frame_options: "DENY".to_string(),
            content_type_options: "nosniff".to_string(),
            referrer_policy: "no-referrer".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=()".to_string(),
            xss_protection: "1; mode=block".to_string(),
        }
    }

    pub fn with_frame_options(mut self, value: &str) -> Self {
        self.frame_options = value.to_string();
        self
    }

    pub fn with_referrer_policy(mut self, value: &str) -> Self {
        self.referrer_policy = value.to_string();
        self
    }
}

impl Default for SecurityHeadersMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for SecurityHeadersMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let response = next(req).await?;
        Ok(response
            .with_header("x-frame-options", &self.frame_options)
            .with_header("x-content-type-options", &self.content_type_options)
            .with_header("referrer-policy", &self.referrer_policy)
            .with_header("permissions-policy", &self.permissions_policy)
            .with_header("x-xss-protection", &self.xss_protection))
    }
}

/// One observation handed to the metrics sink after each response.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    /// Buffered body size; `None` for streamed responses.
    pub body_size: Option<usize>,
}

/// Receives one [`MetricsRecord`] per completed exchange.
pub type MetricsSink = Arc<dyn Fn(MetricsRecord) + Send + Sync>;

/// Invokes the supplied sink after each response (failures report the status
/// they would surface as).
pub struct MetricsMiddleware {
    sink: MetricsSink,
}

impl MetricsMiddleware {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(MetricsRecord) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let start = Instant::now();
        let method = req.method.clone();
        let path = req.path.clone();

        let result = next(req).await;
        let duration = start.elapsed();

        let (status, body_size) = match &result {
            Ok(response) => (response.status, response.body.len()),
            Err(err) => (err.status_code(), None),
        };
        (self.sink)(MetricsRecord {
            method,
            path,
            status,
            duration,
            body_size,
        });
        result
    }
}

/// Installs the per-request deadline contract and races the downstream
/// handler against it; expiry answers 408. There is no implicit timeout in
/// the runtime; this middleware is how applications opt in.
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
        let deadline = Instant::now() + self.duration;
        let req = req.with_context(CTX_DEADLINE, deadline);
        match tokio::time::timeout(self.duration, next(req)).await {
            Ok(result) => result,
            Err(_) => Ok(Response::json_error(408, "Request timeout")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::handler;
    use std::sync::Mutex;

    fn ok_handler() -> Handler {
        handler(|_req| async { Ok(Response::text("ok")) })
    }

    struct TagMiddleware {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for TagMiddleware {
        async fn handle(&self, req: Request, next: Next) -> Result<Response, Error> {
            self.log.lock().unwrap().push(format!("{}-pre", self.tag));
            let resp = next(req).await;
            self.log.lock().unwrap().push(format!("{}-post", self.tag));
            resp
        }
    }

    #[tokio::test]
    async fn first_declared_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(TagMiddleware { tag: "1", log: log.clone() });
        chain.use_middleware(TagMiddleware { tag: "2", log: log.clone() });

        let inner_log = log.clone();
        let handler = handler(move |_req| {
            let inner_log = inner_log.clone();
            async move {
                inner_log.lock().unwrap().push("handler".to_string());
                Ok(Response::text("ok"))
            }
        });

        chain.apply(Request::new("GET", "/h"), handler).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["1-pre", "2-pre", "handler", "2-post", "1-post"]
        );
    }

    #[tokio::test]
    async fn cors_answers_preflight_with_204() {
        let cors = CorsMiddleware::new().allow_origin("https://example.com");
        let resp = cors
            .handle(Request::new("OPTIONS", "/api"), Box::new(|_| panic!("must not reach")))
            .await
            .unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(
            resp.header("access-control-allow-origin"),
            Some(&"https://example.com".to_string())
        );
    }

    #[tokio::test]
    async fn cors_decorates_non_preflight_responses() {
        let cors = CorsMiddleware::new().allow_credentials(true);
        let resp = cors
            .handle(
                Request::new("GET", "/api"),
                Box::new(|req| ok_handler()(req)),
            )
            .await
            .unwrap();
        assert_eq!(resp.header("access-control-allow-origin"), Some(&"*".to_string()));
        assert_eq!(
            resp.header("access-control-allow-credentials"),
            Some(&"true".to_string())
        );
    }

    #[tokio::test]
    async fn error_trap_maps_body_errors() {
        let trap = ErrorTrapMiddleware::new();
        let resp = trap
            .handle(
                Request::new("POST", "/"),
                Box::new(|_| {
                    Box::pin(async { Err(Error::MalformedBody("bad json".to_string())) })
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 400);

        let resp = trap
            .handle(
                Request::new("POST", "/"),
                Box::new(|_| {
                    Box::pin(async { Err(Error::PayloadTooLarge("cap".to_string())) })
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 413);
    }

    #[tokio::test]
    async fn error_trap_hides_details_by_default() {
        let trap = ErrorTrapMiddleware::new();
        let resp = trap
            .handle(
                Request::new("GET", "/"),
                Box::new(|_| Box::pin(async { Err(Error::Internal("secret".to_string())) })),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 500);
        let body: serde_json::Value = serde_json::from_slice(&resp.body_bytes()).unwrap();
        assert_eq!(body["error"], "Internal Server Error");

        let trap = ErrorTrapMiddleware::new().with_details();
        let resp = trap
            .handle(
                Request::new("GET", "/"),
                Box::new(|_| Box::pin(async { Err(Error::Internal("secret".to_string())) })),
            )
            .await
            .unwrap();
        let text = String::from_utf8(resp.body_bytes().to_vec()).unwrap();
        assert!(text.contains("secret"));
    }

    #[tokio::test]
    async fn auth_rejects_missing_and_invalid_tokens() {
        let auth = AuthMiddleware::new(|token: String| async move {
            (token == "good").then(|| Arc::new("alice".to_string()) as ContextValue)
        });

        let resp = auth
            .handle(Request::new("GET", "/"), Box::new(|req| ok_handler()(req)))
            .await
            .unwrap();
        assert_eq!(resp.status, 401);

        let req = Request::new("GET", "/").with_header("authorization", "Bearer bad");
        let resp = auth.handle(req, Box::new(|req| ok_handler()(req))).await.unwrap();
        assert_eq!(resp.status, 401);
    }

    #[tokio::test]
    async fn auth_stashes_principal_in_context() {
        let auth = AuthMiddleware::new(|token: String| async move {
            (token == "good").then(|| Arc::new("alice".to_string()) as ContextValue)
        });
        let req = Request::new("GET", "/").with_header("authorization", "Bearer good");
        let resp = auth
            .handle(
                req,
                Box::new(|req| {
                    Box::pin(async move {
                        let user = req.context_string(CTX_USER).unwrap_or_default();
                        Ok(Response::text(user))
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp.body_bytes(), bytes::Bytes::from_static(b"alice"));
    }

    #[tokio::test]
    async fn rate_limit_answers_429_with_retry_after() {
        let limiter = RateLimitMiddleware::new(2, Duration::from_secs(60)).key_header("x-client");
        for _ in 0..2 {
            let req = Request::new("GET", "/").with_header("x-client", "a");
            let resp = limiter.handle(req, Box::new(|req| ok_handler()(req))).await.unwrap();
            assert_eq!(resp.status, 200);
        }
        let req = Request::new("GET", "/").with_header("x-client", "a");
        let resp = limiter.handle(req, Box::new(|req| ok_handler()(req))).await.unwrap();
        assert_eq!(resp.status, 429);
        assert!(resp.header("retry-after").is_some());

        // A different client is unaffected.
        let req = Request::new("GET", "/").with_header("x-client", "b");
        let resp = limiter.handle(req, Box::new(|req| ok_handler()(req))).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn request_id_propagates_and_generates() {
        let req = Request::new("GET", "/").with_header("x-request-id", "fixed");
        let resp = RequestIdMiddleware
            .handle(req, Box::new(|req| ok_handler()(req)))
            .await
            .unwrap();
        assert_eq!(resp.header("x-request-id"), Some(&"fixed".to_string()));

        let resp = RequestIdMiddleware
            .handle(Request::new("GET", "/"), Box::new(|req| ok_handler()(req)))
            .await
            .unwrap();
        assert!(!resp.header("x-request-id").unwrap().is_empty());
    }

    #[tokio::test]
    async fn security_headers_are_applied() {
        let resp = SecurityHeadersMiddleware::new()
            .handle(Request::new("GET", "/"), Box::new(|req| ok_handler()(req)))
            .await
            .unwrap();
        assert_eq!(resp.header("x-frame-options"), Some(&"DENY".to_string()));
        assert_eq!(resp.header("x-content-type-options"), Some(&"nosniff".to_string()));
        assert!(resp.header("referrer-policy").is_some());
        assert!(resp.header("permissions-policy").is_some());
        assert!(resp.header("x-xss-protection").is_some());
    }

    #[tokio::test]
    async fn metrics_sink_observes_status_and_size() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink_records = records.clone();
        let metrics = MetricsMiddleware::new(move |record| {
            sink_records.lock().unwrap().push(record);
        });
        metrics
            .handle(Request::new("GET", "/m"), Box::new(|req| ok_handler()(req)))
            .await
            .unwrap();
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].path, "/m");
        assert_eq!(records[0].body_size, Some(2));
    }

    #[tokio::test]
    async fn timeout_middleware_answers_408_on_expiry() {
        let timeout = TimeoutMiddleware::new(Duration::from_millis(10));
        let resp = timeout
            .handle(
                Request::new("GET", "/slow"),
                Box::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(Response::text("late"))
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 408);
    }

    #[tokio::test]
    async fn timeout_middleware_installs_deadline() {
        let timeout = TimeoutMiddleware::new(Duration::from_secs(5));
        let resp = timeout
            .handle(
                Request::new("GET", "/"),
                Box::new(|req| {
                    Box::pin(async move {
                        assert!(req.deadline().is_some());
                        assert!(!req.is_past_deadline());
                        Ok(Response::text("ok"))
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }
}
