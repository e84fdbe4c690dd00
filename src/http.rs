// HTTP request and response values
//
// Both types are immutable in the pipeline sense: middleware and handlers
// never mutate a value in place, they build a modified copy with the
// consuming `with_*` methods and pass it downstream.

use crate::router::normalize_path;
use crate::Error;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Opaque per-request context value.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Context key for the pre-mount-strip request path.
pub const CTX_ORIGINAL_PATH: &str = "_originalPath";
/// Context key for the authenticated principal.
pub const CTX_USER: &str = "user";
/// Context key for the request id.
pub const CTX_REQUEST_ID: &str = "requestId";
/// Context key for the request deadline.
pub const CTX_DEADLINE: &str = "deadline";

/// A single request cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    /// Parse a `cookie` request header into its pairs, in header order.
    pub fn parse_header(raw: &str) -> Vec<Cookie> {
        raw.split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                let (name, value) = pair.split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                Some(Cookie {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                })
            })
            .collect()
    }
}

/// HTTP request value.
///
/// Created once per accepted exchange (or WebSocket upgrade), then passed by
/// value through the middleware chain to the matched handler.
#[derive(Clone)]
pub struct Request {
    /// Upper-cased verb.
    pub method: String,
    /// The request target as received.
    pub uri: String,
    /// Normalized path (leading `/`, no trailing `/` except root).
    pub path: String,
    /// Path parameters bound by the router.
    pub params: HashMap<String, String>,
    /// Query parameters parsed from the URI.
    pub query: HashMap<String, String>,
    /// Headers with lower-cased keys; multi-valued headers joined with `", "`.
    pub headers: HashMap<String, String>,
    /// Cookies in header order.
    pub cookies: Vec<Cookie>,
    context: HashMap<String, ContextValue>,
    body: Bytes,
    // Shared across copies so a repeated json() never re-parses.
    json_cache: Arc<OnceLock<Option<serde_json::Value>>>,
}

impl Request {
    /// Fabricate a request without a socket. Normalizes the method to
    /// upper-case, splits the query string off the URI, and normalizes the
    /// path.
    pub fn new(method: &str, uri: &str) -> Self {
        let (path, query_string) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };
        Self {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            path: normalize_path(path),
            params: HashMap::new(),
            query: query_string.map(parse_query_string).unwrap_or_default(),
            headers: HashMap::new(),
            cookies: Vec::new(),
            context: HashMap::new(),
            body: Bytes::new(),
            json_cache: Arc::new(OnceLock::new()),
        }
    }

    /// Get a path parameter by name.
    pub fn param(&self, name: &str) -> Option<&String> {
        self.params.get(name)
    }

    /// Get a query parameter by name.
    pub fn query_param(&self, name: &str) -> Option<&String> {
        self.query.get(name)
    }

    /// Get a header by name (case-insensitive; keys are stored lower-case).
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Get a cookie by name.
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// The buffered request body. Always the same bytes for a given request.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parse the body as JSON. The parse happens once; repeat calls return
    /// the cached value. A parse failure signals [`Error::MalformedBody`].
    pub fn json(&self) -> Result<serde_json::Value, Error> {
        let cached = self
            .json_cache
            .get_or_init(|| serde_json::from_slice(&self.body).ok());
        cached
            .clone()
            .ok_or_else(|| Error::MalformedBody("request body is not valid JSON".to_string()))
    }

    /// Deserialize the body into a concrete type.
    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::MalformedBody(e.to_string()))
    }

    /// Typed context lookup.
    pub fn context<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.context.get(key).and_then(|v| v.clone().downcast::<T>().ok())
    }

    /// Convenience for `String`-valued context entries.
    pub fn context_string(&self, key: &str) -> Option<String> {
        self.context::<String>(key).map(|s| (*s).clone())
    }

    /// The pre-mount-strip path, when this request was delegated through a
    /// mount.
    pub fn original_path(&self) -> Option<String> {
        self.context_string(CTX_ORIGINAL_PATH)
    }

    /// The request deadline, when one was installed.
    pub fn deadline(&self) -> Option<Instant> {
        self.context::<Instant>(CTX_DEADLINE).map(|i| *i)
    }

    /// True once the installed deadline has passed.
    pub fn is_past_deadline(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Copy with an added header (key lower-cased).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Copy with a replaced body. Drops the JSON parse cache.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.json_cache = Arc::new(OnceLock::new());
        self
    }

    /// Copy with a replaced (re-normalized) path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    /// Copy with additional path parameters merged in.
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    /// Copy with a context entry added.
    pub fn with_context<T: Any + Send + Sync>(mut self, key: &str, value: T) -> Self {
        self.context.insert(key.to_string(), Arc::new(value));
        self
    }

    /// Copy with an already-erased context value added.
    pub fn with_context_value(mut self, key: &str, value: ContextValue) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Copy with a context entry added only when the key is absent.
    pub fn with_context_if_absent<T: Any + Send + Sync>(mut self, key: &str, value: T) -> Self {
        if !self.context.contains_key(key) {
            self.context.insert(key.to_string(), Arc::new(value));
        }
        self
    }

    /// Copy with a deadline installed under [`CTX_DEADLINE`].
    pub fn with_deadline(self, deadline: Instant) -> Self {
        self.with_context(CTX_DEADLINE, deadline)
    }

    /// Copy with cookies parsed from the `cookie` header.
    pub(crate) fn with_cookies_from_headers(mut self) -> Self {
        if let Some(raw) = self.headers.get("cookie") {
            self.cookies = Cookie::parse_header(raw);
        }
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("query", &self.query)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((name, value)) => params.insert(name.to_string(), value.to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    params
}

/// A stream of body chunks that can be taken exactly once by the writer.
#[derive(Clone)]
pub struct ChunkStream {
    inner: Arc<Mutex<Option<BoxStream<'static, Result<Bytes, Error>>>>>,
}

impl ChunkStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(stream)))),
        }
    }

    /// Yield the inner stream. Returns `None` once consumed.
    pub fn take(&self) -> Option<BoxStream<'static, Result<Bytes, Error>>> {
        self.inner.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkStream")
    }
}

/// Response body: fully buffered bytes or a stream of chunks, never both.
#[derive(Debug, Clone)]
pub enum Body {
    Buffered(Bytes),
    Stream(ChunkStream),
}

impl Body {
    pub fn empty() -> Self {
        Body::Buffered(Bytes::new())
    }

    /// Buffered length; `None` for streams.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Buffered(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Buffered(bytes) if bytes.is_empty())
    }
}

/// HTTP response value. Produced by handlers and middleware, consumed exactly
/// once by the wire adapter.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Header keys are stored lower-case and written verbatim.
    pub headers: HashMap<String, String>,
    pub body: Body,
}

impl Response {
    /// Bare response with the given status and no body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Body::empty(),
        }
    }

    /// 200 with `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::status(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(Bytes::from(body.into()))
    }

    /// 200 with `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        Self::status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(Bytes::from(body.into()))
    }

    /// 200 with `application/json; charset=utf-8`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::status(200)
            .with_header("content-type", "application/json; charset=utf-8")
            .with_body(Bytes::from(bytes)))
    }

    /// 200 with `application/octet-stream` (override with
    /// [`Response::with_content_type`]).
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::status(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(body.into())
    }

    /// Streamed body, unbuffered. Defaults to `application/octet-stream`.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self {
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/octet-stream".to_string(),
            )]),
            body: Body::Stream(ChunkStream::new(stream)),
        }
    }

    /// Redirect with a `location` header, default status 302.
    pub fn redirect(location: &str) -> Self {
        Self::status(302).with_header("location", location)
    }

    /// Empty body, default status 204.
    pub fn empty() -> Self {
        Self::status(204)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::json_error(404, &message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::json_error(400, &message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::json_error(401, &message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::json_error(403, &message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::json_error(500, &message.into())
    }

    /// Build the canonical response for an error kind: the status from
    /// [`Error::status_code`] and the error's display text as the
    /// `{"error": ...}` body.
    pub fn from_error(err: &Error) -> Self {
        Self::json_error(err.status_code(), &err.to_string())
    }

    /// `{"error": <message>}` with the given status.
    pub fn json_error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message });
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        Self::status(status)
            .with_header("content-type", "application/json; charset=utf-8")
            .with_body(Bytes::from(bytes))
    }

    /// Copy with a replaced status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Copy with one header set (key lower-cased).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Copy with headers merged in; new entries override existing ones.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value);
        }
        self
    }

    /// Copy with a replaced content type.
    pub fn with_content_type(self, content_type: &str) -> Self {
        self.with_header("content-type", content_type)
    }

    /// Copy with a replaced buffered body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Buffered(body.into());
        self
    }

    /// Copy with the body emptied (HEAD fallback strip).
    pub fn without_body(mut self) -> Self {
        self.body = Body::empty();
        self
    }

    /// Header lookup (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Buffered body bytes; empty for streams.
    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            Body::Buffered(bytes) => bytes.clone(),
            Body::Stream(_) => Bytes::new(),
        }
    }
}
