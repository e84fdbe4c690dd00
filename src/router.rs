// Routing: a segment trie per HTTP router plus a parallel WebSocket trie.
//
// Matching is depth-first with static children preferred over the parameter
// child at every node, with backtracking. Mounts are consulted before the
// local trie, in insertion order; the first mount whose prefix matches
// consumes the request and its answer is final.

use crate::http::CTX_ORIGINAL_PATH;
use crate::websocket::WebSocketSession;
use crate::{Error, Request, Response};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by route handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, Error>> + Send>>;

/// A boxed route handler.
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// A boxed WebSocket handler. Owns the session for the life of the socket.
pub type WsHandler =
    Arc<dyn Fn(WebSocketSession) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler<H, Fut>(f: H) -> Handler
where
    H: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Wrap an async function as a [`WsHandler`].
pub fn ws_handler<H, Fut>(f: H) -> WsHandler
where
    H: Fn(WebSocketSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// Normalize a path: ensure a leading `/`, strip a single trailing `/`
/// unless the path is `"/"`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.truncate(normalized.len() - 1);
    }
    normalized
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

// A mount prefix consumes a path when the remainder is empty or sits on a
// segment boundary; `/api` must not capture `/apix`.
fn mount_remainder(path: &str, prefix: &str) -> Option<String> {
    if prefix == "/" {
        return Some(path.to_string());
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("/".to_string())
    } else if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

#[derive(Default)]
struct Node {
    statics: HashMap<String, Node>,
    param: Option<Box<ParamChild>>,
    methods: HashMap<String, Handler>,
}

struct ParamChild {
    name: String,
    node: Node,
}

#[derive(Default)]
struct WsNode {
    statics: HashMap<String, WsNode>,
    param: Option<Box<WsParamChild>>,
    handler: Option<WsHandler>,
}

struct WsParamChild {
    name: String,
    node: WsNode,
}

/// A successful WebSocket route match.
pub struct WsMatch {
    pub params: HashMap<String, String>,
    pub handler: WsHandler,
    /// The normalized path the match was made against (post mount strip).
    pub path: String,
}

/// Trie-based router with nested mounts and a parallel WebSocket trie.
#[derive(Default)]
pub struct Router {
    root: Node,
    ws_root: WsNode,
    mounts: Vec<(String, Router)>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `(method, pattern)`. The method is upper-cased;
    /// `*` registers a wildcard serving any method except `OPTIONS`.
    /// Registering the same `(method, pattern)` twice fails with
    /// [`Error::AlreadyRegistered`].
    pub fn route<H, Fut>(&mut self, method: &str, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.add_route(method, pattern, handler(f))
    }

    /// Register a pre-boxed handler.
    pub fn add_route(
        &mut self,
        method: &str,
        pattern: &str,
        handler: Handler,
    ) -> Result<&mut Self, Error> {
        let method = method.to_ascii_uppercase();
        let normalized = normalize_path(pattern);
        let mut node = &mut self.root;
        for segment in split_segments(&normalized) {
            if let Some(name) = segment.strip_prefix(':') {
                let child = node.param.get_or_insert_with(|| {
                    Box::new(ParamChild {
                        // First binder wins; a later pattern reuses the
                        // existing binding.
                        name: name.to_string(),
                        node: Node::default(),
                    })
                });
                node = &mut child.node;
            } else {
                node = node.statics.entry(segment.to_string()).or_default();
            }
        }
        if node.methods.contains_key(&method) {
            return Err(Error::AlreadyRegistered(format!("{} {}", method, normalized)));
        }
        node.methods.insert(method, handler);
        Ok(self)
    }

    pub fn get<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("GET", pattern, f)
    }

    pub fn post<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("POST", pattern, f)
    }

    pub fn put<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("PUT", pattern, f)
    }

    pub fn delete<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("DELETE", pattern, f)
    }

    pub fn patch<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("PATCH", pattern, f)
    }

    pub fn head<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("HEAD", pattern, f)
    }

    pub fn options<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("OPTIONS", pattern, f)
    }

    /// Wildcard: serves any method except `OPTIONS`.
    pub fn any<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        self.route("*", pattern, f)
    }

    /// Register a WebSocket handler for `pattern`. One handler per pattern.
    pub fn ws<H, Fut>(&mut self, pattern: &str, f: H) -> Result<&mut Self, Error>
    where
        H: Fn(WebSocketSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.add_ws_route(pattern, ws_handler(f))
    }

    /// Register a pre-boxed WebSocket handler.
    pub fn add_ws_route(&mut self, pattern: &str, handler: WsHandler) -> Result<&mut Self, Error> {
        let normalized = normalize_path(pattern);
        let mut node = &mut self.ws_root;
        for segment in split_segments(&normalized) {
            if let Some(name) = segment.strip_prefix(':') {
                let child = node.param.get_or_insert_with(|| {
                    Box::new(WsParamChild {
                        name: name.to_string(),
                        node: WsNode::default(),
                    })
                });
                node = &mut child.node;
            } else {
                node = node.statics.entry(segment.to_string()).or_default();
            }
        }
        if node.handler.is_some() {
            return Err(Error::AlreadyRegistered(format!("WS {}", normalized)));
        }
        node.handler = Some(handler);
        Ok(self)
    }

    /// Attach `sub` under `prefix`. Mounts are matched before the local trie,
    /// in insertion order; the prefix is stripped exactly once before
    /// delegation and the original path is kept under
    /// `context["_originalPath"]`.
    pub fn mount(&mut self, prefix: &str, sub: Router) -> &mut Self {
        self.mounts.push((normalize_path(prefix), sub));
        self
    }

    /// Route a request to its handler and produce the response, applying the
    /// method-resolution policy (HEAD fallback, wildcard, synthesized
    /// OPTIONS, 405 with `allow`). A missing route is answered with the
    /// canonical 404 body, never an error. Boxed so the recursion through
    /// mounts stays expressible.
    pub fn dispatch(
        &self,
        req: Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = req.path.clone();

            for (prefix, sub) in &self.mounts {
                if let Some(remainder) = mount_remainder(&path, prefix) {
                    let derived = req
                        .with_context_if_absent(CTX_ORIGINAL_PATH, path.clone())
                        .with_path(&remainder);
                    return sub.dispatch(derived).await;
                }
            }

            let mut bound = Vec::new();
            match find(&self.root, &split_segments(&path), &mut bound) {
                None => Ok(Response::from_error(&Error::RouteNotFound(format!(
                    "{} {}",
                    req.method, path
                )))),
                Some(node) => {
                    let req = req.with_params(bound.into_iter().collect());
                    resolve_method(node, req).await
                }
            }
        })
    }

    /// Match the WebSocket trie. Mounts are consulted first (recursively);
    /// the first mount whose prefix matches decides.
    pub fn match_websocket(&self, path: &str) -> Option<WsMatch> {
        let path = normalize_path(path);
        for (prefix, sub) in &self.mounts {
            if let Some(remainder) = mount_remainder(&path, prefix) {
                return sub.match_websocket(&remainder);
            }
        }
        let mut bound = Vec::new();
        let node = find_ws(&self.ws_root, &split_segments(&path), &mut bound)?;
        node.handler.clone().map(|handler| WsMatch {
            params: bound.into_iter().collect(),
            handler,
            path,
        })
    }

    /// Human-readable listing of everything registered, for diagnostics.
    /// `HEAD` entries implied by a `GET` are suppressed.
    pub fn routes(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (prefix, _) in &self.mounts {
            out.push(format!("MOUNT {} -> [nested router]", prefix));
        }
        collect_routes(&self.root, "", &mut out);
        collect_ws_routes(&self.ws_root, "", &mut out);
        out
    }
}

fn find<'a>(node: &'a Node, segments: &[&str], bound: &mut Vec<(String, String)>) -> Option<&'a Node> {
    if segments.is_empty() {
        return if node.methods.is_empty() { None } else { Some(node) };
    }
    let (head, rest) = (segments[0], &segments[1..]);
    if let Some(child) = node.statics.get(head) {
        if let Some(found) = find(child, rest, bound) {
            return Some(found);
        }
    }
    if let Some(param) = &node.param {
        bound.push((param.name.clone(), head.to_string()));
        if let Some(found) = find(&param.node, rest, bound) {
            return Some(found);
        }
        bound.pop();
    }
    None
}

fn find_ws<'a>(
    node: &'a WsNode,
    segments: &[&str],
    bound: &mut Vec<(String, String)>,
) -> Option<&'a WsNode> {
    if segments.is_empty() {
        return if node.handler.is_some() { Some(node) } else { None };
    }
    let (head, rest) = (segments[0], &segments[1..]);
    if let Some(child) = node.statics.get(head) {
        if let Some(found) = find_ws(child, rest, bound) {
            return Some(found);
        }
    }
    if let Some(param) = &node.param {
        bound.push((param.name.clone(), head.to_string()));
        if let Some(found) = find_ws(&param.node, rest, bound) {
            return Some(found);
        }
        bound.pop();
    }
    None
}

async fn resolve_method(node: &Node, req: Request) -> Result<Response, Error> {
    let method = req.method.clone();

    if let Some(handler) = node.methods.get(&method) {
        return handler(req).await;
    }
    if method == "HEAD" {
        if let Some(get) = node.methods.get("GET") {
            // GET's status and headers, empty bytes.
            let response = get(req).await?;
            return Ok(response.without_body());
        }
    }
    if method == "OPTIONS" {
        return Ok(Response::empty().with_header("allow", &allowed_methods(&node.methods)));
    }
    if let Some(wildcard) = node.methods.get("*") {
        return wildcard(req).await;
    }
    Ok(Response::from_error(&Error::MethodNotAllowed(method))
        .with_header("allow", &allowed_methods(&node.methods)))
}

fn allowed_methods(table: &HashMap<String, Handler>) -> String {
    let mut set: BTreeSet<String> = table.keys().cloned().collect();
    if set.remove("*") {
        for m in ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"] {
            set.insert(m.to_string());
        }
    }
    if set.contains("GET") {
        set.insert("HEAD".to_string());
    }
    set.insert("OPTIONS".to_string());
    set.into_iter().collect::<Vec<_>>().join(", ")
}

fn collect_routes(node: &Node, pattern: &str, out: &mut Vec<String>) {
    let shown = if pattern.is_empty() { "/" } else { pattern };
    let mut methods: Vec<&String> = node.methods.keys().collect();
    methods.sort();
    for method in methods {
        if method == "HEAD" && node.methods.contains_key("GET") {
            continue;
        }
        out.push(format!("{} {}", method, shown));
    }
    let mut tokens: Vec<&String> = node.statics.keys().collect();
    tokens.sort();
    for token in tokens {
        collect_routes(&node.statics[token], &format!("{}/{}", pattern, token), out);
    }
    if let Some(param) = &node.param {
        collect_routes(&param.node, &format!("{}/:{}", pattern, param.name), out);
    }
}

fn collect_ws_routes(node: &WsNode, pattern: &str, out: &mut Vec<String>) {
    if node.handler.is_some() {
        let shown = if pattern.is_empty() { "/" } else { pattern };
        out.push(format!("WS {}", shown));
    }
    let mut tokens: Vec<&String> = node.statics.keys().collect();
    tokens.sort();
    for token in tokens {
        collect_ws_routes(&node.statics[token], &format!("{}/{}", pattern, token), out);
    }
    if let Some(param) = &node.param {
        collect_ws_routes(&param.node, &format!("{}/:{}", pattern, param.name), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok_handler(_req: Request) -> Result<Response, Error> {
        Ok(Response::text("ok"))
    }

    #[test]
    fn normalize_path_rules() {
        assert_eq!(normalize_path("users"), "/users");
        assert_eq!(normalize_path("/users/"), "/users");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let mut router = Router::new();
        router.get("/x", ok_handler).unwrap();
        let err = router.get("/x", ok_handler).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        // Same pattern, different method is fine.
        router.post("/x", ok_handler).unwrap();
    }

    #[test]
    fn duplicate_ws_route_is_rejected() {
        let mut router = Router::new();
        router.ws("/ws", |_s| async { Ok(()) }).unwrap();
        let err = router.ws("/ws", |_s| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn static_route_dispatches() {
        let mut router = Router::new();
        router.get("/users", ok_handler).unwrap();
        let resp = router.dispatch(Request::new("GET", "/users")).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn param_route_binds_value() {
        let mut router = Router::new();
        router
            .get("/users/:id", |req: Request| async move {
                Ok(Response::text(req.param("id").cloned().unwrap_or_default()))
            })
            .unwrap();
        let resp = router.dispatch(Request::new("GET", "/users/42")).await.unwrap();
        assert_eq!(resp.body_bytes(), bytes::Bytes::from_static(b"42"));
    }

    #[tokio::test]
    async fn static_beats_param_at_same_position() {
        let mut router = Router::new();
        router
            .get("/users/me", |_req| async { Ok(Response::text("static")) })
            .unwrap();
        router
            .get("/users/:id", |_req| async { Ok(Response::text("param")) })
            .unwrap();
        let resp = router.dispatch(Request::new("GET", "/users/me")).await.unwrap();
        assert_eq!(resp.body_bytes(), bytes::Bytes::from_static(b"static"));
        let resp = router.dispatch(Request::new("GET", "/users/7")).await.unwrap();
        assert_eq!(resp.body_bytes(), bytes::Bytes::from_static(b"param"));
    }

    #[tokio::test]
    async fn backtracks_from_dead_end_static_branch() {
        let mut router = Router::new();
        // `/files/special` exists only as an interior node with no methods;
        // a request for `/files/special/x` must retry via the param child.
        router
            .get("/files/special/archive/manifest", ok_handler)
            .unwrap();
        router
            .get("/files/:name/x", |req: Request| async move {
                Ok(Response::text(req.param("name").cloned().unwrap_or_default()))
            })
            .unwrap();
        let resp = router
            .dispatch(Request::new("GET", "/files/special/x"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_bytes(), bytes::Bytes::from_static(b"special"));
    }

    #[tokio::test]
    async fn root_path_matches_root_node() {
        let mut router = Router::new();
        router.get("/", ok_handler).unwrap();
        let resp = router.dispatch(Request::new("GET", "/")).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn allowed_methods_expands_wildcard_and_get() {
        let mut table: HashMap<String, Handler> = HashMap::new();
        table.insert("*".to_string(), handler(ok_handler));
        assert_eq!(
            allowed_methods(&table),
            "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT"
        );

        let mut table: HashMap<String, Handler> = HashMap::new();
        table.insert("GET".to_string(), handler(ok_handler));
        assert_eq!(allowed_methods(&table), "GET, HEAD, OPTIONS");
    }

    #[test]
    fn route_listing_suppresses_implied_head() {
        let mut router = Router::new();
        router.get("/users", ok_handler).unwrap();
        router.post("/users", ok_handler).unwrap();
        router.get("/users/:id", ok_handler).unwrap();
        router.ws("/ws/:room", |_s| async { Ok(()) }).unwrap();
        router.mount("/api", Router::new());

        let listing = router.routes();
        assert!(listing.contains(&"GET /users".to_string()));
        assert!(listing.contains(&"POST /users".to_string()));
        assert!(listing.contains(&"GET /users/:id".to_string()));
        assert!(listing.contains(&"WS /ws/:room".to_string()));
        assert!(listing.contains(&"MOUNT /api -> [nested router]".to_string()));
        assert!(!listing.iter().any(|r| r.starts_with("HEAD ")));
    }

    #[test]
    fn ws_match_binds_params_and_reports_path() {
        let mut router = Router::new();
        router.ws("/ws/:room", |_s| async { Ok(()) }).unwrap();
        let matched = router.match_websocket("/ws/lobby/").unwrap();
        assert_eq!(matched.params.get("room"), Some(&"lobby".to_string()));
        assert_eq!(matched.path, "/ws/lobby");
        assert!(router.match_websocket("/nope").is_none());
    }

    #[test]
    fn mount_prefix_requires_segment_boundary() {
        assert_eq!(mount_remainder("/api/users", "/api"), Some("/users".to_string()));
        assert_eq!(mount_remainder("/api", "/api"), Some("/".to_string()));
        assert_eq!(mount_remainder("/apix", "/api"), None);
        assert_eq!(mount_remainder("/other", "/api"), None);
    }
}
