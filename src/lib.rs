//! gantry: an embeddable HTTP/WebSocket service runtime.
//!
//! The crate composes a trie-based router with WebSocket upgrade routing, an
//! onion-model middleware pipeline, a type-keyed dependency-injection
//! container, dependency-ordered modules, linear plugins, and a hyper/tokio
//! acceptor.
//!
//! ```no_run
//! use gantry::{App, Response};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gantry::Error> {
//!     let mut app = App::new();
//!     app.router().get("/users/:id", |req| async move {
//!         Response::json(&serde_json::json!({ "userId": req.param("id") }))
//!     })?;
//!     app.listen().await
//! }
//! ```

pub mod application;
pub mod compression;
pub mod config;
pub mod container;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod module;
pub mod plugin;
pub mod router;
pub mod tls;
pub mod websocket;

pub use application::{App, ShutdownHandle};
pub use config::AppConfig;
pub use container::Container;
pub use error::Error;
pub use http::{Body, ChunkStream, ContextValue, Cookie, Request, Response};
pub use middleware::{
    AuthMiddleware, CorsMiddleware, ErrorTrapMiddleware, LoggingMiddleware, MetricsMiddleware,
    MetricsRecord, Middleware, MiddlewareChain, Next, RateLimitMiddleware, RequestIdMiddleware,
    SecurityHeadersMiddleware, TimeoutMiddleware,
};
pub use module::{export, Module, ModuleContext, ModuleRegistry};
pub use plugin::{Plugin, PluginContext};
pub use router::{handler, normalize_path, ws_handler, Handler, HandlerFuture, Router, WsHandler, WsMatch};
pub use tls::TlsConfig;
pub use websocket::{Message, WebSocketSession};
