// Application orchestrator and HTTP acceptor
//
// Boot wires the subsystems in a fixed order: validate modules, register
// modules, register plugins, compose the middleware chain onto the router,
// then bind the acceptor. Per connection, an exchange is either a WebSocket
// upgrade or an ordinary request run through the composed handler.

use crate::compression::maybe_compress;
use crate::http::Body;
use crate::module::{validate_modules, Module, ModuleRegistry};
use crate::plugin::{dispose_plugins, register_plugins, Plugin};
use crate::router::{Handler, Router};
use crate::websocket::{handle_upgrade, is_upgrade};
use crate::{AppConfig, Container, Error, Middleware, MiddlewareChain, Request, Response};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub(crate) type OutBody = UnsyncBoxBody<Bytes, Error>;

pub(crate) fn empty_out_body() -> OutBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed_unsync()
}

/// Wire adapter: status first, then headers verbatim (stored lower-case),
/// then buffered bytes or streamed chunks.
pub(crate) fn hyper_response(response: Response) -> hyper::Response<OutBody> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body: OutBody = match response.body {
        Body::Buffered(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
        Body::Stream(stream) => match stream.take() {
            Some(inner) => {
                StreamBody::new(inner.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
            }
            // Restartable-once: a consumed stream has nothing left to write.
            None => empty_out_body(),
        },
    };
    builder.body(body).unwrap_or_else(|err| {
        error!(error = %err, "invalid response metadata; writing bare 500");
        let mut fallback = hyper::Response::new(empty_out_body());
        *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

/// Build the Request value shared by HTTP and WebSocket dispatch: upper-case
/// method, normalized path, query map, lower-cased headers with multi-values
/// joined `", "`, cookies parsed.
pub(crate) fn base_request<B>(req: &hyper::Request<B>) -> Request {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = Request::new(req.method().as_str(), target);
    for name in req.headers().keys() {
        let values: Vec<&str> = req
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !values.is_empty() {
            request = request.with_header(name.as_str(), &values.join(", "));
        }
    }
    request.with_cookies_from_headers()
}

#[derive(Clone)]
struct Engine {
    handler: Handler,
    chain: MiddlewareChain,
    router: Arc<Router>,
    max_body: Option<usize>,
    compression: bool,
}

/// Triggers a graceful shutdown of a listening [`App`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }
}

/// The application: container, root router, middleware, modules, plugins,
/// and the acceptor.
pub struct App {
    container: Container,
    router: Router,
    chain: MiddlewareChain,
    modules: Vec<Arc<dyn Module>>,
    plugins: Vec<Arc<dyn Plugin>>,
    config: AppConfig,
    registry: ModuleRegistry,
    engine: Option<Engine>,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl App {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            container: Container::new(),
            router: Router::new(),
            chain: MiddlewareChain::new(),
            modules: Vec::new(),
            plugins: Vec::new(),
            config,
            registry: ModuleRegistry::new(),
            engine: None,
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The root router; register routes here before boot.
    pub fn router(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Append a middleware; the first added is outermost.
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.chain.use_middleware(middleware);
        self
    }

    pub fn add_module(&mut self, module: Arc<dyn Module>) -> &mut Self {
        self.modules.push(module);
        self
    }

    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    /// Diagnostics: everything registered, including module mounts.
    pub fn routes(&self) -> Vec<String> {
        match &self.engine {
            Some(engine) => engine.router.routes(),
            None => self.router.routes(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.shutdown_notify.clone(),
        }
    }

    /// Run the boot sequence. Idempotent; any failure aborts and propagates.
    pub async fn boot(&mut self) -> Result<(), Error> {
        if self.engine.is_some() {
            return Ok(());
        }

        validate_modules(&self.modules)?;

        let mut root = std::mem::take(&mut self.router);
        self.registry
            .register_all(&self.modules, &self.container, &mut root, &self.config)
            .await?;
        register_plugins(&self.plugins, &self.container, &mut root, &self.config).await?;

        let router = Arc::new(root);
        let dispatch: Handler = {
            let router = router.clone();
            Arc::new(move |req| {
                let router = router.clone();
                Box::pin(async move { router.dispatch(req).await })
            })
        };
        let handler = self.chain.compose(dispatch);

        self.engine = Some(Engine {
            handler,
            chain: self.chain.clone(),
            router,
            max_body: self.config.max_request_body_bytes,
            compression: self.config.enable_compression,
        });
        info!(
            modules = self.registry.registered_names().len(),
            plugins = self.plugins.len(),
            middlewares = self.chain.len(),
            "application booted"
        );
        Ok(())
    }

    /// Run one request through the composed pipeline without a socket.
    /// Requires a prior [`App::boot`].
    pub async fn handle(&self, req: Request) -> Result<Response, Error> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| Error::internal("app not booted; call boot() first"))?;
        (engine.handler)(req).await
    }

    /// Boot if needed, bind the acceptor per the configured host/port, and
    /// serve until the shutdown handle fires.
    pub async fn listen(self) -> Result<(), Error> {
        let mut addrs = tokio::net::lookup_host((self.config.host.as_str(), self.config.port)).await?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::internal(format!("cannot resolve host {}", self.config.host)))?;
        drop(addrs);
        let listener = bind_listener(addr, self.config.shared)?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (port 0 callers bind themselves to
    /// learn the address). Performs the graceful shutdown sequence on exit.
    pub async fn serve(mut self, listener: tokio::net::TcpListener) -> Result<(), Error> {
        self.boot().await?;
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| Error::internal("boot did not produce an engine"))?;

        let local = listener.local_addr()?;

        let tls_acceptor = self
            .config
            .security
            .as_ref()
            .map(|tls| TlsAcceptor::from(tls.server_config.clone()));
        let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
        info!(addr = %local, scheme = scheme, "server listening");

        let idle = self.config.idle_timeout;
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => {
                    debug!("shutdown requested; closing acceptor");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let engine = engine.clone();
                            let tls_acceptor = tls_acceptor.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, peer, engine, tls_acceptor, idle).await;
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Graceful shutdown: modules `on_destroy` in reverse, plugins
    /// `on_dispose` in reverse, container disposal, acceptor close.
    /// Re-entry is a no-op.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down application");
        self.registry.destroy_all().await;
        dispose_plugins(&self.plugins).await;
        self.container.dispose();
        self.shutdown_notify.notify_one();
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_listener(addr: SocketAddr, shared: bool) -> Result<tokio::net::TcpListener, Error> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    {
        if shared {
            socket.set_reuseport(true)?;
        }
    }
    #[cfg(not(unix))]
    {
        if shared {
            warn!("shared port requested but SO_REUSEPORT is unavailable on this platform");
        }
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
    tls_acceptor: Option<TlsAcceptor>,
    idle: Option<Duration>,
) {
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(handle_exchange(req, engine).await) }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    if let Some(idle) = idle {
        // Applies between exchanges; an active request is never preempted.
        builder.header_read_timeout(idle);
    }

    match tls_acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let conn = builder
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .with_upgrades();
                if let Err(err) = conn.await {
                    debug!(peer = %peer, error = %err, "connection ended with error");
                }
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "TLS handshake failed");
            }
        },
        None => {
            let conn = builder
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(err) = conn.await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        }
    }
}

async fn handle_exchange(req: hyper::Request<Incoming>, engine: Engine) -> hyper::Response<OutBody> {
    if is_upgrade(&req) {
        return handle_upgrade(req, engine.router.clone()).await;
    }

    let base = base_request(&req);
    let body = req.into_body();
    let collected = match engine.max_body {
        Some(cap) => match Limited::new(body, cap).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() => Err(
                Error::PayloadTooLarge(format!("request body exceeds {} bytes", cap)),
            ),
            Err(err) => Err(Error::Internal(format!("failed to read request body: {}", err))),
        },
        None => match body.collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) => Err(Error::Internal(format!("failed to read request body: {}", err))),
        },
    };

    let (request, result) = match collected {
        Ok(bytes) => {
            let request = base.with_body(bytes);
            let result = (engine.handler)(request.clone()).await;
            (request, result)
        }
        Err(Error::PayloadTooLarge(message)) => {
            // The cap violation takes the same path as any handler failure:
            // through the declared middlewares (body left empty), so an
            // installed error trap maps it to 413 and a bare chain falls
            // through to the 500 writer below.
            let terminal: Handler = Arc::new(move |_req| {
                let message = message.clone();
                Box::pin(async move { Err(Error::PayloadTooLarge(message)) })
            });
            let result = engine.chain.apply(base.clone(), terminal).await;
            (base, result)
        }
        Err(err) => {
            return hyper_response(Response::from_error(&err));
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            // Nothing below caught it; write the canonical 500 directly.
            error!(error = %err, "unhandled failure reached the writer");
            Response::json_error(500, "Internal Server Error")
        }
    };

    let response = if engine.compression {
        maybe_compress(&request, response)
    } else {
        response
    };
    hyper_response(response)
}
