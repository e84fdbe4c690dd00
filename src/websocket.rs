// WebSocket support
//
// Upgrade handling sits on hyper's upgrade machinery with tungstenite
// driving the framing. A session wraps one upgraded connection and carries
// the originating request plus its bound params.

use crate::application::{base_request, hyper_response, OutBody};
use crate::http::CTX_ORIGINAL_PATH;
use crate::router::{normalize_path, Router};
use crate::{Error, Request, Response};
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error};

/// Byte transport a session can run over: the upgraded connection in
/// production, an in-memory duplex in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// WebSocket message as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<WsMessage> for Message {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Message::Text(text),
            WsMessage::Binary(data) => Message::Binary(data),
            WsMessage::Ping(data) => Message::Ping(data),
            WsMessage::Pong(data) => Message::Pong(data),
            WsMessage::Close(_) => Message::Close,
            _ => Message::Close,
        }
    }
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsMessage::Text(text),
            Message::Binary(data) => WsMessage::Binary(data),
            Message::Ping(data) => WsMessage::Ping(data),
            Message::Pong(data) => WsMessage::Pong(data),
            Message::Close => WsMessage::Close(None),
        }
    }
}

/// One upgraded connection. Clones share the underlying socket; the runtime
/// keeps one clone so it can close the socket when a handler fails.
#[derive(Clone)]
pub struct WebSocketSession {
    stream: Arc<tokio::sync::Mutex<WebSocketStream<Box<dyn Transport>>>>,
    /// The originating upgrade request, params merged and path overwritten
    /// to the matched normalized path.
    pub request: Request,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl WebSocketSession {
    /// Wrap an established server-role stream. Used by the runtime after an
    /// upgrade; also the entry point for driving a session over an
    /// in-memory transport.
    pub fn from_stream(stream: WebSocketStream<Box<dyn Transport>>, request: Request) -> Self {
        let params = request.params.clone();
        let query = request.query.clone();
        Self {
            stream: Arc::new(tokio::sync::Mutex::new(stream)),
            request,
            params,
            query,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        let mut stream = self.stream.lock().await;
        stream.send(WsMessage::Text(text.into())).await.map_err(ws_err)
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        let mut stream = self.stream.lock().await;
        stream.send(WsMessage::Binary(data)).await.map_err(ws_err)
    }

    /// UTF-8 JSON encode and send as a text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let json = serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.send_text(json).await
    }

    /// Next inbound frame; `None` once the peer is gone.
    pub async fn next_message(&self) -> Option<Result<Message, Error>> {
        let mut stream = self.stream.lock().await;
        match stream.next().await? {
            Ok(msg) => Some(Ok(Message::from(msg))),
            Err(err) => Some(Err(ws_err(err))),
        }
    }

    /// Clean close, no frame payload.
    pub async fn close(&self) -> Result<(), Error> {
        let mut stream = self.stream.lock().await;
        map_close(stream.close(None).await)
    }

    /// Close with an explicit code and reason.
    pub async fn close_with_code(&self, code: u16, reason: &str) -> Result<(), Error> {
        let mut stream = self.stream.lock().await;
        map_close(
            stream
                .close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                }))
                .await,
        )
    }

    /// Close with the protocol-error code and the failure text as reason.
    pub async fn close_with_error(&self, err: &Error) -> Result<(), Error> {
        let mut stream = self.stream.lock().await;
        map_close(
            stream
                .close(Some(CloseFrame {
                    code: CloseCode::Protocol,
                    reason: err.to_string().into(),
                }))
                .await,
        )
    }
}

fn ws_err(err: WsError) -> Error {
    Error::Internal(format!("websocket failure: {}", err))
}

// Closing an already-closed socket is a no-op, not a failure.
fn map_close(result: Result<(), WsError>) -> Result<(), Error> {
    match result {
        Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
        Err(err) => Err(ws_err(err)),
    }
}

/// Discriminate a WebSocket upgrade exchange: an `upgrade` header valued
/// `websocket`.
pub(crate) fn is_upgrade(req: &hyper::Request<Incoming>) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Route and perform a WebSocket upgrade. An unmatched path answers the
/// canonical 404; invalid upgrade headers answer 400; a matched route
/// returns 101 and hands the upgraded socket to the handler on its own task.
pub(crate) async fn handle_upgrade(
    mut hyper_req: hyper::Request<Incoming>,
    router: Arc<Router>,
) -> hyper::Response<OutBody> {
    let raw_path = hyper_req.uri().path().to_string();
    let method = hyper_req.method().to_string().to_ascii_uppercase();

    let Some(matched) = router.match_websocket(&raw_path) else {
        debug!(path = %raw_path, "no WebSocket route");
        return hyper_response(Response::from_error(&Error::RouteNotFound(format!(
            "{} {}",
            method,
            normalize_path(&raw_path)
        ))));
    };

    let headers = hyper_req.headers();
    let key = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let version_ok = headers
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "13")
        .unwrap_or(false);

    let (Some(key), true) = (key, version_ok) else {
        let err = Error::WebSocketUpgradeFailed(
            "missing sec-websocket-key or unsupported version".to_string(),
        );
        return hyper_response(Response::from_error(&err));
    };

    let request = base_request(&hyper_req)
        .with_context_if_absent(CTX_ORIGINAL_PATH, normalize_path(&raw_path))
        .with_path(&matched.path)
        .with_params(matched.params.clone());

    let accept = derive_accept_key(key.as_bytes());
    let handler = matched.handler.clone();
    let on_upgrade = hyper::upgrade::on(&mut hyper_req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                error!(error = %err, "websocket upgrade did not complete");
                return;
            }
        };
        let io: Box<dyn Transport> = Box::new(TokioIo::new(upgraded));
        let stream = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        let session = WebSocketSession::from_stream(stream, request);
        let runtime_handle = session.clone();

        if let Err(err) = handler(session).await {
            error!(error = %err, "websocket handler failed");
            let _ = runtime_handle.close_with_error(&err).await;
        }
    });

    let response = hyper::Response::builder()
        .status(101)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept)
        .body(crate::application::empty_out_body());
    match response {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "failed to build 101 response");
            hyper_response(Response::from_error(&Error::WebSocketUpgradeFailed(
                err.to_string(),
            )))
        }
    }
}
