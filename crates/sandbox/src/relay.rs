//! NoVNC relay: reverse proxy for the sandbox web UI and a websocket
//! bridge to its remote-desktop stream.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use {
    axum::{
        Json, Router,
        body::Body,
        extract::{
            Path, RawQuery, State,
            ws::{Message, WebSocket, WebSocketUpgrade},
        },
        response::{IntoResponse, Response},
        routing::get,
    },
    bytes::Bytes,
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{Message as BackendMessage, client::IntoClientRequest},
    },
    tracing::{debug, info, warn},
};

use crate::{Result, manager::SandboxManager};

/// Response headers dropped when proxying so the UI can be framed and the
/// body re-chunked by our server.
const STRIPPED_HEADERS: &[&str] = &[
    "x-frame-options",
    "content-security-policy",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame crossing the bridge in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

impl RelayFrame {
    /// Control frames are answered locally and never forwarded.
    fn from_client(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Close(_) => Some(Self::Close),
            Message::Ping(_) | Message::Pong(_) => None,
        }
    }

    fn from_backend(msg: BackendMessage) -> Option<Self> {
        match msg {
            BackendMessage::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            BackendMessage::Binary(data) => Some(Self::Binary(data)),
            BackendMessage::Close(_) => Some(Self::Close),
            BackendMessage::Ping(_) | BackendMessage::Pong(_) | BackendMessage::Frame(_) => None,
        }
    }

    fn into_client(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(data) => Message::Binary(data),
            Self::Close => Message::Close(None),
        }
    }

    fn into_backend(self) -> BackendMessage {
        match self {
            Self::Text(text) => BackendMessage::Text(text.into()),
            Self::Binary(data) => BackendMessage::Binary(data),
            Self::Close => BackendMessage::Close(None),
        }
    }
}

/// Client frames received before the backend connection opened, in arrival order.
#[derive(Debug, Default)]
pub struct PendingFrames {
    frames: VecDeque<RelayFrame>,
}

impl PendingFrames {
    pub fn push(&mut self, frame: RelayFrame) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Take every buffered frame, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<RelayFrame> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Clone)]
struct RelayState {
    sandbox: Arc<SandboxManager>,
    http: reqwest::Client,
}

/// Routes: `GET /api/sandbox`, `GET /novnc/{*path}` and the websocket bridge
/// at `/novnc/<ws_path>`.
pub fn router(sandbox: Arc<SandboxManager>) -> Router {
    let ws_route = format!("/novnc/{}", sandbox.options().ws_path);
    let http = reqwest::Client::builder()
        .connect_timeout(sandbox.options().connect_timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "falling back to default relay http client");
            reqwest::Client::new()
        });
    Router::new()
        .route("/api/sandbox", get(status_handler))
        .route(&ws_route, get(websocket_handler))
        .route("/novnc/{*path}", get(proxy_handler))
        .with_state(RelayState { sandbox, http })
}

fn not_running() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "sandbox is not running" })),
    )
        .into_response()
}

async fn status_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.sandbox.status())
}

async fn proxy_handler(
    State(state): State<RelayState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(base) = state.sandbox.backend_http_url() else {
        return not_running();
    };
    state.sandbox.touch();

    let mut url = format!("{base}/{}", path.trim_start_matches('/'));
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }

    let upstream = match state.http.get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(url = %url, error = %e, "relay proxy request failed");
            return (StatusCode::BAD_GATEWAY, "sandbox unreachable").into_response();
        },
    };

    let status = upstream.status();
    let headers = filter_headers(upstream.headers());
    match upstream.bytes().await {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        },
        Err(e) => {
            warn!(url = %url, error = %e, "relay proxy body read failed");
            (StatusCode::BAD_GATEWAY, "sandbox response truncated").into_response()
        },
    }
}

fn filter_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

async fn websocket_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    let Some(backend_url) = state.sandbox.backend_ws_url() else {
        return not_running();
    };
    let connect_timeout = state.sandbox.options().connect_timeout;
    let sandbox = Arc::clone(&state.sandbox);
    ws.protocols(["binary"])
        .on_upgrade(move |socket| bridge(socket, backend_url, connect_timeout, sandbox))
}

async fn connect_backend(url: &str) -> Result<BackendStream> {
    let mut request = url.into_client_request().map_err(Box::new)?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("binary"),
    );
    let (stream, _) = connect_async(request).await.map_err(Box::new)?;
    Ok(stream)
}

async fn next_client_frame(rx: &mut SplitStream<WebSocket>) -> Option<RelayFrame> {
    loop {
        match rx.next().await? {
            Ok(msg) => {
                if let Some(frame) = RelayFrame::from_client(msg) {
                    return Some(frame);
                }
            },
            Err(e) => {
                debug!(error = %e, "relay client read failed");
                return None;
            },
        }
    }
}

async fn close_client(tx: &mut SplitSink<WebSocket, Message>) {
    let _ = tx.send(Message::Close(None)).await;
}

/// Bridge one browser connection to the sandbox.
///
/// The backend is dialled on the first client frame. Frames arriving while
/// the dial is in flight are queued and replayed in order once it opens.
async fn bridge(
    client: WebSocket,
    backend_url: String,
    connect_timeout: Duration,
    sandbox: Arc<SandboxManager>,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let mut pending = PendingFrames::default();

    match next_client_frame(&mut client_rx).await {
        Some(RelayFrame::Close) | None => return,
        Some(frame) => pending.push(frame),
    }

    let connect = tokio::time::timeout(connect_timeout, connect_backend(&backend_url));
    tokio::pin!(connect);
    let backend = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    warn!(url = %backend_url, error = %e, "relay backend connect failed");
                    pending.clear();
                    close_client(&mut client_tx).await;
                    return;
                },
                Err(_) => {
                    warn!(
                        url = %backend_url,
                        timeout_ms = connect_timeout.as_millis() as u64,
                        "relay backend connect timed out"
                    );
                    pending.clear();
                    close_client(&mut client_tx).await;
                    return;
                },
            },
            frame = next_client_frame(&mut client_rx) => match frame {
                Some(RelayFrame::Close) | None => {
                    debug!(buffered = pending.len(), "client left before backend opened");
                    pending.clear();
                    return;
                },
                Some(frame) => pending.push(frame),
            },
        }
    };

    let (mut backend_tx, mut backend_rx) = backend.split();
    let buffered = pending.len();
    for frame in pending.drain() {
        if let Err(e) = backend_tx.send(frame.into_backend()).await {
            warn!(error = %e, "relay flush to backend failed");
            close_client(&mut client_tx).await;
            return;
        }
    }
    info!(buffered, "relay bridge open");

    loop {
        tokio::select! {
            frame = next_client_frame(&mut client_rx) => match frame {
                Some(RelayFrame::Close) | None => {
                    let _ = backend_tx.send(BackendMessage::Close(None)).await;
                    break;
                },
                Some(frame) => {
                    sandbox.touch();
                    if backend_tx.send(frame.into_backend()).await.is_err() {
                        close_client(&mut client_tx).await;
                        break;
                    }
                },
            },
            msg = backend_rx.next() => match msg {
                Some(Ok(msg)) => match RelayFrame::from_backend(msg) {
                    None => {},
                    Some(RelayFrame::Close) => {
                        close_client(&mut client_tx).await;
                        break;
                    },
                    Some(frame) => {
                        if client_tx.send(frame.into_client()).await.is_err() {
                            let _ = backend_tx.send(BackendMessage::Close(None)).await;
                            break;
                        }
                    },
                },
                Some(Err(e)) => {
                    debug!(error = %e, "relay backend read failed");
                    close_client(&mut client_tx).await;
                    break;
                },
                None => {
                    close_client(&mut client_tx).await;
                    break;
                },
            },
        }
    }
    debug!("relay bridge closed");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_frames_drain_in_order_and_empty() {
        let mut pending = PendingFrames::default();
        pending.push(RelayFrame::Text("one".into()));
        pending.push(RelayFrame::Binary(Bytes::from_static(b"\x01\x02")));
        assert_eq!(pending.len(), 2);

        let drained = pending.drain();
        assert_eq!(drained, vec![
            RelayFrame::Text("one".into()),
            RelayFrame::Binary(Bytes::from_static(b"\x01\x02")),
        ]);
        assert!(pending.is_empty());
    }

    #[test]
    fn framing_headers_are_stripped() {
        let mut upstream = HeaderMap::new();
        upstream.insert("x-frame-options", HeaderValue::from_static("DENY"));
        upstream.insert(
            "content-security-policy",
            HeaderValue::from_static("frame-ancestors 'none'"),
        );
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let filtered = filter_headers(&upstream);
        assert!(filtered.get("x-frame-options").is_none());
        assert!(filtered.get("content-security-policy").is_none());
        assert_eq!(filtered.get(header::CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn control_frames_are_not_forwarded() {
        assert_eq!(RelayFrame::from_client(Message::Ping(Bytes::new())), None);
        assert_eq!(
            RelayFrame::from_client(Message::Text("hi".into())),
            Some(RelayFrame::Text("hi".into()))
        );
    }
}
