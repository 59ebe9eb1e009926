//! Correlated request/response channel over a container's stdio.
//!
//! One reader task decodes frames from the container. Responses resolve the
//! matching pending request; requests from the container are dispatched to a
//! [`RequestHandler`] and answered exactly once; events are forwarded to an
//! `mpsc` subscriber. When the container's stdout closes every pending caller
//! fails with [`Error::ChannelClosed`] instead of hanging.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace, warn},
    warden_common::IpcContext,
    warden_protocol::{
        Event, FrameDecoder, MAX_BUFFERED_BYTES, Request, Response, RpcError, RpcMessage, encode,
        error_codes,
    },
};

use crate::{Error, Result};

/// Serves requests the container sends to the host (`tool.call`).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &IpcContext,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, RpcError>;
}

/// Bound on writes that have no caller-supplied timeout (tool replies, close).
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;
type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct RpcChannel {
    writer: Writer,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RpcChannel {
    /// Start the reader loop. Returns the channel and the event stream.
    pub fn spawn(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        ctx: IpcContext,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            writer: Arc::new(Mutex::new(writer)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            reader_handle: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&channel.writer),
            Arc::clone(&channel.pending),
            channel.closed.clone(),
            events_tx,
            ctx,
            handler,
        ));
        *channel
            .reader_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        (channel, events_rx)
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        self.request_with_cancel(method, params, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`request`](Self::request), resolving with [`Error::Interrupted`]
    /// as soon as `cancel` fires.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        let id = format!("h{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        debug!(method, id = %id, "host -> container request");
        // The write counts against the timeout too: a container that stops
        // reading stdin must not stall the caller.
        let sent = AtomicBool::new(false);
        let exchange = async {
            self.send(&RpcMessage::request(id.clone(), method, params))
                .await?;
            sent.store(true, Ordering::SeqCst);
            match rx.await {
                Ok(resp) => resp.into_result().map_err(Error::Rpc),
                Err(_) => Err(Error::ChannelClosed),
            }
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, exchange) => {
                res.unwrap_or_else(|_| Err(Error::timeout(method, timeout)))
            },
            () = cancel.cancelled() => Err(Error::Interrupted),
        };

        if outcome.is_err() {
            self.pending.lock().await.remove(&id);
            if !sent.load(Ordering::SeqCst) && !self.closed.is_cancelled() {
                // A frame cut off mid-write leaves the stream unusable.
                warn!(method, id = %id, "request abandoned before it was written, closing channel");
                self.closed.cancel();
            }
        }
        outcome
    }

    /// Fire-and-forget event to the container.
    ///
    /// Waits for the write to finish, so callers facing a container that may
    /// have stopped reading should bound it with a timeout.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        trace!(method, "host -> container event");
        self.send(&RpcMessage::event(method, params)).await
    }

    async fn send(&self, msg: &RpcMessage) -> Result<()> {
        write_frame(&self.writer, msg).await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the container side has gone away.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stop reading and fail all pending requests.
    pub async fn close(&self) {
        if let Some(handle) = self
            .reader_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.closed.cancel();
        self.pending.lock().await.clear();
        let shutdown = async { self.writer.lock().await.shutdown().await };
        if tokio::time::timeout(WRITE_TIMEOUT, shutdown).await.is_err() {
            debug!("container stdin did not shut down in time");
        }
    }
}

async fn write_frame(writer: &Writer, msg: &RpcMessage) -> Result<()> {
    let line = encode(msg)?;
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes())
        .await
        .map_err(|_| Error::ChannelClosed)?;
    w.flush().await.map_err(|_| Error::ChannelClosed)?;
    Ok(())
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Writer,
    pending: PendingMap,
    closed: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
    ctx: IpcContext,
    handler: Option<Arc<dyn RequestHandler>>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(group = %ctx.group_folder, "container stdout closed");
                break;
            },
            Ok(n) => n,
            Err(e) => {
                warn!(group = %ctx.group_folder, error = %e, "error reading container stdout");
                break;
            },
        };

        for parsed in decoder.push(&buf[..n]) {
            match parsed {
                Ok(RpcMessage::Response(resp)) => {
                    let tx = pending.lock().await.remove(&resp.id);
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        },
                        None => {
                            debug!(id = %resp.id, "discarding response for unknown or expired request");
                        },
                    }
                },
                Ok(RpcMessage::Request(req)) => {
                    tokio::spawn(serve_request(
                        req,
                        Arc::clone(&writer),
                        ctx.clone(),
                        handler.clone(),
                    ));
                },
                Ok(RpcMessage::Event(event)) => {
                    trace!(method = %event.method, "container -> host event");
                    let _ = events.send(event);
                },
                Err(e) => {
                    warn!(group = %ctx.group_folder, error = %e, "dropping malformed frame");
                },
            }
        }

        if decoder.remaining().len() > MAX_BUFFERED_BYTES {
            warn!(
                group = %ctx.group_folder,
                buffered = decoder.remaining().len(),
                "container sent an oversized frame, closing channel"
            );
            break;
        }
    }

    closed.cancel();
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
}

async fn serve_request(
    req: Request,
    writer: Writer,
    ctx: IpcContext,
    handler: Option<Arc<dyn RequestHandler>>,
) {
    debug!(method = %req.method, id = %req.id, group = %ctx.group_folder, "container -> host request");
    let reply = match handler {
        Some(handler) => match handler.handle(&ctx, &req.method, req.params).await {
            Ok(result) => RpcMessage::response_ok(req.id, result),
            Err(err) => RpcMessage::response_err(req.id, err),
        },
        None => RpcMessage::response_err(
            req.id,
            RpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("no handler for {}", req.method),
            ),
        ),
    };
    match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&writer, &reply)).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => debug!(error = %e, "could not deliver response to container"),
        Err(_) => warn!(group = %ctx.group_folder, "container is not reading, response dropped"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::json,
        tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, duplex},
        warden_protocol::methods,
    };

    fn ctx() -> IpcContext {
        IpcContext {
            chat_jid: "fam@g.us".into(),
            group_folder: "family".into(),
            is_main: false,
        }
    }

    /// Host channel plus the container-side ends of both pipes.
    fn pair(
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> (
        Arc<RpcChannel>,
        mpsc::UnboundedReceiver<Event>,
        BufReader<DuplexStream>,
        DuplexStream,
    ) {
        let (host_in, agent_out) = duplex(64 * 1024);
        let (agent_in, host_out) = duplex(64 * 1024);
        let (channel, events) = RpcChannel::spawn(Box::new(host_out), Box::new(host_in), ctx(), handler);
        (channel, events, BufReader::new(agent_out), agent_in)
    }

    async fn read_msg(reader: &mut BufReader<DuplexStream>) -> RpcMessage {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn write_msg(writer: &mut DuplexStream, msg: &RpcMessage) {
        writer.write_all(encode(msg).unwrap().as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn request_resolves_with_matching_response() {
        let (channel, _events, mut agent_rx, mut agent_tx) = pair(None);

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                channel
                    .request(methods::AGENT_RUN, json!({"prompt": "hi"}), Duration::from_secs(5))
                    .await
            }
        });

        let RpcMessage::Request(req) = read_msg(&mut agent_rx).await else {
            panic!("expected request");
        };
        assert_eq!(req.method, "agent.run");
        // An unrelated response first: must be ignored, not fatal.
        write_msg(&mut agent_tx, &RpcMessage::response_ok("nope", json!(1))).await;
        write_msg(&mut agent_tx, &RpcMessage::response_ok(req.id, json!({"status": "success"}))).await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_and_late_reply_is_discarded() {
        let (channel, _events, mut agent_rx, mut agent_tx) = pair(None);

        let err = channel
            .request("slow", serde_json::Value::Null, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(channel.pending_count().await, 0);

        let RpcMessage::Request(req) = read_msg(&mut agent_rx).await else {
            panic!("expected request");
        };
        write_msg(&mut agent_tx, &RpcMessage::response_ok(req.id, json!(null))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn cancel_resolves_interrupted() {
        let (channel, _events, _agent_rx, _agent_tx) = pair(None);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = channel
            .request_with_cancel("run", serde_json::Value::Null, Duration::from_secs(10), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn eof_fails_in_flight_requests() {
        let (channel, _events, agent_rx, agent_tx) = pair(None);
        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                channel
                    .request("run", serde_json::Value::Null, Duration::from_secs(10))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(agent_tx);
        drop(agent_rx);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
        channel.closed().await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn events_reach_subscriber_and_malformed_lines_are_skipped() {
        let (_channel, mut events, _agent_rx, mut agent_tx) = pair(None);
        agent_tx.write_all(b"garbage\n").await.unwrap();
        write_msg(&mut agent_tx, &RpcMessage::event(methods::AGENT_DELTA, json!({"text": "he"}))).await;
        write_msg(&mut agent_tx, &RpcMessage::event(methods::AGENT_DELTA, json!({"text": "llo"}))).await;

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.params["text"], "he");
        assert_eq!(second.params["text"], "llo");
    }

    /// Channel whose container side never drains stdin.
    fn stalled() -> (Arc<RpcChannel>, DuplexStream, DuplexStream) {
        let (host_in, agent_out) = duplex(1024);
        let (agent_in, host_out) = duplex(1024);
        let (channel, _events) =
            RpcChannel::spawn(Box::new(host_out), Box::new(host_in), ctx(), None);
        (channel, agent_out, agent_in)
    }

    fn large_params() -> serde_json::Value {
        json!({"prompt": "x".repeat(64 * 1024)})
    }

    #[tokio::test]
    async fn timeout_covers_a_write_the_container_never_reads() {
        let (channel, _agent_out, _agent_in) = stalled();
        let call = channel.request(methods::AGENT_RUN, large_params(), Duration::from_millis(100));
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("request must not hang on a blocked write")
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(channel.pending_count().await, 0);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn cancel_covers_a_blocked_write() {
        let (channel, _agent_out, _agent_in) = stalled();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let call = channel.request_with_cancel(
            methods::AGENT_RUN,
            large_params(),
            Duration::from_secs(30),
            &token,
        );
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("cancel must not wait for the write")
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));

        // The writer is free again, so closing does not hang either.
        tokio::time::timeout(Duration::from_secs(7), channel.close())
            .await
            .unwrap();
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            ctx: &IpcContext,
            method: &str,
            params: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, RpcError> {
            if method == methods::TOOL_CALL {
                Ok(json!({"group": ctx.group_folder, "echo": params}))
            } else {
                Err(RpcError::new(error_codes::METHOD_NOT_FOUND, method))
            }
        }
    }

    #[tokio::test]
    async fn container_requests_get_exactly_one_response() {
        let (_channel, _events, mut agent_rx, mut agent_tx) = pair(Some(Arc::new(Echo)));

        write_msg(&mut agent_tx, &RpcMessage::request("c1", methods::TOOL_CALL, json!({"name": "list_tasks"}))).await;
        let RpcMessage::Response(resp) = read_msg(&mut agent_rx).await else {
            panic!("expected response");
        };
        assert_eq!(resp.id, "c1");
        let value = resp.into_result().unwrap();
        assert_eq!(value["group"], "family");

        write_msg(&mut agent_tx, &RpcMessage::request("c2", "bogus", json!({}))).await;
        let RpcMessage::Response(resp) = read_msg(&mut agent_rx).await else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap_err().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn no_handler_answers_method_not_found() {
        let (_channel, _events, mut agent_rx, mut agent_tx) = pair(None);
        write_msg(&mut agent_tx, &RpcMessage::request("c9", methods::TOOL_CALL, json!({}))).await;
        let RpcMessage::Response(resp) = read_msg(&mut agent_rx).await else {
            panic!("expected response");
        };
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }
}
