//! Policy-enforcing WebSocket relay between chat clients and the upstream
//! XMPP server.
//!
//! Each accepted client connection is paired with one outbound connection to
//! the upstream server. Client-to-upstream traffic runs through the auth
//! extractor and policy pipeline; upstream-to-client traffic is verbatim
//! passthrough. The pair is torn down as a unit: the first side to close or
//! error cancels the other, with no retry or reconnect.

mod policy;
mod stanza;
mod store;

pub use store::{ChatStore, StoreError};

use futures_util::{SinkExt, StreamExt};
use stanza::Session;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// WebSocket subprotocol negotiated with clients and offered to the upstream
/// server.
const WS_SUBPROTOCOL: &str = "xmpp";

/// Grace period for delivering a close frame to the client after the bridge
/// ends. The sockets drop regardless once it elapses.
const CLOSE_FRAME_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Monotonic connection id for correlating relay logs across tasks.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay already running")]
    AlreadyRunning,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "Connection closed");
    }
}

/// The relay server: a WebSocket listener that pairs every accepted client
/// connection with one upstream connection.
pub struct ChatRelay {
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl Default for ChatRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRelay {
    pub fn new() -> Self {
        Self {
            local_addr: None,
            task: None,
            shutdown_tx: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful when listening on port 0).
    pub async fn start(
        &mut self,
        listen: &str,
        upstream_url: String,
        store: ChatStore,
    ) -> Result<SocketAddr, RelayError> {
        if self.local_addr.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(listen).await.map_err(|e| RelayError::Bind {
            addr: listen.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| RelayError::Bind {
            addr: listen.to_string(),
            source: e,
        })?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let active_connections = self.active_connections.clone();
        let upstream_url: Arc<str> = upstream_url.into();

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                info!(addr = %addr, "New client connection");
                                let upstream_url = upstream_url.clone();
                                let store = store.clone();
                                let shutdown = shutdown_tx.subscribe();
                                let conn_counter = active_connections.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream,
                                        upstream_url,
                                        store,
                                        shutdown,
                                        conn_counter,
                                    )
                                    .await
                                    {
                                        error!(error = %e, "Connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "Accept failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay listener shutting down");
                        break;
                    }
                }
            }
        });

        self.task = Some(task);
        Ok(local_addr)
    }

    /// Signal shutdown to the accept loop and every live connection pair.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.local_addr = None;
    }
}

/// Echo the `xmpp` subprotocol back to clients that offer it.
fn negotiate_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim() == WS_SUBPROTOCOL))
        .unwrap_or(false);
    if offered {
        resp.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));
    }
    Ok(resp)
}

/// Handle one client connection: WebSocket upgrade, upstream pairing, then
/// the bidirectional bridge.
async fn handle_connection(
    stream: TcpStream,
    upstream_url: Arc<str>,
    store: ChatStore,
    mut shutdown: broadcast::Receiver<()>,
    active_connections: Arc<AtomicUsize>,
) -> Result<(), RelayError> {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let connection_started = Instant::now();

    active_connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard::new(active_connections);

    let client_ws = accept_hdr_async(stream, negotiate_subprotocol).await?;
    info!(conn_id, "Client WebSocket established");

    let mut request = upstream_url.as_ref().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));

    let upstream_connect_started = Instant::now();
    let upstream_ws = tokio::select! {
        result = connect_async(request) => {
            let (ws, _) = result?;
            info!(
                conn_id,
                upstream = %upstream_url,
                connect_ms = upstream_connect_started.elapsed().as_millis() as u64,
                "Upstream connected"
            );
            ws
        }
        _ = shutdown.recv() => {
            info!(conn_id, "Shutdown before upstream connection completed");
            return Ok(());
        }
    };

    let result = bridge(client_ws, upstream_ws, store, shutdown, conn_id).await;
    info!(
        conn_id,
        total_ms = connection_started.elapsed().as_millis() as u64,
        "Connection finished"
    );
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeEndReason {
    ClientClosed,
    ClientError,
    UpstreamClosed,
    UpstreamError,
    Shutdown,
}

type ClientWs = tokio_tungstenite::WebSocketStream<TcpStream>;
type UpstreamWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Bridge one connection pair.
///
/// Two tasks run until the first exits for any reason, which aborts the
/// sibling and drops both sockets:
/// - outbound (client → upstream): auth extraction, then the policy pipeline,
///   writing forwarded/injected frames upstream and acks back to the client
/// - inbound (upstream → client): verbatim passthrough
///
/// Within the outbound direction, frames are processed strictly in arrival
/// order so a sender's messages and their acks keep causal order.
async fn bridge(
    client_ws: ClientWs,
    upstream_ws: UpstreamWs,
    store: ChatStore,
    mut shutdown: broadcast::Receiver<()>,
    conn_id: u64,
) -> Result<(), RelayError> {
    let bridge_started = Instant::now();

    let (client_write, mut client_read) = client_ws.split();
    let (mut upstream_write, mut upstream_read) = upstream_ws.split();

    // The client sink is shared: the outbound task sends acks, the inbound
    // task sends passthrough frames, and the cleanup code sends the close
    // frame after both tasks are aborted.
    let client_write = Arc::new(Mutex::new(client_write));

    // Outbound: client → upstream, with processing.
    let client_write_out = client_write.clone();
    let mut outbound = tokio::spawn(async move {
        let mut session = Session::new();
        while let Some(msg) = client_read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    session.observe_frame(&text);
                    let disposition = policy::process_frame(&text, &session, &store).await;
                    for frame in disposition.to_upstream {
                        debug!(conn_id, data = %frame, "Client->Upstream");
                        if let Err(e) = upstream_write.send(Message::Text(frame)).await {
                            error!(conn_id, error = %e, "Upstream write failed");
                            return BridgeEndReason::UpstreamError;
                        }
                    }
                    for frame in disposition.to_client {
                        debug!(conn_id, data = %frame, "Ack->Client");
                        if let Err(e) = client_write_out.lock().await.send(Message::Text(frame)).await {
                            debug!(conn_id, error = %e, "Ack write failed (client likely gone)");
                            return BridgeEndReason::ClientError;
                        }
                    }
                }
                Ok(Message::Binary(data)) => {
                    // No chat stanzas arrive in binary frames; relay untouched.
                    if let Err(e) = upstream_write.send(Message::Binary(data)).await {
                        error!(conn_id, error = %e, "Upstream write failed");
                        return BridgeEndReason::UpstreamError;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!(conn_id, "WebSocket closed by client");
                    return BridgeEndReason::ClientClosed;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(conn_id, error = %e, "Client read error");
                    return BridgeEndReason::ClientError;
                }
            }
        }
        BridgeEndReason::ClientClosed
    });

    // Inbound: upstream → client, pure passthrough.
    let client_write_in = client_write.clone();
    let mut inbound = tokio::spawn(async move {
        while let Some(msg) = upstream_read.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if let Err(e) = client_write_in.lock().await.send(msg).await {
                        debug!(conn_id, error = %e, "Passthrough write failed (client likely gone)");
                        return BridgeEndReason::ClientError;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!(conn_id, "Upstream closed the connection");
                    return BridgeEndReason::UpstreamClosed;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(conn_id, error = %e, "Upstream read error");
                    return BridgeEndReason::UpstreamError;
                }
            }
        }
        BridgeEndReason::UpstreamClosed
    });

    // First exit cancels the sibling.
    let end_reason = tokio::select! {
        result = &mut outbound => {
            match result {
                Ok(reason) => reason,
                Err(e) => {
                    error!(conn_id, error = %e, "Outbound task join error");
                    BridgeEndReason::ClientError
                }
            }
        }
        result = &mut inbound => {
            match result {
                Ok(reason) => reason,
                Err(e) => {
                    error!(conn_id, error = %e, "Inbound task join error");
                    BridgeEndReason::UpstreamError
                }
            }
        }
        _ = shutdown.recv() => {
            info!(conn_id, "Connection closed by shutdown");
            BridgeEndReason::Shutdown
        }
    };

    outbound.abort();
    inbound.abort();

    // Deliver a proper close frame so the client learns the pair died even
    // when the upstream side failed first.
    let close_result = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
        let mut writer = client_write.lock().await;
        let _ = writer
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Relay closed".into(),
            })))
            .await;
    })
    .await;
    if close_result.is_err() {
        debug!(conn_id, "Close frame send timed out");
    }

    info!(
        conn_id,
        reason = ?end_reason,
        bridge_ms = bridge_started.elapsed().as_millis() as u64,
        "Bridge ended"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use tokio::sync::mpsc;

    /// Fake upstream chat server: accepts one WebSocket connection, reports
    /// every received text frame on a channel, and stays open until dropped.
    async fn spawn_fake_upstream() -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake upstream");
        let port = listener.local_addr().expect("fake upstream addr").port();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept upstream connection");
            let mut ws = accept_hdr_async(stream, negotiate_subprotocol)
                .await
                .expect("upstream ws handshake");
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if frames_tx.send(text).is_err() {
                        break;
                    }
                }
            }
        });

        (port, frames_rx)
    }

    async fn start_relay(upstream_port: u16) -> (ChatRelay, SocketAddr) {
        let store = ChatStore::open_in_memory().expect("open in-memory store");
        let mut relay = ChatRelay::new();
        let addr = relay
            .start(
                "127.0.0.1:0",
                format!("ws://127.0.0.1:{upstream_port}"),
                store,
            )
            .await
            .expect("start relay");
        (relay, addr)
    }

    fn auth_frame(identity: &str) -> String {
        let payload = BASE64.encode(format!("\0{identity}\0password"));
        format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>")
    }

    async fn recv_text(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> String {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_delivered_message_reaches_upstream_with_inbox_update() {
        let (upstream_port, mut upstream_frames) = spawn_fake_upstream().await;
        let (_relay, addr) = start_relay(upstream_port).await;

        let mut request = format!("ws://{addr}").into_client_request().expect("request");
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("xmpp"));
        let (mut client, response) = connect_async(request).await.expect("connect client");

        // Subprotocol negotiation echoes the offered protocol.
        assert_eq!(
            response
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some("xmpp"),
        );

        client
            .send(Message::Text(auth_frame("42")))
            .await
            .expect("send auth");
        let message = r#"<message type="chat" id="1" to="99@chat.example" check_uniqueness="true"><body>Hello there</body></message>"#;
        client
            .send(Message::Text(message.to_string()))
            .await
            .expect("send message");

        assert_eq!(recv_text(&mut client).await, r#"<duo_message_delivered id="1"/>"#);

        // The auth frame is not actionable and passes through first.
        async fn recv_upstream(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
            let deadline = std::time::Duration::from_secs(2);
            tokio::time::timeout(deadline, rx.recv())
                .await
                .expect("timed out waiting for upstream frame")
                .expect("upstream channel closed")
        }
        let forwarded_auth = recv_upstream(&mut upstream_frames).await;
        assert!(forwarded_auth.contains("<auth"));
        assert_eq!(recv_upstream(&mut upstream_frames).await, message);
        let inbox = recv_upstream(&mut upstream_frames).await;
        assert!(inbox.contains("erlang-solutions.com:xmpp:inbox:0#conversation"));
        assert!(inbox.contains("jid='99@chat.example'"));
        assert!(inbox.contains("<box>chats</box>"));
    }

    #[tokio::test]
    async fn test_suppressed_message_never_reaches_upstream() {
        let (upstream_port, mut upstream_frames) = spawn_fake_upstream().await;
        let (_relay, addr) = start_relay(upstream_port).await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

        // No auth frame sent: the block check fails closed.
        let message = r#"<message type="chat" id="9" to="99@chat.example"><body>hi</body></message>"#;
        client
            .send(Message::Text(message.to_string()))
            .await
            .expect("send message");

        assert_eq!(recv_text(&mut client).await, r#"<duo_message_blocked id="9"/>"#);

        // Nothing is forwarded upstream for a suppressed message.
        let extra = tokio::time::timeout(
            std::time::Duration::from_millis(300),
            upstream_frames.recv(),
        )
        .await;
        assert!(extra.is_err(), "suppressed message leaked upstream: {extra:?}");
    }

    #[tokio::test]
    async fn test_upstream_frames_pass_through_to_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake upstream");
        let port = listener.local_addr().expect("addr").port();

        // Upstream that pushes a frame to the client as soon as it connects.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_hdr_async(stream, negotiate_subprotocol)
                .await
                .expect("handshake");
            ws.send(Message::Text(
                "<message from='99@chat.example' type='chat'><body>reply</body></message>"
                    .to_string(),
            ))
            .await
            .expect("push frame");
            // Hold the connection open until the test ends.
            while ws.next().await.is_some() {}
        });

        let (_relay, addr) = start_relay(port).await;
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

        let frame = recv_text(&mut client).await;
        assert!(frame.contains("reply"));
    }

    #[tokio::test]
    async fn test_upstream_close_promptly_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake upstream");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_hdr_async(stream, negotiate_subprotocol)
                .await
                .expect("handshake");
            ws.close(None).await.expect("close upstream side");
        });

        let (_relay, addr) = start_relay(port).await;
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

        // The client must observe the closure promptly: either a close frame
        // or end-of-stream, well within the test timeout.
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        })
        .await;
        assert!(outcome.is_ok(), "client connection not closed promptly");
    }

    #[tokio::test]
    async fn test_arbitrary_xml_forwarded_byte_for_byte() {
        let (upstream_port, mut upstream_frames) = spawn_fake_upstream().await;
        let (_relay, addr) = start_relay(upstream_port).await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

        let frame = "<weird a='1'><nested>stuff</nested></weird>";
        client
            .send(Message::Text(frame.to_string()))
            .await
            .expect("send frame");

        let forwarded = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            upstream_frames.recv(),
        )
        .await
        .expect("timed out")
        .expect("upstream channel closed");
        assert_eq!(forwarded, frame);

        // No ack is generated for non-actionable frames.
        let unexpected = tokio::time::timeout(
            std::time::Duration::from_millis(300),
            client.next(),
        )
        .await;
        assert!(unexpected.is_err(), "unexpected frame to client: {unexpected:?}");
    }

    #[tokio::test]
    async fn test_relay_start_is_exclusive_and_stop_releases() {
        let store = ChatStore::open_in_memory().expect("store");
        let mut relay = ChatRelay::new();
        relay
            .start("127.0.0.1:0", "ws://127.0.0.1:1".to_string(), store.clone())
            .await
            .expect("first start");
        assert!(matches!(
            relay
                .start("127.0.0.1:0", "ws://127.0.0.1:1".to_string(), store)
                .await,
            Err(RelayError::AlreadyRunning)
        ));
        relay.stop().await;
        assert!(relay.local_addr().is_none());
    }
}
