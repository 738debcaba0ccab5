//! Transport abstraction and the default WebSocket transport
//!
//! A transport moves already-typed messages over some link and reports three
//! events, each to a single registered handler: opened, payload received and
//! closed. Every transport instance is used for exactly one connection
//! attempt; reconnecting builds a new one through a [`TransportFactory`].

use crate::config::ConnectionConfig;
use crate::error::{Result, WampError};
use crate::message::{List, Message};
use crate::serializer::Serializer;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

/// Called once the link is established
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;

/// Called with every inbound payload, already deserialized
pub type ReceiveHandler = Arc<dyn Fn(List) + Send + Sync>;

/// Called once when the link goes down, with a human readable reason
pub type CloseHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Single-slot storage for the three transport events
///
/// Registering a handler replaces the previous one. Handlers are invoked
/// without any lock held, so they may call back into the transport.
#[derive(Default)]
pub struct TransportHandlers {
    on_open: Mutex<Option<OpenHandler>>,
    on_message: Mutex<Option<ReceiveHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
}

impl TransportHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_open(&self, handler: OpenHandler) {
        *self.on_open.lock() = Some(handler);
    }

    pub fn set_on_message(&self, handler: ReceiveHandler) {
        *self.on_message.lock() = Some(handler);
    }

    pub fn set_on_close(&self, handler: CloseHandler) {
        *self.on_close.lock() = Some(handler);
    }

    /// Report that the link is open
    pub fn opened(&self) {
        let handler = self.on_open.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Report an inbound payload
    pub fn received(&self, payload: List) {
        let handler = self.on_message.lock().clone();
        match handler {
            Some(handler) => handler(payload),
            None => trace!("No message handler registered, dropping payload"),
        }
    }

    /// Report that the link is closed
    pub fn closed(&self, reason: String) {
        let handler = self.on_close.lock().clone();
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}

impl fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandlers")
            .field("on_open", &self.on_open.lock().is_some())
            .field("on_message", &self.on_message.lock().is_some())
            .field("on_close", &self.on_close.lock().is_some())
            .finish()
    }
}

/// Capability interface the session engine needs from a link
pub trait Transport: Send + Sync {
    /// Event handler slots of this transport
    fn handlers(&self) -> &TransportHandlers;

    /// Begin establishing the link; the outcome is reported through the handlers
    fn connect(&self);

    /// Tear the link down.
    ///
    /// Returns `true` if the link was closed immediately and `false` if the
    /// close is still in progress. The close handler fires exactly once per
    /// connection attempt either way.
    fn disconnect(&self) -> bool;

    /// Serialize and transmit one message
    fn send(&self, message: &Message) -> Result<()>;

    /// Whether the link is currently usable for `send`
    fn is_connected(&self) -> bool;

    fn on_open(&self, handler: OpenHandler) {
        self.handlers().set_on_open(handler);
    }

    fn on_message(&self, handler: ReceiveHandler) {
        self.handlers().set_on_message(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.handlers().set_on_close(handler);
    }
}

/// Builds a fresh transport for every connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectionConfig) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, config: &ConnectionConfig) -> Arc<dyn Transport> {
        self(config)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketPhase {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct SocketState {
    phase: SocketPhase,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    task: Option<JoinHandle<()>>,
}

struct SocketInner {
    uri: String,
    protocol: String,
    headers: HashMap<String, String>,
    serializer: Arc<dyn Serializer>,
    handlers: TransportHandlers,
    state: Mutex<SocketState>,
}

/// WebSocket transport negotiating the configured WAMP sub-protocol
///
/// This is the default transport when no [`TransportFactory`] is configured.
pub struct WebSocketTransport {
    inner: Arc<SocketInner>,
}

impl WebSocketTransport {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                uri: config.uri.clone(),
                protocol: config.protocol.clone(),
                headers: config.headers.clone(),
                serializer: config.serializer.clone(),
                handlers: TransportHandlers::new(),
                state: Mutex::new(SocketState {
                    phase: SocketPhase::Idle,
                    outbound: None,
                    task: None,
                }),
            }),
        }
    }
}

impl Transport for WebSocketTransport {
    fn handlers(&self) -> &TransportHandlers {
        &self.inner.handlers
    }

    fn connect(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != SocketPhase::Idle {
            warn!(uri = %self.inner.uri, phase = ?state.phase, "WebSocket transport cannot be reused");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            state.phase = SocketPhase::Closed;
            drop(state);

            warn!(uri = %self.inner.uri, "No Tokio runtime to run the WebSocket on");
            self.inner.handlers.closed("Connection failed: no Tokio runtime".to_string());
            return;
        };

        state.phase = SocketPhase::Connecting;
        state.task = Some(runtime.spawn(socket_task(self.inner.clone())));
    }

    fn disconnect(&self) -> bool {
        let mut state = self.inner.state.lock();
        match state.phase {
            SocketPhase::Idle | SocketPhase::Closed => {
                state.phase = SocketPhase::Closed;
                true
            }
            SocketPhase::Connecting => {
                if let Some(task) = state.task.take() {
                    task.abort();
                }
                state.phase = SocketPhase::Closed;
                drop(state);

                debug!(uri = %self.inner.uri, "WebSocket connect aborted");
                self.inner.handlers.closed("Connection aborted".to_string());
                true
            }
            SocketPhase::Connected => {
                state.phase = SocketPhase::Closing;
                if let Some(tx) = &state.outbound {
                    let _ = tx.send(WsMessage::Close(None));
                }
                false
            }
            SocketPhase::Closing => false,
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        let tx = {
            let state = self.inner.state.lock();
            match (state.phase, &state.outbound) {
                (SocketPhase::Connected, Some(tx)) => tx.clone(),
                _ => return Err(WampError::NotConnected),
            }
        };

        let bytes = self.inner.serializer.serialize(&message.payload())?;
        let frame = if self.inner.serializer.is_binary() {
            WsMessage::Binary(bytes.into())
        } else {
            let text = String::from_utf8(bytes).map_err(|e| WampError::Transport(e.to_string()))?;
            WsMessage::Text(text.into())
        };

        trace!(message_type = ?message.message_type(), "Sending message");
        tx.send(frame).map_err(|_| WampError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().phase == SocketPhase::Connected
    }
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("uri", &self.inner.uri)
            .field("protocol", &self.inner.protocol)
            .field("phase", &self.inner.state.lock().phase)
            .finish()
    }
}

impl SocketInner {
    async fn open_stream(&self) -> Result<WsStream> {
        let mut request = self
            .uri
            .as_str()
            .into_client_request()
            .map_err(|e| WampError::Transport(format!("Failed to build WebSocket request: {}", e)))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WampError::Transport(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WampError::Transport(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        let protocol = HeaderValue::from_str(&self.protocol)
            .map_err(|e| WampError::Transport(format!("Invalid protocol '{}': {}", self.protocol, e)))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| WampError::Transport(format!("Connection failed: {}", e)))?;

        debug!(uri = %self.uri, status = %response.status(), "WebSocket handshake complete");
        Ok(stream)
    }

    fn deliver(&self, data: &[u8]) {
        match self.serializer.deserialize(data) {
            Ok(payload) => self.handlers.received(payload),
            Err(e) => warn!(error = %e, "Dropping undecodable message"),
        }
    }

    /// Mark the socket closed and report it, at most once
    fn finish(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if state.phase == SocketPhase::Closed {
                return;
            }
            state.phase = SocketPhase::Closed;
            state.outbound = None;
            state.task = None;
        }

        debug!(uri = %self.uri, reason = %reason, "WebSocket closed");
        self.handlers.closed(reason);
    }
}

/// Connection task: handshake, then pump frames until either side closes
async fn socket_task(inner: Arc<SocketInner>) {
    let stream = match inner.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(uri = %inner.uri, error = %e, "WebSocket connection failed");
            inner.finish(e.to_string());
            return;
        }
    };

    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    {
        let mut state = inner.state.lock();
        if state.phase != SocketPhase::Connecting {
            return;
        }
        state.phase = SocketPhase::Connected;
        state.outbound = Some(tx);
    }

    inner.handlers.opened();

    let reason = loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            break e.to_string();
                        }
                    }
                    None => break "Connection closed".to_string(),
                }
            }

            inbound = source.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => inner.deliver(text.as_str().as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => inner.deliver(&data),
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "Connection closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "Connection closed".to_string(),
                }
            }
        }
    };

    let _ = sink.close().await;
    inner.finish(reason);
}
