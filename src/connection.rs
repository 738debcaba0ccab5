//! Connection lifecycle and reconnection
//!
//! A [`Connection`] owns the current transport and, once that transport is
//! open, the session bound to it. Losing either triggers a reconnect with
//! exponential backoff while reconnection is wanted. Every (re)connect builds
//! a fresh transport and session; events from discarded ones are ignored.

use crate::config::ConnectionConfig;
use crate::error::{Result, WampError};
use crate::message::Dict;
use crate::session::{ChallengeHandler, LeaveHandler, Session, SessionHandlers};
use crate::transport::{Transport, WebSocketTransport};
use crate::uri::check_uri;

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Called when a transport opens
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Called with the joined session and the WELCOME details
pub type SessionJoinHandler = Arc<dyn Fn(&Session, &Dict) + Send + Sync>;

/// Called with the close reason when the transport goes down
pub type DisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ConnectionHandlers {
    on_connect: Option<ConnectHandler>,
    on_join: Option<SessionJoinHandler>,
    on_challenge: Option<ChallengeHandler>,
    on_leave: Option<LeaveHandler>,
    on_disconnect: Option<DisconnectHandler>,
}

struct LifecycleState {
    /// Whether losing the transport or session should trigger a retry
    reconnect: bool,
    retry_interval: Duration,
    /// A retry cycle is in flight
    retrying: bool,
    /// From transport creation until that transport reports closed
    is_open: bool,
    /// Between `open` and the lifecycle stopping
    running: bool,
    /// Bumped for every transport; stale events carry an older value
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    session: Option<Session>,
}

struct ConnectionInner {
    config: ConnectionConfig,
    handlers: Mutex<ConnectionHandlers>,
    state: Mutex<LifecycleState>,
    running: watch::Sender<bool>,
}

/// WAMP client connection with automatic reconnection
///
/// Cheaply cloneable; clones share the same connection.
///
/// ```no_run
/// use wamp_client::{Connection, ConnectionConfig};
///
/// # async fn example() -> wamp_client::Result<()> {
/// let connection = Connection::new(ConnectionConfig::new("ws://127.0.0.1:8080/ws", "realm1"));
///
/// connection.on_join(|session, _details| {
///     let _ = session.subscribe(
///         "com.example.topic",
///         |args, _kwargs, _details| println!("event: {:?}", args),
///         Default::default(),
///         |_| {},
///     );
/// });
///
/// connection.open()?;
/// connection.stopped().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (running, _) = watch::channel(false);
        let retry_interval = config.retry_interval;

        Self {
            inner: Arc::new(ConnectionInner {
                config,
                handlers: Mutex::new(ConnectionHandlers::default()),
                state: Mutex::new(LifecycleState {
                    reconnect: false,
                    retry_interval,
                    retrying: false,
                    is_open: false,
                    running: false,
                    generation: 0,
                    transport: None,
                    session: None,
                }),
                running,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether a transport is currently live or connecting
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().is_open
    }

    /// Whether a reconnect cycle is in flight
    pub fn is_retrying(&self) -> bool {
        self.inner.state.lock().retrying
    }

    /// Current backoff delay
    pub fn retry_interval(&self) -> Duration {
        self.inner.state.lock().retry_interval
    }

    /// Session bound to the current transport, if it has opened
    pub fn session(&self) -> Option<Session> {
        self.inner.state.lock().session.clone()
    }

    /// Called every time a transport opens
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.lock().on_connect = Some(Arc::new(handler));
    }

    /// Called every time a session is established
    pub fn on_join<F>(&self, handler: F)
    where
        F: Fn(&Session, &Dict) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().on_join = Some(Arc::new(handler));
    }

    /// Called when the router challenges the session. Answer with
    /// [`Session::authenticate`] on [`Connection::session`].
    pub fn on_challenge<F>(&self, handler: F)
    where
        F: Fn(&str, &Dict) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().on_challenge = Some(Arc::new(handler));
    }

    /// Called when a session ends, except for teardowns caused by retrying
    pub fn on_leave<F>(&self, handler: F)
    where
        F: Fn(&str, &Dict) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().on_leave = Some(Arc::new(handler));
    }

    /// Called once per outage when the transport closes
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().on_disconnect = Some(Arc::new(handler));
    }

    /// Start connecting
    ///
    /// Returns immediately; progress is reported through the callbacks.
    pub fn open(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.is_open || state.running {
                return Err(WampError::AlreadyOpen);
            }
            check_uri("realm", &self.inner.config.realm)?;
            if self.inner.config.transport.is_none() {
                Handle::try_current().map_err(|_| WampError::NoRuntime)?;
            }

            state.reconnect = self.inner.config.auto_reconnect;
            state.retry_interval = self.inner.config.retry_interval;
            state.retrying = false;
            state.running = true;
        }
        self.inner.running.send_replace(true);

        info!(uri = %self.inner.config.uri, realm = %self.inner.config.realm, "Opening connection");
        self.inner.create_transport();
        Ok(())
    }

    /// Stop reconnecting and leave the session
    ///
    /// The transport closes once the router answers the GOODBYE. Without an
    /// open session the transport is disconnected right away. Closing during
    /// a retry cycle does not report a second disconnect.
    pub fn close(&self) -> Result<()> {
        let (session, transport) = {
            let mut state = self.inner.state.lock();
            if !state.is_open && !state.retrying {
                return Err(WampError::AlreadyClosed);
            }
            state.reconnect = false;
            (state.session.clone(), state.transport.clone())
        };

        info!(uri = %self.inner.config.uri, "Closing connection");

        if let Some(session) = session.filter(Session::is_open) {
            return session.leave(None, None);
        }

        match transport {
            Some(transport) => {
                if transport.disconnect() {
                    self.inner.stop();
                }
            }
            None => self.inner.stop(),
        }
        Ok(())
    }

    /// Wait until the connection stops for good
    ///
    /// Resolves immediately if the connection is not running.
    pub async fn stopped(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("uri", &self.inner.config.uri)
            .field("realm", &self.inner.config.realm)
            .field("is_open", &state.is_open)
            .field("retrying", &state.retrying)
            .field("retry_interval", &state.retry_interval)
            .field("session", &state.session)
            .finish()
    }
}

impl ConnectionInner {
    /// Replace the current transport with a fresh one and connect it
    fn create_transport(self: &Arc<Self>) {
        let transport = match &self.config.transport {
            Some(factory) => factory.create(&self.config),
            None => Arc::new(WebSocketTransport::new(&self.config)) as Arc<dyn Transport>,
        };

        let (generation, previous, previous_session) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.is_open = true;
            (
                state.generation,
                state.transport.replace(transport.clone()),
                state.session.take(),
            )
        };

        if let Some(session) = previous_session {
            session.abandon("Transport replaced");
        }
        if let Some(previous) = previous {
            previous.disconnect();
        }

        let weak = Arc::downgrade(self);
        transport.on_open(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_open(generation);
            }
        }));

        let weak = Arc::downgrade(self);
        transport.on_close(Arc::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(generation, &reason);
            }
        }));

        debug!(generation, uri = %self.config.uri, "Connecting transport");
        transport.connect();
    }

    fn is_current(&self, generation: u64) -> bool {
        let current = self.state.lock().generation;
        if current != generation {
            debug!(generation, current, "Ignoring event from a discarded transport");
            return false;
        }
        true
    }

    fn handle_open(self: &Arc<Self>, generation: u64) {
        let transport = {
            let state = self.state.lock();
            if state.generation != generation {
                debug!(generation, "Ignoring open from a discarded transport");
                return;
            }
            state.transport.clone()
        };
        let Some(transport) = transport else {
            return;
        };

        debug!(generation, "Transport open");
        let handler = self.handlers.lock().on_connect.clone();
        if let Some(handler) = handler {
            handler();
        }

        self.create_session(generation, transport);
    }

    fn create_session(self: &Arc<Self>, generation: u64, transport: Arc<dyn Transport>) {
        let on_join = {
            let weak = Arc::downgrade(self);
            move |details: &Dict| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_join(generation, details);
                }
            }
        };
        let on_challenge = {
            let weak = Arc::downgrade(self);
            move |authmethod: &str, extra: &Dict| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_challenge(generation, authmethod, extra);
                }
            }
        };
        let on_leave = {
            let weak = Arc::downgrade(self);
            move |reason: &str, details: &Dict| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_leave(generation, reason, details);
                }
            }
        };

        let handlers = SessionHandlers::new()
            .on_join(on_join)
            .on_challenge(on_challenge)
            .on_leave(on_leave);
        let session = Session::new(transport, handlers);

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.session = Some(session.clone());
        }

        let result = session.join_with_auth(
            &self.config.realm,
            self.config.authid.as_deref(),
            &self.config.authmethods,
        );
        if let Err(e) = result {
            warn!(realm = %self.config.realm, error = %e, "Failed to join realm");
        }
    }

    fn handle_join(&self, generation: u64, details: &Dict) {
        let session = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.retry_interval = self.config.retry_interval;
            state.retrying = false;
            state.session.clone()
        };
        let Some(session) = session else {
            return;
        };

        let handler = self.handlers.lock().on_join.clone();
        if let Some(handler) = handler {
            handler(&session, details);
        }
    }

    fn handle_challenge(&self, generation: u64, authmethod: &str, extra: &Dict) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.retry_interval = self.config.retry_interval;
            state.retrying = false;
        }

        let handler = self.handlers.lock().on_challenge.clone();
        if let Some(handler) = handler {
            handler(authmethod, extra);
        }
    }

    fn handle_leave(self: &Arc<Self>, generation: u64, reason: &str, details: &Dict) {
        if !self.is_current(generation) {
            return;
        }

        let retrying = self.state.lock().retrying;
        if !retrying {
            let handler = self.handlers.lock().on_leave.clone();
            if let Some(handler) = handler {
                handler(reason, details);
            }
        }

        let (reconnect, retrying, transport) = {
            let state = self.state.lock();
            (state.reconnect, state.retrying, state.transport.clone())
        };

        if reconnect {
            if !retrying {
                self.retry();
            }
        } else if let Some(transport) = transport {
            transport.disconnect();
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, reason: &str) {
        let (retrying, session) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(generation, "Ignoring close from a discarded transport");
                return;
            }
            state.is_open = false;
            (state.retrying, state.session.take())
        };

        info!(reason, retrying, "Transport closed");

        if !retrying {
            let handler = self.handlers.lock().on_disconnect.clone();
            if let Some(handler) = handler {
                handler(reason);
            }
        }

        if let Some(session) = session {
            session.abandon(reason);
        }

        let (reconnect, retrying) = {
            let state = self.state.lock();
            (state.reconnect, state.retrying)
        };

        if reconnect {
            if !retrying {
                self.retry();
            }
        } else {
            self.stop();
        }
    }

    /// Reconnect and schedule the next attempt with a doubled delay
    fn retry(self: &Arc<Self>) {
        let session = self.state.lock().session.clone();
        if session.is_some_and(|session| session.is_open()) {
            return;
        }

        let interval = {
            let mut state = self.state.lock();
            state.retry_interval = state
                .retry_interval
                .saturating_mul(2)
                .min(self.config.max_retry_interval);
            state.retrying = true;
            state.retry_interval
        };

        self.create_transport();

        info!(interval_secs = interval.as_secs_f64(), "Attempting reconnect");
        let weak = Arc::downgrade(self);
        self.config.scheduler.schedule(
            interval,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let (retrying, reconnect) = {
                    let state = inner.state.lock();
                    (state.retrying, state.reconnect)
                };
                if retrying && reconnect {
                    inner.retry();
                }
            }),
        );
    }

    fn stop(&self) {
        let was_running = {
            let mut state = self.state.lock();
            state.is_open = false;
            state.retrying = false;
            state.transport = None;
            state.session = None;
            std::mem::replace(&mut state.running, false)
        };

        if was_running {
            info!(uri = %self.config.uri, "Connection stopped");
        }
        self.running.send_replace(false);
    }
}
