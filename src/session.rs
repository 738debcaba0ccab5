//! WAMP session protocol engine
//!
//! A session is either Closed (no session id) or Open (the router assigned
//! an id in WELCOME). Requests are correlated with their replies through one
//! pending table per request category, keyed by a locally generated request
//! id. Every pending entry is resolved exactly once: by the matching reply,
//! by an ERROR, or by the session going away.

use crate::error::{Result, WampError};
use crate::message::{Dict, Id, List, Message, MessageType};
use crate::transport::Transport;
use crate::uri::{check_optional_uri, check_uri};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Reason sent with GOODBYE when none is given
pub const CLOSE_NORMAL: &str = "wamp.close.normal";

/// Reason echoed when the router initiates GOODBYE
pub const GOODBYE_AND_OUT: &str = "wamp.error.goodbye_and_out";

/// Error delivered to requests still in flight when the session goes away
pub const SESSION_CLOSED_ERROR: &str = "wamp.error.session_closed";

/// Upper bound of the request id space
const MAX_REQUEST_ID: Id = 1 << 53;

/// Called for every event on a subscription with `(args, kwargs, details)`
pub type EventHandler = Arc<dyn Fn(Option<List>, Option<Dict>, Dict) + Send + Sync>;

/// Called with the WELCOME details
pub type JoinHandler = Arc<dyn Fn(&Dict) + Send + Sync>;

/// Called with `(reason, details)` on ABORT or GOODBYE
pub type LeaveHandler = Arc<dyn Fn(&str, &Dict) + Send + Sync>;

/// Called with `(authmethod, extra)` on CHALLENGE
pub type ChallengeHandler = Arc<dyn Fn(&str, &Dict) + Send + Sync>;

pub type SubscribeResult = std::result::Result<Subscription, RequestError<SubscribeRequest>>;
pub type UnsubscribeResult = std::result::Result<Subscription, RequestError<Subscription>>;
pub type PublishResult = std::result::Result<Publication, RequestError<PublishRequest>>;

type SubscribeCallback = Box<dyn FnOnce(SubscribeResult) + Send>;
type UnsubscribeCallback = Box<dyn FnOnce(UnsubscribeResult) + Send>;
type PublishCallback = Box<dyn FnOnce(PublishResult) + Send>;

/// Session lifecycle handlers; unset slots are skipped
#[derive(Clone, Default)]
pub struct SessionHandlers {
    pub on_join: Option<JoinHandler>,
    pub on_leave: Option<LeaveHandler>,
    pub on_challenge: Option<ChallengeHandler>,
}

impl SessionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_join<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Dict) + Send + Sync + 'static,
    {
        self.on_join = Some(Arc::new(handler));
        self
    }

    pub fn on_leave<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Dict) + Send + Sync + 'static,
    {
        self.on_leave = Some(Arc::new(handler));
        self
    }

    pub fn on_challenge<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Dict) + Send + Sync + 'static,
    {
        self.on_challenge = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers")
            .field("on_join", &self.on_join.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .field("on_challenge", &self.on_challenge.is_some())
            .finish()
    }
}

/// A router-reported failure of one request
///
/// `context` is whatever the request was made with, so the caller can tell
/// which request failed.
#[derive(Debug, Clone)]
pub struct RequestError<C> {
    pub context: C,
    pub error: String,
    pub details: Dict,
    pub arguments: Option<List>,
    pub arguments_kw: Option<Dict>,
}

impl<C> RequestError<C> {
    fn session_closed(context: C, reason: &str) -> Self {
        let mut details = Dict::new();
        details.insert("reason".to_string(), Value::from(reason));

        Self {
            context,
            error: SESSION_CLOSED_ERROR.to_string(),
            details,
            arguments: None,
            arguments_kw: None,
        }
    }
}

/// What a subscribe request was made with
#[derive(Clone)]
pub struct SubscribeRequest {
    pub topic: String,
    pub handler: EventHandler,
    pub options: Dict,
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("topic", &self.topic)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// What a publish request was made with
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub arguments: Option<List>,
    pub arguments_kw: Option<Dict>,
    pub options: Dict,
}

/// An acknowledged publication
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub request: PublishRequest,
    pub publication: Id,
}

/// An active subscription on a session
///
/// Created when the router confirms a subscribe request. It keeps a weak
/// reference to its session so it can unsubscribe itself.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    handler: EventHandler,
    options: Dict,
    id: Id,
    session: Weak<SessionInner>,
}

impl Subscription {
    /// Router-assigned subscription id
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn options(&self) -> &Dict {
        &self.options
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    /// Unsubscribe through the owning session
    pub fn unsubscribe<C>(&self, callback: C) -> Result<Id>
    where
        C: FnOnce(UnsubscribeResult) + Send + 'static,
    {
        let inner = self
            .session
            .upgrade()
            .ok_or(WampError::SessionClosed("unsubscribe"))?;
        Session { inner }.unsubscribe(self, callback)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct PendingSubscribe {
    request: SubscribeRequest,
    callback: SubscribeCallback,
}

struct PendingUnsubscribe {
    subscription: Subscription,
    callback: UnsubscribeCallback,
}

struct PendingPublish {
    request: PublishRequest,
    callback: PublishCallback,
}

#[derive(Default)]
struct SessionState {
    id: Option<Id>,
    realm: Option<String>,
    goodbye_sent: bool,
    subscribe_requests: HashMap<Id, PendingSubscribe>,
    unsubscribe_requests: HashMap<Id, PendingUnsubscribe>,
    publish_requests: HashMap<Id, PendingPublish>,
    subscriptions: HashMap<Id, Subscription>,
}

impl SessionState {
    fn pending_count(&self) -> usize {
        self.subscribe_requests.len() + self.unsubscribe_requests.len() + self.publish_requests.len()
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    handlers: SessionHandlers,
    state: Mutex<SessionState>,
}

/// One WAMP session bound to one transport
///
/// Cheaply cloneable; clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a closed session and take over the transport's message handler
    pub fn new(transport: Arc<dyn Transport>, handlers: SessionHandlers) -> Self {
        let inner = Arc::new(SessionInner {
            transport,
            handlers,
            state: Mutex::new(SessionState::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.on_message(Arc::new(move |payload| {
            if let Some(inner) = weak.upgrade() {
                inner.process_payload(payload);
            }
        }));

        Self { inner }
    }

    /// Session id assigned by the router; `None` while closed
    pub fn id(&self) -> Option<Id> {
        self.inner.state.lock().id
    }

    /// Realm requested by the last `join`
    pub fn realm(&self) -> Option<String> {
        self.inner.state.lock().realm.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().id.is_some()
    }

    pub fn subscription(&self, id: Id) -> Option<Subscription> {
        self.inner.state.lock().subscriptions.get(&id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Number of requests awaiting a reply, across all categories
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending_count()
    }

    /// Send HELLO for `realm`
    pub fn join(&self, realm: &str) -> Result<()> {
        self.join_with_auth(realm, None, &[])
    }

    /// Send HELLO for `realm`, announcing authentication id and methods
    pub fn join_with_auth(
        &self,
        realm: &str,
        authid: Option<&str>,
        authmethods: &[String],
    ) -> Result<()> {
        self.require_closed("join")?;
        check_uri("realm", realm)?;

        let mut details = Dict::new();
        details.insert("roles".to_string(), client_roles());
        if let Some(authid) = authid {
            details.insert("authid".to_string(), Value::from(authid));
        }
        if !authmethods.is_empty() {
            details.insert("authmethods".to_string(), Value::from(authmethods.to_vec()));
        }

        self.inner.state.lock().realm = Some(realm.to_string());

        debug!(realm, "Joining realm");
        self.inner.transport.send(&Message::Hello {
            realm: realm.to_string(),
            details,
        })
    }

    /// Answer a CHALLENGE during the handshake
    pub fn authenticate(&self, signature: &str, extra: Dict) -> Result<()> {
        self.require_closed("authenticate")?;

        self.inner.transport.send(&Message::Authenticate {
            signature: signature.to_string(),
            extra,
        })
    }

    /// Send GOODBYE. The session stays open until the router replies.
    pub fn leave(&self, reason: Option<&str>, message: Option<&str>) -> Result<()> {
        self.require_open("leave")?;
        check_optional_uri("reason", reason)?;

        let mut details = Dict::new();
        if let Some(message) = message {
            details.insert("message".to_string(), Value::from(message));
        }
        let reason = reason.unwrap_or(CLOSE_NORMAL);

        // Set before sending so a fast reply is not echoed
        self.inner.state.lock().goodbye_sent = true;

        debug!(reason, "Leaving session");
        let result = self.inner.transport.send(&Message::Goodbye {
            details,
            reason: reason.to_string(),
        });
        if result.is_err() {
            self.inner.state.lock().goodbye_sent = false;
        }
        result
    }

    /// Subscribe `handler` to `topic`, returning the request id
    pub fn subscribe<H, C>(&self, topic: &str, handler: H, options: Dict, callback: C) -> Result<Id>
    where
        H: Fn(Option<List>, Option<Dict>, Dict) + Send + Sync + 'static,
        C: FnOnce(SubscribeResult) + Send + 'static,
    {
        self.require_open("subscribe")?;
        check_uri("topic", topic)?;

        let request = generate_id();
        let pending = PendingSubscribe {
            request: SubscribeRequest {
                topic: topic.to_string(),
                handler: Arc::new(handler),
                options: options.clone(),
            },
            callback: Box::new(callback),
        };
        self.inner.state.lock().subscribe_requests.insert(request, pending);

        let message = Message::Subscribe {
            request,
            options,
            topic: topic.to_string(),
        };
        if let Err(e) = self.inner.transport.send(&message) {
            // A concurrent close may already have failed the callback
            if self.inner.state.lock().subscribe_requests.remove(&request).is_some() {
                return Err(e);
            }
            debug!(request, topic, error = %e, "Subscribe send failed after close");
            return Ok(request);
        }

        debug!(request, topic, "Subscribe requested");
        Ok(request)
    }

    /// Unsubscribe `subscription`, returning the request id
    pub fn unsubscribe<C>(&self, subscription: &Subscription, callback: C) -> Result<Id>
    where
        C: FnOnce(UnsubscribeResult) + Send + 'static,
    {
        self.require_open("unsubscribe")?;

        let request = generate_id();
        let pending = PendingUnsubscribe {
            subscription: subscription.clone(),
            callback: Box::new(callback),
        };
        self.inner.state.lock().unsubscribe_requests.insert(request, pending);

        let message = Message::Unsubscribe {
            request,
            subscription: subscription.id,
        };
        if let Err(e) = self.inner.transport.send(&message) {
            if self.inner.state.lock().unsubscribe_requests.remove(&request).is_some() {
                return Err(e);
            }
            debug!(request, error = %e, "Unsubscribe send failed after close");
            return Ok(request);
        }

        debug!(request, subscription = subscription.id, "Unsubscribe requested");
        Ok(request)
    }

    /// Publish to `topic`, returning the request id.
    ///
    /// `callback` is only ever invoked when `options.acknowledge` is truthy;
    /// otherwise the publish is fire-and-forget.
    pub fn publish<C>(
        &self,
        topic: &str,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
        options: Dict,
        callback: C,
    ) -> Result<Id>
    where
        C: FnOnce(PublishResult) + Send + 'static,
    {
        self.require_open("publish")?;
        check_uri("topic", topic)?;

        let request = generate_id();
        let acknowledge = options.get("acknowledge").is_some_and(is_truthy);
        if acknowledge {
            let pending = PendingPublish {
                request: PublishRequest {
                    topic: topic.to_string(),
                    arguments: arguments.clone(),
                    arguments_kw: arguments_kw.clone(),
                    options: options.clone(),
                },
                callback: Box::new(callback),
            };
            self.inner.state.lock().publish_requests.insert(request, pending);
        }

        let message = Message::Publish {
            request,
            options,
            topic: topic.to_string(),
            arguments,
            arguments_kw,
        };
        if let Err(e) = self.inner.transport.send(&message) {
            let tracked = self.inner.state.lock().publish_requests.remove(&request).is_some();
            if !acknowledge || tracked {
                return Err(e);
            }
            debug!(request, topic, error = %e, "Publish send failed after close");
            return Ok(request);
        }

        trace!(request, topic, acknowledge, "Published");
        Ok(request)
    }

    /// Close the session locally without a GOODBYE exchange.
    ///
    /// Used when the transport is gone. Every in-flight request fails with
    /// [`SESSION_CLOSED_ERROR`] and all subscriptions are dropped.
    pub fn abandon(&self, reason: &str) {
        self.inner.close_out(reason);
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(WampError::SessionClosed(operation))
        }
    }

    fn require_closed(&self, operation: &'static str) -> Result<()> {
        if self.is_open() {
            Err(WampError::SessionOpen(operation))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("realm", &state.realm)
            .field("subscriptions", &state.subscriptions.len())
            .field("pending", &state.pending_count())
            .finish()
    }
}

impl SessionInner {
    fn process_payload(self: &Arc<Self>, payload: List) {
        match Message::parse(&payload) {
            Ok(message) => self.process_message(message),
            Err(e) => warn!(error = %e, "Dropping unparseable message"),
        }
    }

    fn process_message(self: &Arc<Self>, message: Message) {
        trace!(message_type = ?message.message_type(), "Received message");

        let open = self.state.lock().id.is_some();
        if open {
            self.process_open(message);
        } else {
            self.process_closed(message);
        }
    }

    fn process_closed(&self, message: Message) {
        match message {
            Message::Welcome { session, details } => {
                let realm = {
                    let mut state = self.state.lock();
                    state.id = Some(session);
                    state.realm.clone()
                };
                info!(session_id = session, realm = ?realm, "Session joined");

                if let Some(handler) = &self.handlers.on_join {
                    handler(&details);
                }
            }
            Message::Abort { details, reason } => {
                warn!(reason = %reason, "Session aborted");
                if let Some(handler) = &self.handlers.on_leave {
                    handler(&reason, &details);
                }
            }
            Message::Challenge { authmethod, extra } => {
                debug!(authmethod = %authmethod, "Challenge received");
                if let Some(handler) = &self.handlers.on_challenge {
                    handler(&authmethod, &extra);
                }
            }
            message @ (Message::Hello { .. }
            | Message::Authenticate { .. }
            | Message::Goodbye { .. }
            | Message::Error { .. }
            | Message::Publish { .. }
            | Message::Published { .. }
            | Message::Subscribe { .. }
            | Message::Subscribed { .. }
            | Message::Unsubscribe { .. }
            | Message::Unsubscribed { .. }
            | Message::Event { .. }) => {
                debug!(message_type = ?message.message_type(), "Ignoring message while session is closed");
            }
        }
    }

    fn process_open(self: &Arc<Self>, message: Message) {
        match message {
            Message::Goodbye { details, reason } => self.handle_goodbye(details, reason),
            Message::Error {
                request_type,
                request,
                details,
                error,
                arguments,
                arguments_kw,
            } => self.handle_error(request_type, request, details, error, arguments, arguments_kw),
            Message::Subscribed {
                request,
                subscription,
            } => self.handle_subscribed(request, subscription),
            Message::Unsubscribed { request } => self.handle_unsubscribed(request),
            Message::Published {
                request,
                publication,
            } => self.handle_published(request, publication),
            Message::Event {
                subscription,
                publication,
                details,
                arguments,
                arguments_kw,
            } => self.handle_event(subscription, publication, details, arguments, arguments_kw),
            message @ (Message::Hello { .. }
            | Message::Welcome { .. }
            | Message::Abort { .. }
            | Message::Challenge { .. }
            | Message::Authenticate { .. }
            | Message::Publish { .. }
            | Message::Subscribe { .. }
            | Message::Unsubscribe { .. }) => {
                debug!(message_type = ?message.message_type(), "Ignoring message while session is open");
            }
        }
    }

    fn handle_goodbye(&self, details: Dict, reason: String) {
        let goodbye_sent = self.state.lock().goodbye_sent;
        if !goodbye_sent {
            let reply = Message::Goodbye {
                details: Dict::new(),
                reason: GOODBYE_AND_OUT.to_string(),
            };
            if let Err(e) = self.transport.send(&reply) {
                warn!(error = %e, "Failed to answer GOODBYE");
            }
        }

        info!(reason = %reason, "Session closed");
        self.close_out(&reason);

        if let Some(handler) = &self.handlers.on_leave {
            handler(&reason, &details);
        }
    }

    fn handle_error(
        &self,
        request_type: u64,
        request: Id,
        details: Dict,
        error: String,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
    ) {
        debug!(request_type, request, error = %error, "Request failed");

        match MessageType::from_code(request_type) {
            Some(MessageType::Subscribe) => {
                let pending = self.state.lock().subscribe_requests.remove(&request);
                match pending {
                    Some(pending) => (pending.callback)(Err(RequestError {
                        context: pending.request,
                        error,
                        details,
                        arguments,
                        arguments_kw,
                    })),
                    None => debug!(request, "No pending subscribe for error"),
                }
            }
            Some(MessageType::Unsubscribe) => {
                let pending = self.state.lock().unsubscribe_requests.remove(&request);
                match pending {
                    Some(pending) => (pending.callback)(Err(RequestError {
                        context: pending.subscription,
                        error,
                        details,
                        arguments,
                        arguments_kw,
                    })),
                    None => debug!(request, "No pending unsubscribe for error"),
                }
            }
            Some(MessageType::Publish) => {
                let pending = self.state.lock().publish_requests.remove(&request);
                match pending {
                    Some(pending) => (pending.callback)(Err(RequestError {
                        context: pending.request,
                        error,
                        details,
                        arguments,
                        arguments_kw,
                    })),
                    None => debug!(request, "No pending publish for error"),
                }
            }
            _ => debug!(request_type, "Ignoring error for unsupported request type"),
        }
    }

    fn handle_subscribed(self: &Arc<Self>, request: Id, id: Id) {
        let resolved = {
            let mut state = self.state.lock();
            match state.subscribe_requests.remove(&request) {
                Some(pending) => {
                    let subscription = Subscription {
                        topic: pending.request.topic,
                        handler: pending.request.handler,
                        options: pending.request.options,
                        id,
                        session: Arc::downgrade(self),
                    };
                    state.subscriptions.insert(id, subscription.clone());
                    Some((subscription, pending.callback))
                }
                None => None,
            }
        };

        match resolved {
            Some((subscription, callback)) => {
                debug!(request, subscription = id, topic = %subscription.topic, "Subscribed");
                callback(Ok(subscription));
            }
            None => debug!(request, "No pending subscribe for SUBSCRIBED"),
        }
    }

    fn handle_unsubscribed(&self, request: Id) {
        let pending = {
            let mut state = self.state.lock();
            let pending = state.unsubscribe_requests.remove(&request);
            if let Some(pending) = &pending {
                state.subscriptions.remove(&pending.subscription.id);
            }
            pending
        };

        match pending {
            Some(pending) => {
                debug!(request, subscription = pending.subscription.id, "Unsubscribed");
                (pending.callback)(Ok(pending.subscription));
            }
            None => debug!(request, "No pending unsubscribe for UNSUBSCRIBED"),
        }
    }

    fn handle_published(&self, request: Id, publication: Id) {
        let pending = self.state.lock().publish_requests.remove(&request);
        match pending {
            Some(pending) => (pending.callback)(Ok(Publication {
                request: pending.request,
                publication,
            })),
            None => debug!(request, "No pending publish for PUBLISHED"),
        }
    }

    fn handle_event(
        &self,
        subscription: Id,
        publication: Id,
        mut details: Dict,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
    ) {
        let handler = self
            .state
            .lock()
            .subscriptions
            .get(&subscription)
            .map(|s| s.handler.clone());

        match handler {
            Some(handler) => {
                details.insert("publication".to_string(), Value::from(publication));
                handler(arguments, arguments_kw, details);
            }
            None => debug!(subscription, publication, "Dropping event for unknown subscription"),
        }
    }

    /// Reset to Closed and fail everything still in flight
    fn close_out(&self, reason: &str) {
        let (subscribes, unsubscribes, publishes) = {
            let mut state = self.state.lock();
            state.id = None;
            state.realm = None;
            state.goodbye_sent = false;
            state.subscriptions.clear();
            (
                mem::take(&mut state.subscribe_requests),
                mem::take(&mut state.unsubscribe_requests),
                mem::take(&mut state.publish_requests),
            )
        };

        let pending = subscribes.len() + unsubscribes.len() + publishes.len();
        if pending > 0 {
            debug!(pending, reason, "Failing in-flight requests");
        }

        for (_, pending) in subscribes {
            (pending.callback)(Err(RequestError::session_closed(pending.request, reason)));
        }
        for (_, pending) in unsubscribes {
            (pending.callback)(Err(RequestError::session_closed(pending.subscription, reason)));
        }
        for (_, pending) in publishes {
            (pending.callback)(Err(RequestError::session_closed(pending.request, reason)));
        }
    }
}

/// Roles announced in HELLO; feature sets are left empty
fn client_roles() -> Value {
    json!({
        "caller": {"features": {}},
        "callee": {"features": {}},
        "publisher": {"features": {}},
        "subscriber": {"features": {}},
    })
}

fn generate_id() -> Id {
    rand::rng().random_range(0..=MAX_REQUEST_ID)
}

/// Anything but null and `false` counts as set
fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}
