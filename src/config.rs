//! Configuration for a WAMP connection

use crate::scheduler::{Scheduler, TokioScheduler};
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Sub-protocol negotiated when none is configured
pub const DEFAULT_PROTOCOL: &str = "wamp.2.json";

/// Configuration for connecting to a WAMP router
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Router endpoint (e.g., "ws://localhost:8080/ws")
    pub uri: String,

    /// Realm joined once the transport is open
    pub realm: String,

    /// WebSocket sub-protocol identifier
    pub protocol: String,

    /// Authentication id announced in HELLO
    pub authid: Option<String>,

    /// Authentication methods announced in HELLO
    pub authmethods: Vec<String>,

    /// Extra headers sent with the transport handshake
    pub headers: HashMap<String, String>,

    /// Payload encoding
    pub serializer: Arc<dyn Serializer>,

    /// Builds the transport for every (re)connect; `None` uses WebSocket
    pub transport: Option<Arc<dyn TransportFactory>>,

    /// Timer used by the reconnect loop
    pub scheduler: Arc<dyn Scheduler>,

    /// Whether losing the transport or session triggers a reconnect
    pub auto_reconnect: bool,

    /// Initial delay between reconnect attempts
    pub retry_interval: Duration,

    /// Ceiling for the doubling reconnect delay
    pub max_retry_interval: Duration,
}

impl ConnectionConfig {
    /// Create a new configuration with the given router URI and realm
    pub fn new(uri: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            realm: realm.into(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            authid: None,
            authmethods: Vec::new(),
            headers: HashMap::new(),
            serializer: Arc::new(JsonSerializer),
            transport: None,
            scheduler: Arc::new(TokioScheduler),
            auto_reconnect: true,
            retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(32),
        }
    }

    /// Set the WebSocket sub-protocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the authentication id and the methods offered to the router
    pub fn auth<I, S>(mut self, authid: impl Into<String>, authmethods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authid = Some(authid.into());
        self.authmethods = authmethods.into_iter().map(Into::into).collect();
        self
    }

    /// Add a header to the transport handshake
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Use a different payload serializer
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Build transports with `factory` instead of the default WebSocket transport
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Use a different timer for the reconnect loop
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnect delay range
    pub fn retry_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_interval = initial;
        self.max_retry_interval = max;
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("uri", &self.uri)
            .field("realm", &self.realm)
            .field("protocol", &self.protocol)
            .field("authid", &self.authid)
            .field("authmethods", &self.authmethods)
            .field("headers", &self.headers)
            .field("serializer", &self.serializer)
            .field("transport", &self.transport.as_ref().map(|_| "custom"))
            .field("scheduler", &self.scheduler)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("retry_interval", &self.retry_interval)
            .field("max_retry_interval", &self.max_retry_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new_defaults() {
        let config = ConnectionConfig::new("ws://localhost:8080/ws", "realm1");

        assert_eq!(config.uri, "ws://localhost:8080/ws");
        assert_eq!(config.realm, "realm1");
        assert_eq!(config.protocol, "wamp.2.json");
        assert!(config.authid.is_none());
        assert!(config.authmethods.is_empty());
        assert!(config.headers.is_empty());
        assert!(config.transport.is_none());
        assert!(config.auto_reconnect);
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.max_retry_interval, Duration::from_secs(32));
    }

    #[test]
    fn test_config_auth() {
        let config =
            ConnectionConfig::new("ws://localhost:8080/ws", "realm1").auth("joe", ["wampcra", "ticket"]);

        assert_eq!(config.authid.as_deref(), Some("joe"));
        assert_eq!(config.authmethods, vec!["wampcra", "ticket"]);
    }

    #[test]
    fn test_config_builder_chain() {
        let config = ConnectionConfig::new("ws://example.com/ws", "realm2")
            .protocol("wamp.2.msgpack")
            .header("Authorization", "Bearer abc")
            .no_reconnect()
            .retry_interval(Duration::from_millis(500), Duration::from_secs(8));

        assert_eq!(config.protocol, "wamp.2.msgpack");
        assert_eq!(
            config.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert!(!config.auto_reconnect);
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert_eq!(config.max_retry_interval, Duration::from_secs(8));
    }

    #[test]
    fn test_config_debug_hides_factory() {
        let config = ConnectionConfig::new("ws://localhost:8080/ws", "realm1");
        let debug = format!("{:?}", config);
        assert!(debug.contains("realm1"));
        assert!(debug.contains("JsonSerializer"));
        assert!(debug.contains("TokioScheduler"));
    }
}
